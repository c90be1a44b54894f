//! Attachment download and decryption.
//!
//! Attachments hang off `m.room.message` and `m.sticker` events. The
//! pipeline resolves the content URI (thumbnail variant on request),
//! consults the file cache, downloads on miss, stores size-capped copies,
//! and decrypts encrypted envelopes through the encryption subsystem.

use thiserror::Error;
use weft_types::{Event, IdParseError, MxcUri};

use crate::{
    api::ApiError,
    client::Client,
    encryption::EncryptedFile,
    error::{DecryptionError, StoreError},
};

/// Failures of the attachment pipeline.
#[derive(Debug, Error)]
pub enum AttachmentError {
    /// The event type cannot carry an attachment.
    #[error("event type cannot carry an attachment")]
    WrongEventType,

    /// The event carries no attachment (no `url` or `file.url`).
    #[error("event has no attachment")]
    NoAttachment,

    /// The attachment is encrypted but encryption is not enabled.
    #[error("encryption disabled, cannot decrypt attachment")]
    EncryptionDisabled,

    /// The embedded key does not permit decryption.
    #[error("attachment key is missing the decrypt key op")]
    KeyOpsMissingDecrypt,

    /// The encrypted-file envelope does not parse.
    #[error("malformed attachment envelope: {0}")]
    MalformedEnvelope(String),

    /// The content URI does not parse.
    #[error(transparent)]
    InvalidUri(#[from] IdParseError),

    /// Download failure.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// File-cache failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Decryption failure.
    #[error(transparent)]
    Decryption(#[from] DecryptionError),
}

impl Client {
    /// Download (and, when necessary, decrypt) the attachment of an event.
    ///
    /// With `get_thumbnail` the thumbnail variant is resolved instead of
    /// the full attachment.
    pub async fn download_attachment(
        &self,
        event: &Event,
        get_thumbnail: bool,
    ) -> Result<Vec<u8>, AttachmentError> {
        if !matches!(event.event_type.as_str(), "m.room.message" | "m.sticker") {
            return Err(AttachmentError::WrongEventType);
        }
        let Some(mxc) = event.attachment_mxc(get_thumbnail) else {
            return Err(AttachmentError::NoAttachment);
        };
        MxcUri::parse(mxc)?;

        let api = self.api();
        let bytes = match self.db() {
            Some(db) => match db.get_file(mxc)? {
                Some(cached) => cached,
                None => {
                    let bytes = api.download(mxc).await?;
                    if bytes.len() <= db.max_file_size() {
                        db.store_file(mxc, &bytes, self.env().now_ms())?;
                    }
                    bytes
                },
            },
            None => api.download(mxc).await?,
        };

        if !event.attachment_encrypted(get_thumbnail) {
            return Ok(bytes);
        }

        let Some(encryption) = self.encryption().filter(|e| e.enabled()) else {
            return Err(AttachmentError::EncryptionDisabled);
        };
        let envelope_json =
            event.attachment_envelope(get_thumbnail).ok_or(AttachmentError::NoAttachment)?;
        let envelope: EncryptedFile = serde_json::from_value(envelope_json.clone())
            .map_err(|e| AttachmentError::MalformedEnvelope(e.to_string()))?;
        if !envelope.key.key_ops.iter().any(|op| op == "decrypt") {
            return Err(AttachmentError::KeyOpsMissingDecrypt);
        }

        Ok(encryption.decrypt_file(&envelope, &bytes).await?)
    }
}
