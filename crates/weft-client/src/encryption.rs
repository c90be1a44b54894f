//! The `Encryption` capability.
//!
//! Olm/Megolm sessions, key verification and to-device crypto are a black
//! box behind this trait. The sync engine only routes events through it and
//! reacts to decryption results; it never inspects cryptographic state.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    device_keys::DeviceKeys,
    error::{ClientError, DecryptionError},
    update::EventUpdate,
};

/// A to-device message: sender plus a basic event.
#[derive(Debug, Clone, PartialEq)]
pub struct ToDeviceEvent {
    /// Sending user.
    pub sender: String,
    /// Dotted event type.
    pub event_type: String,
    /// Free-form content.
    pub content: Value,
}

/// JSON Web Key carried in an encrypted-file envelope.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct JsonWebKey {
    /// Key type, always `oct`.
    pub kty: String,
    /// Algorithm, always `A256CTR`.
    #[serde(default)]
    pub alg: Option<String>,
    /// Base64url key material.
    pub k: String,
    /// Permitted key operations; must include `decrypt` to be usable.
    #[serde(default)]
    pub key_ops: Vec<String>,
}

/// Encrypted-attachment envelope: symmetric key, IV and content hash.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EncryptedFile {
    /// Content URI of the ciphertext.
    pub url: String,
    /// Symmetric key.
    pub key: JsonWebKey,
    /// AES-CTR initialisation vector, base64.
    pub iv: String,
    /// Ciphertext digests; `sha256` is required.
    #[serde(default)]
    pub hashes: BTreeMap<String, String>,
}

/// The end-to-end encryption subsystem consumed by the client core.
#[async_trait]
pub trait Encryption: Send + Sync {
    /// Initialise, restoring the account from its pickle when given.
    async fn init(&mut self, pickled_account: Option<String>) -> Result<(), ClientError>;

    /// Drop all key material. The subsystem is unusable afterwards.
    fn dispose(&mut self);

    /// Whether encryption is available for this session.
    fn enabled(&self) -> bool;

    /// Pickled account blob for persistence.
    fn pickled_olm_account(&self) -> Option<String>;

    /// This device's curve25519 identity key.
    fn identity_key(&self) -> Option<String>;

    /// This device's ed25519 fingerprint key.
    fn fingerprint_key(&self) -> Option<String>;

    /// Hook invoked at the end of every sync pass (key uploads, session
    /// maintenance).
    async fn on_sync(&mut self);

    /// Decrypt an Olm-encrypted to-device event.
    async fn decrypt_to_device_event(
        &mut self,
        event: &ToDeviceEvent,
    ) -> Result<ToDeviceEvent, DecryptionError>;

    /// Encrypt a message for each of the given devices. Returns the
    /// `{user_id: {device_id: content}}` addressing map.
    async fn encrypt_to_device_message(
        &mut self,
        devices: &[DeviceKeys],
        event_type: &str,
        message: &Value,
    ) -> Result<Value, ClientError>;

    /// Observe a (possibly decrypted) to-device event.
    async fn handle_to_device_event(&mut self, event: &ToDeviceEvent);

    /// Decrypt a Megolm-encrypted room event update. On failure the update
    /// is returned unchanged (the ciphertext event still flows downstream).
    async fn decrypt_event_update(&mut self, update: &EventUpdate) -> EventUpdate;

    /// Observe a room event update (session rotation, key forwarding).
    async fn handle_event_update(&mut self, update: &EventUpdate);

    /// Observe the one-time-key counts of a sync response.
    async fn handle_device_one_time_keys_count(&mut self, counts: &BTreeMap<String, u64>);

    /// Decrypt an attachment downloaded as `ciphertext` against its
    /// envelope (key, IV, SHA-256).
    async fn decrypt_file(
        &self,
        envelope: &EncryptedFile,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, DecryptionError>;
}
