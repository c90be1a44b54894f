//! Error types for the client core.
//!
//! Strongly-typed errors per layer: transport and homeserver errors from the
//! API capability, decryption errors from the encryption subsystem, store
//! errors from the database, and validation/state errors raised by the
//! client itself. Boundary `From` impls only; protocol logic never loses the
//! typed error code of a homeserver response.

use serde_json::Value;
use thiserror::Error;

use crate::api::{ApiError, MatrixError};

/// A minimal event: type plus content. Used for account data and ephemerals
/// which carry no envelope of their own.
#[derive(Debug, Clone, PartialEq)]
pub struct BasicEvent {
    /// Dotted event type.
    pub event_type: String,
    /// Free-form content.
    pub content: Value,
}

impl BasicEvent {
    /// Create a basic event.
    pub fn new(event_type: impl Into<String>, content: Value) -> Self {
        Self { event_type: event_type.into(), content }
    }
}

/// Top-level error of every fallible client operation.
///
/// Clonable so sync-loop failures can be both broadcast on the error
/// streams and returned to the caller.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// Network or HTTP transport failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Typed error response from the homeserver.
    #[error("homeserver error: {0}")]
    Matrix(#[from] MatrixError),

    /// Event or to-device decryption failure.
    #[error(transparent)]
    Decryption(#[from] DecryptionError),

    /// Malformed caller input (e.g. an invalid Matrix ID).
    #[error("validation error: {0}")]
    Validation(String),

    /// Operation attempted in the wrong session state (not logged in, no
    /// homeserver set, event not re-sendable).
    #[error("invalid state: {0}")]
    State(String),

    /// Persistent store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<ApiError> for ClientError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Transport(message) => Self::Transport(message),
            ApiError::Matrix(matrix) => Self::Matrix(matrix),
        }
    }
}

/// Decryption failures from the encryption subsystem.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecryptionError {
    /// The Olm channel is corrupted and must be re-established.
    #[error("olm channel corrupted")]
    ChannelCorrupted,

    /// Encryption is not enabled for this session.
    #[error("encryption not enabled")]
    NotEnabled,

    /// The event announces an algorithm this client does not implement.
    #[error("unknown encryption algorithm: {0}")]
    UnknownAlgorithm(String),

    /// No session material for this ciphertext.
    #[error("unknown session: {0}")]
    UnknownSession(String),
}

/// Persistent store failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backend rejected or failed the operation.
    #[error("store backend error: {0}")]
    Backend(String),

    /// A stored row could not be decoded.
    #[error("corrupt store row: {0}")]
    Corrupt(String),

    /// The referenced session row does not exist.
    #[error("unknown client: {0}")]
    UnknownClient(String),
}
