//! Error types for cosync core.

use thiserror::Error;

use crate::ids::{CoId, SessionId};

/// Errors raised by identifiers, cryptography and session logs.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("invalid identifier {value:?}: {reason}")]
    InvalidId { value: String, reason: &'static str },

    #[error("header does not hash to {expected}")]
    IdMismatch { expected: CoId },

    #[error("gap in session {session}: local log has {local} transactions, content starts after {after}")]
    Gap {
        session: SessionId,
        local: usize,
        after: usize,
    },

    #[error("no key available to encrypt private transaction")]
    MissingKey,

    #[error("encryption error: {0}")]
    EncryptionError(String),

    #[error("decryption error: {0}")]
    DecryptionError(String),

    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("decoding error: {0}")]
    DecodingError(String),

    #[error("invalid list position {index} (length {len})")]
    InvalidPosition { index: usize, len: usize },
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::DecodingError(e.to_string())
    }
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
