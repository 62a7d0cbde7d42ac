//! # Error Types
//!
//! Error handling for the backup protocol.
//!
//! Every fallible operation in the crate returns [`Result`], whose error side is
//! [`ProtocolError`]. The variants follow the layers a message passes through:
//!
//! ## Error Categories
//! - **Codec**: the frame could not be decoded (`MalformedHeader`,
//!   `PayloadLengthMismatch`, `UnknownMessageCode`, `OversizedPacket`)
//! - **Protocol**: a decoded request broke a precondition (`ProtocolViolation`)
//! - **Cryptographic**: key import, wrap or block decryption failed
//! - **Persistence**: the store rejected or could not serve a request
//! - **Ambient**: I/O, configuration, serialization
//!
//! Codec errors are answered with `GENERAL_ERROR` and the connection stays open.
//! `StorageUnavailable` is fatal for the whole server, see [`ProtocolError::is_fatal`].
//!
//! ## Example Usage
//! ```rust
//! use backup_protocol::error::{ProtocolError, Result};
//!
//! fn check_mode(transfer: bool) -> Result<()> {
//!     if !transfer {
//!         return Err(ProtocolError::ProtocolViolation("file sent in control mode".into()));
//!     }
//!     Ok(())
//! }
//!
//! assert!(check_mode(false).is_err());
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Mode errors
    pub const ERR_NOT_CONTROL_MODE: &str = "request only allowed in control mode";
    pub const ERR_NOT_TRANSFER_MODE: &str = "request only allowed in transfer mode";

    /// Binding errors
    pub const ERR_IDENTITY_MISMATCH: &str = "client identity does not match session";
    pub const ERR_USERNAME_MISMATCH: &str = "username does not match session";
    pub const ERR_FILENAME_MISMATCH: &str = "filename does not match pending transfer";
    pub const ERR_NO_SESSION_KEY: &str = "no session key negotiated";

    /// Payload shape errors
    pub const ERR_PAYLOAD_SIZE: &str = "wrong payload size for request";
    pub const ERR_CIPHERTEXT_TOO_SHORT: &str = "ciphertext shorter than declared content size";

    /// Name field errors
    pub const ERR_EMPTY_NAME: &str = "name field is empty";
    pub const ERR_NAME_NOT_UTF8: &str = "name field is not valid utf-8";
    pub const ERR_NAME_FORBIDDEN: &str = "name field contains forbidden characters";
    pub const ERR_NAME_TOO_LONG: &str = "name exceeds 255 bytes";

    /// Connection errors
    pub const ERR_SESSION_CLOSED: &str = "session is no longer active";
}

/// ProtocolError is the primary error type for all protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Malformed header: fewer than 23 bytes")]
    MalformedHeader,

    #[error("Payload length mismatch: declared {declared}, got {actual}")]
    PayloadLengthMismatch { declared: usize, actual: usize },

    #[error("Unknown message code: {0}")]
    UnknownMessageCode(u16),

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Key import failed: {0}")]
    KeyImportError(String),

    #[error("Decryption failed")]
    DecryptionFailure,

    #[error("Encryption failed")]
    EncryptionFailure,

    #[error("Username already registered")]
    DuplicateUsername,

    #[error("Unknown client")]
    UnknownClient,

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Connection closed")]
    ConnectionClosed,
}

impl ProtocolError {
    /// Errors raised while framing, before a request reaches the state machine.
    pub fn is_codec_error(&self) -> bool {
        matches!(
            self,
            Self::MalformedHeader
                | Self::PayloadLengthMismatch { .. }
                | Self::UnknownMessageCode(_)
        )
    }

    /// Errors that must stop the whole server, not just one session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_))
    }
}

impl From<&'static str> for ProtocolError {
    fn from(msg: &'static str) -> Self {
        ProtocolError::ProtocolViolation(msg.to_string())
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
