//! Master-side operation errors.

use drover_proto::{ErrTag, ProtocolError};
use thiserror::Error;

/// Failure of one operation against a slave.
///
/// Tagged error boxes from the slave become the typed variants; anything
/// wire-level becomes `Protocol` or `Disconnected`. Local preconditions
/// (e.g. the destination of a fetch already existing) surface as `Io` before
/// any remote exchange begins.
#[derive(Debug, Error)]
pub enum OpError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("file exists: {0}")]
    FileExists(String),

    #[error("open failed: {0}")]
    OpenFailed(String),

    #[error("operation failed: {0}")]
    Failed(String),

    /// A tagged remote error with no dedicated variant.
    #[error("remote error [{tag}]: {message}")]
    Remote { tag: String, message: String },

    #[error("slave disconnected")]
    Disconnected,

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl OpError {
    /// Translates a received error box into the typed taxonomy.
    pub fn from_reply(tag: ErrTag, message: String) -> Self {
        match tag {
            ErrTag::NotFound => OpError::NotFound(message),
            ErrTag::FileExists => OpError::FileExists(message),
            ErrTag::OpenFailed => OpError::OpenFailed(message),
            ErrTag::Failed => OpError::Failed(message),
            other => OpError::Remote {
                tag: other.as_str().to_string(),
                message,
            },
        }
    }
}
