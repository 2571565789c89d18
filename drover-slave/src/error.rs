//! Slave error types.

use drover_proto::{ErrTag, ProtocolError};
use thiserror::Error;

/// Fatal slave-side errors. These terminate the connection's serve loop.
#[derive(Debug, Error)]
pub enum SlaveError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("registration failed: {0}")]
    Registration(String),
}

/// Outcome of one operation handler.
///
/// A rejection is reported to the master as an error box and the serve loop
/// continues; anything fatal tears the connection down. Handlers return one
/// or the other instead of unwinding, so a rejection can never escape after
/// a response has been sent.
#[derive(Debug)]
pub enum OpFault {
    /// The operation failed in a way the master can act on.
    Reject { tag: ErrTag, message: String },

    /// The connection itself is broken.
    Fatal(ProtocolError),
}

impl OpFault {
    pub fn reject(tag: ErrTag, message: impl Into<String>) -> Self {
        OpFault::Reject {
            tag,
            message: message.into(),
        }
    }

    /// Rejection carrying an OS error's message.
    pub fn os(tag: ErrTag, err: &std::io::Error) -> Self {
        OpFault::reject(tag, err.to_string())
    }
}

impl From<ProtocolError> for OpFault {
    fn from(err: ProtocolError) -> Self {
        OpFault::Fatal(err)
    }
}
