//! Protocol error types and the remote error-tag taxonomy.

use std::fmt;
use thiserror::Error;

/// Errors raised by the framing, wire, and RPC layers.
///
/// Every variant is fatal to the connection it occurred on, never to the
/// process.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("box key must be 1-255 bytes, got {0} bytes")]
    InvalidKeyLength(usize),

    #[error("box value too large: {size} bytes (max {max})")]
    ValueTooLarge { size: usize, max: usize },

    #[error("invalid key length field {0:#06x} on the wire")]
    BadKeyLengthField(u16),

    #[error("duplicate key {0:?} in one box")]
    DuplicateKey(String),

    #[error("box key is not valid UTF-8")]
    KeyNotUtf8,

    #[error("EOF in the middle of a box")]
    UnexpectedEof,

    #[error("missing required key: {0}")]
    MissingKey(&'static str),

    #[error("value for key {0:?} is not valid UTF-8")]
    ValueNotUtf8(String),

    #[error("value for key {0:?} is not a decimal integer")]
    ValueNotInt(String),

    #[error("correlation token mismatch: expected {expected:?}, got {got:?}")]
    TokenMismatch { expected: String, got: String },

    #[error("unknown command {0:?}")]
    UnknownCommand(String),

    #[error("response has neither _answer nor _error")]
    MalformedReply,

    #[error("unexpected box: {0}")]
    UnexpectedBox(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Machine-readable error kinds carried in the `errtag` key of failure boxes.
///
/// These strings are part of the wire contract and must remain stable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrTag {
    NotFound,
    FileExists,
    OpenFailed,
    Failed,
    Invalid,
    InvalidMethod,
    VersionTooNew,
    VersionUnsupported,
    ExecFailed,
    WriteFailed,
    ReadFailed,
    Unknown,
    /// A tag this implementation does not recognize.
    Other(String),
}

impl ErrTag {
    /// Returns the wire representation of this tag.
    pub fn as_str(&self) -> &str {
        match self {
            ErrTag::NotFound => "notfound",
            ErrTag::FileExists => "fileexists",
            ErrTag::OpenFailed => "openfailed",
            ErrTag::Failed => "failed",
            ErrTag::Invalid => "invalid",
            ErrTag::InvalidMethod => "invalid-meth",
            ErrTag::VersionTooNew => "version-too-new",
            ErrTag::VersionUnsupported => "version-unsupported",
            ErrTag::ExecFailed => "execfail",
            ErrTag::WriteFailed => "writefailed",
            ErrTag::ReadFailed => "readfailed",
            ErrTag::Unknown => "unknown",
            ErrTag::Other(s) => s,
        }
    }

    /// Parses a tag received on the wire. Unrecognized tags are preserved.
    pub fn from_wire(s: &str) -> Self {
        match s {
            "notfound" => ErrTag::NotFound,
            "fileexists" => ErrTag::FileExists,
            "openfailed" => ErrTag::OpenFailed,
            "failed" => ErrTag::Failed,
            "invalid" => ErrTag::Invalid,
            "invalid-meth" => ErrTag::InvalidMethod,
            "version-too-new" => ErrTag::VersionTooNew,
            "version-unsupported" => ErrTag::VersionUnsupported,
            "execfail" => ErrTag::ExecFailed,
            "writefailed" => ErrTag::WriteFailed,
            "readfailed" => ErrTag::ReadFailed,
            "unknown" => ErrTag::Unknown,
            other => ErrTag::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ErrTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errtag_roundtrip() {
        for tag in [
            ErrTag::NotFound,
            ErrTag::FileExists,
            ErrTag::OpenFailed,
            ErrTag::Failed,
            ErrTag::Invalid,
            ErrTag::InvalidMethod,
            ErrTag::VersionTooNew,
            ErrTag::VersionUnsupported,
            ErrTag::ExecFailed,
            ErrTag::WriteFailed,
            ErrTag::ReadFailed,
            ErrTag::Unknown,
        ] {
            assert_eq!(ErrTag::from_wire(tag.as_str()), tag);
        }
    }

    #[test]
    fn test_errtag_unrecognized_preserved() {
        let tag = ErrTag::from_wire("quotafull");
        assert_eq!(tag, ErrTag::Other("quotafull".to_string()));
        assert_eq!(tag.as_str(), "quotafull");
    }

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::BadKeyLengthField(0x1ff);
        assert!(err.to_string().contains("0x01ff"));

        let err = ProtocolError::DuplicateKey("meth".to_string());
        assert!(err.to_string().contains("meth"));

        let err = ProtocolError::TokenMismatch {
            expected: "3".to_string(),
            got: "7".to_string(),
        };
        assert!(err.to_string().contains("3") && err.to_string().contains("7"));
    }
}
