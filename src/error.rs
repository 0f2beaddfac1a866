//! Protocol error taxonomy (RFC 1350 §5) and the crate's error types.

use thiserror::Error;

use crate::packet::DecodeError;

/// The RFC 1350 numeric error codes, 0 through 7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ProtocolErrorCode {
    NotDefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOperation = 4,
    UnknownTransferId = 5,
    FileAlreadyExists = 6,
    NoSuchUser = 7,
}

impl std::fmt::Display for ProtocolErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.code(), self.message())
    }
}

impl ProtocolErrorCode {
    /// The canonical RFC 1350 message for this code.
    pub fn message(self) -> &'static str {
        match self {
            ProtocolErrorCode::NotDefined => "Not defined, see error message",
            ProtocolErrorCode::FileNotFound => "File not found",
            ProtocolErrorCode::AccessViolation => "Access violation",
            ProtocolErrorCode::DiskFull => "Disk full or allocation exceeded",
            ProtocolErrorCode::IllegalOperation => "Illegal TFTP operation",
            ProtocolErrorCode::UnknownTransferId => "Unknown transfer ID",
            ProtocolErrorCode::FileAlreadyExists => "File already exists",
            ProtocolErrorCode::NoSuchUser => "No such user",
        }
    }

    pub fn code(self) -> u16 {
        self as u16
    }
}

/// Errors raised while driving a single transfer, from either role.
#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed packet: {0}")]
    Decode(#[from] DecodeError),

    #[error("peer sent ERROR {code}: {message}")]
    PeerError { code: u16, message: String },

    #[error("protocol violation: {0}")]
    Protocol(ProtocolErrorCode),

    #[error("file exceeds the {0}-block maximum")]
    FileTooLarge(usize),

    #[error("timed out after {0} retries")]
    RetriesExhausted(u32),

    #[error("idle timeout")]
    IdleTimeout,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The ERROR packet this failure should produce for the peer, if any.
    /// Retry/idle exhaustion never generates a wire ERROR (spec: "simply close the session").
    pub fn to_wire_error(&self) -> Option<(u16, String)> {
        match self {
            Error::Decode(_) => Some((
                ProtocolErrorCode::IllegalOperation.code(),
                ProtocolErrorCode::IllegalOperation.message().to_string(),
            )),
            Error::Protocol(code) => Some((code.code(), code.message().to_string())),
            Error::FileTooLarge(_) => Some((
                ProtocolErrorCode::DiskFull.code(),
                "file exceeds maximum supported size".to_string(),
            )),
            Error::PeerError { .. } | Error::RetriesExhausted(_) | Error::IdleTimeout => None,
            Error::Io(e) => Some((
                ProtocolErrorCode::AccessViolation.code(),
                e.to_string(),
            )),
        }
    }
}
