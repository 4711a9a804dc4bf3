//! Error taxonomy shared by the registry, the transfer engine and sessions.
//!
//! Every fallible operation in the crate returns [`Result`]. Wrapping
//! variants ([`Error::Phase`], [`Error::Chunk`], [`Error::RetriesExhausted`])
//! carry context; [`Error::kind`] looks through them to the root cause.

use std::fmt;
use std::io;
use std::str::FromStr;

use thiserror::Error;

use crate::events::UpdatePhase;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorKind {
    /// Operation or feature absent on this device or backend.
    NotSupported,
    /// Device reported busy; eligible for retry.
    Busy,
    /// A bounded wait elapsed.
    Timeout,
    /// Malformed response, checksum or size mismatch, malformed log.
    InvalidData,
    /// Insufficient privileges to reach the device.
    PermissionDenied,
    /// Device or record not present.
    NotFound,
    /// Caller cancelled the session.
    Cancelled,
    /// Programming-contract violation.
    Internal,
    /// Any other I/O failure.
    Io,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotSupported => "not-supported",
            ErrorKind::Busy => "busy",
            ErrorKind::Timeout => "timeout",
            ErrorKind::InvalidData => "invalid-data",
            ErrorKind::PermissionDenied => "permission-denied",
            ErrorKind::NotFound => "not-found",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
            ErrorKind::Io => "io",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "not-supported" => ErrorKind::NotSupported,
            "busy" => ErrorKind::Busy,
            "timeout" => ErrorKind::Timeout,
            "invalid-data" => ErrorKind::InvalidData,
            "permission-denied" => ErrorKind::PermissionDenied,
            "not-found" => ErrorKind::NotFound,
            "cancelled" => ErrorKind::Cancelled,
            "internal" => ErrorKind::Internal,
            "io" => ErrorKind::Io,
            other => return Err(Error::InvalidData(format!("unknown error kind '{other}'"))),
        })
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Device busy: {0}")]
    Busy(String),

    #[error("Timeout after {timeout_ms}ms: {message}")]
    Timeout { timeout_ms: u64, message: String },

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Data mismatch at offset 0x{offset:X} (address 0x{address:X}): expected 0x{expected:02X}, got 0x{actual:02X}")]
    Mismatch {
        offset: usize,
        address: u64,
        expected: u8,
        actual: u8,
    },

    #[error("Checksum mismatch at 0x{address:X}: expected 0x{expected:04X}, got 0x{actual:04X}")]
    ChecksumMismatch {
        address: u64,
        expected: u16,
        actual: u16,
    },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{phase}: {source}")]
    Phase {
        phase: UpdatePhase,
        source: Box<Error>,
    },

    #[error("chunk {index} at 0x{address:X}: {source}")]
    Chunk {
        index: usize,
        address: u64,
        source: Box<Error>,
    },

    #[error("failed after {attempts} attempts: {source}")]
    RetriesExhausted { attempts: u32, source: Box<Error> },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Build an error of the given kind, e.g. when replaying a recorded failure.
    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::NotSupported => Error::NotSupported(message),
            ErrorKind::Busy => Error::Busy(message),
            ErrorKind::Timeout => Error::Timeout {
                timeout_ms: 0,
                message,
            },
            ErrorKind::InvalidData => Error::InvalidData(message),
            ErrorKind::PermissionDenied => Error::PermissionDenied(message),
            ErrorKind::NotFound => Error::NotFound(message),
            ErrorKind::Cancelled => Error::Cancelled,
            ErrorKind::Internal => Error::Internal(message),
            ErrorKind::Io => Error::Io(io::Error::other(message)),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotSupported(_) => ErrorKind::NotSupported,
            Error::Busy(_) => ErrorKind::Busy,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::InvalidData(_) | Error::Mismatch { .. } | Error::ChecksumMismatch { .. } => {
                ErrorKind::InvalidData
            }
            Error::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Internal(_) => ErrorKind::Internal,
            Error::Phase { source, .. }
            | Error::Chunk { source, .. }
            | Error::RetriesExhausted { source, .. } => source.kind(),
            Error::Io(e) => match e.kind() {
                io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
                io::ErrorKind::TimedOut => ErrorKind::Timeout,
                io::ErrorKind::NotFound => ErrorKind::NotFound,
                _ => ErrorKind::Io,
            },
        }
    }

    /// Innermost error with all context wrappers removed.
    pub fn root(&self) -> &Error {
        match self {
            Error::Phase { source, .. }
            | Error::Chunk { source, .. }
            | Error::RetriesExhausted { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether a retry loop gave up somewhere beneath the context wrappers.
    pub fn is_retries_exhausted(&self) -> bool {
        match self {
            Error::RetriesExhausted { .. } => true,
            Error::Phase { source, .. } | Error::Chunk { source, .. } => {
                source.is_retries_exhausted()
            }
            _ => false,
        }
    }

    /// Prefix with the phase the error occurred in. Already-prefixed errors
    /// are left alone.
    pub fn in_phase(self, phase: UpdatePhase) -> Self {
        match self {
            Error::Phase { .. } => self,
            other => Error::Phase {
                phase,
                source: Box::new(other),
            },
        }
    }

    /// Phase recorded by [`Error::in_phase`], if any.
    pub fn phase(&self) -> Option<UpdatePhase> {
        match self {
            Error::Phase { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    pub fn in_chunk(self, index: usize, address: u64) -> Self {
        Error::Chunk {
            index,
            address,
            source: Box::new(self),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::InvalidData(format!("malformed JSON: {e}"))
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::InvalidData(format!("malformed TOML: {e}"))
    }
}

impl From<toml::ser::Error> for Error {
    fn from(e: toml::ser::Error) -> Self {
        Error::Internal(format!("cannot serialize TOML: {e}"))
    }
}

impl From<base64::DecodeError> for Error {
    fn from(e: base64::DecodeError) -> Self {
        Error::InvalidData(format!("malformed base64: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_looks_through_context() {
        let err = Error::Busy("status 0x05".into())
            .in_chunk(3, 0x80)
            .in_phase(UpdatePhase::Write);
        assert_eq!(err.kind(), ErrorKind::Busy);
        assert_eq!(err.phase(), Some(UpdatePhase::Write));
        assert!(matches!(err.root(), Error::Busy(_)));
        assert_eq!(
            err.to_string(),
            "Write: chunk 3 at 0x80: Device busy: status 0x05"
        );
    }

    #[test]
    fn test_in_phase_keeps_first_phase() {
        let err = Error::Cancelled
            .in_phase(UpdatePhase::Detach)
            .in_phase(UpdatePhase::Write);
        assert_eq!(err.phase(), Some(UpdatePhase::Detach));
    }

    #[test]
    fn test_io_permission_denied_is_distinct() {
        let err = Error::from(io::Error::from(io::ErrorKind::PermissionDenied));
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);

        let err = Error::from(io::Error::other("pipe"));
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_mismatch_is_invalid_data() {
        let err = Error::Mismatch {
            offset: 17,
            address: 0x1011,
            expected: 0xAA,
            actual: 0x55,
        };
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn test_kind_string_round_trip() {
        for kind in [
            ErrorKind::NotSupported,
            ErrorKind::Busy,
            ErrorKind::Timeout,
            ErrorKind::PermissionDenied,
            ErrorKind::Io,
        ] {
            assert_eq!(kind.as_str().parse::<ErrorKind>().unwrap(), kind);
            assert_eq!(Error::from_kind(kind, "x").kind(), kind);
        }
        assert!("bogus".parse::<ErrorKind>().is_err());
    }
}
