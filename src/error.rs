//! Crate-wide error type.

use crate::protocol::control::RejectReason;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("connection rejected ({reason:?}): {message}")]
    Rejected {
        reason: RejectReason,
        message: String,
    },

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("connection corrupted after {0} consecutive frame errors")]
    StreamCorrupted(u32),

    #[error("not connected")]
    NotConnected,

    #[error("already running")]
    AlreadyRunning,
}

pub type Result<T> = std::result::Result<T, AudioError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_contains_context() {
        let e = AudioError::Rejected {
            reason: RejectReason::Busy,
            message: "maximum clients (4) reached".into(),
        };
        let msg = format!("{}", e);
        assert!(msg.contains("Busy"));
        assert!(msg.contains("maximum clients"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let e: AudioError = io.into();
        assert!(matches!(e, AudioError::Io(_)));
    }
}
