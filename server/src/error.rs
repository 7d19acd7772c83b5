//! Error and status types for the session layer.

use std::io;

/// Outcome of one non-blocking read attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxStatus {
    /// The requested byte count is now buffered.
    All,
    /// Some or no bytes arrived; try again on the next readiness event.
    Partial,
    /// The peer reset the connection.
    Reset,
    /// Any other read failure.
    Error(io::ErrorKind),
    /// Zero byte read: the peer closed its end.
    Disconnected,
}

/// Why a session was closed. Carried through the single closing path and
/// handed to every close listener.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CloseReason {
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("connection reset by peer")]
    Reset,
    #[error("read error: {0}")]
    ReadError(String),
    #[error("write error: {0}")]
    WriteError(String),
    #[error("send queue too big")]
    SendQueueOverflow,
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("kicked: {0}")]
    Kicked(String),
    #[error("disconnect timeout")]
    IdleTimeout,
    #[error("player exit")]
    Exit,
    #[error("server shutdown")]
    Shutdown,
}

impl CloseReason {
    /// Orderly departures are not logged as failures.
    pub fn is_orderly(&self) -> bool {
        matches!(
            self,
            CloseReason::PeerClosed | CloseReason::Exit | CloseReason::Shutdown
        )
    }
}

/// Failures of the server process itself, as opposed to one session.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid list server url {0:?}")]
    InvalidListServerUrl(String),
    #[error("list server {0} timed out")]
    ListServerTimeout(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orderly_reasons() {
        assert!(CloseReason::PeerClosed.is_orderly());
        assert!(CloseReason::Exit.is_orderly());
        assert!(!CloseReason::Reset.is_orderly());
        assert!(!CloseReason::ProtocolViolation("x".into()).is_orderly());
    }

    #[test]
    fn test_reason_messages() {
        assert_eq!(CloseReason::SendQueueOverflow.to_string(), "send queue too big");
        assert_eq!(
            CloseReason::Kicked("UDP link required".into()).to_string(),
            "kicked: UDP link required"
        );
    }
}
