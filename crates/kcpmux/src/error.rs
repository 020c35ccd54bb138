use std::io;

use thiserror::Error;

// ── Errors ──────────────────────────────────────────────────────────

/// Errors returned by [`Session`](crate::session::Session) reads and writes.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The send window has no room; nothing was enqueued. Retry later.
    #[error("send window full")]
    WindowFull,
    /// The record can never be sent in one piece.
    #[error("record of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },
    /// The next record does not fit the buffer; it is still queued.
    #[error("record of {needed} bytes does not fit a {capacity} byte buffer")]
    BufferTooSmall { needed: usize, capacity: usize },
    /// Nothing became readable before the deadline.
    #[error("timed out")]
    TimedOut,
    /// The session is dead.
    #[error("session closed")]
    Closed,
    /// The transport failed; the session is now dead.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
}

impl SessionError {
    /// Whether the same call may succeed later on this session.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SessionError::WindowFull | SessionError::BufferTooSmall { .. } | SessionError::TimedOut
        )
    }

    /// Whether the session is dead.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionError::Closed | SessionError::Transport(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(SessionError::WindowFull.is_retryable());
        assert!(SessionError::BufferTooSmall {
            needed: 10,
            capacity: 4
        }
        .is_retryable());
        assert!(SessionError::TimedOut.is_retryable());
        assert!(!SessionError::Closed.is_retryable());
        assert!(!SessionError::TooLarge { len: 1, max: 0 }.is_retryable());
    }

    #[test]
    fn terminal_classification() {
        assert!(SessionError::Closed.is_terminal());
        let io = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert!(SessionError::from(io).is_terminal());
        assert!(!SessionError::WindowFull.is_terminal());
    }

    #[test]
    fn messages_carry_sizes() {
        let err = SessionError::BufferTooSmall {
            needed: 100,
            capacity: 10,
        };
        assert_eq!(
            err.to_string(),
            "record of 100 bytes does not fit a 10 byte buffer"
        );
    }
}
