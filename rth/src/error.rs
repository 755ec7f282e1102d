//! Error taxonomy for the controller library.
//!
//! Creation faults of the I/O class are worth a bounded retry; everything
//! else aborts agent selection immediately. Exchange faults poison the
//! channel. Timeouts are their own variant so callers can never mistake
//! them for an ordinary failure.

use rth_common::ProtocolError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    /// Worker process failed to spawn (or the listener could not be bound).
    #[error("failed to launch worker process: {0}")]
    Spawn(#[source] std::io::Error),
    /// Worker spawned but the callback connection failed.
    #[error("worker callback connection failed: {0}")]
    Handshake(#[source] std::io::Error),
    /// Worker never connected back within the accept window.
    #[error("worker did not connect back within {0:?}")]
    HandshakeTimeout(Duration),
    /// Stream I/O failed mid-exchange; the channel is no longer usable.
    #[error("i/o on worker channel: {0}")]
    Io(#[source] std::io::Error),
    /// The worker broke the framing contract; the channel is no longer
    /// trustworthy and must not return to the pool.
    #[error("worker protocol violation: {0}")]
    Protocol(#[source] ProtocolError),
    /// The channel was closed, locally or by a pool force-close.
    #[error("worker channel is closed")]
    Closed,
    /// The exchange outlived its timeout.
    #[error("action timed out after {elapsed:?} (diagnostic handler completed: {handler_completed})")]
    Timeout {
        elapsed: Duration,
        handler_completed: bool,
    },
}

impl AgentError {
    /// Whether agent selection may retry after this fault.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Spawn(_) | Self::Handshake(_) | Self::HandshakeTimeout(_) | Self::Io(_)
        )
    }

    pub(crate) fn from_protocol(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) => Self::Io(e),
            other => Self::Protocol(other),
        }
    }
}

/// Outcome of bounded agent selection: the last fault plus every prior
/// fault, oldest first.
#[derive(Debug, Error)]
#[error("no worker available after {attempts} attempt(s): {last}")]
pub struct SelectionError {
    pub attempts: u32,
    pub last: AgentError,
    pub suppressed: Vec<AgentError>,
}

/// Supervised command execution failed before any status could be produced.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to start command: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("i/o while supervising command: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn io_err() -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused")
    }

    #[test]
    fn test_creation_faults_are_retryable() {
        assert!(AgentError::Spawn(io_err()).is_retryable());
        assert!(AgentError::Handshake(io_err()).is_retryable());
        assert!(AgentError::HandshakeTimeout(Duration::from_secs(60)).is_retryable());
        assert!(AgentError::Io(io_err()).is_retryable());
    }

    #[test]
    fn test_other_faults_abort_selection() {
        assert!(!AgentError::Closed.is_retryable());
        assert!(!AgentError::Protocol(ProtocolError::UnknownOp(0xee)).is_retryable());
        assert!(
            !AgentError::Timeout {
                elapsed: Duration::from_secs(2),
                handler_completed: true
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_protocol_io_maps_to_io_fault() {
        let err = AgentError::from_protocol(ProtocolError::Io(io_err()));
        assert!(matches!(err, AgentError::Io(_)));
        let err = AgentError::from_protocol(ProtocolError::UnknownOp(9));
        assert!(matches!(err, AgentError::Protocol(_)));
    }

    #[test]
    fn test_selection_error_display_carries_attempts() {
        let err = SelectionError {
            attempts: 3,
            last: AgentError::Spawn(io_err()),
            suppressed: vec![AgentError::Spawn(io_err()), AgentError::Spawn(io_err())],
        };
        let text = err.to_string();
        assert!(text.contains("3 attempt(s)"), "{text}");
        assert_eq!(err.suppressed.len(), 2);
    }
}
