use thiserror::Error;

use crate::config::ConfigError;
use crate::core::connection::ConnectionState;

/// Errors surfaced to callers of the client runtime.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("client queue is full ({entries} entries, {bytes} bytes)")]
    QueueFull { entries: usize, bytes: u64 },
    #[error("client is shutting down")]
    Shutdown,
    #[error("request not possible while connection is {0}")]
    NotConnected(ConnectionState),
    #[error("connection is DEAD, reconnect explicitly before issuing requests")]
    Dead,
    #[error("queue already holds an entry with unique id {0}")]
    DuplicateEntry(u64),
    #[error("queue type '{0}' needs an external entry store")]
    UnsupportedQueueType(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Failures reported by a [`Transport`](crate::core::transport::Transport).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The remote side is unreachable. Drives the connection into POLLING.
    #[error("communication failure: {0}")]
    Communication(String),
    /// The broker answered but refused the request. Never retried.
    #[error("request rejected by broker: {0}")]
    Rejected(String),
    #[error("no response within {0} ms")]
    Timeout(u64),
}

impl TransportError {
    /// Whether retrying the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::Rejected(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_is_not_retryable() {
        assert!(!TransportError::Rejected("no".into()).is_retryable());
        assert!(TransportError::Communication("eof".into()).is_retryable());
        assert!(TransportError::Timeout(10).is_retryable());
    }

    #[test]
    fn display_mentions_state() {
        let err = ClientError::NotConnected(ConnectionState::Polling);
        assert_eq!(err.to_string(), "request not possible while connection is POLLING");
    }
}
