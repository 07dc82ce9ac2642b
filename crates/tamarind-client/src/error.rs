//! Client error types for the Tamarind lock client

use std::time::Duration;

use tamarind_common::KeeperError;

/// Error type for session, lock and data operations
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The session could not be established
    #[error("connection failed: {0}")]
    Connection(String),

    /// The lock node is held by another session
    #[error("lock busy: {path}")]
    Contention { path: String },

    /// The ensemble failed for a reason other than contention
    #[error("coordination fault on {path}: {source}")]
    CoordinationFault {
        path: String,
        #[source]
        source: KeeperError,
    },

    #[error("node does not exist: {0}")]
    NodeMissing(String),

    #[error("write to {path} failed: {source}")]
    Write {
        path: String,
        #[source]
        source: KeeperError,
    },

    #[error("session expired")]
    SessionExpired,

    #[error("session closed")]
    Closed,

    #[error("gave up on {path} after {attempts} attempts ({waited:?})")]
    Timeout {
        path: String,
        attempts: u64,
        waited: Duration,
    },

    #[error("acquire of {path} cancelled")]
    Cancelled { path: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl ClientError {
    pub(crate) fn fault(path: &str, source: KeeperError) -> Self {
        match source {
            KeeperError::SessionExpired => ClientError::SessionExpired,
            source => ClientError::CoordinationFault {
                path: path.to_string(),
                source,
            },
        }
    }

    /// Whether retrying on the same session can never succeed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ClientError::SessionExpired | ClientError::Closed)
    }
}

impl From<config::ConfigError> for ClientError {
    fn from(err: config::ConfigError) -> Self {
        ClientError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
