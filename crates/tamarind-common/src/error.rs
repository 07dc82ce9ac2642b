//! Error types and error codes for Tamarind
//!
//! This module defines:
//! - `KeeperError`: failures reported by a coordination ensemble
//! - `ErrorCode`: the numeric codes ensembles put on the wire

use serde::{Deserialize, Serialize};

/// Failure of a single coordination-ensemble operation.
///
/// Variants mirror the ensemble's own error codes so that both the
/// in-memory ensemble and the wire transport report faults identically.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum KeeperError {
    #[error("node already exists: {0}")]
    NodeExists(String),

    #[error("node does not exist: {0}")]
    NoNode(String),

    #[error("version mismatch: {0}")]
    BadVersion(String),

    #[error("node has children: {0}")]
    NotEmpty(String),

    #[error("ephemeral nodes may not have children: {0}")]
    NoChildrenForEphemerals(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("bad arguments: {0}")]
    BadArguments(String),

    #[error("connection loss")]
    ConnectionLoss,

    #[error("session expired")]
    SessionExpired,

    #[error("session moved")]
    SessionMoved,

    #[error("operation timeout")]
    OperationTimeout,

    #[error("authentication failed")]
    AuthFailed,

    #[error("io error: {0}")]
    Io(String),

    #[error("ensemble returned error code {0}")]
    Server(i32),
}

impl KeeperError {
    /// Wire error code for this error.
    pub fn code(&self) -> i32 {
        match self {
            KeeperError::NodeExists(_) => NODE_EXISTS.code,
            KeeperError::NoNode(_) => NO_NODE.code,
            KeeperError::BadVersion(_) => BAD_VERSION.code,
            KeeperError::NotEmpty(_) => NOT_EMPTY.code,
            KeeperError::NoChildrenForEphemerals(_) => NO_CHILDREN_FOR_EPHEMERALS.code,
            KeeperError::InvalidPath(_) | KeeperError::BadArguments(_) => BAD_ARGUMENTS.code,
            KeeperError::ConnectionLoss | KeeperError::Io(_) => CONNECTION_LOSS.code,
            KeeperError::SessionExpired => SESSION_EXPIRED.code,
            KeeperError::SessionMoved => SESSION_MOVED.code,
            KeeperError::OperationTimeout => OPERATION_TIMEOUT.code,
            KeeperError::AuthFailed => AUTH_FAILED.code,
            KeeperError::Server(code) => *code,
        }
    }

    /// Build an error from a wire code. `path` names the node the failed
    /// request targeted.
    pub fn from_code(code: i32, path: &str) -> Self {
        match code {
            c if c == NODE_EXISTS.code => KeeperError::NodeExists(path.to_string()),
            c if c == NO_NODE.code => KeeperError::NoNode(path.to_string()),
            c if c == BAD_VERSION.code => KeeperError::BadVersion(path.to_string()),
            c if c == NOT_EMPTY.code => KeeperError::NotEmpty(path.to_string()),
            c if c == NO_CHILDREN_FOR_EPHEMERALS.code => {
                KeeperError::NoChildrenForEphemerals(path.to_string())
            }
            c if c == BAD_ARGUMENTS.code => KeeperError::BadArguments(path.to_string()),
            c if c == CONNECTION_LOSS.code => KeeperError::ConnectionLoss,
            c if c == SESSION_EXPIRED.code => KeeperError::SessionExpired,
            c if c == SESSION_MOVED.code => KeeperError::SessionMoved,
            c if c == OPERATION_TIMEOUT.code => KeeperError::OperationTimeout,
            c if c == AUTH_FAILED.code => KeeperError::AuthFailed,
            other => KeeperError::Server(other),
        }
    }

    /// Whether the node already existed (lock contention on create).
    pub fn is_node_exists(&self) -> bool {
        matches!(self, KeeperError::NodeExists(_))
    }

    /// Whether the outcome of the request is unknown: it may or may not
    /// have been applied before the connection dropped.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            KeeperError::ConnectionLoss | KeeperError::Io(_) | KeeperError::OperationTimeout
        )
    }

    /// Whether the session can no longer be used.
    pub fn is_session_terminal(&self) -> bool {
        matches!(self, KeeperError::SessionExpired | KeeperError::AuthFailed)
    }
}

impl From<std::io::Error> for KeeperError {
    fn from(e: std::io::Error) -> Self {
        KeeperError::Io(e.to_string())
    }
}

/// Error code structure for wire responses
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCode<'a> {
    pub code: i32,
    pub message: &'a str,
}

pub const OK: ErrorCode<'static> = ErrorCode {
    code: 0,
    message: "ok",
};

// System errors
pub const SYSTEM_ERROR: ErrorCode<'static> = ErrorCode {
    code: -1,
    message: "system error",
};

pub const CONNECTION_LOSS: ErrorCode<'static> = ErrorCode {
    code: -4,
    message: "connection loss",
};

pub const MARSHALLING_ERROR: ErrorCode<'static> = ErrorCode {
    code: -5,
    message: "marshalling error",
};

pub const OPERATION_TIMEOUT: ErrorCode<'static> = ErrorCode {
    code: -7,
    message: "operation timeout",
};

pub const BAD_ARGUMENTS: ErrorCode<'static> = ErrorCode {
    code: -8,
    message: "bad arguments",
};

// API errors
pub const NO_NODE: ErrorCode<'static> = ErrorCode {
    code: -101,
    message: "no node",
};

pub const NO_AUTH: ErrorCode<'static> = ErrorCode {
    code: -102,
    message: "not authenticated",
};

pub const BAD_VERSION: ErrorCode<'static> = ErrorCode {
    code: -103,
    message: "bad version",
};

pub const NO_CHILDREN_FOR_EPHEMERALS: ErrorCode<'static> = ErrorCode {
    code: -108,
    message: "no children for ephemerals",
};

pub const NODE_EXISTS: ErrorCode<'static> = ErrorCode {
    code: -110,
    message: "node exists",
};

pub const NOT_EMPTY: ErrorCode<'static> = ErrorCode {
    code: -111,
    message: "not empty",
};

pub const SESSION_EXPIRED: ErrorCode<'static> = ErrorCode {
    code: -112,
    message: "session expired",
};

pub const AUTH_FAILED: ErrorCode<'static> = ErrorCode {
    code: -115,
    message: "auth failed",
};

pub const SESSION_MOVED: ErrorCode<'static> = ErrorCode {
    code: -118,
    message: "session moved",
};
