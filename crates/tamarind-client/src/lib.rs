//! Tamarind Client - Distributed locks on a coordination ensemble
//!
//! This crate provides:
//! - Session management with a one-shot connect gate
//! - Session event dispatch and listeners
//! - Ephemeral-node locks with fixed-interval retry
//! - Node data access for state shared under a lock
//! - A ZooKeeper wire-protocol transport

pub mod config;
pub mod data;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod session;
pub mod watch;
pub mod zk;

pub use config::ClientConfig;
pub use data::NodeDataAccessor;
pub use error::{ClientError, Result};
pub use lock::{AcquireOptions, Acquisition, FaultPolicy, LockManager, LockPhase};
pub use session::{SessionCell, SessionManager, global_session, shutdown_global};
pub use watch::{ConnectLatch, FnSessionEventListener, SessionEventListener, WatchDispatcher};
pub use zk::{ZkClient, ZkConnector};

pub use tamarind_common::{SessionState, WatchedEvent};
