//! Ensemble client traits
//!
//! These traits abstract away the concrete coordination ensemble, so the
//! locking layer works unchanged against the in-memory ensemble and the
//! wire-protocol transport.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::KeeperError;
use crate::model::{CreateMode, Stat, WatchedEvent};
use crate::utils::Endpoint;

/// Channel a session delivers its watched events into.
pub type EventSink = mpsc::UnboundedSender<WatchedEvent>;

/// Result type of ensemble operations
pub type KeeperResult<T> = std::result::Result<T, KeeperError>;

/// Handle to one session on a coordination ensemble.
///
/// Operations issued before the handshake completes, or while the
/// transport is down, fail with [`KeeperError::ConnectionLoss`].
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Server-issued session id, 0 until the handshake completes.
    fn session_id(&self) -> i64;

    /// Session timeout negotiated with the ensemble.
    fn negotiated_timeout(&self) -> Duration;

    /// Create a node; returns the actual path (differs for sequential modes).
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> KeeperResult<String>;

    /// Delete a node. `version` may be [`crate::ANY_VERSION`].
    async fn delete(&self, path: &str, version: i32) -> KeeperResult<()>;

    /// Read node data without leaving a watch.
    async fn get_data(&self, path: &str) -> KeeperResult<(Vec<u8>, Stat)>;

    /// Overwrite node data. `version` may be [`crate::ANY_VERSION`].
    async fn set_data(&self, path: &str, data: &[u8], version: i32) -> KeeperResult<Stat>;

    /// Node metadata, `None` when absent.
    async fn exists(&self, path: &str) -> KeeperResult<Option<Stat>>;

    /// End the session; its ephemeral nodes are removed.
    async fn close(&self) -> KeeperResult<()>;
}

/// Factory that opens sessions on an ensemble.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Start the asynchronous session handshake.
    ///
    /// Returns as soon as the handshake is under way; completion is
    /// reported as a `SyncConnected` event on `events`. Errors here mean
    /// the handshake could not even be started.
    async fn connect(
        &self,
        endpoints: &[Endpoint],
        session_timeout: Duration,
        events: EventSink,
    ) -> KeeperResult<Arc<dyn Coordinator>>;
}
