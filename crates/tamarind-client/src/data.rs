//! Node data access
//!
//! Reads and writes the payload of ordinary nodes, typically shared state
//! a critical section hands to the next lock holder. Writes are
//! unconditional and not tied to lock ownership: callers are expected to
//! write only while holding the matching lock.

use std::sync::Arc;

use tamarind_common::{
    ANY_VERSION, Coordinator, CreateMode, KeeperError, KeeperResult, Stat, parent_path,
    validate_path,
};
use tracing::debug;

use crate::error::{ClientError, Result};
use crate::session::SessionManager;

/// Create every missing ancestor of `path` as an empty persistent node.
pub(crate) async fn create_parents(coordinator: &dyn Coordinator, path: &str) -> KeeperResult<()> {
    let mut ancestors = Vec::new();
    let mut current = parent_path(path);
    while let Some(parent) = current {
        if parent == "/" {
            break;
        }
        ancestors.push(parent);
        current = parent_path(parent);
    }

    for ancestor in ancestors.into_iter().rev() {
        match coordinator.create(ancestor, b"", CreateMode::Persistent).await {
            Ok(_) => debug!(path = ancestor, "Created parent node"),
            Err(KeeperError::NodeExists(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Reader/writer of node payloads on one session
#[derive(Clone)]
pub struct NodeDataAccessor {
    session: Arc<SessionManager>,
}

impl NodeDataAccessor {
    pub fn new(session: Arc<SessionManager>) -> Self {
        Self { session }
    }

    /// Current payload of `path`. No watch is left behind.
    pub async fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.session.ensure_live()?;
        match self.session.coordinator().get_data(path).await {
            Ok((data, _)) => Ok(data),
            Err(KeeperError::NoNode(_)) => Err(ClientError::NodeMissing(path.to_string())),
            Err(e) => Err(ClientError::fault(path, e)),
        }
    }

    pub async fn read_string(&self, path: &str) -> Result<String> {
        let data = self.read(path).await?;
        String::from_utf8(data).map_err(|e| {
            ClientError::Other(anyhow::anyhow!("payload of {} is not UTF-8: {}", path, e))
        })
    }

    /// Overwrite the payload of an existing node, ignoring its version.
    pub async fn write(&self, path: &str, payload: &[u8]) -> Result<()> {
        self.session.ensure_live()?;
        match self
            .session
            .coordinator()
            .set_data(path, payload, ANY_VERSION)
            .await
        {
            Ok(stat) => {
                debug!(path, version = stat.version, bytes = payload.len(), "Wrote node data");
                Ok(())
            }
            Err(source) => Err(ClientError::Write {
                path: path.to_string(),
                source,
            }),
        }
    }

    pub async fn write_string(&self, path: &str, payload: &str) -> Result<()> {
        self.write(path, payload.as_bytes()).await
    }

    /// Node metadata, `None` when the node is absent.
    pub async fn stat(&self, path: &str) -> Result<Option<Stat>> {
        self.session.ensure_live()?;
        self.session
            .coordinator()
            .exists(path)
            .await
            .map_err(|e| ClientError::fault(path, e))
    }

    /// Create a persistent node and any missing parents.
    /// Returns `false` if the node already existed (its payload is kept).
    pub async fn create(&self, path: &str, payload: &[u8]) -> Result<bool> {
        self.session.ensure_live()?;
        validate_path(path).map_err(|e| ClientError::fault(path, e))?;

        let coordinator = self.session.coordinator().as_ref();
        create_parents(coordinator, path)
            .await
            .map_err(|e| ClientError::fault(path, e))?;

        match coordinator.create(path, payload, CreateMode::Persistent).await {
            Ok(_) => Ok(true),
            Err(KeeperError::NodeExists(_)) => Ok(false),
            Err(e) => Err(ClientError::fault(path, e)),
        }
    }
}
