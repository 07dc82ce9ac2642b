//! ZooKeeper wire-protocol transport
//!
//! `ZkConnector` opens sessions on a real ensemble. Endpoints are shuffled
//! and tried in turn; requests issued while disconnected fail with
//! `ConnectionLoss`, and a session the ensemble no longer knows is
//! reported as `Expired` and never resumed.

pub mod connection;
pub mod proto;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::seq::SliceRandom;
use tamarind_common::{
    Connector, Coordinator, CreateMode, Endpoint, EventSink, KeeperError, KeeperResult,
    KeeperState, Stat, WatchedEvent, validate_path,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use self::connection::{Call, SessionEngine, SessionShared};
use self::proto::{Request, decode_create, decode_get_data, decode_stat};

/// Opens sessions over TCP
#[derive(Debug, Clone)]
pub struct ZkConnector {
    shuffle: bool,
}

impl Default for ZkConnector {
    fn default() -> Self {
        Self { shuffle: true }
    }
}

impl ZkConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep the configured endpoint order instead of shuffling.
    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }
}

#[async_trait]
impl Connector for ZkConnector {
    async fn connect(
        &self,
        endpoints: &[Endpoint],
        session_timeout: Duration,
        events: EventSink,
    ) -> KeeperResult<Arc<dyn Coordinator>> {
        if endpoints.is_empty() {
            return Err(KeeperError::BadArguments(
                "endpoint list is empty".to_string(),
            ));
        }

        let mut endpoints = endpoints.to_vec();
        if self.shuffle {
            endpoints.shuffle(&mut rand::rng());
        }
        debug!(endpoints = ?endpoints, "Starting session engine");

        let (calls_tx, calls_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SessionShared::new(session_timeout));
        let engine = SessionEngine::new(
            endpoints,
            session_timeout,
            events.clone(),
            shared.clone(),
            calls_rx,
        );
        tokio::spawn(engine.run());

        Ok(Arc::new(ZkClient {
            shared,
            calls: calls_tx,
            events,
            closed: AtomicBool::new(false),
        }))
    }
}

/// Session handle on a ZooKeeper ensemble
pub struct ZkClient {
    shared: Arc<SessionShared>,
    calls: mpsc::UnboundedSender<Call>,
    events: EventSink,
    closed: AtomicBool,
}

impl ZkClient {
    fn gone(&self) -> KeeperError {
        if self.shared.expired.load(Ordering::Acquire) {
            KeeperError::SessionExpired
        } else {
            KeeperError::ConnectionLoss
        }
    }

    async fn call(&self, request: Request) -> KeeperResult<Bytes> {
        if !self.shared.connected.load(Ordering::Acquire) {
            return Err(self.gone());
        }
        let (reply, response) = oneshot::channel();
        self.calls
            .send(Call { request, reply })
            .map_err(|_| self.gone())?;
        response.await.map_err(|_| self.gone())?
    }
}

#[async_trait]
impl Coordinator for ZkClient {
    fn session_id(&self) -> i64 {
        self.shared.session_id.load(Ordering::Acquire)
    }

    fn negotiated_timeout(&self) -> Duration {
        Duration::from_millis(self.shared.timeout_ms.load(Ordering::Acquire))
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> KeeperResult<String> {
        validate_path(path)?;
        let body = self
            .call(Request::Create {
                path: path.to_string(),
                data: data.to_vec(),
                mode,
            })
            .await?;
        decode_create(body)
    }

    async fn delete(&self, path: &str, version: i32) -> KeeperResult<()> {
        validate_path(path)?;
        self.call(Request::Delete {
            path: path.to_string(),
            version,
        })
        .await?;
        Ok(())
    }

    async fn get_data(&self, path: &str) -> KeeperResult<(Vec<u8>, Stat)> {
        validate_path(path)?;
        let body = self
            .call(Request::GetData {
                path: path.to_string(),
            })
            .await?;
        decode_get_data(body)
    }

    async fn set_data(&self, path: &str, data: &[u8], version: i32) -> KeeperResult<Stat> {
        validate_path(path)?;
        let body = self
            .call(Request::SetData {
                path: path.to_string(),
                data: data.to_vec(),
                version,
            })
            .await?;
        decode_stat(body)
    }

    async fn exists(&self, path: &str) -> KeeperResult<Option<Stat>> {
        validate_path(path)?;
        match self
            .call(Request::Exists {
                path: path.to_string(),
            })
            .await
        {
            Ok(body) => decode_stat(body).map(Some),
            Err(KeeperError::NoNode(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn close(&self) -> KeeperResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let (reply, response) = oneshot::channel();
        if self
            .calls
            .send(Call {
                request: Request::CloseSession,
                reply,
            })
            .is_ok()
        {
            match tokio::time::timeout(self.negotiated_timeout(), response).await {
                Ok(Ok(Ok(_))) => {}
                Ok(Ok(Err(e))) => warn!(error = %e, "closeSession rejected"),
                Ok(Err(_)) => {}
                Err(_) => warn!("closeSession not acknowledged"),
            }
        }

        let _ = self.events.send(WatchedEvent::session(KeeperState::Closed));
        Ok(())
    }
}
