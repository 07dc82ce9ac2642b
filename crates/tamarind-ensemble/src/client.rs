//! Session handles on a `MemoryEnsemble`

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tamarind_common::{
    Connector, Coordinator, CreateMode, Endpoint, EventSink, KeeperError, KeeperResult,
    KeeperState, Stat, WatchedEvent, validate_path,
};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::ensemble::MemoryEnsemble;

/// Opens sessions on an in-memory ensemble. Endpoints are ignored.
#[derive(Clone)]
pub struct MemoryConnector {
    ensemble: MemoryEnsemble,
}

impl MemoryConnector {
    pub fn new(ensemble: MemoryEnsemble) -> Self {
        Self { ensemble }
    }

    pub fn ensemble(&self) -> &MemoryEnsemble {
        &self.ensemble
    }
}

#[async_trait]
impl Connector for MemoryConnector {
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
        let client = MemoryClient::start(self.ensemble.clone(), session_timeout, events);
        Ok(Arc::new(client))
    }
}

struct SessionSlot {
    session_id: AtomicI64,
    timeout_ms: AtomicU64,
    closed: AtomicBool,
    /// Held while the session is opened or the slot is closed
    lifecycle: Mutex<()>,
}

/// One session on a `MemoryEnsemble`.
///
/// The handshake runs in the background: it waits out the configured
/// handshake delay and any unavailability, then emits `SyncConnected`
/// and heartbeats at a third of the negotiated timeout. Dropping the
/// handle without `close` leaves the session to expire, as a crashed
/// process would.
pub struct MemoryClient {
    ensemble: MemoryEnsemble,
    slot: Arc<SessionSlot>,
    events: EventSink,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryClient {
    fn start(ensemble: MemoryEnsemble, requested: Duration, events: EventSink) -> Self {
        let slot = Arc::new(SessionSlot {
            session_id: AtomicI64::new(0),
            timeout_ms: AtomicU64::new(requested.as_millis() as u64),
            closed: AtomicBool::new(false),
            lifecycle: Mutex::new(()),
        });

        let task = tokio::spawn(run_session(
            ensemble.clone(),
            slot.clone(),
            requested,
            events.clone(),
        ));

        Self {
            ensemble,
            slot,
            events,
            task: Mutex::new(Some(task)),
        }
    }

    fn live_session(&self) -> KeeperResult<i64> {
        match self.slot.session_id.load(Ordering::Acquire) {
            0 => Err(KeeperError::ConnectionLoss),
            id => Ok(id),
        }
    }
}

async fn run_session(
    ensemble: MemoryEnsemble,
    slot: Arc<SessionSlot>,
    requested: Duration,
    events: EventSink,
) {
    let delay = ensemble.options().handshake_delay;
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let mut available = ensemble.subscribe_availability();
    let ready = available.wait_for(|up| *up).await.is_ok();
    if !ready {
        return;
    }

    let (session_id, timeout) = {
        let _lifecycle = slot.lifecycle.lock();
        if slot.closed.load(Ordering::Acquire) {
            return;
        }
        let (session_id, timeout) = ensemble.open_session(requested, events.clone());
        slot.timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Release);
        slot.session_id.store(session_id, Ordering::Release);
        (session_id, timeout)
    };
    let _ = events.send(WatchedEvent::session(KeeperState::SyncConnected));

    let period = (timeout / 3).max(Duration::from_millis(1));
    loop {
        tokio::time::sleep(period).await;
        match ensemble.touch(session_id) {
            Ok(()) => trace!(session_id, "Heartbeat"),
            Err(KeeperError::SessionExpired) => {
                debug!(session_id, "Heartbeat stopped, session gone");
                break;
            }
            Err(_) => {}
        }
    }
}

impl Drop for MemoryClient {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

#[async_trait]
impl Coordinator for MemoryClient {
    fn session_id(&self) -> i64 {
        self.slot.session_id.load(Ordering::Acquire)
    }

    fn negotiated_timeout(&self) -> Duration {
        Duration::from_millis(self.slot.timeout_ms.load(Ordering::Acquire))
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> KeeperResult<String> {
        let id = self.live_session()?;
        tokio::task::yield_now().await;
        let result = self
            .ensemble
            .execute(id, |tree| tree.create(path, data, mode, id));
        self.ensemble.record_create(&result);
        result
    }

    async fn delete(&self, path: &str, version: i32) -> KeeperResult<()> {
        let id = self.live_session()?;
        tokio::task::yield_now().await;
        self.ensemble
            .execute(id, |tree| tree.delete(path, version))?;
        self.ensemble.record_delete();
        Ok(())
    }

    async fn get_data(&self, path: &str) -> KeeperResult<(Vec<u8>, Stat)> {
        let id = self.live_session()?;
        tokio::task::yield_now().await;
        let result = self.ensemble.execute(id, |tree| tree.get_data(path));
        self.ensemble.record_read();
        result
    }

    async fn set_data(&self, path: &str, data: &[u8], version: i32) -> KeeperResult<Stat> {
        let id = self.live_session()?;
        tokio::task::yield_now().await;
        let stat = self
            .ensemble
            .execute(id, |tree| tree.set_data(path, data, version))?;
        self.ensemble.record_write();
        Ok(stat)
    }

    async fn exists(&self, path: &str) -> KeeperResult<Option<Stat>> {
        let id = self.live_session()?;
        validate_path(path)?;
        tokio::task::yield_now().await;
        self.ensemble.execute(id, |tree| Ok(tree.stat(path)))
    }

    async fn close(&self) -> KeeperResult<()> {
        // Either the handshake already opened the session or it never will
        let id = {
            let _lifecycle = self.slot.lifecycle.lock();
            if self.slot.closed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
            self.slot.session_id.load(Ordering::Acquire)
        };
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }

        if id != 0 {
            self.ensemble.close_session(id);
        }
        let _ = self.events.send(WatchedEvent::session(KeeperState::Closed));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensemble::EnsembleOptions;
    use tamarind_common::ANY_VERSION;
    use tokio::sync::mpsc;

    fn endpoints() -> Vec<Endpoint> {
        vec![Endpoint::new("memory", 2181)]
    }

    async fn connected(
        ensemble: &MemoryEnsemble,
    ) -> (Arc<dyn Coordinator>, mpsc::UnboundedReceiver<WatchedEvent>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = ensemble
            .connector()
            .connect(&endpoints(), Duration::from_secs(10), tx)
            .await
            .unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            WatchedEvent::session(KeeperState::SyncConnected)
        );
        (client, rx)
    }

    #[tokio::test]
    async fn test_ops_before_handshake_fail_with_connection_loss() {
        let ensemble = MemoryEnsemble::with_options(EnsembleOptions {
            handshake_delay: Duration::from_secs(60),
            ..Default::default()
        });
        let (tx, _rx) = mpsc::unbounded_channel();
        let client = ensemble
            .connector()
            .connect(&endpoints(), Duration::from_secs(10), tx)
            .await
            .unwrap();

        assert_eq!(client.session_id(), 0);
        assert_eq!(
            client.exists("/").await.unwrap_err(),
            KeeperError::ConnectionLoss
        );
    }

    #[tokio::test]
    async fn test_connect_rejects_empty_endpoints() {
        let ensemble = MemoryEnsemble::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = ensemble
            .connector()
            .connect(&[], Duration::from_secs(10), tx)
            .await;
        assert!(matches!(result, Err(KeeperError::BadArguments(_))));
    }

    #[tokio::test]
    async fn test_node_operations() {
        let ensemble = MemoryEnsemble::new();
        let (client, _rx) = connected(&ensemble).await;
        assert_ne!(client.session_id(), 0);
        assert_eq!(client.negotiated_timeout(), Duration::from_secs(10));

        client
            .create("/cfg", b"v1", CreateMode::Persistent)
            .await
            .unwrap();
        let (data, stat) = client.get_data("/cfg").await.unwrap();
        assert_eq!(data, b"v1");
        assert_eq!(stat.version, 0);

        let stat = client.set_data("/cfg", b"v2", ANY_VERSION).await.unwrap();
        assert_eq!(stat.version, 1);
        assert_eq!(ensemble.data("/cfg").unwrap(), b"v2");

        client.delete("/cfg", 1).await.unwrap();
        assert!(client.exists("/cfg").await.unwrap().is_none());

        let stats = ensemble.stats();
        assert_eq!(stats.creates, 1);
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.deletes, 1);
    }

    #[tokio::test]
    async fn test_close_removes_ephemerals() {
        let ensemble = MemoryEnsemble::new();
        let (client, mut rx) = connected(&ensemble).await;
        let id = client.session_id();

        client
            .create("/held", b"", CreateMode::Ephemeral)
            .await
            .unwrap();
        assert_eq!(ensemble.stat("/held").unwrap().ephemeral_owner, id);

        client.close().await.unwrap();
        client.close().await.unwrap();

        assert!(ensemble.stat("/held").is_none());
        assert!(!ensemble.is_session_alive(id));
        assert_eq!(
            rx.recv().await.unwrap(),
            WatchedEvent::session(KeeperState::Closed)
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_close_during_handshake_leaks_no_session() {
        let ensemble = MemoryEnsemble::with_options(EnsembleOptions {
            handshake_delay: Duration::ZERO,
            ..Default::default()
        });

        for round in 0..200 {
            let (tx, _rx) = mpsc::unbounded_channel();
            let client = ensemble
                .connector()
                .connect(&endpoints(), Duration::from_secs(10), tx)
                .await
                .unwrap();
            if round % 2 == 1 {
                tokio::task::yield_now().await;
            }
            client.close().await.unwrap();
        }

        // Let any handshake still in flight finish
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ensemble.session_count(), 0);
        let stats = ensemble.stats();
        assert_eq!(stats.sessions_opened, stats.sessions_closed);
    }

    #[tokio::test]
    async fn test_handshake_waits_for_availability() {
        let ensemble = MemoryEnsemble::new();
        ensemble.set_available(false);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = ensemble
            .connector()
            .connect(&endpoints(), Duration::from_secs(10), tx)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(client.session_id(), 0);
        assert!(rx.try_recv().is_err());

        ensemble.set_available(true);
        assert_eq!(
            rx.recv().await.unwrap(),
            WatchedEvent::session(KeeperState::SyncConnected)
        );
        assert_ne!(client.session_id(), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_session_alive() {
        let ensemble = MemoryEnsemble::with_options(EnsembleOptions {
            tick_time: Duration::from_millis(10),
            handshake_delay: Duration::ZERO,
        })
        .with_expiry_scanner(Duration::from_millis(5));

        let (client, _rx) = connected(&ensemble).await;
        assert_eq!(client.negotiated_timeout(), Duration::from_millis(200));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(ensemble.is_session_alive(client.session_id()));
    }

    #[tokio::test]
    async fn test_dropped_client_session_expires() {
        let ensemble = MemoryEnsemble::with_options(EnsembleOptions {
            tick_time: Duration::from_millis(10),
            handshake_delay: Duration::ZERO,
        })
        .with_expiry_scanner(Duration::from_millis(5));

        let (client, _rx) = connected(&ensemble).await;
        let id = client.session_id();
        client
            .create("/orphan", b"", CreateMode::Ephemeral)
            .await
            .unwrap();
        drop(client);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!ensemble.is_session_alive(id));
        assert!(ensemble.stat("/orphan").is_none());
    }
}
