//! In-memory coordination ensemble
//!
//! Provides:
//! - Linearizable node create/delete/read/write over a single `DataTree`
//! - Sessions with negotiated timeouts and ephemeral-node cleanup
//! - Session expiry on timeout (background scanner)
//! - Fault injection for tests: forced expiry and ensemble unavailability

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tamarind_common::{
    EventSink, KeeperError, KeeperResult, KeeperState, Stat, WatchedEvent,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::client::MemoryConnector;
use crate::tree::DataTree;

/// Tunables of an in-memory ensemble
#[derive(Debug, Clone)]
pub struct EnsembleOptions {
    /// Basic time unit; session timeouts are clamped to `[2, 20]` ticks
    pub tick_time: Duration,
    /// Delay between a connect request and the `SyncConnected` event
    pub handshake_delay: Duration,
}

impl Default for EnsembleOptions {
    fn default() -> Self {
        Self {
            tick_time: Duration::from_millis(2000),
            handshake_delay: Duration::from_millis(5),
        }
    }
}

impl EnsembleOptions {
    pub fn min_session_timeout(&self) -> Duration {
        self.tick_time * 2
    }

    pub fn max_session_timeout(&self) -> Duration {
        self.tick_time * 20
    }

    /// Clamp a requested session timeout into the allowed range.
    pub fn negotiate(&self, requested: Duration) -> Duration {
        requested.clamp(self.min_session_timeout(), self.max_session_timeout())
    }
}

/// Ensemble statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnsembleStats {
    pub sessions_opened: u64,
    pub sessions_expired: u64,
    pub sessions_closed: u64,
    /// Successful creates
    pub creates: u64,
    /// Creates rejected because the node already existed
    pub create_conflicts: u64,
    pub deletes: u64,
    pub reads: u64,
    pub writes: u64,
}

#[derive(Default)]
struct StatsCollector {
    sessions_opened: AtomicU64,
    sessions_expired: AtomicU64,
    sessions_closed: AtomicU64,
    creates: AtomicU64,
    create_conflicts: AtomicU64,
    deletes: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
}

struct SessionEntry {
    timeout: Duration,
    last_seen: Instant,
    events: EventSink,
}

struct Inner {
    tree: Mutex<DataTree>,
    sessions: DashMap<i64, SessionEntry>,
    next_session_id: AtomicI64,
    available: watch::Sender<bool>,
    options: EnsembleOptions,
    stats: StatsCollector,
    scanner: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = self.scanner.get_mut().take() {
            handle.abort();
        }
    }
}

/// A single-process, linearizable coordination ensemble.
///
/// All node operations go through one mutex around the `DataTree`, so
/// create/delete/read/write on a path are totally ordered across sessions.
/// Cloning yields another handle to the same ensemble.
#[derive(Clone)]
pub struct MemoryEnsemble {
    inner: Arc<Inner>,
}

impl Default for MemoryEnsemble {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEnsemble {
    pub fn new() -> Self {
        Self::with_options(EnsembleOptions::default())
    }

    pub fn with_options(options: EnsembleOptions) -> Self {
        let (available, _) = watch::channel(true);
        Self {
            inner: Arc::new(Inner {
                tree: Mutex::new(DataTree::new()),
                sessions: DashMap::new(),
                // Session ids are never 0; 0 means "no session yet"
                next_session_id: AtomicI64::new(0x0100_0000_0000_0001),
                available,
                options,
                stats: StatsCollector::default(),
                scanner: Mutex::new(None),
            }),
        }
    }

    /// Start with a background task that expires idle sessions.
    pub fn with_expiry_scanner(self, scan_interval: Duration) -> Self {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);

        let handle = tokio::spawn(async move {
            let mut ticker = interval(scan_interval);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let ensemble = MemoryEnsemble { inner };
                ensemble.expire_stale_sessions();
            }
        });

        *self.inner.scanner.lock() = Some(handle);
        self
    }

    pub fn options(&self) -> &EnsembleOptions {
        &self.inner.options
    }

    /// Connector that opens sessions on this ensemble.
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector::new(self.clone())
    }

    /// Whether the ensemble currently serves requests.
    pub fn is_available(&self) -> bool {
        *self.inner.available.borrow()
    }

    /// Take the ensemble down or bring it back.
    ///
    /// While down every request fails with `ConnectionLoss` and no
    /// handshake completes. Live sessions see `Disconnected`, then
    /// `SyncConnected` once it is back; their expiry clocks restart.
    pub fn set_available(&self, available: bool) {
        let previous = self.inner.available.send_replace(available);
        if previous == available {
            return;
        }

        let state = if available {
            KeeperState::SyncConnected
        } else {
            KeeperState::Disconnected
        };
        info!(available, "Ensemble availability changed");

        let now = Instant::now();
        for mut entry in self.inner.sessions.iter_mut() {
            if available {
                entry.last_seen = now;
            }
            let _ = entry.events.send(WatchedEvent::session(state));
        }
    }

    pub(crate) fn subscribe_availability(&self) -> watch::Receiver<bool> {
        self.inner.available.subscribe()
    }

    /// Register a new session. Returns its id and negotiated timeout.
    pub(crate) fn open_session(&self, requested: Duration, events: EventSink) -> (i64, Duration) {
        let id = self.inner.next_session_id.fetch_add(1, Ordering::Relaxed);
        let timeout = self.inner.options.negotiate(requested);
        self.inner.sessions.insert(
            id,
            SessionEntry {
                timeout,
                last_seen: Instant::now(),
                events,
            },
        );
        self.inner
            .stats
            .sessions_opened
            .fetch_add(1, Ordering::Relaxed);

        info!(session_id = format!("0x{:x}", id), timeout_ms = timeout.as_millis() as u64, "Session opened");
        (id, timeout)
    }

    /// Heartbeat from a session.
    pub(crate) fn touch(&self, session_id: i64) -> KeeperResult<()> {
        if !self.is_available() {
            return Err(KeeperError::ConnectionLoss);
        }
        match self.inner.sessions.get_mut(&session_id) {
            Some(mut entry) => {
                entry.last_seen = Instant::now();
                Ok(())
            }
            None => Err(KeeperError::SessionExpired),
        }
    }

    /// Run an operation against the tree on behalf of a session.
    pub(crate) fn execute<T>(
        &self,
        session_id: i64,
        op: impl FnOnce(&mut DataTree) -> KeeperResult<T>,
    ) -> KeeperResult<T> {
        if !self.is_available() {
            return Err(KeeperError::ConnectionLoss);
        }

        let mut tree = self.inner.tree.lock();
        // Checked under the tree lock so expiry and ephemeral creation
        // cannot interleave.
        match self.inner.sessions.get_mut(&session_id) {
            Some(mut entry) => entry.last_seen = Instant::now(),
            None => return Err(KeeperError::SessionExpired),
        }
        op(&mut tree)
    }

    pub(crate) fn record_create(&self, result: &KeeperResult<String>) {
        match result {
            Ok(_) => self.inner.stats.creates.fetch_add(1, Ordering::Relaxed),
            Err(KeeperError::NodeExists(_)) => self
                .inner
                .stats
                .create_conflicts
                .fetch_add(1, Ordering::Relaxed),
            Err(_) => 0,
        };
    }

    pub(crate) fn record_delete(&self) {
        self.inner.stats.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_read(&self) {
        self.inner.stats.reads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_write(&self) {
        self.inner.stats.writes.fetch_add(1, Ordering::Relaxed);
    }

    /// End a session at the client's request.
    pub(crate) fn close_session(&self, session_id: i64) -> bool {
        if self.remove_session(session_id).is_some() {
            self.inner
                .stats
                .sessions_closed
                .fetch_add(1, Ordering::Relaxed);
            info!(session_id = format!("0x{:x}", session_id), "Session closed");
            true
        } else {
            false
        }
    }

    /// Expire a session now: its ephemeral nodes are removed and the
    /// client receives an `Expired` event.
    pub fn expire_session(&self, session_id: i64) -> bool {
        match self.remove_session(session_id) {
            Some(entry) => {
                self.inner
                    .stats
                    .sessions_expired
                    .fetch_add(1, Ordering::Relaxed);
                warn!(session_id = format!("0x{:x}", session_id), "Session expired");
                let _ = entry
                    .events
                    .send(WatchedEvent::session(KeeperState::Expired));
                true
            }
            None => false,
        }
    }

    /// Expire every session not heard from within its timeout.
    /// Returns the number expired.
    pub fn expire_stale_sessions(&self) -> usize {
        if !self.is_available() {
            return 0;
        }

        let now = Instant::now();
        let stale: Vec<i64> = self
            .inner
            .sessions
            .iter()
            .filter(|entry| now.duration_since(entry.last_seen) >= entry.timeout)
            .map(|entry| *entry.key())
            .collect();

        let expired = stale
            .into_iter()
            .filter(|id| self.expire_session(*id))
            .count();

        metrics::gauge!("tamarind_ensemble_sessions").set(self.inner.sessions.len() as f64);
        if expired > 0 {
            debug!(expired, "Expiry scan finished");
        }
        expired
    }

    fn remove_session(&self, session_id: i64) -> Option<SessionEntry> {
        let mut tree = self.inner.tree.lock();
        let (_, entry) = self.inner.sessions.remove(&session_id)?;
        let removed = tree.kill_session(session_id);
        if !removed.is_empty() {
            debug!(
                session_id = format!("0x{:x}", session_id),
                nodes = ?removed,
                "Removed ephemeral nodes"
            );
        }
        Some(entry)
    }

    // ------------------------------------------------------------------
    // Inspection (bypasses sessions)
    // ------------------------------------------------------------------

    pub fn stat(&self, path: &str) -> Option<Stat> {
        self.inner.tree.lock().stat(path)
    }

    pub fn data(&self, path: &str) -> Option<Vec<u8>> {
        self.inner.tree.lock().get_data(path).ok().map(|(data, _)| data)
    }

    pub fn children(&self, path: &str) -> KeeperResult<Vec<String>> {
        self.inner.tree.lock().children(path)
    }

    pub fn node_count(&self) -> usize {
        self.inner.tree.lock().node_count()
    }

    /// Ephemeral paths owned by a session.
    pub fn ephemerals_of(&self, session_id: i64) -> Vec<String> {
        self.inner.tree.lock().ephemerals(session_id)
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn is_session_alive(&self, session_id: i64) -> bool {
        self.inner.sessions.contains_key(&session_id)
    }

    pub fn stats(&self) -> EnsembleStats {
        let s = &self.inner.stats;
        EnsembleStats {
            sessions_opened: s.sessions_opened.load(Ordering::Relaxed),
            sessions_expired: s.sessions_expired.load(Ordering::Relaxed),
            sessions_closed: s.sessions_closed.load(Ordering::Relaxed),
            creates: s.creates.load(Ordering::Relaxed),
            create_conflicts: s.create_conflicts.load(Ordering::Relaxed),
            deletes: s.deletes.load(Ordering::Relaxed),
            reads: s.reads.load(Ordering::Relaxed),
            writes: s.writes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tamarind_common::{ANY_VERSION, CreateMode};
    use tokio::sync::mpsc;

    fn open(ensemble: &MemoryEnsemble) -> (i64, mpsc::UnboundedReceiver<WatchedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (id, _) = ensemble.open_session(Duration::from_secs(10), tx);
        (id, rx)
    }

    #[test]
    fn test_negotiate_timeout() {
        let options = EnsembleOptions::default();
        assert_eq!(
            options.negotiate(Duration::from_millis(100)),
            Duration::from_secs(4)
        );
        assert_eq!(
            options.negotiate(Duration::from_secs(50)),
            Duration::from_secs(40)
        );
        assert_eq!(
            options.negotiate(Duration::from_secs(10)),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn test_execute_requires_session() {
        let ensemble = MemoryEnsemble::new();
        let err = ensemble
            .execute(42, |tree| tree.create("/a", b"", CreateMode::Persistent, 42))
            .unwrap_err();
        assert_eq!(err, KeeperError::SessionExpired);
    }

    #[test]
    fn test_expire_session_drops_ephemerals_and_notifies() {
        let ensemble = MemoryEnsemble::new();
        let (id, mut rx) = open(&ensemble);

        ensemble
            .execute(id, |tree| tree.create("/lock", b"", CreateMode::Ephemeral, id))
            .unwrap();
        assert_eq!(ensemble.ephemerals_of(id), vec!["/lock"]);

        assert!(ensemble.expire_session(id));
        assert!(ensemble.stat("/lock").is_none());
        assert!(!ensemble.is_session_alive(id));
        assert_eq!(
            rx.try_recv().unwrap(),
            WatchedEvent::session(KeeperState::Expired)
        );

        // Second expiry is a no-op
        assert!(!ensemble.expire_session(id));
        assert_eq!(ensemble.stats().sessions_expired, 1);
    }

    #[test]
    fn test_close_session_is_silent() {
        let ensemble = MemoryEnsemble::new();
        let (id, mut rx) = open(&ensemble);
        assert!(ensemble.close_session(id));
        assert!(rx.try_recv().is_err());
        assert_eq!(ensemble.stats().sessions_closed, 1);
    }

    #[test]
    fn test_unavailable_rejects_requests() {
        let ensemble = MemoryEnsemble::new();
        let (id, mut rx) = open(&ensemble);

        ensemble.set_available(false);
        assert_eq!(
            ensemble
                .execute(id, |tree| tree.set_data("/", b"", ANY_VERSION))
                .unwrap_err(),
            KeeperError::ConnectionLoss
        );
        assert_eq!(ensemble.touch(id).unwrap_err(), KeeperError::ConnectionLoss);
        assert_eq!(
            rx.try_recv().unwrap(),
            WatchedEvent::session(KeeperState::Disconnected)
        );

        ensemble.set_available(true);
        assert!(ensemble.touch(id).is_ok());
        assert_eq!(
            rx.try_recv().unwrap(),
            WatchedEvent::session(KeeperState::SyncConnected)
        );

        // Repeating the same availability sends nothing
        ensemble.set_available(true);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_expire_stale_sessions() {
        let ensemble = MemoryEnsemble::with_options(EnsembleOptions {
            tick_time: Duration::from_millis(1),
            ..Default::default()
        });
        let (tx, _rx) = mpsc::unbounded_channel();
        let (id, timeout) = ensemble.open_session(Duration::from_millis(1), tx);
        assert_eq!(timeout, Duration::from_millis(2));

        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(ensemble.expire_stale_sessions(), 1);
        assert!(!ensemble.is_session_alive(id));
    }

    #[test]
    fn test_stats() {
        let ensemble = MemoryEnsemble::new();
        let (id, _rx) = open(&ensemble);

        for _ in 0..3 {
            let result =
                ensemble.execute(id, |tree| tree.create("/x", b"", CreateMode::Ephemeral, id));
            ensemble.record_create(&result);
        }

        let stats = ensemble.stats();
        assert_eq!(stats.sessions_opened, 1);
        assert_eq!(stats.creates, 1);
        assert_eq!(stats.create_conflicts, 2);
    }
}
