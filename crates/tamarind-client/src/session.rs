//! Session management
//!
//! A `SessionManager` owns one ensemble session: it starts the handshake,
//! waits once on the session's connect latch and exposes the session state
//! to the lock and data helpers. `SessionCell` adds lazy, serialised,
//! one-time initialisation for callers that keep one session per process.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tamarind_common::{Connector, Coordinator, KeeperState, SessionState, WatchedEvent};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::ClientConfig;
use crate::data::NodeDataAccessor;
use crate::error::{ClientError, Result};
use crate::lock::LockManager;
use crate::watch::{SessionEventListener, WatchDispatcher};

/// Owner of one live ensemble session
pub struct SessionManager {
    config: ClientConfig,
    coordinator: Arc<dyn Coordinator>,
    dispatcher: Arc<WatchDispatcher>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
    /// Lock paths whose create lost its reply; the node may exist and be ours
    unconfirmed_creates: Mutex<HashSet<String>>,
    closed: AtomicBool,
}

impl SessionManager {
    /// Open a session and wait until the ensemble confirms it.
    ///
    /// Fails with `ClientError::Connection` on a malformed endpoint list,
    /// when the handshake cannot be started, when the session ends before
    /// it connects, or when `connect_timeout` elapses. Never retries.
    pub async fn connect(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Arc<SessionManager>> {
        let endpoints = config.parsed_endpoints()?;
        config.validate()?;

        let dispatcher = Arc::new(WatchDispatcher::new());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let dispatch_task = dispatcher.spawn(events_rx);

        info!(
            endpoints = ?config.endpoints,
            session_timeout_ms = config.session_timeout_ms,
            "Connecting to ensemble"
        );

        let coordinator = match connector
            .connect(&endpoints, config.session_timeout(), events_tx)
            .await
        {
            Ok(coordinator) => coordinator,
            Err(e) => {
                dispatch_task.abort();
                warn!(error = %e, "Failed to start session handshake");
                return Err(ClientError::Connection(e.to_string()));
            }
        };

        let waited = match config.connect_timeout() {
            Some(limit) => tokio::time::timeout(limit, dispatcher.wait_connected())
                .await
                .map_err(|_| format!("no session within {:?}", limit))
                .and_then(|r| r.map_err(|state| format!("session ended while connecting: {}", state))),
            None => dispatcher
                .wait_connected()
                .await
                .map_err(|state| format!("session ended while connecting: {}", state)),
        };

        if let Err(reason) = waited {
            warn!(%reason, "Session handshake failed");
            if let Err(e) = coordinator.close().await {
                warn!(error = %e, "Failed to close abandoned session");
            }
            dispatch_task.abort();
            return Err(ClientError::Connection(reason));
        }

        info!(
            session_id = format!("0x{:x}", coordinator.session_id()),
            negotiated_timeout_ms = coordinator.negotiated_timeout().as_millis() as u64,
            "Session connected"
        );

        Ok(Arc::new(SessionManager {
            config,
            coordinator,
            dispatcher,
            dispatch_task: Mutex::new(Some(dispatch_task)),
            unconfirmed_creates: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.dispatcher.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    pub fn session_id(&self) -> i64 {
        self.coordinator.session_id()
    }

    pub fn negotiated_timeout(&self) -> Duration {
        self.coordinator.negotiated_timeout()
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.dispatcher.subscribe()
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionEventListener>) {
        self.dispatcher.add_listener(listener);
    }

    /// Fail if the session can no longer serve requests.
    pub fn ensure_live(&self) -> Result<()> {
        match self.state() {
            SessionState::Expired => Err(ClientError::SessionExpired),
            SessionState::Closed => Err(ClientError::Closed),
            _ => Ok(()),
        }
    }

    pub(crate) fn coordinator(&self) -> &Arc<dyn Coordinator> {
        &self.coordinator
    }

    pub(crate) fn mark_unconfirmed(&self, path: &str) {
        self.unconfirmed_creates.lock().insert(path.to_string());
    }

    pub(crate) fn is_unconfirmed(&self, path: &str) -> bool {
        self.unconfirmed_creates.lock().contains(path)
    }

    pub(crate) fn clear_unconfirmed(&self, path: &str) {
        self.unconfirmed_creates.lock().remove(path);
    }

    pub fn lock_manager(self: &Arc<Self>) -> LockManager {
        LockManager::new(self.clone())
    }

    pub fn data_accessor(self: &Arc<Self>) -> NodeDataAccessor {
        NodeDataAccessor::new(self.clone())
    }

    /// End the session. Its ephemeral lock nodes are removed by the
    /// ensemble. Safe to call more than once.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let session_id = self.session_id();
        let result = self.coordinator.close().await;
        self.dispatcher
            .dispatch(WatchedEvent::session(KeeperState::Closed));
        if let Some(task) = self.dispatch_task.lock().take() {
            task.abort();
        }

        match result {
            Ok(()) => {
                info!(session_id = format!("0x{:x}", session_id), "Session closed");
                Ok(())
            }
            Err(e) => {
                warn!(session_id = format!("0x{:x}", session_id), error = %e, "Session close failed");
                Err(ClientError::Connection(e.to_string()))
            }
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Some(task) = self.dispatch_task.get_mut().take() {
            task.abort();
        }
    }
}

/// Lazily connected, process-wide session slot.
///
/// Concurrent first calls are serialised so exactly one handshake runs;
/// everyone receives the same session. A session found expired or closed
/// is replaced on the next call.
#[derive(Default)]
pub struct SessionCell {
    current: RwLock<Option<Arc<SessionManager>>>,
    init: tokio::sync::Mutex<()>,
}

impl SessionCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current session if it can still serve requests.
    pub fn get(&self) -> Option<Arc<SessionManager>> {
        self.current
            .read()
            .as_ref()
            .filter(|session| !session.state().is_terminal())
            .cloned()
    }

    pub async fn get_or_connect(
        &self,
        config: ClientConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Arc<SessionManager>> {
        if let Some(session) = self.get() {
            return Ok(session);
        }

        let _guard = self.init.lock().await;
        if let Some(session) = self.get() {
            return Ok(session);
        }

        let stale = self.current.write().take();
        if let Some(stale) = stale {
            info!(state = %stale.state(), "Replacing terminated session");
            if let Err(e) = stale.close().await {
                warn!(error = %e, "Failed to close terminated session");
            }
        }

        let session = SessionManager::connect(config, connector).await?;
        *self.current.write() = Some(session.clone());
        Ok(session)
    }

    /// Close and forget the session, if any.
    pub async fn shutdown(&self) -> Result<()> {
        let _guard = self.init.lock().await;
        let session = self.current.write().take();
        match session {
            Some(session) => session.close().await,
            None => Ok(()),
        }
    }
}

static GLOBAL_SESSION: LazyLock<SessionCell> = LazyLock::new(SessionCell::new);

/// The process-wide session, connecting on first use.
pub async fn global_session(
    config: ClientConfig,
    connector: Arc<dyn Connector>,
) -> Result<Arc<SessionManager>> {
    GLOBAL_SESSION.get_or_connect(config, connector).await
}

/// Close the process-wide session.
pub async fn shutdown_global() -> Result<()> {
    GLOBAL_SESSION.shutdown().await
}
