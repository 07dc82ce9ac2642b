//! Session event dispatch
//!
//! A `WatchDispatcher` is the single event sink of one session. It folds
//! connection-state events into a `SessionState`, opens the session's
//! one-shot `ConnectLatch` on the first `SyncConnected`, and forwards every
//! event to registered listeners.

use std::sync::Arc;

use parking_lot::RwLock;
use tamarind_common::{KeeperState, SessionState, WatchedEvent};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::metrics;

/// One-shot gate that counts down from one.
///
/// Every waiter unblocks together the first time it opens; later
/// count-downs are no-ops.
pub struct ConnectLatch {
    open: watch::Sender<bool>,
}

impl Default for ConnectLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectLatch {
    pub fn new() -> Self {
        let (open, _) = watch::channel(false);
        Self { open }
    }

    /// Open the latch. Returns `true` only for the call that opened it.
    pub fn count_down(&self) -> bool {
        self.open.send_if_modified(|open| {
            if *open {
                false
            } else {
                *open = true;
                true
            }
        })
    }

    pub fn is_open(&self) -> bool {
        *self.open.borrow()
    }

    /// Suspend until the latch is open.
    pub async fn wait(&self) {
        let mut rx = self.open.subscribe();
        // The sender lives in `self`, so the channel cannot close here
        let _ = rx.wait_for(|open| *open).await;
    }
}

/// Trait for receiving session and node events.
pub trait SessionEventListener: Send + Sync + 'static {
    fn on_event(&self, event: &WatchedEvent);
}

/// A simple listener that invokes a closure.
pub struct FnSessionEventListener<F>
where
    F: Fn(&WatchedEvent) + Send + Sync + 'static,
{
    f: F,
}

impl<F> FnSessionEventListener<F>
where
    F: Fn(&WatchedEvent) + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> SessionEventListener for FnSessionEventListener<F>
where
    F: Fn(&WatchedEvent) + Send + Sync + 'static,
{
    fn on_event(&self, event: &WatchedEvent) {
        (self.f)(event);
    }
}

/// Event sink of a single session
pub struct WatchDispatcher {
    state: watch::Sender<SessionState>,
    latch: ConnectLatch,
    listeners: RwLock<Vec<Arc<dyn SessionEventListener>>>,
}

impl Default for WatchDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl WatchDispatcher {
    pub fn new() -> Self {
        let (state, _) = watch::channel(SessionState::Connecting);
        Self {
            state,
            latch: ConnectLatch::new(),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionEventListener>) {
        self.listeners.write().push(listener);
    }

    /// Handle one event from the session.
    pub fn dispatch(&self, event: WatchedEvent) {
        if event.is_session_event() {
            self.apply_state(event.state);
        } else {
            debug!(event_type = ?event.event_type, path = ?event.path, "Node event");
        }

        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_event(&event);
        }
    }

    fn apply_state(&self, keeper_state: KeeperState) {
        let next = match keeper_state {
            KeeperState::SyncConnected | KeeperState::ConnectedReadOnly => SessionState::Connected,
            KeeperState::Disconnected => SessionState::Disconnected,
            KeeperState::Expired => SessionState::Expired,
            KeeperState::AuthFailed | KeeperState::Closed => SessionState::Closed,
        };

        let mut previous = next;
        let changed = self.state.send_if_modified(|current| {
            previous = *current;
            // Expired and Closed are final
            if current.is_terminal() || *current == next {
                return false;
            }
            *current = next;
            true
        });

        if changed {
            match next {
                SessionState::Expired => {
                    warn!(from = %previous, "Session expired, ephemeral locks are gone")
                }
                SessionState::Disconnected => warn!(from = %previous, "Session disconnected"),
                _ => info!(from = %previous, to = %next, "Session state changed"),
            }
            metrics::set_session_state(next);
        }

        if next == SessionState::Connected
            && self.state() == SessionState::Connected
            && self.latch.count_down()
        {
            info!("Session established");
        }
    }

    /// Run the dispatch loop until the event channel closes.
    pub fn spawn(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<WatchedEvent>,
    ) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                dispatcher.dispatch(event);
            }
            debug!("Event channel closed, dispatcher stopped");
        })
    }

    /// Wait for the connect latch. Fails with the terminal state if the
    /// session ends before it ever connected.
    pub async fn wait_connected(&self) -> Result<(), SessionState> {
        let mut states = self.state.subscribe();
        tokio::select! {
            biased;
            _ = self.latch.wait() => Ok(()),
            result = states.wait_for(|s| s.is_terminal()) => {
                Err(result.map(|s| *s).unwrap_or(SessionState::Closed))
            }
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn latch(&self) -> &ConnectLatch {
        &self.latch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tamarind_common::EventType;

    #[tokio::test]
    async fn test_latch_opens_once() {
        let latch = Arc::new(ConnectLatch::new());
        assert!(!latch.is_open());

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let latch = latch.clone();
                tokio::spawn(async move { latch.wait().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(waiters.iter().all(|w| !w.is_finished()));

        assert!(latch.count_down());
        assert!(!latch.count_down());
        for waiter in waiters {
            waiter.await.unwrap();
        }
        assert!(latch.is_open());

        // Already open: returns immediately
        latch.wait().await;
    }

    #[test]
    fn test_state_transitions() {
        let dispatcher = WatchDispatcher::new();
        assert_eq!(dispatcher.state(), SessionState::Connecting);

        dispatcher.dispatch(WatchedEvent::session(KeeperState::SyncConnected));
        assert_eq!(dispatcher.state(), SessionState::Connected);
        assert!(dispatcher.latch().is_open());

        dispatcher.dispatch(WatchedEvent::session(KeeperState::Disconnected));
        assert_eq!(dispatcher.state(), SessionState::Disconnected);

        dispatcher.dispatch(WatchedEvent::session(KeeperState::SyncConnected));
        assert_eq!(dispatcher.state(), SessionState::Connected);

        dispatcher.dispatch(WatchedEvent::node(EventType::NodeDeleted, "/locks/a"));
        assert_eq!(dispatcher.state(), SessionState::Connected);

        dispatcher.dispatch(WatchedEvent::session(KeeperState::Expired));
        assert_eq!(dispatcher.state(), SessionState::Expired);

        // Terminal states stick
        dispatcher.dispatch(WatchedEvent::session(KeeperState::SyncConnected));
        dispatcher.dispatch(WatchedEvent::session(KeeperState::Closed));
        assert_eq!(dispatcher.state(), SessionState::Expired);
    }

    #[test]
    fn test_auth_failed_closes() {
        let dispatcher = WatchDispatcher::new();
        dispatcher.dispatch(WatchedEvent::session(KeeperState::AuthFailed));
        assert_eq!(dispatcher.state(), SessionState::Closed);

        // A late SyncConnected does not open the gate of a closed session
        dispatcher.dispatch(WatchedEvent::session(KeeperState::SyncConnected));
        assert!(!dispatcher.latch().is_open());
    }

    #[test]
    fn test_listeners_receive_every_event() {
        let dispatcher = WatchDispatcher::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let expired = Arc::new(AtomicUsize::new(0));

        let seen_clone = seen.clone();
        let expired_clone = expired.clone();
        dispatcher.add_listener(Arc::new(FnSessionEventListener::new(move |event| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
            if event.state == KeeperState::Expired {
                expired_clone.fetch_add(1, Ordering::SeqCst);
            }
        })));

        dispatcher.dispatch(WatchedEvent::session(KeeperState::SyncConnected));
        dispatcher.dispatch(WatchedEvent::node(EventType::NodeCreated, "/x"));
        dispatcher.dispatch(WatchedEvent::session(KeeperState::Expired));

        assert_eq!(seen.load(Ordering::SeqCst), 3);
        assert_eq!(expired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wait_connected() {
        let dispatcher = Arc::new(WatchDispatcher::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = dispatcher.spawn(rx);

        let waiter = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.wait_connected().await })
        };

        tx.send(WatchedEvent::session(KeeperState::SyncConnected))
            .unwrap();
        assert_eq!(waiter.await.unwrap(), Ok(()));

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_connected_fails_on_terminal_state() {
        let dispatcher = WatchDispatcher::new();
        dispatcher.dispatch(WatchedEvent::session(KeeperState::Expired));
        assert_eq!(
            dispatcher.wait_connected().await,
            Err(SessionState::Expired)
        );
    }
}
