//! Ephemeral-node locks
//!
//! A lock on a resource is an ephemeral node at the resource's path. Its
//! creation is the atomic test-and-set: whichever session creates the node
//! holds the lock until it deletes the node or the session ends. Waiters
//! poll at a fixed interval.
//!
//! A create whose reply is lost to a connection drop may still have been
//! applied. The session remembers such paths, and the next `NodeExists`
//! on one of them checks whether the node is this session's own.
//!
//! A holder whose session expires has already lost the lock (the ensemble
//! removed the node); the `Acquisition` it still holds is stale. Such
//! sessions report `ClientError::SessionExpired` on every later lock call.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tamarind_common::{ANY_VERSION, CreateMode, KeeperError, resource_path};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::data::create_parents;
use crate::error::{ClientError, Result};
use crate::metrics::{self, Timer};
use crate::session::SessionManager;

/// What to do when an attempt fails for a reason other than contention
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultPolicy {
    /// Log and keep retrying
    #[default]
    Retry,
    /// Return `ClientError::CoordinationFault`
    FailFast,
}

/// Lock lifecycle as seen by one acquirer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockPhase {
    Idle,
    Acquiring,
    Held,
    Retrying,
    Released,
}

impl fmt::Display for LockPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LockPhase::Idle => "IDLE",
            LockPhase::Acquiring => "ACQUIRING",
            LockPhase::Held => "HELD",
            LockPhase::Retrying => "RETRYING",
            LockPhase::Released => "RELEASED",
        };
        write!(f, "{}", s)
    }
}

/// Per-call acquisition options. The defaults retry forever.
#[derive(Debug, Clone, Default)]
pub struct AcquireOptions {
    /// Give up with `ClientError::Timeout` after this long
    pub deadline: Option<Duration>,
    /// Give up with `ClientError::Cancelled` once cancelled
    pub cancel: Option<CancellationToken>,
    /// Overrides the manager's default policy
    pub fault_policy: Option<FaultPolicy>,
}

impl AcquireOptions {
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_fault_policy(mut self, policy: FaultPolicy) -> Self {
        self.fault_policy = Some(policy);
        self
    }
}

/// Proof of a successful acquire. Release it exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acquisition {
    /// Lock node path
    pub path: String,
    /// Create attempts made, including the successful one
    pub attempts: u64,
    /// Time from the first attempt to success
    pub waited: Duration,
}

enum Attempt {
    Acquired,
    Busy,
    Fault(KeeperError),
}

/// Acquires and releases resource locks on one session
#[derive(Clone)]
pub struct LockManager {
    session: Arc<SessionManager>,
    root: String,
    retry_interval: Duration,
    fault_policy: FaultPolicy,
}

impl LockManager {
    pub fn new(session: Arc<SessionManager>) -> Self {
        let config = session.config();
        let root = config.lock_root.clone();
        let retry_interval = config.retry_interval();
        let fault_policy = if config.fail_fast {
            FaultPolicy::FailFast
        } else {
            FaultPolicy::Retry
        };
        debug!(root = %root, phase = %LockPhase::Idle, "Lock manager ready");
        Self {
            session,
            root,
            retry_interval,
            fault_policy,
        }
    }

    pub fn with_fault_policy(mut self, policy: FaultPolicy) -> Self {
        self.fault_policy = policy;
        self
    }

    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    /// Node path of a resource's lock.
    ///
    /// Identifiers starting with `/` are used as the path itself; anything
    /// else is escaped into a single child of the lock root.
    pub fn lock_path(&self, resource: &str) -> Result<String> {
        resource_path(&self.root, resource).map_err(|e| ClientError::fault(resource, e))
    }

    /// Block until the lock on `resource` is held.
    pub async fn acquire(&self, resource: &str) -> Result<Acquisition> {
        self.acquire_with(resource, AcquireOptions::default()).await
    }

    pub async fn acquire_with(&self, resource: &str, options: AcquireOptions) -> Result<Acquisition> {
        let path = self.lock_path(resource)?;
        let policy = options.fault_policy.unwrap_or(self.fault_policy);
        let started = Instant::now();
        let deadline = options.deadline.map(|d| started + d);
        let mut attempts: u64 = 0;

        debug!(path = %path, phase = %LockPhase::Acquiring, "Acquiring lock");

        loop {
            self.session.ensure_live()?;
            if let Some(token) = &options.cancel
                && token.is_cancelled()
            {
                return Err(ClientError::Cancelled { path });
            }
            if let Some(deadline) = deadline
                && attempts > 0
                && Instant::now() >= deadline
            {
                warn!(path = %path, attempts, "Lock acquire timed out");
                return Err(ClientError::Timeout {
                    path,
                    attempts,
                    waited: started.elapsed(),
                });
            }

            attempts += 1;
            match self.attempt(&path).await {
                Attempt::Acquired => {
                    return Ok(self.held(path, attempts, started.elapsed()));
                }
                Attempt::Busy => {
                    if self.reclaim_unconfirmed(&path).await {
                        return Ok(self.held(path, attempts, started.elapsed()));
                    }
                    metrics::record_lock_attempt("contended");
                    debug!(path = %path, attempts, phase = %LockPhase::Retrying, "Lock busy");
                }
                Attempt::Fault(e) => {
                    metrics::record_lock_attempt("fault");
                    self.note_fault(&path, &e);
                    if e.is_session_terminal() || policy == FaultPolicy::FailFast {
                        warn!(path = %path, attempts, error = %e, "Lock acquire failed");
                        return Err(ClientError::fault(&path, e));
                    }
                    warn!(path = %path, attempts, error = %e, phase = %LockPhase::Retrying, "Lock attempt failed, retrying");
                }
            }

            let mut pause = self.retry_interval;
            if let Some(deadline) = deadline {
                pause = pause.min(deadline.saturating_duration_since(Instant::now()));
            }
            match &options.cancel {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => {
                            debug!(path = %path, attempts, "Lock acquire cancelled");
                            return Err(ClientError::Cancelled { path });
                        }
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
                None => tokio::time::sleep(pause).await,
            }
        }
    }

    /// Single attempt. `None` when another session holds the lock.
    pub async fn try_acquire(&self, resource: &str) -> Result<Option<Acquisition>> {
        let path = self.lock_path(resource)?;
        self.session.ensure_live()?;
        let started = Instant::now();

        match self.attempt(&path).await {
            Attempt::Acquired => Ok(Some(self.held(path, 1, started.elapsed()))),
            Attempt::Busy => {
                if self.reclaim_unconfirmed(&path).await {
                    return Ok(Some(self.held(path, 1, started.elapsed())));
                }
                metrics::record_lock_attempt("contended");
                debug!(path = %path, "Lock busy");
                Ok(None)
            }
            Attempt::Fault(e) => {
                metrics::record_lock_attempt("fault");
                self.note_fault(&path, &e);
                Err(ClientError::fault(&path, e))
            }
        }
    }

    /// Single attempt that reports a held lock as `ClientError::Contention`.
    pub async fn acquire_nowait(&self, resource: &str) -> Result<Acquisition> {
        match self.try_acquire(resource).await? {
            Some(acquisition) => Ok(acquisition),
            None => Err(ClientError::Contention {
                path: self.lock_path(resource)?,
            }),
        }
    }

    /// Delete the lock node, whoever holds it.
    ///
    /// Never fails: an absent node or a fault is logged and reported as
    /// `false`. Returns `true` when this call removed the node.
    pub async fn release(&self, resource: &str) -> bool {
        let path = match self.lock_path(resource) {
            Ok(path) => path,
            Err(e) => {
                warn!(resource, error = %e, "Cannot release lock");
                return false;
            }
        };

        let deleted = match self
            .session
            .coordinator()
            .delete(&path, ANY_VERSION)
            .await
        {
            Ok(()) => {
                info!(path = %path, phase = %LockPhase::Released, "Lock released");
                true
            }
            Err(KeeperError::NoNode(_)) => {
                debug!(path = %path, "Lock already released");
                false
            }
            Err(e) => {
                warn!(path = %path, error = %e, "Lock release failed");
                false
            }
        };
        self.session.clear_unconfirmed(&path);
        metrics::record_lock_released(deleted);
        deleted
    }

    /// Whether any session currently holds the lock.
    pub async fn is_locked(&self, resource: &str) -> Result<bool> {
        let path = self.lock_path(resource)?;
        self.session.ensure_live()?;
        self.session
            .coordinator()
            .exists(&path)
            .await
            .map(|stat| stat.is_some())
            .map_err(|e| ClientError::fault(&path, e))
    }

    /// Session id of the current holder, if any.
    pub async fn holder(&self, resource: &str) -> Result<Option<i64>> {
        let path = self.lock_path(resource)?;
        self.session.ensure_live()?;
        let stat = self
            .session
            .coordinator()
            .exists(&path)
            .await
            .map_err(|e| ClientError::fault(&path, e))?;
        Ok(stat.map(|s| s.ephemeral_owner))
    }

    /// Run `f` while holding the lock on `resource`, releasing it afterwards.
    pub async fn with_lock<F, Fut, T>(&self, resource: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.acquire(resource).await?;
        let timer = Timer::new();
        let output = f().await;
        metrics::record_lock_hold(timer.elapsed_secs());
        self.release(resource).await;
        Ok(output)
    }

    async fn attempt(&self, path: &str) -> Attempt {
        let coordinator = self.session.coordinator();
        match coordinator.create(path, b"", CreateMode::Ephemeral).await {
            Ok(_) => Attempt::Acquired,
            Err(KeeperError::NodeExists(_)) => Attempt::Busy,
            Err(KeeperError::NoNode(_)) => {
                // Lock root missing
                if let Err(e) = create_parents(coordinator.as_ref(), path).await {
                    return Attempt::Fault(e);
                }
                match coordinator.create(path, b"", CreateMode::Ephemeral).await {
                    Ok(_) => Attempt::Acquired,
                    Err(KeeperError::NodeExists(_)) => Attempt::Busy,
                    Err(e) => Attempt::Fault(e),
                }
            }
            Err(e) => Attempt::Fault(e),
        }
    }

    fn note_fault(&self, path: &str, e: &KeeperError) {
        if e.is_connection_loss() {
            self.session.mark_unconfirmed(path);
        }
    }

    /// Whether a busy lock is this session's own node from a create whose
    /// reply was lost. The mark is kept only while the owner is unknown.
    async fn reclaim_unconfirmed(&self, path: &str) -> bool {
        if !self.session.is_unconfirmed(path) {
            return false;
        }
        let session_id = self.session.session_id();
        match self.session.coordinator().exists(path).await {
            Ok(stat) => {
                self.session.clear_unconfirmed(path);
                let owned = stat
                    .is_some_and(|s| session_id != 0 && s.ephemeral_owner == session_id);
                if owned {
                    info!(path = %path, "Earlier create succeeded before the connection dropped");
                }
                owned
            }
            Err(e) => {
                debug!(path = %path, error = %e, "Lock owner still unknown");
                false
            }
        }
    }

    fn held(&self, path: String, attempts: u64, waited: Duration) -> Acquisition {
        metrics::record_lock_attempt("acquired");
        metrics::record_lock_acquired(waited.as_secs_f64());
        info!(
            path = %path,
            attempts,
            waited_ms = waited.as_millis() as u64,
            phase = %LockPhase::Held,
            "Lock acquired"
        );
        Acquisition {
            path,
            attempts,
            waited,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use tamarind_ensemble::MemoryEnsemble;

    async fn manager(ensemble: &MemoryEnsemble) -> LockManager {
        let session =
            SessionManager::connect(ClientConfig::new("memory:2181"), Arc::new(ensemble.connector()))
                .await
                .unwrap();
        session.lock_manager()
    }

    #[tokio::test]
    async fn test_lock_path() {
        let ensemble = MemoryEnsemble::new();
        let locks = manager(&ensemble).await;

        assert_eq!(locks.lock_path("product-1").unwrap(), "/locks/product-1");
        assert_eq!(locks.lock_path("a/b").unwrap(), "/locks/a%2Fb");
        assert_eq!(
            locks.lock_path("/taskid-list-lock").unwrap(),
            "/taskid-list-lock"
        );
        assert!(locks.lock_path("").is_err());
    }

    #[tokio::test]
    async fn test_acquire_creates_root_and_ephemeral_node() {
        let ensemble = MemoryEnsemble::new();
        let locks = manager(&ensemble).await;

        let acquisition = locks.acquire("orders").await.unwrap();
        assert_eq!(acquisition.path, "/locks/orders");
        assert_eq!(acquisition.attempts, 1);

        let root = ensemble.stat("/locks").unwrap();
        assert!(!root.is_ephemeral());
        assert!(ensemble.stat("/locks/orders").unwrap().is_ephemeral());
        assert!(locks.is_locked("orders").await.unwrap());
        assert_eq!(
            locks.holder("orders").await.unwrap(),
            Some(locks.session.session_id())
        );
    }

    #[tokio::test]
    async fn test_try_acquire_contention() {
        let ensemble = MemoryEnsemble::new();
        let first = manager(&ensemble).await;
        let second = manager(&ensemble).await;

        assert!(first.try_acquire("r").await.unwrap().is_some());
        assert!(second.try_acquire("r").await.unwrap().is_none());
        // Same session contends with itself
        assert!(first.try_acquire("r").await.unwrap().is_none());

        assert!(first.release("r").await);
        assert!(second.try_acquire("r").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_acquire_nowait_reports_contention() {
        let ensemble = MemoryEnsemble::new();
        let first = manager(&ensemble).await;
        let second = manager(&ensemble).await;

        first.acquire_nowait("r").await.unwrap();
        match second.acquire_nowait("r").await {
            Err(ClientError::Contention { path }) => assert_eq!(path, "/locks/r"),
            other => panic!("unexpected result: {other:?}"),
        }

        first.release("r").await;
        assert_eq!(second.acquire_nowait("r").await.unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let ensemble = MemoryEnsemble::new();
        let locks = manager(&ensemble).await;

        locks.acquire("r").await.unwrap();
        assert!(locks.release("r").await);
        assert!(!locks.release("r").await);
        assert!(!locks.release("never-locked").await);
        assert!(!locks.release("").await);
    }

    #[tokio::test]
    async fn test_deadline() {
        let ensemble = MemoryEnsemble::new();
        let holder = manager(&ensemble).await;
        let waiter = manager(&ensemble).await;
        holder.acquire("r").await.unwrap();

        let err = waiter
            .acquire_with(
                "r",
                AcquireOptions::default().with_deadline(Duration::from_millis(100)),
            )
            .await
            .unwrap_err();
        match err {
            ClientError::Timeout { path, attempts, .. } => {
                assert_eq!(path, "/locks/r");
                assert!(attempts >= 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_cancel() {
        let ensemble = MemoryEnsemble::new();
        let holder = manager(&ensemble).await;
        let waiter = manager(&ensemble).await;
        holder.acquire("r").await.unwrap();

        let token = CancellationToken::new();
        let task = {
            let waiter = waiter.clone();
            let token = token.clone();
            tokio::spawn(async move {
                waiter
                    .acquire_with("r", AcquireOptions::default().with_cancel(token))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        assert!(matches!(
            task.await.unwrap(),
            Err(ClientError::Cancelled { .. })
        ));
    }

    #[tokio::test]
    async fn test_fault_policy() {
        let ensemble = MemoryEnsemble::new();
        let locks = manager(&ensemble).await;
        ensemble.set_available(false);

        let err = locks
            .acquire_with(
                "r",
                AcquireOptions::default().with_fault_policy(FaultPolicy::FailFast),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::CoordinationFault {
                source: KeeperError::ConnectionLoss,
                ..
            }
        ));

        // Retry rides out the outage
        let task = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire("r").await })
        };
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!task.is_finished());
        ensemble.set_available(true);

        let acquisition = task.await.unwrap().unwrap();
        assert!(acquisition.attempts > 1);
    }

    #[tokio::test]
    async fn test_expired_session_fails_immediately() {
        let ensemble = MemoryEnsemble::new();
        let locks = manager(&ensemble).await;
        locks.acquire("r").await.unwrap();

        ensemble.expire_session(locks.session.session_id());
        locks
            .session
            .subscribe()
            .wait_for(|s| s.is_terminal())
            .await
            .unwrap();

        assert!(ensemble.stat("/locks/r").is_none());
        assert!(matches!(
            locks.acquire("r").await,
            Err(ClientError::SessionExpired)
        ));
        assert!(!locks.release("r").await);
    }

    #[tokio::test]
    async fn test_with_lock_releases() {
        let ensemble = MemoryEnsemble::new();
        let locks = manager(&ensemble).await;

        let value = locks
            .with_lock("scoped", || async { 42 })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert!(!locks.is_locked("scoped").await.unwrap());
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(LockPhase::Idle.to_string(), "IDLE");
        assert_eq!(LockPhase::Retrying.to_string(), "RETRYING");
        assert_eq!(FaultPolicy::default(), FaultPolicy::Retry);
    }
}
