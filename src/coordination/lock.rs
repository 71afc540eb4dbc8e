//! Session-scoped distributed locks.
//!
//! A lock is a KV key acquired under a backend session bound to health
//! checks. If the holder dies or one of those checks fails, the backend
//! invalidates the session and the key frees itself after the lock-delay, so
//! mutual exclusion holds across processes and machines without any local
//! synchronization.

use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use super::watch;
use crate::common::keys::{lock_key, service_check_id, SERF_HEALTH_CHECK};
use crate::common::{ConsulConfig, Error, LockConfig, Result};
use crate::consul::{Backend, SessionRequest};

/// Tuning of lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    /// Cooldown the backend enforces after a session is lost
    pub lock_delay: Duration,
    /// Pause before retrying when the key looked free but acquire failed
    pub retry_delay: Duration,
    /// Long-poll wait while watching a held key
    pub wait: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            lock_delay: Duration::from_secs(5),
            retry_delay: Duration::from_secs(1),
            wait: Duration::from_secs(10),
        }
    }
}

impl LockOptions {
    pub fn from_config(lock: &LockConfig, consul: &ConsulConfig) -> Self {
        Self {
            lock_delay: Duration::from_millis(lock.lock_delay_ms),
            retry_delay: Duration::from_millis(lock.retry_delay_ms),
            wait: consul.wait(),
        }
    }
}

/// Proof of holding a lock. Release it with [`LockHandle::release`]; a handle
/// dropped without release gives the lock up from a background task.
pub struct LockHandle {
    backend: Arc<dyn Backend>,
    key: String,
    session: String,
    released: bool,
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("key", &self.key)
            .field("session", &self.session)
            .field("released", &self.released)
            .finish()
    }
}

impl LockHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// Release the key and destroy the session. The session is destroyed even
    /// if the release request fails; the first error is returned. A release
    /// cancelled midway falls back to the background release of `Drop`.
    pub async fn release(mut self) -> Result<()> {
        let result = release_and_destroy(self.backend.as_ref(), &self.key, &self.session).await;
        self.released = true;
        result
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        tracing::warn!(lock = %self.key, session = %self.session, "Lock handle dropped while held, releasing in background");
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::error!(lock = %self.key, "No runtime to release lock on; it will expire with its session");
            return;
        };
        let backend = self.backend.clone();
        let key = std::mem::take(&mut self.key);
        let session = std::mem::take(&mut self.session);
        runtime.spawn(async move {
            if let Err(e) = release_and_destroy(backend.as_ref(), &key, &session).await {
                tracing::error!(lock = %key, "Background release failed: {}", e);
            }
        });
    }
}

async fn release_and_destroy(backend: &dyn Backend, key: &str, session: &str) -> Result<()> {
    let released = backend.kv_release(key, session).await;
    match &released {
        Ok(true) => tracing::debug!(lock = %key, session = %session, "Lock released"),
        // The session was invalidated first, which already freed the key.
        Ok(false) => tracing::debug!(lock = %key, session = %session, "Lock no longer held at release"),
        Err(e) => tracing::warn!(lock = %key, session = %session, "Lock release failed: {}", e),
    }
    let destroyed = backend.session_destroy(session).await;
    released?;
    destroyed
}

/// Acquire `key` under a fresh session bound to `serfHealth` plus `checks`,
/// blocking until it is held.
pub async fn acquire(
    backend: Arc<dyn Backend>,
    key: &str,
    checks: &[String],
    options: LockOptions,
) -> Result<LockHandle> {
    let node = backend.node_name().await?;

    let mut bound = vec![SERF_HEALTH_CHECK.to_string()];
    bound.extend(checks.iter().filter(|c| *c != SERF_HEALTH_CHECK).cloned());
    let session = backend
        .session_create(&SessionRequest {
            name: Some(format!("lock {}", key)),
            checks: bound,
            lock_delay: options.lock_delay,
        })
        .await?;
    tracing::debug!(lock = %key, session = %session, "Session created");

    match acquire_with_session(backend.as_ref(), key, &session, node.as_bytes(), options).await {
        Ok(()) => Ok(LockHandle {
            backend,
            key: key.to_string(),
            session,
            released: false,
        }),
        Err(e) => {
            if let Err(destroy) = backend.session_destroy(&session).await {
                tracing::warn!(lock = %key, session = %session, "Failed to destroy session after acquire error: {}", destroy);
            }
            Err(e)
        }
    }
}

async fn acquire_with_session(
    backend: &dyn Backend,
    key: &str,
    session: &str,
    value: &[u8],
    options: LockOptions,
) -> Result<()> {
    loop {
        if backend.kv_acquire(key, session, value).await? {
            tracing::info!(lock = %key, session = %session, "Lock acquired");
            return Ok(());
        }

        tracing::debug!(lock = %key, "Lock held elsewhere, waiting for it to be released");
        let mut query = watch::kv(backend, key, options.wait);
        query
            .watch_while(|pair| pair.as_ref().is_some_and(|p| p.is_locked()))
            .await?;

        // Free on the very first read means blocking could not help: the
        // backend refused the acquire (lock-delay) although nobody holds the
        // key. Back off instead of hammering it.
        if query.state().rounds == 1 {
            tokio::time::sleep(options.retry_delay).await;
        }
    }
}

/// Run `critical` while holding `key`. The lock is released and its session
/// destroyed on every exit path before this returns: success, error, or panic
/// (which is resumed afterwards).
pub async fn with_lock<F, Fut, T>(
    backend: Arc<dyn Backend>,
    key: &str,
    checks: &[String],
    options: LockOptions,
    critical: F,
) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let handle = acquire(backend, key, checks, options).await?;

    let outcome = AssertUnwindSafe(critical()).catch_unwind().await;
    let released = handle.release().await;

    match outcome {
        Ok(Ok(value)) => {
            released?;
            Ok(value)
        }
        Ok(Err(e)) => {
            if let Err(release_error) = released {
                tracing::warn!(lock = %key, "Release after failed critical section also failed: {}", release_error);
            }
            Err(Error::LockCallbackFailed {
                lock: key.to_string(),
                source: Box::new(e),
            })
        }
        Err(panic) => {
            if let Err(release_error) = released {
                tracing::warn!(lock = %key, "Release after panicked critical section failed: {}", release_error);
            }
            std::panic::resume_unwind(panic)
        }
    }
}

/// Cluster coordination scoped to one service: its locks live under the
/// service's KV prefix and their sessions die with the service's check.
#[derive(Clone)]
pub struct Service {
    name: String,
    backend: Arc<dyn Backend>,
    options: LockOptions,
}

impl Service {
    pub fn new(name: impl Into<String>, backend: Arc<dyn Backend>) -> Self {
        Self {
            name: name.into(),
            backend,
            options: LockOptions::default(),
        }
    }

    pub fn with_options(mut self, options: LockOptions) -> Self {
        self.options = options;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn options(&self) -> LockOptions {
        self.options
    }

    /// Block until `lock` is held, then run `critical`, releasing the lock and
    /// destroying the session when it completes.
    pub async fn lock<F, Fut, T>(&self, lock: &str, critical: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.lock_with_checks(lock, &[], critical).await
    }

    /// Like [`Service::lock`], with extra checks bound to the session.
    pub async fn lock_with_checks<F, Fut, T>(&self, lock: &str, extra_checks: &[String], critical: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut checks = vec![service_check_id(&self.name)];
        checks.extend(extra_checks.iter().cloned());
        with_lock(
            self.backend.clone(),
            &lock_key(&self.name, lock),
            &checks,
            self.options,
            critical,
        )
        .await
    }

    /// Block until more than `min_nodes` instances pass; see
    /// [`health_gate::wait_until_at_least`](super::health_gate::wait_until_at_least).
    pub async fn wait_until_healthy(&self, min_nodes: usize) -> Result<usize> {
        super::health_gate::wait_until_at_least(self.backend.as_ref(), &self.name, min_nodes, self.options.wait).await
    }
}
