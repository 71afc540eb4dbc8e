//! Coordinated shutdown of one node.
//!
//! Before a node terminates it takes its service's `shutdown` lock, waits
//! until the rest of the cluster can absorb its absence, marks itself
//! unhealthy (while still serving), and waits until the backend reports it
//! unhealthy. Only then is the lock released, so the next node never sees a
//! stale healthy view of this one. A grace period follows to drain requests
//! routed before the failure propagated.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch as state_watch;

use super::lock::{LockOptions, Service};
use super::watch;
use crate::common::keys::service_check_id;
use crate::common::{Result, ShutdownConfig};
use crate::consul::Backend;

/// Lock serializing shutdowns within a service.
pub const SHUTDOWN_LOCK: &str = "shutdown";

/// Progress of a coordinated shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShutdownState {
    Running,
    LockAcquired,
    ClusterVerifiedHealthy,
    MarkedUnhealthy,
    PropagatedUnhealthy,
    GracePeriod,
    Terminated,
}

impl std::fmt::Display for ShutdownState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ShutdownState::Running => "running",
            ShutdownState::LockAcquired => "lock-acquired",
            ShutdownState::ClusterVerifiedHealthy => "cluster-verified-healthy",
            ShutdownState::MarkedUnhealthy => "marked-unhealthy",
            ShutdownState::PropagatedUnhealthy => "propagated-unhealthy",
            ShutdownState::GracePeriod => "grace-period",
            ShutdownState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownOptions {
    /// Passing instances that must remain once this node is gone
    pub min_nodes: usize,
    /// Drain time after unhealthiness has propagated
    pub grace_period: Duration,
}

impl Default for ShutdownOptions {
    fn default() -> Self {
        Self {
            min_nodes: 1,
            grace_period: Duration::from_secs(3),
        }
    }
}

impl From<&ShutdownConfig> for ShutdownOptions {
    fn from(config: &ShutdownConfig) -> Self {
        Self {
            min_nodes: config.min_nodes,
            grace_period: Duration::from_millis(config.grace_period_ms),
        }
    }
}

/// Operations on a service instance running on the local node.
pub struct LocalService {
    name: String,
    backend: Arc<dyn Backend>,
    lock_options: LockOptions,
    state: state_watch::Sender<ShutdownState>,
}

impl LocalService {
    pub fn new(name: impl Into<String>, backend: Arc<dyn Backend>) -> Self {
        let (state, _) = state_watch::channel(ShutdownState::Running);
        Self {
            name: name.into(),
            backend,
            lock_options: LockOptions::default(),
            state,
        }
    }

    pub fn with_lock_options(mut self, options: LockOptions) -> Self {
        self.lock_options = options;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ShutdownState {
        *self.state.borrow()
    }

    /// Follow shutdown progress, e.g. from a status endpoint.
    pub fn subscribe(&self) -> state_watch::Receiver<ShutdownState> {
        self.state.subscribe()
    }

    fn transition(&self, next: ShutdownState) {
        tracing::info!(service = %self.name, state = %next, "Shutdown progress");
        self.state.send_replace(next);
    }

    /// Coordinate the shutdown of this node with the rest of the cluster so
    /// that at least `min_nodes` instances stay healthy.
    ///
    /// `mark_unhealthy` runs once the lock is held and the cluster has spare
    /// capacity; it must flip the local health signal so the next check fails,
    /// while the process keeps accepting traffic. When this returns the caller
    /// should stop accepting connections, finish existing work and terminate.
    ///
    /// If `mark_unhealthy` fails the lock is still released, the propagation
    /// wait and grace period are skipped, and the error is returned.
    pub async fn coordinated_shutdown<F>(&self, options: ShutdownOptions, mark_unhealthy: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send,
    {
        let cluster = Service::new(self.name.clone(), self.backend.clone()).with_options(self.lock_options);

        let gate = &cluster;

        tracing::info!(service = %self.name, "Obtaining shutdown lock");
        cluster
            .lock(SHUTDOWN_LOCK, move || async move {
                self.transition(ShutdownState::LockAcquired);

                gate.wait_until_healthy(options.min_nodes).await?;
                self.transition(ShutdownState::ClusterVerifiedHealthy);

                mark_unhealthy()?;
                self.transition(ShutdownState::MarkedUnhealthy);

                self.wait_until_unhealthy().await?;
                self.transition(ShutdownState::PropagatedUnhealthy);

                // Releasing here lets the next node start while this one
                // drains: the consistent view of the cluster already excludes it.
                Ok(())
            })
            .await?;

        self.transition(ShutdownState::GracePeriod);
        tokio::time::sleep(options.grace_period).await;

        self.transition(ShutdownState::Terminated);
        Ok(())
    }

    /// Block until the backend reports this node's check for the service as
    /// anything but passing, i.e. it no longer receives new traffic.
    pub async fn wait_until_unhealthy(&self) -> Result<()> {
        let node = self.backend.node_name().await?;
        let check_id = service_check_id(&self.name);

        let mut query = watch::node(self.backend.as_ref(), &node, self.lock_options.wait);
        query
            .watch_while(|checks| {
                checks
                    .iter()
                    .find(|c| c.check_id == check_id)
                    .is_some_and(|c| c.status.is_passing())
            })
            .await?;

        tracing::info!(service = %self.name, node = %node, "Unhealthy state has propagated");
        Ok(())
    }
}
