//! Node side of a rolling upgrade.
//!
//! The restarter waits for the coordinator to flag its node `down`, drains the
//! local service, and brings it back on the cluster's target version.

use std::time::Duration;

use crate::common::keys::{restart_flag_key, VERSION_KEY};
use crate::common::{Backoff, Error, Result};
use crate::consul::QueryOptions;
use crate::coordination::LocalService;
use crate::service::{wait_for_restart_flag, ManagedService};
use crate::shift::FLAG_UP;

pub struct Restarter {
    managed: ManagedService,
    wait: Duration,
    startup_delay: Duration,
}

impl Restarter {
    pub fn new(managed: ManagedService) -> Self {
        Self {
            managed,
            wait: Duration::from_secs(10),
            startup_delay: Duration::from_secs(3),
        }
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    /// Time the service takes to come up after switching versions.
    pub fn with_startup_delay(mut self, delay: Duration) -> Self {
        self.startup_delay = delay;
        self
    }

    /// Switch to the cluster's target version: re-register tagged with it,
    /// clear this node's restart flag, and report healthy once started.
    ///
    /// The flag is cleared before the service is healthy again; the
    /// coordinator will not count the node as healthy until its check passes.
    pub async fn start_with_latest_version(&self) -> Result<String> {
        let backend = self.managed.backend();
        let version = backend
            .kv_get(VERSION_KEY, QueryOptions::default())
            .await?
            .value
            .and_then(|p| p.value_str().map(str::to_string))
            .ok_or_else(|| Error::InvalidSpec(format!("no target version at {}", VERSION_KEY)))?;

        self.managed.state().version.set(version.clone());
        self.managed.register().await?;

        let node = backend.node_name().await?;
        backend.kv_put(&restart_flag_key(&node), FLAG_UP.as_bytes()).await?;

        tokio::time::sleep(self.startup_delay).await;
        self.managed.state().health.mark_healthy();
        tracing::info!(version = %version, "Started on target version");
        Ok(version)
    }

    /// One restart: wait for the flag, drain, come back.
    pub async fn restart_once(&self) -> Result<String> {
        wait_for_restart_flag(self.managed.backend().as_ref(), self.wait).await?;

        self.managed.state().health.mark_unhealthy();
        // Otherwise the coordinator could see this node healthy once the flag
        // is cleared and flag it again.
        LocalService::new(self.managed.name(), self.managed.backend().clone())
            .wait_until_unhealthy()
            .await?;

        self.start_with_latest_version().await
    }

    pub async fn run(&self) -> Result<()> {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        loop {
            match self.restart_once().await {
                Ok(_) => backoff.reset(),
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!("Restart failed, retrying in {:?}: {}", delay, e);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consul::{CheckStatus, MemoryCluster};
    use crate::service::ServiceState;
    use std::net::SocketAddr;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_start_with_latest_version() {
        let cluster = MemoryCluster::new();
        let agent = cluster.agent("a");
        agent.kv_put(VERSION_KEY, b"v2").await.unwrap();

        let state = ServiceState::new(Some("v1".into()));
        state.health.mark_unhealthy();
        let managed = ManagedService::new("http", SocketAddr::from(([127, 0, 0, 1], 8888)), state.clone(), Arc::new(agent));
        let restarter = Restarter::new(managed).with_startup_delay(Duration::from_millis(10));

        assert_eq!(restarter.start_with_latest_version().await.unwrap(), "v2");
        assert_eq!(state.version.get().as_deref(), Some("v2"));
        assert!(state.health.is_healthy());
        assert_eq!(cluster.kv_value("nodes/a/status").as_deref(), Some("up"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_version_is_an_error() {
        let cluster = MemoryCluster::new();
        let managed = ManagedService::new(
            "http",
            SocketAddr::from(([127, 0, 0, 1], 8888)),
            ServiceState::default(),
            Arc::new(cluster.agent("a")),
        );
        let restarter = Restarter::new(managed);
        assert!(matches!(restarter.start_with_latest_version().await, Err(Error::InvalidSpec(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_once_drains_before_switching() {
        let cluster = MemoryCluster::new();
        let agent = cluster.agent("a");
        agent.kv_put(VERSION_KEY, b"v1").await.unwrap();

        let state = ServiceState::default();
        let managed = ManagedService::new("http", SocketAddr::from(([127, 0, 0, 1], 8888)), state.clone(), Arc::new(agent.clone()));
        let restarter = Restarter::new(managed).with_startup_delay(Duration::from_millis(10));
        restarter.start_with_latest_version().await.unwrap();

        let running = tokio::spawn(async move { restarter.restart_once().await });

        agent.kv_put(VERSION_KEY, b"v2").await.unwrap();
        agent.kv_put("nodes/a/status", b"down").await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!state.health.is_healthy());
        assert!(!running.is_finished());

        cluster.set_service_health("a", "http", CheckStatus::Critical);
        assert_eq!(running.await.unwrap().unwrap(), "v2");
        assert_eq!(cluster.kv_value("nodes/a/status").as_deref(), Some("up"));
    }
}
