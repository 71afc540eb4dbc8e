//! Rolling-upgrade coordinator.
//!
//! Watches the cluster-wide target version and the health of the service as
//! two independent watches. Their updates meet in one queue, so decisions are
//! always taken on a joint snapshot of both.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use super::planner::{plan_restarts, RestartPlan};
use crate::common::keys::{restart_flag_key, VERSION_KEY};
use crate::common::{Backoff, Error, Result};
use crate::consul::{Backend, HealthFilter, QueryOptions, ServiceInstance};
use crate::coordination::watch;
use crate::shift::FLAG_DOWN;

#[derive(Debug)]
enum Update {
    Version(String),
    Health(Vec<ServiceInstance>),
}

pub struct RolloutCoordinator {
    service: String,
    min_nodes: usize,
    backend: Arc<dyn Backend>,
    wait: Duration,
}

impl RolloutCoordinator {
    pub fn new(service: impl Into<String>, backend: Arc<dyn Backend>) -> Self {
        Self {
            service: service.into(),
            min_nodes: 1,
            backend,
            wait: Duration::from_secs(10),
        }
    }

    pub fn with_min_nodes(mut self, min_nodes: usize) -> Self {
        self.min_nodes = min_nodes;
        self
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    /// Act on every change of the target version or the service's health.
    /// Runs until both watches have stopped, which only happens when the
    /// runtime shuts down.
    pub async fn run(&self) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watchers = JoinSet::new();
        watchers.spawn(watch_version(self.backend.clone(), self.wait, tx.clone()));
        watchers.spawn(watch_health(self.backend.clone(), self.service.clone(), self.wait, tx));

        let mut version: Option<String> = None;
        let mut health: Option<Vec<ServiceInstance>> = None;

        while let Some(update) = rx.recv().await {
            apply(update, &mut version, &mut health);
            // Later updates supersede this one: act once on the latest view.
            while let Ok(update) = rx.try_recv() {
                apply(update, &mut version, &mut health);
            }

            let (Some(version), Some(health)) = (&version, &health) else {
                continue;
            };
            if let Err(e) = self.step(version, health).await {
                tracing::warn!(version = %version, "Rollout step failed: {}", e);
            }
        }
        Err(Error::Internal("rollout watchers stopped".into()))
    }

    /// Flag the nodes that may restart now, given the target version and a
    /// health snapshot.
    pub async fn step(&self, version: &str, instances: &[ServiceInstance]) -> Result<RestartPlan> {
        let mut restarting = BTreeSet::new();
        for instance in instances {
            let flag = self
                .backend
                .kv_get(&restart_flag_key(instance.node_name()), QueryOptions::default())
                .await?;
            if flag.value.as_ref().and_then(|p| p.value_str()) == Some(FLAG_DOWN) {
                restarting.insert(instance.node_name().to_string());
            }
        }

        let plan = plan_restarts(version, instances, &restarting, self.min_nodes);
        tracing::info!(
            version = %version,
            incorrect = plan.incorrect.len(),
            healthy = plan.healthy.len(),
            restarting = plan.restarting.len(),
            "Evaluated rollout"
        );

        for node in &plan.to_restart {
            self.backend.kv_put(&restart_flag_key(node), FLAG_DOWN.as_bytes()).await?;
            tracing::info!(node = %node, version = %version, "Flagged node for restart");
        }
        Ok(plan)
    }
}

fn apply(update: Update, version: &mut Option<String>, health: &mut Option<Vec<ServiceInstance>>) {
    match update {
        Update::Version(v) => *version = Some(v),
        Update::Health(h) => *health = Some(h),
    }
}

async fn watch_version(backend: Arc<dyn Backend>, wait: Duration, tx: mpsc::UnboundedSender<Update>) {
    let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
    let mut last: Option<String> = None;
    loop {
        let observed = {
            let mut query = watch::kv(backend.as_ref(), VERSION_KEY, wait);
            query
                .watch_while(|pair| {
                    let current = pair.as_ref().and_then(|p| p.value_str());
                    current.is_none() || current == last.as_deref()
                })
                .await
        };
        match observed {
            Ok(pair) => {
                backoff.reset();
                let version = pair.and_then(|p| p.value_str().map(str::to_string));
                if let Some(version) = version {
                    tracing::info!(version = %version, "Target version changed");
                    last = Some(version.clone());
                    if tx.send(Update::Version(version)).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                let delay = backoff.next_delay();
                tracing::warn!("Version watch failed, retrying in {:?}: {}", delay, e);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

async fn watch_health(backend: Arc<dyn Backend>, service: String, wait: Duration, tx: mpsc::UnboundedSender<Update>) {
    let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
    let filter = HealthFilter::default();
    let mut last: Option<Vec<ServiceInstance>> = None;
    loop {
        let observed = {
            let mut query = watch::service(backend.as_ref(), &service, &filter, wait);
            query.watch_while(|instances| last.as_ref() == Some(instances)).await
        };
        match observed {
            Ok(instances) => {
                backoff.reset();
                last = Some(instances.clone());
                if tx.send(Update::Health(instances)).is_err() {
                    return;
                }
            }
            Err(e) => {
                let delay = backoff.next_delay();
                tracing::warn!(service = %service, "Health watch failed, retrying in {:?}: {}", delay, e);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consul::{MemoryCluster, ServiceRegistration};

    #[tokio::test(start_paused = true)]
    async fn test_step_flags_incorrect_nodes() {
        let cluster = MemoryCluster::new();
        for node in ["a", "b", "c"] {
            cluster
                .agent(node)
                .register_service(&ServiceRegistration::new("http").with_tag("v1"))
                .await
                .unwrap();
        }
        let agent = cluster.agent("ops");
        agent.kv_put("nodes/c/status", b"down").await.unwrap();

        let coordinator = RolloutCoordinator::new("http", Arc::new(agent.clone()));
        let instances = agent
            .health_service("http", &HealthFilter::default(), QueryOptions::default())
            .await
            .unwrap()
            .value;

        let plan = coordinator.step("v2", &instances).await.unwrap();
        assert_eq!(plan.restarting, vec!["c"]);
        assert_eq!(plan.to_restart, vec!["a"]);
        assert_eq!(cluster.kv_value("nodes/a/status").as_deref(), Some("down"));
        assert_eq!(cluster.kv_value("nodes/b/status"), None);
    }
}
