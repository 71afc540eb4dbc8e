//! Minimum-healthy-node gate.

use std::time::Duration;

use super::watch;
use crate::common::Result;
use crate::consul::{Backend, HealthFilter};

/// Block until strictly more than `min_nodes` instances of `service` pass
/// their checks, and return the count observed.
///
/// The caller is assumed to be one of the passing instances and about to
/// leave, so once this returns the remainder is still at least `min_nodes`.
pub async fn wait_until_at_least(
    backend: &dyn Backend,
    service: &str,
    min_nodes: usize,
    wait: Duration,
) -> Result<usize> {
    let filter = HealthFilter::passing();
    let mut query = watch::service(backend, service, &filter, wait);

    let instances = query
        .watch_while(|instances| {
            let short = instances.len() <= min_nodes;
            if short {
                tracing::info!(
                    service = %service,
                    passing = instances.len(),
                    min_nodes,
                    "Waiting for cluster to have spare healthy nodes"
                );
            }
            short
        })
        .await?;

    tracing::debug!(service = %service, passing = instances.len(), "Cluster is healthy enough");
    Ok(instances.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consul::{CheckStatus, MemoryCluster, ServiceRegistration};

    async fn register(cluster: &MemoryCluster, nodes: &[&str]) {
        for node in nodes {
            cluster
                .agent(*node)
                .register_service(&ServiceRegistration::new("web"))
                .await
                .unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_immediately_with_spare_nodes() {
        let cluster = MemoryCluster::new();
        register(&cluster, &["a", "b", "c"]).await;
        let agent = cluster.agent("a");

        let count = wait_until_at_least(&agent, "web", 2, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_while_at_threshold() {
        let cluster = MemoryCluster::new();
        register(&cluster, &["a", "b", "c"]).await;
        cluster.set_service_health("c", "web", CheckStatus::Critical);
        let agent = cluster.agent("a");

        let gate = tokio::spawn(async move {
            wait_until_at_least(&agent, "web", 2, Duration::from_secs(10)).await
        });

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!gate.is_finished());

        cluster.set_service_health("c", "web", CheckStatus::Passing);
        assert_eq!(gate.await.unwrap().unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_minimum_needs_one_passing() {
        let cluster = MemoryCluster::new();
        register(&cluster, &["a"]).await;
        let agent = cluster.agent("a");

        let count = wait_until_at_least(&agent, "web", 0, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
