//! Traffic-shift updater against a simulated cluster

use async_trait::async_trait;
use consul_coord::consul::{Backend, ClusterEvent, MemoryCluster, ServiceRegistration};
use consul_coord::coordination::LockOptions;
use consul_coord::shift::{LocalDeployment, ReconcileOutcome, TrafficShift};
use consul_coord::Result;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Local service whose version is held in memory.
struct FakeDeployment {
    version: Mutex<Option<String>>,
    switches: Mutex<Vec<String>>,
}

impl FakeDeployment {
    fn running(version: &str) -> Arc<Self> {
        Arc::new(Self {
            version: Mutex::new(Some(version.to_string())),
            switches: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl LocalDeployment for FakeDeployment {
    async fn current_version(&self) -> Result<Option<String>> {
        Ok(self.version.lock().unwrap().clone())
    }

    async fn wait_stopped(&self) -> Result<()> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(())
    }

    async fn switch_version(&self, version: &str) -> Result<()> {
        *self.version.lock().unwrap() = Some(version.to_string());
        self.switches.lock().unwrap().push(version.to_string());
        Ok(())
    }
}

fn fast() -> LockOptions {
    LockOptions {
        lock_delay: Duration::from_millis(200),
        retry_delay: Duration::from_millis(100),
        wait: Duration::from_secs(5),
    }
}

async fn run_service(cluster: &MemoryCluster, node: &str, version: &str) {
    cluster
        .agent(node)
        .register_service(&ServiceRegistration::new("testdrive").with_tag(version))
        .await
        .unwrap();
}

async fn updater(cluster: &MemoryCluster, node: &str, deployment: Arc<FakeDeployment>) -> TrafficShift {
    let shift = TrafficShift::new("testdrive", Arc::new(cluster.agent(node)), deployment).with_lock_options(fast());
    // The listener task is dropped with the test runtime.
    let _ = shift.register().await.unwrap();
    shift
}

fn flag_writes(cluster: &MemoryCluster, node: &str) -> Vec<String> {
    let key = format!("nodes/{}/status", node);
    cluster
        .events()
        .into_iter()
        .filter_map(|e| match e {
            ClusterEvent::KvWritten { key: k, value } if k == key => Some(value),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_reconcile_is_idempotent_on_target_version() {
    let cluster = MemoryCluster::new();
    run_service(&cluster, "a", "v1").await;
    run_service(&cluster, "b", "v1").await;
    run_service(&cluster, "c", "v2").await;
    cluster
        .agent("ops")
        .kv_put("testdrive/spec", br#"{"v1": 0.5, "v2": 0.5}"#)
        .await
        .unwrap();

    let deployment = FakeDeployment::running("v1");
    let shift = updater(&cluster, "a", deployment.clone()).await;

    for _ in 0..2 {
        let outcome = shift.reconcile().await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Unchanged { version: "v1".into() });
    }
    assert!(flag_writes(&cluster, "a").is_empty());
    assert!(deployment.switches.lock().unwrap().is_empty());
    assert_eq!(cluster.lock_holder("testdrive-updater/restart"), None);
}

#[tokio::test(start_paused = true)]
async fn test_reconcile_switches_to_under_provisioned_version() {
    let cluster = MemoryCluster::new();
    run_service(&cluster, "a", "v1").await;
    run_service(&cluster, "b", "v1").await;
    run_service(&cluster, "c", "v2").await;
    cluster
        .agent("ops")
        .kv_put("testdrive/spec", br#"{"v1": 0.0, "v2": 1.0}"#)
        .await
        .unwrap();

    let deployment = FakeDeployment::running("v1");
    let shift = updater(&cluster, "a", deployment.clone()).await;

    let outcome = shift.reconcile().await.unwrap();
    assert_eq!(
        outcome,
        ReconcileOutcome::Switched {
            from: Some("v1".into()),
            to: "v2".into()
        }
    );
    assert_eq!(flag_writes(&cluster, "a"), vec!["down", "up"]);
    assert_eq!(*deployment.switches.lock().unwrap(), vec!["v2"]);
    assert_eq!(cluster.session_count(), 0);

    // a comes back on v2; b is now the floor of v1.
    run_service(&cluster, "a", "v2").await;
    let deployment_b = FakeDeployment::running("v1");
    let shift_b = updater(&cluster, "b", deployment_b.clone()).await;
    let outcome = shift_b.reconcile().await.unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Unchanged { .. }), "{:?}", outcome);
}

#[tokio::test(start_paused = true)]
async fn test_run_reacts_to_spec_changes_only() {
    let cluster = MemoryCluster::new();
    run_service(&cluster, "a", "v1").await;
    run_service(&cluster, "b", "v1").await;
    run_service(&cluster, "c", "v1").await;
    let ops = cluster.agent("ops");

    let deployment = FakeDeployment::running("v1");
    let shift = updater(&cluster, "a", deployment.clone()).await;
    let running = tokio::spawn(async move { shift.run().await });

    ops.kv_put("testdrive/spec", br#"{"v1": 0.5, "v2": 0.5}"#).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(*deployment.switches.lock().unwrap(), vec!["v2"]);

    // Rewriting the same spec is not a change.
    ops.kv_put("testdrive/spec", br#"{"v1": 0.5, "v2": 0.5}"#).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    let cycles = cluster
        .events()
        .into_iter()
        .filter(|e| matches!(e, ClusterEvent::LockAcquired { key, .. } if key == "testdrive-updater/restart"))
        .count();
    assert_eq!(cycles, 1);
    assert!(!running.is_finished());
    running.abort();
}
