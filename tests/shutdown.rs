//! Coordinated shutdown across simulated nodes

use consul_coord::common::Error;
use consul_coord::consul::{Backend, CheckStatus, ClusterEvent, HealthFilter, MemoryCluster, QueryOptions, ServiceRegistration};
use consul_coord::coordination::{LocalService, LockOptions, ShutdownOptions, ShutdownState};
use consul_coord::service::HealthFlag;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

fn fast() -> LockOptions {
    LockOptions {
        lock_delay: Duration::from_millis(200),
        retry_delay: Duration::from_millis(100),
        wait: Duration::from_secs(5),
    }
}

fn options(min_nodes: usize) -> ShutdownOptions {
    ShutdownOptions {
        min_nodes,
        grace_period: Duration::from_secs(3),
    }
}

/// Stand-in for the agent's check runner: mirrors the local health flag into
/// the node's service check every 500ms.
fn check_runner(cluster: &MemoryCluster, node: &str, flag: HealthFlag) -> JoinHandle<()> {
    let cluster = cluster.clone();
    let node = node.to_string();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(500)).await;
            let status = if flag.is_healthy() {
                CheckStatus::Passing
            } else {
                CheckStatus::Critical
            };
            cluster.set_service_health(&node, "web", status);
        }
    })
}

struct Node {
    local: Arc<LocalService>,
    flag: HealthFlag,
    _runner: JoinHandle<()>,
}

async fn start(cluster: &MemoryCluster, name: &str) -> Node {
    let agent = cluster.agent(name);
    agent
        .register_service(&ServiceRegistration::new("web"))
        .await
        .unwrap();
    let flag = HealthFlag::default();
    Node {
        local: Arc::new(LocalService::new("web", Arc::new(agent)).with_lock_options(fast())),
        _runner: check_runner(cluster, name, flag.clone()),
        flag,
    }
}

fn shutdown(node: &Node, min_nodes: usize) -> JoinHandle<consul_coord::Result<()>> {
    let local = node.local.clone();
    let flag = node.flag.clone();
    tokio::spawn(async move {
        local
            .coordinated_shutdown(options(min_nodes), move || {
                flag.mark_unhealthy();
                Ok(())
            })
            .await
    })
}

fn position(events: &[ClusterEvent], wanted: impl Fn(&ClusterEvent) -> bool) -> usize {
    events
        .iter()
        .position(wanted)
        .expect("event not found")
}

fn went_critical(node: &'static str) -> impl Fn(&ClusterEvent) -> bool {
    move |e| {
        matches!(e, ClusterEvent::CheckUpdated { node: n, check_id, status: CheckStatus::Critical }
            if n == node && check_id == "service:web")
    }
}

fn shutdown_lock_released(e: &ClusterEvent) -> bool {
    matches!(e, ClusterEvent::LockReleased { key, .. } if key == "web/shutdown")
}

#[tokio::test(start_paused = true)]
async fn test_lock_is_released_only_after_unhealthy_propagated() {
    let cluster = MemoryCluster::new();
    let a = start(&cluster, "a").await;
    let _b = start(&cluster, "b").await;
    let _c = start(&cluster, "c").await;

    let mut states = a.local.subscribe();
    let started = tokio::time::Instant::now();
    shutdown(&a, 1).await.unwrap().unwrap();

    assert_eq!(*states.borrow_and_update(), ShutdownState::Terminated);
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert!(!a.flag.is_healthy());

    let events = cluster.events();
    let critical = position(&events, went_critical("a"));
    let released = position(&events, shutdown_lock_released);
    assert!(critical < released, "lock released before the check failed: {:?}", events);
    assert_eq!(cluster.lock_holder("web/shutdown"), None);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_shutdowns_keep_minimum_healthy() {
    let cluster = MemoryCluster::new();
    let a = start(&cluster, "a").await;
    let b = start(&cluster, "b").await;
    let c = start(&cluster, "c").await;

    let first = shutdown(&a, 1);
    let second = shutdown(&b, 1);
    let third = shutdown(&c, 1);

    // Two nodes can leave; the last one waits for company.
    tokio::time::sleep(Duration::from_secs(60)).await;
    let stopped = [&first, &second, &third].iter().filter(|h| h.is_finished()).count();
    assert_eq!(stopped, 2);

    let observer = cluster.agent("observer");
    let passing = observer
        .health_service("web", &HealthFilter::passing(), QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(passing.value.len(), 1);

    // A replacement comes up: the last node may now go.
    let _d = start(&cluster, "d").await;
    for handle in [first, second, third] {
        handle.await.unwrap().unwrap();
    }

    let passing = observer
        .health_service("web", &HealthFilter::passing(), QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(passing.value.len(), 1);
    assert_eq!(passing.value[0].node_name(), "d");
}

#[tokio::test(start_paused = true)]
async fn test_next_node_waits_for_propagation_of_previous() {
    let cluster = MemoryCluster::new();
    let a = start(&cluster, "a").await;
    let b = start(&cluster, "b").await;
    let _c = start(&cluster, "c").await;
    let _d = start(&cluster, "d").await;

    let first = shutdown(&a, 1);
    let second = shutdown(&b, 1);
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    let events = cluster.events();
    let a_critical = position(&events, went_critical("a"));
    let b_critical = position(&events, went_critical("b"));
    let first_release = position(&events, shutdown_lock_released);
    let (earlier, later) = (a_critical.min(b_critical), a_critical.max(b_critical));

    // The second node only marks itself unhealthy after the first one has
    // been seen unhealthy and given the lock up.
    assert!(earlier < first_release);
    assert!(first_release < later);
}

#[tokio::test(start_paused = true)]
async fn test_failed_callback_lets_next_node_proceed() {
    let cluster = MemoryCluster::new();
    let a = start(&cluster, "a").await;
    let b = start(&cluster, "b").await;
    let _c = start(&cluster, "c").await;

    let result = a
        .local
        .coordinated_shutdown(options(1), || Err(Error::Other("cannot flip health".into())))
        .await;
    assert!(matches!(result, Err(Error::LockCallbackFailed { .. })));
    assert!(a.flag.is_healthy());
    assert_eq!(a.local.state(), ShutdownState::ClusterVerifiedHealthy);

    shutdown(&b, 1).await.unwrap().unwrap();
    assert_eq!(b.local.state(), ShutdownState::Terminated);
    assert_eq!(cluster.session_count(), 0);
}
