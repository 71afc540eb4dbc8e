//! In-process simulation of a Consul cluster.
//!
//! One [`MemoryCluster`] holds the shared state (KV, sessions, nodes and their
//! checks); each [`MemoryAgent`] is the view of a single node and implements
//! [`Backend`]. The simulation keeps a single modify index for the whole
//! cluster, so a blocking read wakes on any change and callers re-check their
//! predicate, which real Consul also allows.
//!
//! Semantics reproduced:
//! - sessions must be bound to existing, passing checks on their node
//! - a bound check turning critical invalidates the session, releases its
//!   locks and arms the lock-delay on those keys
//! - acquire fails while a key is held by another session or lock-delay is
//!   armed

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use super::{
    AgentService, Backend, CheckStatus, HealthCheck, HealthFilter, Indexed, KvPair, NodeInfo,
    QueryOptions, ServiceInstance, ServiceRegistration, SessionRequest,
};
use crate::common::keys::{service_check_id, SERF_HEALTH_CHECK};
use crate::common::{Error, Result};

/// Wait applied to blocking reads that carry no explicit wait.
const DEFAULT_WAIT: Duration = Duration::from_secs(300);

/// Observable state transitions, in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    KvWritten { key: String, value: String },
    LockAcquired { key: String, session: String, node: String },
    LockReleased { key: String, session: String },
    SessionCreated { session: String, node: String },
    SessionDestroyed { session: String },
    SessionInvalidated { session: String },
    CheckUpdated { node: String, check_id: String, status: CheckStatus },
    ServiceRegistered { node: String, service: String, tags: Vec<String> },
}

#[derive(Debug, Clone)]
struct Session {
    node: String,
    checks: Vec<String>,
    lock_delay: Duration,
}

#[derive(Debug, Default)]
struct NodeState {
    services: BTreeMap<String, AgentService>,
    checks: BTreeMap<String, HealthCheck>,
}

#[derive(Debug, Default)]
struct ClusterState {
    index: u64,
    kv: BTreeMap<String, KvPair>,
    lock_delays: HashMap<String, Instant>,
    sessions: HashMap<String, Session>,
    nodes: BTreeMap<String, NodeState>,
    events: Vec<ClusterEvent>,
    failures: usize,
    latency: Duration,
}

impl ClusterState {
    fn bump(&mut self) -> u64 {
        self.index += 1;
        self.index
    }

    fn node_mut(&mut self, node: &str) -> &mut NodeState {
        self.nodes.entry(node.to_string()).or_insert_with(|| {
            let mut state = NodeState::default();
            state.checks.insert(
                SERF_HEALTH_CHECK.to_string(),
                HealthCheck {
                    node: node.to_string(),
                    check_id: SERF_HEALTH_CHECK.to_string(),
                    name: "Serf Health Status".to_string(),
                    status: CheckStatus::Passing,
                    service_name: String::new(),
                },
            );
            state
        })
    }

    /// Drop the session and release every key it holds. Invalidation (as
    /// opposed to an explicit destroy) arms the lock-delay on those keys.
    fn remove_session(&mut self, id: &str, invalidated: bool) {
        let Some(session) = self.sessions.remove(id) else {
            return;
        };
        let index = self.bump();
        let held: Vec<String> = self
            .kv
            .values()
            .filter(|pair| pair.session.as_deref() == Some(id))
            .map(|pair| pair.key.clone())
            .collect();
        for key in held {
            if let Some(pair) = self.kv.get_mut(&key) {
                pair.session = None;
                pair.modify_index = index;
            }
            if invalidated && !session.lock_delay.is_zero() {
                self.lock_delays
                    .insert(key.clone(), Instant::now() + session.lock_delay);
            }
            self.events.push(ClusterEvent::LockReleased {
                key,
                session: id.to_string(),
            });
        }
        self.events.push(if invalidated {
            ClusterEvent::SessionInvalidated {
                session: id.to_string(),
            }
        } else {
            ClusterEvent::SessionDestroyed {
                session: id.to_string(),
            }
        });
    }

    fn instances(&self, service: &str) -> Vec<ServiceInstance> {
        self.nodes
            .iter()
            .filter_map(|(name, node)| {
                let registered = node.services.get(service)?;
                let checks = node
                    .checks
                    .values()
                    .filter(|c| c.service_name.is_empty() || c.service_name == service)
                    .cloned()
                    .collect();
                Some(ServiceInstance {
                    node: NodeInfo {
                        node: name.clone(),
                        address: String::new(),
                    },
                    service: registered.clone(),
                    checks,
                })
            })
            .collect()
    }
}

struct Shared {
    state: Mutex<ClusterState>,
    index_tx: watch::Sender<u64>,
}

/// Shared state of a simulated cluster.
#[derive(Clone)]
pub struct MemoryCluster {
    shared: Arc<Shared>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        let (index_tx, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ClusterState::default()),
                index_tx,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        // A panic while holding the lock only happens in a failing test.
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply a mutation and wake blocked readers.
    fn mutate<T>(&self, f: impl FnOnce(&mut ClusterState) -> T) -> T {
        let (result, index) = {
            let mut state = self.lock();
            let result = f(&mut state);
            (result, state.index)
        };
        self.shared.index_tx.send_replace(index);
        result
    }

    /// Agent for `node`; the node joins the cluster with a passing
    /// `serfHealth` check.
    pub fn agent(&self, node: impl Into<String>) -> MemoryAgent {
        let node = node.into();
        self.mutate(|state| {
            state.node_mut(&node);
            state.bump();
        });
        MemoryAgent {
            cluster: self.clone(),
            node,
        }
    }

    /// Set a check's status, invalidating sessions bound to it when it turns
    /// critical.
    pub fn set_check_status(&self, node: &str, check_id: &str, status: CheckStatus) {
        self.mutate(|state| {
            let Some(check) = state.node_mut(node).checks.get_mut(check_id) else {
                return;
            };
            if check.status == status {
                return;
            }
            check.status = status;
            state.bump();
            state.events.push(ClusterEvent::CheckUpdated {
                node: node.to_string(),
                check_id: check_id.to_string(),
                status,
            });

            if status == CheckStatus::Critical {
                let doomed: Vec<String> = state
                    .sessions
                    .iter()
                    .filter(|(_, s)| s.node == node && s.checks.iter().any(|c| c == check_id))
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in doomed {
                    state.remove_session(&id, true);
                }
            }
        });
    }

    /// Set the check of `service` on `node`.
    pub fn set_service_health(&self, node: &str, service: &str, status: CheckStatus) {
        self.set_check_status(node, &service_check_id(service), status);
    }

    /// Make the next `n` backend calls (from any agent) fail.
    pub fn fail_next_requests(&self, n: usize) {
        self.lock().failures = n;
    }

    pub fn kv_value(&self, key: &str) -> Option<String> {
        self.lock()
            .kv
            .get(key)
            .map(|pair| String::from_utf8_lossy(&pair.value).into_owned())
    }

    /// Session currently holding `key`, if any.
    pub fn lock_holder(&self, key: &str) -> Option<String> {
        self.lock().kv.get(key).and_then(|pair| pair.session.clone())
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn events(&self) -> Vec<ClusterEvent> {
        self.lock().events.clone()
    }

    pub fn index(&self) -> u64 {
        self.lock().index
    }

    /// Delay every subsequent backend call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Apply injected latency, then an injected failure if one is pending.
    async fn fault(&self, operation: &str) -> Result<()> {
        let latency = self.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.lock();
        if state.failures > 0 {
            state.failures -= 1;
            return Err(Error::RequestFailed(format!("500 on {} (injected)", operation)));
        }
        Ok(())
    }

    /// Hold a blocking read until the cluster index moves past the cursor or
    /// the wait elapses.
    async fn block(&self, opts: QueryOptions) {
        let Some(index) = opts.index else {
            return;
        };
        let mut rx = self.shared.index_tx.subscribe();
        let wait = opts.wait.unwrap_or(DEFAULT_WAIT);
        let _ = tokio::time::timeout(wait, rx.wait_for(|current| *current > index)).await;
    }
}

/// One node's agent in a [`MemoryCluster`].
#[derive(Clone)]
pub struct MemoryAgent {
    cluster: MemoryCluster,
    node: String,
}

impl MemoryAgent {
    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn cluster(&self) -> &MemoryCluster {
        &self.cluster
    }
}

#[async_trait]
impl Backend for MemoryAgent {
    async fn node_name(&self) -> Result<String> {
        self.cluster.fault("/agent/self").await?;
        Ok(self.node.clone())
    }

    async fn kv_get(&self, key: &str, opts: QueryOptions) -> Result<Indexed<Option<KvPair>>> {
        self.cluster.fault(&format!("/kv/{}", key)).await?;
        self.cluster.block(opts).await;
        let state = self.cluster.lock();
        Ok(Indexed {
            value: state.kv.get(key).cloned(),
            index: state.index,
        })
    }

    async fn kv_put(&self, key: &str, value: &[u8]) -> Result<bool> {
        self.cluster.fault(&format!("/kv/{}", key)).await?;
        self.cluster.mutate(|state| {
            let index = state.bump();
            let pair = state.kv.entry(key.to_string()).or_insert_with(|| KvPair {
                key: key.to_string(),
                value: Vec::new(),
                session: None,
                modify_index: index,
                lock_index: 0,
            });
            pair.value = value.to_vec();
            pair.modify_index = index;
            state.events.push(ClusterEvent::KvWritten {
                key: key.to_string(),
                value: String::from_utf8_lossy(value).into_owned(),
            });
        });
        Ok(true)
    }

    async fn kv_acquire(&self, key: &str, session: &str, value: &[u8]) -> Result<bool> {
        self.cluster.fault(&format!("/kv/{}?acquire", key)).await?;
        self.cluster.mutate(|state| {
            if !state.sessions.contains_key(session) {
                return Err(Error::RequestFailed(format!(
                    "500 on /kv/{}?acquire: invalid session \"{}\"",
                    key, session
                )));
            }
            if let Some(pair) = state.kv.get(key) {
                match pair.session.as_deref() {
                    Some(holder) if holder == session => return Ok(true),
                    Some(_) => return Ok(false),
                    None => {}
                }
            }
            if let Some(until) = state.lock_delays.get(key) {
                if Instant::now() < *until {
                    return Ok(false);
                }
            }
            state.lock_delays.remove(key);

            let index = state.bump();
            let pair = state.kv.entry(key.to_string()).or_insert_with(|| KvPair {
                key: key.to_string(),
                value: Vec::new(),
                session: None,
                modify_index: index,
                lock_index: 0,
            });
            pair.value = value.to_vec();
            pair.session = Some(session.to_string());
            pair.lock_index += 1;
            pair.modify_index = index;
            state.events.push(ClusterEvent::LockAcquired {
                key: key.to_string(),
                session: session.to_string(),
                node: self.node.clone(),
            });
            Ok(true)
        })
    }

    async fn kv_release(&self, key: &str, session: &str) -> Result<bool> {
        self.cluster.fault(&format!("/kv/{}?release", key)).await?;
        Ok(self.cluster.mutate(|state| {
            let index = state.index + 1;
            let Some(pair) = state.kv.get_mut(key) else {
                return false;
            };
            if pair.session.as_deref() != Some(session) {
                return false;
            }
            pair.session = None;
            pair.modify_index = index;
            state.bump();
            state.events.push(ClusterEvent::LockReleased {
                key: key.to_string(),
                session: session.to_string(),
            });
            true
        }))
    }

    async fn session_create(&self, request: &SessionRequest) -> Result<String> {
        self.cluster.fault("/session/create").await?;
        self.cluster.mutate(|state| {
            let node = state.node_mut(&self.node);
            for check_id in &request.checks {
                match node.checks.get(check_id) {
                    None => {
                        return Err(Error::RequestFailed(format!(
                            "500 on /session/create: Missing check '{}' registration",
                            check_id
                        )))
                    }
                    Some(check) if check.status == CheckStatus::Critical => {
                        return Err(Error::RequestFailed(format!(
                            "500 on /session/create: Check '{}' is in {} state",
                            check_id, check.status
                        )))
                    }
                    Some(_) => {}
                }
            }

            let id = uuid::Uuid::new_v4().to_string();
            state.sessions.insert(
                id.clone(),
                Session {
                    node: self.node.clone(),
                    checks: request.checks.clone(),
                    lock_delay: request.lock_delay,
                },
            );
            state.bump();
            state.events.push(ClusterEvent::SessionCreated {
                session: id.clone(),
                node: self.node.clone(),
            });
            Ok(id)
        })
    }

    async fn session_destroy(&self, id: &str) -> Result<()> {
        self.cluster.fault("/session/destroy").await?;
        self.cluster.mutate(|state| state.remove_session(id, false));
        Ok(())
    }

    async fn health_service(
        &self,
        service: &str,
        filter: &HealthFilter,
        opts: QueryOptions,
    ) -> Result<Indexed<Vec<ServiceInstance>>> {
        self.cluster.fault(&format!("/health/service/{}", service)).await?;
        self.cluster.block(opts).await;
        let state = self.cluster.lock();
        let value = state
            .instances(service)
            .into_iter()
            .filter(|instance| filter.matches(instance))
            .collect();
        Ok(Indexed {
            value,
            index: state.index,
        })
    }

    async fn health_node(&self, node: &str, opts: QueryOptions) -> Result<Indexed<Vec<HealthCheck>>> {
        self.cluster.fault(&format!("/health/node/{}", node)).await?;
        self.cluster.block(opts).await;
        let state = self.cluster.lock();
        let value = state
            .nodes
            .get(node)
            .map(|n| n.checks.values().cloned().collect())
            .unwrap_or_default();
        Ok(Indexed {
            value,
            index: state.index,
        })
    }

    /// Registers the service with its check passing; the simulation has no
    /// check runner, tests drive statuses with `set_check_status`.
    async fn register_service(&self, registration: &ServiceRegistration) -> Result<()> {
        self.cluster.fault("/agent/service/register").await?;
        self.cluster.mutate(|state| {
            let node_name = self.node.clone();
            let node = state.node_mut(&node_name);
            node.services.insert(
                registration.name.clone(),
                AgentService {
                    id: registration.name.clone(),
                    service: registration.name.clone(),
                    tags: registration.tags.clone(),
                    port: registration.port.unwrap_or_default(),
                },
            );
            let check_id = service_check_id(&registration.name);
            node.checks
                .entry(check_id.clone())
                .or_insert_with(|| HealthCheck {
                    node: node_name.clone(),
                    check_id,
                    name: format!("Service '{}' check", registration.name),
                    status: CheckStatus::Passing,
                    service_name: registration.name.clone(),
                });
            state.bump();
            state.events.push(ClusterEvent::ServiceRegistered {
                node: node_name,
                service: registration.name.clone(),
                tags: registration.tags.clone(),
            });
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_request(checks: &[&str]) -> SessionRequest {
        SessionRequest {
            name: None,
            checks: checks.iter().map(|c| c.to_string()).collect(),
            lock_delay: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_acquire_is_exclusive() {
        let cluster = MemoryCluster::new();
        let a = cluster.agent("a");
        let b = cluster.agent("b");

        let sa = a.session_create(&session_request(&["serfHealth"])).await.unwrap();
        let sb = b.session_create(&session_request(&["serfHealth"])).await.unwrap();

        assert!(a.kv_acquire("web/shutdown", &sa, b"a").await.unwrap());
        assert!(a.kv_acquire("web/shutdown", &sa, b"a").await.unwrap());
        assert!(!b.kv_acquire("web/shutdown", &sb, b"b").await.unwrap());
        assert!(!b.kv_release("web/shutdown", &sb).await.unwrap());

        assert!(a.kv_release("web/shutdown", &sa).await.unwrap());
        assert!(b.kv_acquire("web/shutdown", &sb, b"b").await.unwrap());
        assert_eq!(cluster.lock_holder("web/shutdown"), Some(sb));
    }

    #[tokio::test]
    async fn test_session_requires_passing_checks() {
        let cluster = MemoryCluster::new();
        let a = cluster.agent("a");

        let missing = a.session_create(&session_request(&["service:web"])).await;
        assert!(matches!(missing, Err(Error::RequestFailed(_))));

        a.register_service(&ServiceRegistration::new("web")).await.unwrap();
        cluster.set_service_health("a", "web", CheckStatus::Critical);
        let critical = a.session_create(&session_request(&["service:web"])).await;
        assert!(matches!(critical, Err(Error::RequestFailed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidation_releases_lock_and_arms_lock_delay() {
        let cluster = MemoryCluster::new();
        let a = cluster.agent("a");
        let b = cluster.agent("b");
        a.register_service(&ServiceRegistration::new("web")).await.unwrap();

        let sa = a
            .session_create(&session_request(&["serfHealth", "service:web"]))
            .await
            .unwrap();
        assert!(a.kv_acquire("web/shutdown", &sa, b"").await.unwrap());

        cluster.set_service_health("a", "web", CheckStatus::Critical);
        assert_eq!(cluster.lock_holder("web/shutdown"), None);
        assert_eq!(cluster.session_count(), 0);

        let sb = b.session_create(&session_request(&["serfHealth"])).await.unwrap();
        assert!(!b.kv_acquire("web/shutdown", &sb, b"").await.unwrap());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(b.kv_acquire("web/shutdown", &sb, b"").await.unwrap());
    }

    #[tokio::test]
    async fn test_warning_check_keeps_session() {
        let cluster = MemoryCluster::new();
        let a = cluster.agent("a");
        a.register_service(&ServiceRegistration::new("web")).await.unwrap();

        let sa = a
            .session_create(&session_request(&["serfHealth", "service:web"]))
            .await
            .unwrap();
        assert!(a.kv_acquire("web/shutdown", &sa, b"").await.unwrap());

        cluster.set_service_health("a", "web", CheckStatus::Warning);
        assert_eq!(cluster.lock_holder("web/shutdown"), Some(sa.clone()));
        assert_eq!(cluster.session_count(), 1);

        // A warning check can still back a new session.
        a.session_create(&session_request(&["service:web"])).await.unwrap();

        cluster.set_service_health("a", "web", CheckStatus::Critical);
        assert_eq!(cluster.lock_holder("web/shutdown"), None);
        assert_eq!(cluster.session_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_injected_latency_delays_calls() {
        let cluster = MemoryCluster::new();
        let a = cluster.agent("a");
        cluster.set_latency(Duration::from_millis(300));

        let start = tokio::time::Instant::now();
        a.node_name().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_destroy_releases_without_lock_delay() {
        let cluster = MemoryCluster::new();
        let a = cluster.agent("a");
        let b = cluster.agent("b");

        let sa = a.session_create(&session_request(&["serfHealth"])).await.unwrap();
        assert!(a.kv_acquire("lock", &sa, b"").await.unwrap());
        a.session_destroy(&sa).await.unwrap();

        let sb = b.session_create(&session_request(&["serfHealth"])).await.unwrap();
        assert!(b.kv_acquire("lock", &sb, b"").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_read_waits_for_change() {
        let cluster = MemoryCluster::new();
        let a = cluster.agent("a");
        let b = cluster.agent("b");

        let first = a.kv_get("version", QueryOptions::default()).await.unwrap();
        assert!(first.value.is_none());

        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            b.kv_put("version", b"v2").await.unwrap();
        });

        let start = Instant::now();
        let next = a
            .kv_get("version", QueryOptions::blocking(first.index, Duration::from_secs(10)))
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(next.value.unwrap().value_str(), Some("v2"));
        assert!(next.index > first.index);
        writer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_read_returns_unchanged_after_wait() {
        let cluster = MemoryCluster::new();
        let a = cluster.agent("a");

        let first = a.kv_get("version", QueryOptions::default()).await.unwrap();
        let start = Instant::now();
        let next = a
            .kv_get("version", QueryOptions::blocking(first.index, Duration::from_secs(2)))
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert_eq!(next.index, first.index);
        assert!(next.value.is_none());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let cluster = MemoryCluster::new();
        let a = cluster.agent("a");
        cluster.fail_next_requests(1);
        assert!(matches!(a.node_name().await, Err(Error::RequestFailed(_))));
        assert_eq!(a.node_name().await.unwrap(), "a");
    }

    #[tokio::test]
    async fn test_health_filters() {
        let cluster = MemoryCluster::new();
        let a = cluster.agent("a");
        let b = cluster.agent("b");
        a.register_service(&ServiceRegistration::new("web").with_tag("v1"))
            .await
            .unwrap();
        b.register_service(&ServiceRegistration::new("web").with_tag("v2"))
            .await
            .unwrap();
        cluster.set_service_health("b", "web", CheckStatus::Critical);

        let all = a
            .health_service("web", &HealthFilter::default(), QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(all.value.len(), 2);

        let passing = a
            .health_service("web", &HealthFilter::passing(), QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(passing.value.len(), 1);
        assert_eq!(passing.value[0].node_name(), "a");

        let v2 = a
            .health_service("web", &HealthFilter::passing_with_tag("v2"), QueryOptions::default())
            .await
            .unwrap();
        assert!(v2.value.is_empty());

        let checks = a.health_node("b", QueryOptions::default()).await.unwrap();
        let web = checks
            .value
            .iter()
            .find(|c| c.check_id == "service:web")
            .unwrap();
        assert_eq!(web.status, CheckStatus::Critical);
    }
}
