//! Traffic-shift updater.
//!
//! One updater runs next to every service instance. Whenever the allocation
//! spec changes, each updater in turn (serialized by the `restart` lock of the
//! `<service>-updater` service) recomputes the allocation and, if its own node
//! runs the wrong version, drains the local service, switches the version and
//! lets it come back.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use super::allocator::{allocate, Allocation, AllocationSpec};
use super::local::LocalDeployment;
use crate::common::keys::{restart_flag_key, spec_key, updater_service};
use crate::common::{Backoff, Error, Result, ShiftConfig};
use crate::consul::{Backend, CheckDefinition, HealthFilter, QueryOptions, ServiceRegistration};
use crate::coordination::{watch, LockOptions, Service};

/// Lock serializing allocation decisions.
pub const RESTART_LOCK: &str = "restart";

pub const FLAG_DOWN: &str = "down";
pub const FLAG_UP: &str = "up";

/// What one reconcile cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The local node already runs the target version
    Unchanged { version: String },
    /// The local node was switched
    Switched { from: Option<String>, to: String },
}

pub struct TrafficShift {
    service: String,
    min_nodes: usize,
    backend: Arc<dyn Backend>,
    deployment: Arc<dyn LocalDeployment>,
    lock_options: LockOptions,
}

impl TrafficShift {
    pub fn new(service: impl Into<String>, backend: Arc<dyn Backend>, deployment: Arc<dyn LocalDeployment>) -> Self {
        Self {
            service: service.into(),
            min_nodes: 1,
            backend,
            deployment,
            lock_options: LockOptions::default(),
        }
    }

    pub fn from_config(
        config: &ShiftConfig,
        lock_options: LockOptions,
        backend: Arc<dyn Backend>,
        deployment: Arc<dyn LocalDeployment>,
    ) -> Self {
        Self::new(config.service.clone(), backend, deployment)
            .with_min_nodes(config.min_nodes)
            .with_lock_options(lock_options)
    }

    pub fn with_min_nodes(mut self, min_nodes: usize) -> Self {
        self.min_nodes = min_nodes;
        self
    }

    pub fn with_lock_options(mut self, options: LockOptions) -> Self {
        self.lock_options = options;
        self
    }

    fn coordinator(&self) -> Service {
        Service::new(updater_service(&self.service), self.backend.clone()).with_options(self.lock_options)
    }

    /// Register the `<service>-updater` service with a TCP check against a
    /// listener owned by this process, so the updater's locks die with it.
    ///
    /// The returned task keeps the listener open; abort it to fail the check.
    pub async fn register(&self) -> Result<JoinHandle<()>> {
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
        let addr = listener.local_addr()?;

        let registration = ServiceRegistration::new(updater_service(&self.service))
            .with_check(CheckDefinition::tcp(addr.to_string(), Duration::from_secs(1)));
        self.backend.register_service(&registration).await?;
        tracing::info!(service = %registration.name, check = %addr, "Registered updater");

        Ok(tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        }))
    }

    /// Current allocation spec, if one has been published.
    pub async fn spec(&self) -> Result<Option<AllocationSpec>> {
        let pair = self.backend.kv_get(&spec_key(&self.service), QueryOptions::default()).await?;
        pair.value
            .map(|p| AllocationSpec::from_json(&p.value))
            .transpose()
    }

    /// Compute the allocation from this node's point of view without acting.
    pub async fn plan(&self) -> Result<Allocation> {
        let spec = self
            .spec()
            .await?
            .ok_or_else(|| Error::InvalidSpec(format!("no spec at {}", spec_key(&self.service))))?;
        let me = self.backend.node_name().await?;

        let mut actual = BTreeMap::new();
        for version in spec.versions() {
            let instances = self
                .backend
                .health_service(&self.service, &HealthFilter::passing_with_tag(version), QueryOptions::default())
                .await?;
            let others = instances.value.iter().filter(|i| i.node_name() != me).count();
            actual.insert(version.to_string(), others);
        }

        let allocation = allocate(&spec, &actual, self.min_nodes)?;
        tracing::debug!(actual = ?allocation.actual, desired = ?allocation.desired, target = %allocation.target, "Computed allocation");
        if !allocation.feasible {
            tracing::warn!(
                service = %self.service,
                min_nodes = self.min_nodes,
                versions = spec.len(),
                "Not enough nodes to keep the floor of every version"
            );
        }
        Ok(allocation)
    }

    /// Run one allocation cycle under the `restart` lock.
    pub async fn reconcile(&self) -> Result<ReconcileOutcome> {
        tracing::info!(service = %self.service, "Acquiring lock to reconcile version");
        self.coordinator()
            .lock(RESTART_LOCK, move || async move {
                let allocation = self.plan().await?;
                let current = self.deployment.current_version().await?;

                if current.as_deref() == Some(allocation.target.as_str()) {
                    tracing::info!(version = %allocation.target, "Already on target version, skipping restart");
                    return Ok(ReconcileOutcome::Unchanged {
                        version: allocation.target,
                    });
                }

                self.restart_into(current, allocation.target).await
            })
            .await
    }

    async fn restart_into(&self, from: Option<String>, to: String) -> Result<ReconcileOutcome> {
        let me = self.backend.node_name().await?;
        let flag = restart_flag_key(&me);

        tracing::info!(from = ?from, to = %to, "Shutting down local service");
        self.backend.kv_put(&flag, FLAG_DOWN.as_bytes()).await?;
        self.deployment.wait_stopped().await?;

        self.deployment.switch_version(&to).await?;
        // Cleared whatever the service's health: the flag only commands the stop.
        self.backend.kv_put(&flag, FLAG_UP.as_bytes()).await?;

        Ok(ReconcileOutcome::Switched { from, to })
    }

    /// Reconcile once per change of the spec, forever.
    ///
    /// Failed cycles are logged and retried after a backoff; a spec that is
    /// missing or unchanged keeps the loop waiting.
    pub async fn run(&self) -> Result<()> {
        let key = spec_key(&self.service);
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let mut current: Option<Vec<u8>> = None;

        loop {
            let observed = {
                let mut query = watch::kv(self.backend.as_ref(), &key, self.lock_options.wait);
                query
                    .watch_while(|pair| pair.as_ref().map(|p| &p.value) == current.as_ref())
                    .await
            };
            let observed = match observed {
                Ok(pair) => pair.map(|p| p.value),
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(key = %key, "Watching spec failed, retrying in {:?}: {}", delay, e);
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };
            if observed.is_none() {
                // Deleted: wait for it to come back.
                current = None;
                continue;
            }

            tracing::info!(service = %self.service, "Detected spec change");
            match self.reconcile().await {
                Ok(outcome) => {
                    tracing::info!(outcome = ?outcome, "Reconciled");
                    backoff.reset();
                    current = observed;
                }
                Err(e) if e.is_retryable() => {
                    let delay = backoff.next_delay();
                    tracing::warn!("Reconcile failed, retrying in {:?}: {}", delay, e);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    // Bad spec: wait for the next edit instead of looping on it.
                    tracing::error!("Reconcile failed: {}", e);
                    current = observed;
                }
            }
        }
    }
}
