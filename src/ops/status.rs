//! Cluster status report

use std::collections::BTreeMap;

use crate::common::keys::{lock_key, restart_flag_key, updater_service};
use crate::common::Result;
use crate::consul::{Backend, HealthFilter, QueryOptions};
use crate::coordination::SHUTDOWN_LOCK;
use crate::shift::RESTART_LOCK;

use super::publish::{get_spec, get_version};

#[derive(Debug)]
pub struct StatusReport {
    pub service: String,
    pub target_version: Option<String>,
    /// Traffic ratio per version from the published spec
    pub spec: Vec<(String, f64)>,
    pub nodes: Vec<NodeStatus>,
    /// Passing instances per version tag
    pub passing_by_version: BTreeMap<String, usize>,
    /// Lock key to holding session, for the service's locks
    pub locks: BTreeMap<String, Option<String>>,
}

#[derive(Debug)]
pub struct NodeStatus {
    pub node: String,
    pub tags: Vec<String>,
    pub passing: bool,
    pub restart_flag: Option<String>,
}

pub async fn cluster_status(backend: &dyn Backend, service: &str) -> Result<StatusReport> {
    tracing::info!(service = %service, "Collecting cluster status");

    let instances = backend
        .health_service(service, &HealthFilter::default(), QueryOptions::default())
        .await?
        .value;

    let mut nodes = Vec::with_capacity(instances.len());
    let mut passing_by_version = BTreeMap::new();
    for instance in &instances {
        let flag = backend
            .kv_get(&restart_flag_key(instance.node_name()), QueryOptions::default())
            .await?
            .value
            .and_then(|p| p.value_str().map(str::to_string));
        let passing = instance.is_passing();
        if passing {
            for tag in &instance.service.tags {
                *passing_by_version.entry(tag.clone()).or_insert(0) += 1;
            }
        }
        nodes.push(NodeStatus {
            node: instance.node_name().to_string(),
            tags: instance.service.tags.clone(),
            passing,
            restart_flag: flag,
        });
    }

    let mut locks = BTreeMap::new();
    for key in [lock_key(service, SHUTDOWN_LOCK), lock_key(&updater_service(service), RESTART_LOCK)] {
        let holder = backend
            .kv_get(&key, QueryOptions::default())
            .await?
            .value
            .and_then(|p| p.session);
        locks.insert(key, holder);
    }

    Ok(StatusReport {
        service: service.to_string(),
        target_version: get_version(backend).await?,
        spec: get_spec(backend, service)
            .await?
            .map(|s| s.entries().to_vec())
            .unwrap_or_default(),
        nodes,
        passing_by_version,
        locks,
    })
}
