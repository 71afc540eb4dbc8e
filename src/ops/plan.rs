//! Allocation dry run

use crate::common::Result;
use crate::consul::Backend;
use crate::shift::{Allocation, LocalDeployment, TrafficShift};
use std::sync::Arc;

#[derive(Debug)]
pub struct PlanReport {
    pub allocation: Allocation,
    pub current_version: Option<String>,
}

impl PlanReport {
    /// Whether the updater on this node would switch versions.
    pub fn would_switch(&self) -> bool {
        self.current_version.as_deref() != Some(self.allocation.target.as_str())
    }
}

/// Compute what the updater on this node would decide, without taking the
/// lock or touching anything.
pub async fn plan_allocation(
    backend: Arc<dyn Backend>,
    deployment: Arc<dyn LocalDeployment>,
    service: &str,
    min_nodes: usize,
) -> Result<PlanReport> {
    tracing::info!(service = %service, "Starting allocation dry run");
    let shift = TrafficShift::new(service, backend, deployment.clone()).with_min_nodes(min_nodes);
    let allocation = shift.plan().await?;
    let current_version = deployment.current_version().await?;
    Ok(PlanReport {
        allocation,
        current_version,
    })
}
