//! Which nodes may restart next during a rolling upgrade.

use std::collections::BTreeSet;

use crate::consul::ServiceInstance;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestartPlan {
    /// Nodes not tagged with the target version, not yet restarting
    pub incorrect: Vec<String>,
    /// Passing nodes, not yet restarting
    pub healthy: Vec<String>,
    /// Nodes whose restart flag is already down
    pub restarting: Vec<String>,
    /// Nodes to flag down now
    pub to_restart: Vec<String>,
}

/// Flag as many nodes on the wrong version as can leave while keeping
/// `min_nodes` healthy ones.
///
/// Nodes already restarting count neither as healthy nor as candidates: if
/// they still pass their checks they may stop doing so at any moment.
pub fn plan_restarts(
    version: &str,
    instances: &[ServiceInstance],
    restarting: &BTreeSet<String>,
    min_nodes: usize,
) -> RestartPlan {
    let is_restarting = |i: &&ServiceInstance| restarting.contains(i.node_name());

    let incorrect: Vec<String> = instances
        .iter()
        .filter(|i| !i.has_tag(version))
        .filter(|i| !is_restarting(i))
        .map(|i| i.node_name().to_string())
        .collect();
    let healthy: Vec<String> = instances
        .iter()
        .filter(|i| i.is_passing())
        .filter(|i| !is_restarting(i))
        .map(|i| i.node_name().to_string())
        .collect();

    let budget = healthy.len().saturating_sub(min_nodes);
    let to_restart = incorrect.iter().take(budget).cloned().collect();

    RestartPlan {
        incorrect,
        healthy,
        restarting: instances
            .iter()
            .filter(is_restarting)
            .map(|i| i.node_name().to_string())
            .collect(),
        to_restart,
    }
}
