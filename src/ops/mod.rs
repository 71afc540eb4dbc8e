//! Ops commands for cluster management

pub mod plan;
pub mod publish;
pub mod status;

pub use plan::{plan_allocation, PlanReport};
pub use publish::{get_spec, get_version, set_spec, set_version};
pub use status::{cluster_status, NodeStatus, StatusReport};
