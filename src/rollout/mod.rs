//! Orchestrated rolling upgrades: one coordinator flags nodes, each node's
//! restarter drains itself and comes back on the target version.

pub mod coordinator;
pub mod planner;
pub mod restarter;

pub use coordinator::RolloutCoordinator;
pub use planner::{plan_restarts, RestartPlan};
pub use restarter::Restarter;
