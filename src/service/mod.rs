//! A service instance managed by this process: its HTTP health endpoints,
//! its registration, and the ways it is drained before stopping.

pub mod health;
pub mod http;
pub mod runner;

pub use health::{HealthFlag, VersionCell};
pub use http::{create_router, ServiceState};
pub use runner::{wait_for_file_change, wait_for_restart_flag, ManagedService, CHECK_INTERVAL};
