//! Traffic-weighted version shifting.
//!
//! - `allocator`: decide which version the local node should run
//! - `local`: observe and switch the locally running service
//! - `updater`: the per-node loop applying allocation decisions under lock

pub mod allocator;
pub mod local;
pub mod updater;

pub use allocator::{allocate, Allocation, AllocationSpec};
pub use local::{LocalDeployment, VersionFileDeployment};
pub use updater::{ReconcileOutcome, TrafficShift, FLAG_DOWN, FLAG_UP, RESTART_LOCK};
