//! # consul-coord
//!
//! Coordinated restarts, rolling upgrades and traffic-weighted version
//! shifts for a fleet of nodes registered with Consul:
//! - Blocking queries driven by the backend's change index
//! - Session-scoped distributed locks bound to health checks
//! - A minimum-healthy-node gate
//! - Coordinated shutdown that never drops the cluster below its minimum
//! - Proportional version allocation with a per-version floor
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//!            ┌───────────────────────────────┐
//!            │          Consul agent         │
//!            │ KV · sessions · health checks │
//!            └───────────────┬───────────────┘
//!                            │ Backend (HTTP, blocking reads)
//!      ┌─────────────────────┼─────────────────────┐
//!      │                     │                     │
//! ┌────▼─────────┐   ┌───────▼────────┐   ┌────────▼───────┐
//! │ service      │   │ shift updater  │   │ rollout        │
//! │ coordinated  │   │ allocation     │   │ coordinator +  │
//! │ shutdown     │   │ under lock     │   │ restarters     │
//! └──────────────┘   └────────────────┘   └────────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Run a node role
//! ```bash
//! # HTTP service that drains itself in coordination with its peers
//! consul-coord-node serve --service web --bind 127.0.0.1:8000 --version-file ./VERSION
//!
//! # Traffic shifting: the service and its updater
//! consul-coord-node shift-server --service testdrive
//! consul-coord-node shift-updater --service testdrive
//! ```
//!
//! ### Use the CLI
//! ```bash
//! consul-coord spec set testdrive v1=0.9 v2=0.1
//! consul-coord version set v2
//! consul-coord status --service testdrive
//! consul-coord plan --service testdrive
//! ```

pub mod common;
pub mod consul;
pub mod coordination;
pub mod ops;
pub mod rollout;
pub mod service;
pub mod shift;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use consul::{Backend, ConsulHttp, MemoryCluster};
pub use coordination::{LocalService, Service};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
