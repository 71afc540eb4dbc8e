//! Common utilities and types shared across consul-coord

pub mod config;
pub mod error;
pub mod keys;
pub mod utils;

pub use config::{Config, ConsulConfig, LockConfig, ShiftConfig, ShutdownConfig};
pub use error::{Error, Result};
pub use utils::{consul_duration, encode_key, retry_with_backoff, Backoff};
