//! Coordination primitives built on the backend.
//!
//! - `watch`: index-cursor blocking queries
//! - `lock`: session-scoped distributed locks
//! - `health_gate`: block until a service has spare healthy instances
//! - `shutdown`: the coordinated shutdown protocol a node runs before exiting

pub mod health_gate;
pub mod lock;
pub mod shutdown;
pub mod watch;

pub use health_gate::wait_until_at_least;
pub use lock::{acquire, with_lock, LockHandle, LockOptions, Service};
pub use shutdown::{LocalService, ShutdownOptions, ShutdownState, SHUTDOWN_LOCK};
pub use watch::{BlockingQuery, WatchState};
