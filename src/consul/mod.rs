//! Client-side view of the coordination backend.
//!
//! Everything the coordination primitives need from Consul goes through the
//! [`Backend`] trait:
//!
//! - `ConsulHttp`: the Consul v1 HTTP API on a local agent
//! - `MemoryCluster`: an in-process multi-node simulation with the same
//!   session, lock and blocking-read semantics

use async_trait::async_trait;

use crate::common::Result;

pub mod http;
pub mod memory;
pub mod types;

pub use http::ConsulHttp;
pub use memory::{ClusterEvent, MemoryAgent, MemoryCluster};
pub use types::{
    AgentService, CheckDefinition, CheckStatus, HealthCheck, HealthFilter, Indexed, KvPair,
    NodeInfo, QueryOptions, ServiceInstance, ServiceRegistration, SessionRequest,
};

/// Operations consumed from the coordination backend.
///
/// Every method fails with `Error::RequestFailed` on a transport failure or a
/// non-success status. A missing KV key is not a failure: it reads as `None`.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Name of the node the local agent runs on.
    async fn node_name(&self) -> Result<String>;

    /// Point or blocking read of a KV entry.
    async fn kv_get(&self, key: &str, opts: QueryOptions) -> Result<Indexed<Option<KvPair>>>;

    /// Unconditional write.
    async fn kv_put(&self, key: &str, value: &[u8]) -> Result<bool>;

    /// Take the key as a lock for `session`. Returns whether it was acquired.
    async fn kv_acquire(&self, key: &str, session: &str, value: &[u8]) -> Result<bool>;

    /// Give the key up if `session` holds it. Returns whether it was released.
    async fn kv_release(&self, key: &str, session: &str) -> Result<bool>;

    async fn session_create(&self, request: &SessionRequest) -> Result<String>;

    async fn session_destroy(&self, id: &str) -> Result<()>;

    /// Instances of `service` matching `filter`.
    async fn health_service(
        &self,
        service: &str,
        filter: &HealthFilter,
        opts: QueryOptions,
    ) -> Result<Indexed<Vec<ServiceInstance>>>;

    /// Every check registered on `node`.
    async fn health_node(&self, node: &str, opts: QueryOptions) -> Result<Indexed<Vec<HealthCheck>>>;

    /// Register a service (and its check) with the local agent.
    async fn register_service(&self, registration: &ServiceRegistration) -> Result<()>;
}
