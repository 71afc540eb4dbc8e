//! Records exchanged with the coordination backend.
//!
//! Field names follow the Consul v1 JSON encoding so that the HTTP backend can
//! deserialize responses directly.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Index cursor and wait attached to a read. A read without an index returns
/// immediately; with an index it blocks until the backend's index moves past
/// it or `wait` elapses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
    pub index: Option<u64>,
    pub wait: Option<Duration>,
}

impl QueryOptions {
    pub fn blocking(index: u64, wait: Duration) -> Self {
        Self {
            index: Some(index),
            wait: Some(wait),
        }
    }
}

/// A value read from the backend together with the index it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Indexed<T> {
    pub value: T,
    pub index: u64,
}

/// Aggregated check status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Passing,
    Warning,
    /// Also covers statuses this client does not know (e.g. maintenance).
    #[serde(other)]
    Critical,
}

impl CheckStatus {
    pub fn is_passing(&self) -> bool {
        matches!(self, CheckStatus::Passing)
    }
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckStatus::Passing => write!(f, "passing"),
            CheckStatus::Warning => write!(f, "warning"),
            CheckStatus::Critical => write!(f, "critical"),
        }
    }
}

/// One health check as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HealthCheck {
    #[serde(default)]
    pub node: String,
    #[serde(rename = "CheckID")]
    pub check_id: String,
    #[serde(default)]
    pub name: String,
    pub status: CheckStatus,
    #[serde(default)]
    pub service_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodeInfo {
    pub node: String,
    #[serde(default)]
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentService {
    #[serde(rename = "ID")]
    pub id: String,
    pub service: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub port: u16,
}

/// Read-only snapshot of one instance of a service on one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceInstance {
    pub node: NodeInfo,
    pub service: AgentService,
    #[serde(default)]
    pub checks: Vec<HealthCheck>,
}

impl ServiceInstance {
    pub fn node_name(&self) -> &str {
        &self.node.node
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.service.tags.iter().any(|t| t == tag)
    }

    /// True when every check on the instance passes.
    pub fn is_passing(&self) -> bool {
        self.checks.iter().all(|c| c.status.is_passing())
    }
}

/// Filter applied to a service health read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthFilter {
    /// Only instances whose checks all pass
    pub passing: bool,
    /// Only instances carrying this tag
    pub tag: Option<String>,
}

impl HealthFilter {
    pub fn passing() -> Self {
        Self {
            passing: true,
            tag: None,
        }
    }

    pub fn passing_with_tag(tag: impl Into<String>) -> Self {
        Self {
            passing: true,
            tag: Some(tag.into()),
        }
    }

    pub fn matches(&self, instance: &ServiceInstance) -> bool {
        if self.passing && !instance.is_passing() {
            return false;
        }
        match &self.tag {
            Some(tag) => instance.has_tag(tag),
            None => true,
        }
    }
}

/// A KV entry with its value already decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: Vec<u8>,
    /// Session currently holding the key as a lock, if any
    pub session: Option<String>,
    pub modify_index: u64,
    pub lock_index: u64,
}

impl KvPair {
    pub fn value_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }

    pub fn is_locked(&self) -> bool {
        self.session.is_some()
    }
}

/// Parameters of a new lock session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    pub name: Option<String>,
    /// Checks whose failure invalidates the session
    pub checks: Vec<String>,
    pub lock_delay: Duration,
}

/// Definition of the check registered alongside a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckDefinition {
    #[serde(rename = "HTTP", skip_serializing_if = "Option::is_none")]
    pub http: Option<String>,
    #[serde(rename = "TCP", skip_serializing_if = "Option::is_none")]
    pub tcp: Option<String>,
    #[serde(rename = "Interval")]
    pub interval: String,
}

impl CheckDefinition {
    pub fn http(url: impl Into<String>, interval: Duration) -> Self {
        Self {
            http: Some(url.into()),
            tcp: None,
            interval: crate::common::consul_duration(interval),
        }
    }

    pub fn tcp(addr: impl Into<String>, interval: Duration) -> Self {
        Self {
            http: None,
            tcp: Some(addr.into()),
            interval: crate::common::consul_duration(interval),
        }
    }
}

/// Registration of a service on the local agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceRegistration {
    pub name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check: Option<CheckDefinition>,
}

impl ServiceRegistration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tags: Vec::new(),
            port: None,
            check: None,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_check(mut self, check: CheckDefinition) -> Self {
        self.check = Some(check);
        self
    }
}
