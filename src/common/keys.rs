//! KV key layout shared by every role.

/// Lock key for `lock` scoped under `service`, e.g. `web/shutdown`.
pub fn lock_key(service: &str, lock: &str) -> String {
    format!("{}/{}", service, lock)
}

/// Allocation spec (version → traffic ratio) of a service.
pub fn spec_key(service: &str) -> String {
    format!("{}/spec", service)
}

/// Cluster-wide target version for orchestrated rollouts.
pub const VERSION_KEY: &str = "version";

/// Per-node restart flag (`up` / `down`).
pub fn restart_flag_key(node: &str) -> String {
    format!("nodes/{}/status", node)
}

/// Check id Consul assigns to a service's registered check.
pub fn service_check_id(service: &str) -> String {
    format!("service:{}", service)
}

/// Agent liveness check every node carries.
pub const SERF_HEALTH_CHECK: &str = "serfHealth";

/// Name of the coordinator-role service that guards allocation of `service`.
pub fn updater_service(service: &str) -> String {
    format!("{}-updater", service)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(lock_key("web", "shutdown"), "web/shutdown");
        assert_eq!(spec_key("testdrive"), "testdrive/spec");
        assert_eq!(restart_flag_key("node-1"), "nodes/node-1/status");
        assert_eq!(service_check_id("web"), "service:web");
        assert_eq!(updater_service("testdrive"), "testdrive-updater");
    }
}
