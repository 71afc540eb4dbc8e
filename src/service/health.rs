//! Local health and version cells shared between the HTTP endpoints and the
//! roles that drain the service.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// Health signal reported by `/_status`. Flipping it makes the next check
/// fail while the server keeps serving.
#[derive(Debug, Clone)]
pub struct HealthFlag(Arc<AtomicBool>);

impl HealthFlag {
    pub fn new(healthy: bool) -> Self {
        Self(Arc::new(AtomicBool::new(healthy)))
    }

    pub fn is_healthy(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn mark_unhealthy(&self) {
        if self.0.swap(false, Ordering::SeqCst) {
            tracing::info!("Marked unhealthy");
        }
    }

    pub fn mark_healthy(&self) {
        if !self.0.swap(true, Ordering::SeqCst) {
            tracing::info!("Marked healthy");
        }
    }
}

impl Default for HealthFlag {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Version the local service reports on `/_version`.
#[derive(Debug, Clone, Default)]
pub struct VersionCell(Arc<RwLock<Option<String>>>);

impl VersionCell {
    pub fn new(version: Option<String>) -> Self {
        Self(Arc::new(RwLock::new(version)))
    }

    pub fn get(&self) -> Option<String> {
        self.0.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn set(&self, version: impl Into<String>) {
        *self.0.write().unwrap_or_else(|p| p.into_inner()) = Some(version.into());
    }
}
