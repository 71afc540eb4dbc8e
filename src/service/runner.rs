//! Lifecycle of a managed service: registration, serving, and the triggers
//! that drain it.

use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use super::http::{create_router, ServiceState};
use crate::common::keys::restart_flag_key;
use crate::common::Result;
use crate::consul::{Backend, CheckDefinition, ServiceRegistration};
use crate::coordination::{watch, LocalService, ShutdownOptions};
use crate::shift::FLAG_DOWN;

/// Interval of the HTTP check registered for a managed service.
pub const CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// A service served by this process and registered with the local agent.
#[derive(Clone)]
pub struct ManagedService {
    name: String,
    addr: SocketAddr,
    state: ServiceState,
    backend: Arc<dyn Backend>,
}

impl ManagedService {
    pub fn new(name: impl Into<String>, addr: SocketAddr, state: ServiceState, backend: Arc<dyn Backend>) -> Self {
        Self {
            name: name.into(),
            addr,
            state,
            backend,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> &ServiceState {
        &self.state
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Registration tagged with the running version and checked through
    /// `/_status`.
    pub fn registration(&self) -> ServiceRegistration {
        let check = CheckDefinition::http(format!("http://{}/_status", self.addr), CHECK_INTERVAL);
        let mut registration = ServiceRegistration::new(self.name.clone())
            .with_port(self.addr.port())
            .with_check(check);
        if let Some(version) = self.state.version.get() {
            registration = registration.with_tag(version);
        }
        registration
    }

    pub async fn register(&self) -> Result<()> {
        let registration = self.registration();
        self.backend.register_service(&registration).await?;
        tracing::info!(service = %self.name, tags = ?registration.tags, "Registered service");
        Ok(())
    }

    /// Serve until `shutdown` completes, then finish in-flight requests.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::info!(service = %self.name, addr = %listener.local_addr()?, "Starting service");
        axum::serve(listener, create_router(self.state.clone()))
            .with_graceful_shutdown(shutdown)
            .await?;
        tracing::info!(service = %self.name, "Server is stopped");
        Ok(())
    }

    /// Run the coordinated shutdown protocol, flipping this service's health
    /// flag once the cluster can spare it.
    pub async fn coordinated_drain(&self, local: &LocalService, options: ShutdownOptions) -> Result<()> {
        let health = self.state.health.clone();
        local
            .coordinated_shutdown(options, move || {
                health.mark_unhealthy();
                Ok(())
            })
            .await
    }

    /// Drain without the shutdown lock: the caller already holds the right to
    /// stop (e.g. its restart flag was set by whoever holds the lock).
    pub async fn simple_drain(&self, grace: Duration) -> Result<()> {
        self.state.health.mark_unhealthy();
        LocalService::new(self.name.clone(), self.backend.clone())
            .wait_until_unhealthy()
            .await?;
        tokio::time::sleep(grace).await;
        Ok(())
    }
}

/// Block until this node's restart flag reads `down`.
pub async fn wait_for_restart_flag(backend: &dyn Backend, wait: Duration) -> Result<()> {
    let node = backend.node_name().await?;
    let key = restart_flag_key(&node);
    watch::kv(backend, &key, wait)
        .watch_while(|pair| pair.as_ref().and_then(|p| p.value_str()) != Some(FLAG_DOWN))
        .await?;
    tracing::info!(node = %node, "Restart flag is down");
    Ok(())
}

/// Poll `path` until its contents differ from `initial`.
pub async fn wait_for_file_change(path: impl AsRef<Path>, initial: Option<String>, interval: Duration) -> Result<()> {
    let path: PathBuf = path.as_ref().to_path_buf();
    loop {
        let current = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Some(contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        if current != initial {
            tracing::info!(file = %path.display(), "Version marker changed");
            return Ok(());
        }
        tokio::time::sleep(interval).await;
    }
}
