//! The locally running service, as seen by the updater.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use crate::common::{Result, ShiftConfig};

/// What the updater needs to switch the local node to another version.
#[async_trait]
pub trait LocalDeployment: Send + Sync {
    /// Version the local service reports it runs, `None` when unreachable.
    async fn current_version(&self) -> Result<Option<String>>;

    /// Block until the local service stops accepting connections.
    async fn wait_stopped(&self) -> Result<()>;

    /// Record `version` as the one to run on next start.
    async fn switch_version(&self, version: &str) -> Result<()>;
}

/// Deployment driven by a version marker file, with the service's own
/// `/_version` endpoint as the source of truth for what is running.
pub struct VersionFileDeployment {
    service_addr: SocketAddr,
    version_file: PathBuf,
    client: reqwest::Client,
    probe_interval: Duration,
}

impl VersionFileDeployment {
    pub fn new(service_addr: SocketAddr, version_file: impl Into<PathBuf>) -> Self {
        Self {
            service_addr,
            version_file: version_file.into(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(2))
                .build()
                .unwrap_or_default(),
            probe_interval: Duration::from_millis(200),
        }
    }

    pub fn from_config(config: &ShiftConfig) -> Self {
        Self::new(config.service_addr, config.version_file.clone())
    }

    /// Version recorded in the marker file, if any.
    pub async fn recorded_version(&self) -> Result<Option<String>> {
        match tokio::fs::read_to_string(&self.version_file).await {
            Ok(raw) => {
                let version = raw.trim();
                Ok((!version.is_empty()).then(|| version.to_string()))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl LocalDeployment for VersionFileDeployment {
    async fn current_version(&self) -> Result<Option<String>> {
        let url = format!("http://{}/_version", self.service_addr);
        let response = match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                tracing::debug!(url = %url, status = %response.status(), "Local service did not report a version");
                return Ok(None);
            }
            Err(e) => {
                tracing::debug!(url = %url, "Local service unreachable: {}", e);
                return Ok(None);
            }
        };
        match response.text().await {
            Ok(body) => Ok(Some(body.trim().to_string())),
            Err(e) => {
                tracing::debug!(url = %url, "Failed to read version: {}", e);
                Ok(None)
            }
        }
    }

    async fn wait_stopped(&self) -> Result<()> {
        // Observed on the port itself: health checks may not have caught up.
        loop {
            match TcpStream::connect(self.service_addr).await {
                Ok(mut stream) => {
                    let mut buf = [0u8; 512];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) => break,
                            Ok(_) => continue,
                            Err(e) if matches!(e.kind(), ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted) => break,
                            Err(e) => return Err(e.into()),
                        }
                    }
                    tokio::time::sleep(self.probe_interval).await;
                }
                Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
                    tracing::info!(addr = %self.service_addr, "Local service stopped");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn switch_version(&self, version: &str) -> Result<()> {
        tokio::fs::write(&self.version_file, version).await?;
        tracing::info!(version = %version, file = %self.version_file.display(), "Switched local version");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    async fn closed_port() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    #[tokio::test]
    async fn test_switch_version_writes_marker() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("VERSION");
        let deployment = VersionFileDeployment::new(closed_port().await, &file);

        assert_eq!(deployment.recorded_version().await.unwrap(), None);
        deployment.switch_version("v2").await.unwrap();
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "v2");
        assert_eq!(deployment.recorded_version().await.unwrap(), Some("v2".to_string()));
    }

    #[tokio::test]
    async fn test_unreachable_service_has_no_version() {
        let dir = TempDir::new().unwrap();
        let deployment = VersionFileDeployment::new(closed_port().await, dir.path().join("VERSION"));
        assert_eq!(deployment.current_version().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_wait_stopped_returns_once_port_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dir = TempDir::new().unwrap();
        let deployment = VersionFileDeployment::new(addr, dir.path().join("VERSION"));

        let server = tokio::spawn(async move {
            // Serve one connection, then stop listening.
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(stream);
            drop(listener);
        });

        tokio::time::timeout(Duration::from_secs(5), deployment.wait_stopped())
            .await
            .unwrap()
            .unwrap();
        server.await.unwrap();
    }
}
