//! Node binary: runs one coordination role on this node

use clap::{Parser, Subcommand};
use consul_coord::coordination::{LockOptions, ShutdownOptions};
use consul_coord::rollout::{Restarter, RolloutCoordinator};
use consul_coord::service::{wait_for_file_change, wait_for_restart_flag, ManagedService, ServiceState};
use consul_coord::shift::{TrafficShift, VersionFileDeployment};
use consul_coord::{Backend, Config, ConsulHttp, LocalService};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "consul-coord-node")]
#[command(about = "Run a coordination role on this node")]
#[command(version)]
struct Cli {
    /// Consul agent URL (overrides config)
    #[arg(long)]
    consul: Option<String>,

    /// Config file
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// HTTP service that shuts down in coordination with its peers when its
    /// version marker changes or on Ctrl-C
    Serve {
        #[arg(long, default_value = "http")]
        service: String,

        #[arg(long, default_value = "127.0.0.1:8000")]
        bind: SocketAddr,

        /// Version marker to monitor
        #[arg(long, default_value = "VERSION")]
        version_file: PathBuf,

        /// Passing instances to keep (defaults to config)
        #[arg(long)]
        min_nodes: Option<usize>,
    },

    /// Traffic-shift service: runs the recorded version, stops when its
    /// restart flag goes down
    ShiftServer {
        #[arg(long)]
        service: Option<String>,

        #[arg(long)]
        bind: Option<SocketAddr>,
    },

    /// Traffic-shift updater: applies allocation spec changes to this node
    ShiftUpdater {
        #[arg(long)]
        service: Option<String>,

        #[arg(long)]
        min_nodes: Option<usize>,
    },

    /// Rolling-upgrade coordinator
    Orchestrate {
        #[arg(long, default_value = "http")]
        service: String,

        #[arg(long, default_value = "1")]
        min_nodes: usize,
    },

    /// Service that restarts onto the target version when flagged
    Restarter {
        #[arg(long, default_value = "http")]
        service: String,

        #[arg(long, default_value = "127.0.0.1:8888")]
        bind: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config from file, then override with CLI arguments
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(addr) = cli.consul {
        config.consul.addr = addr;
        config.validate()?;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let backend: Arc<dyn Backend> = Arc::new(ConsulHttp::new(&config.consul)?);
    let lock_options = LockOptions::from_config(&config.lock, &config.consul);

    match cli.command {
        Commands::Serve {
            service,
            bind,
            version_file,
            min_nodes,
        } => {
            let mut shutdown = ShutdownOptions::from(&config.shutdown);
            if let Some(min_nodes) = min_nodes {
                shutdown.min_nodes = min_nodes;
            }
            serve(backend, lock_options, shutdown, service, bind, version_file).await?;
        }

        Commands::ShiftServer { service, bind } => {
            let service = service.unwrap_or_else(|| config.shift.service.clone());
            let bind = bind.unwrap_or(config.shift.service_addr);
            shift_server(backend, &config, service, bind).await?;
        }

        Commands::ShiftUpdater { service, min_nodes } => {
            let mut shift = config.shift.clone();
            if let Some(service) = service {
                shift.service = service;
            }
            if let Some(min_nodes) = min_nodes {
                shift.min_nodes = min_nodes;
            }
            let deployment = Arc::new(VersionFileDeployment::from_config(&shift));
            let updater = TrafficShift::from_config(&shift, lock_options, backend, deployment);

            let _check = updater.register().await?;
            tracing::info!("Starting updater for {}", shift.service);
            tokio::select! {
                res = updater.run() => res?,
                _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted, exiting"),
            }
        }

        Commands::Orchestrate { service, min_nodes } => {
            let coordinator = RolloutCoordinator::new(service.clone(), backend)
                .with_min_nodes(min_nodes)
                .with_wait(config.consul.wait());
            tracing::info!("Starting rollout coordinator for {}", service);
            tokio::select! {
                res = coordinator.run() => res?,
                _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted, exiting"),
            }
        }

        Commands::Restarter { service, bind } => {
            let managed = ManagedService::new(service, bind, ServiceState::default(), backend);
            let restarter = Restarter::new(managed.clone()).with_wait(config.consul.wait());
            restarter.start_with_latest_version().await?;

            let listener = tokio::net::TcpListener::bind(bind).await?;
            let server = managed.serve(listener, async {
                let _ = tokio::signal::ctrl_c().await;
            });
            tokio::select! {
                res = server => res?,
                res = restarter.run() => res?,
            }
        }
    }

    Ok(())
}

/// Serve until the version marker changes or Ctrl-C, then shut down in
/// coordination with the rest of the service.
async fn serve(
    backend: Arc<dyn Backend>,
    lock_options: LockOptions,
    shutdown: ShutdownOptions,
    service: String,
    bind: SocketAddr,
    version_file: PathBuf,
) -> anyhow::Result<()> {
    let initial = tokio::fs::read_to_string(&version_file).await.ok();
    let managed = ManagedService::new(
        service.clone(),
        bind,
        ServiceState::new(initial.as_ref().map(|v| v.trim().to_string())),
        backend.clone(),
    );
    managed.register().await?;
    tracing::info!("Monitoring {} for changes", version_file.display());

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let listener = tokio::net::TcpListener::bind(bind).await?;
    let server = tokio::spawn({
        let managed = managed.clone();
        async move {
            managed
                .serve(listener, async {
                    let _ = stop_rx.await;
                })
                .await
        }
    });

    tokio::select! {
        res = wait_for_file_change(&version_file, initial, Duration::from_secs(1)) => res?,
        _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted"),
    }

    let local = LocalService::new(service, backend).with_lock_options(lock_options);
    tracing::info!("Obtaining shutdown lock");
    managed.coordinated_drain(&local, shutdown).await?;
    tracing::info!("Unhealthy and grace period elapsed, gracefully terminating");

    let _ = stop_tx.send(());
    server.await??;
    Ok(())
}

/// Traffic-shift service: registered under its recorded version, drained
/// without the shutdown lock when the updater flags this node down.
async fn shift_server(backend: Arc<dyn Backend>, config: &Config, service: String, bind: SocketAddr) -> anyhow::Result<()> {
    let deployment = VersionFileDeployment::from_config(&config.shift);
    let Some(version) = deployment.recorded_version().await? else {
        tracing::warn!("No version recorded in {}, exiting", config.shift.version_file.display());
        tokio::time::sleep(Duration::from_secs(1)).await;
        return Ok(());
    };
    tracing::info!("VERSION {}", version);

    let managed = ManagedService::new(service, bind, ServiceState::new(Some(version)), backend.clone());
    managed.register().await?;

    // Still flagged from a switch in progress: let the updater finish first.
    let node = backend.node_name().await?;
    let flag = backend
        .kv_get(&consul_coord::common::keys::restart_flag_key(&node), Default::default())
        .await?;
    if flag.value.as_ref().and_then(|p| p.value_str()) == Some(consul_coord::shift::FLAG_DOWN) {
        tracing::info!("Restart flag is down, sleeping for 1s before exit");
        tokio::time::sleep(Duration::from_secs(1)).await;
        return Ok(());
    }

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let listener = tokio::net::TcpListener::bind(bind).await?;
    let server = tokio::spawn({
        let managed = managed.clone();
        async move {
            managed
                .serve(listener, async {
                    let _ = stop_rx.await;
                })
                .await
        }
    });

    tokio::select! {
        res = wait_for_restart_flag(backend.as_ref(), config.consul.wait()) => res?,
        _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted"),
    }

    tracing::info!("Commencing shutdown");
    managed.simple_drain(Duration::from_secs(1)).await?;

    let _ = stop_tx.send(());
    server.await??;
    tracing::info!("Server is stopped, exiting");
    Ok(())
}
