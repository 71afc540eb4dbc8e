//! CLI for cluster operations

use clap::{Parser, Subcommand};
use consul_coord::ops::{cluster_status, get_spec, get_version, plan_allocation, set_spec, set_version};
use consul_coord::shift::{AllocationSpec, VersionFileDeployment};
use consul_coord::{Config, ConsulHttp};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "consul-coord")]
#[command(about = "Cluster coordination through Consul")]
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
    /// Traffic allocation spec of a service
    Spec {
        #[command(subcommand)]
        action: SpecAction,
    },

    /// Target version of an orchestrated rollout
    Version {
        #[command(subcommand)]
        action: VersionAction,
    },

    /// Show versions, health, restart flags and lock holders
    Status {
        /// Service name (defaults to config)
        #[arg(long)]
        service: Option<String>,
    },

    /// Show what the updater on this node would decide
    Plan {
        /// Service name (defaults to config)
        #[arg(long)]
        service: Option<String>,

        /// Floor of nodes per version (defaults to config)
        #[arg(long)]
        min_nodes: Option<usize>,

        /// Address of the local service (defaults to config)
        #[arg(long)]
        service_addr: Option<SocketAddr>,
    },
}

#[derive(Subcommand)]
enum SpecAction {
    /// Publish a spec, e.g. `spec set testdrive v1=0.9 v2=0.1`
    Set {
        service: String,

        /// VERSION=RATIO pairs, in priority order
        #[arg(required = true)]
        ratios: Vec<String>,
    },

    /// Print the published spec
    Get { service: String },
}

#[derive(Subcommand)]
enum VersionAction {
    Set { version: String },
    Get,
}

fn parse_ratios(pairs: &[String]) -> anyhow::Result<AllocationSpec> {
    let mut entries = Vec::with_capacity(pairs.len());
    for pair in pairs {
        let (version, ratio) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("expected VERSION=RATIO, got {}", pair))?;
        let ratio: f64 = ratio
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid ratio for {}: {}", version, e))?;
        entries.push((version.to_string(), ratio));
    }
    Ok(AllocationSpec::new(entries)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(addr) = cli.consul {
        config.consul.addr = addr;
        config.validate()?;
    }
    let backend = Arc::new(ConsulHttp::new(&config.consul)?);

    match cli.command {
        Commands::Spec { action } => match action {
            SpecAction::Set { service, ratios } => {
                let spec = parse_ratios(&ratios)?;
                set_spec(backend.as_ref(), &service, &spec).await?;
                println!("Published spec for {}: {}", service, spec.to_json()?);
            }
            SpecAction::Get { service } => match get_spec(backend.as_ref(), &service).await? {
                Some(spec) => {
                    for (version, ratio) in spec.entries() {
                        println!("{}\t{}", version, ratio);
                    }
                }
                None => println!("No spec published for {}", service),
            },
        },

        Commands::Version { action } => match action {
            VersionAction::Set { version } => {
                set_version(backend.as_ref(), &version).await?;
                println!("Target version set to {}", version);
            }
            VersionAction::Get => match get_version(backend.as_ref()).await? {
                Some(version) => println!("{}", version),
                None => println!("No target version set"),
            },
        },

        Commands::Status { service } => {
            let service = service.unwrap_or(config.shift.service);
            let report = cluster_status(backend.as_ref(), &service).await?;
            println!("Status of {}:", report.service);
            println!("  Target version: {}", report.target_version.as_deref().unwrap_or("-"));
            if !report.spec.is_empty() {
                println!("  Spec:");
                for (version, ratio) in &report.spec {
                    let passing = report.passing_by_version.get(version).copied().unwrap_or(0);
                    println!("    {}: ratio {} ({} passing)", version, ratio, passing);
                }
            }
            println!("  Nodes:");
            for node in &report.nodes {
                println!(
                    "    {} [{}] {} flag={}",
                    node.node,
                    node.tags.join(","),
                    if node.passing { "passing" } else { "failing" },
                    node.restart_flag.as_deref().unwrap_or("-")
                );
            }
            println!("  Locks:");
            for (key, holder) in &report.locks {
                println!("    {}: {}", key, holder.as_deref().unwrap_or("free"));
            }
        }

        Commands::Plan {
            service,
            min_nodes,
            service_addr,
        } => {
            let mut shift = config.shift.clone();
            if let Some(service) = service {
                shift.service = service;
            }
            if let Some(min_nodes) = min_nodes {
                shift.min_nodes = min_nodes;
            }
            if let Some(addr) = service_addr {
                shift.service_addr = addr;
            }
            let deployment = Arc::new(VersionFileDeployment::from_config(&shift));
            let report = plan_allocation(backend, deployment, &shift.service, shift.min_nodes).await?;

            println!("Allocation for {}:", shift.service);
            for (version, desired) in &report.allocation.desired {
                let actual = report.allocation.actual.get(version).copied().unwrap_or(0);
                println!("  {}: actual {} desired {}", version, actual, desired);
            }
            if !report.allocation.feasible {
                println!("  Warning: not enough nodes for every version's floor");
            }
            println!("  Target: {}", report.allocation.target);
            println!("  Running: {}", report.current_version.as_deref().unwrap_or("-"));
            println!("  Would switch: {}", report.would_switch());
        }
    }

    Ok(())
}
