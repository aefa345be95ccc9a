//! warp-nbd - serve warp object-store volumes over NBD

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use warp_nbd::{BlockBackend, NbdConfig, NbdServer, ObjectBackend, OrderedBackend, VolumeConfig};
use warp_objstore::{MemoryStore, VolumePolicy};

#[derive(Parser)]
#[command(name = "warp-nbd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Volume to create, as NAME:SIZE[:OBJECT_SIZE] (e.g. vol1:1G:4M)
    #[arg(long = "volume", value_parser = parse_volume)]
    volumes: Vec<VolumeConfig>,

    /// Serve without ordering overlapping operations
    #[arg(long)]
    no_ordering: bool,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn parse_volume(spec: &str) -> Result<VolumeConfig, String> {
    VolumeConfig::parse(spec).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(cli)?;
    let store = Arc::new(MemoryStore::new());
    for volume in &config.volumes {
        store
            .create_volume(
                config.domain.as_str(),
                volume.name.as_str(),
                VolumePolicy::new(volume.size, volume.object_size),
            )
            .with_context(|| format!("creating volume {}", volume.name))?;
        info!(
            volume = %volume.name,
            size = volume.size,
            object_size = volume.object_size,
            "Volume ready"
        );
    }

    let objects = ObjectBackend::new(store, config.domain.as_str(), config.blob.as_str());
    let backend: Arc<dyn BlockBackend> = if config.ordered {
        Arc::new(OrderedBackend::with_granularity(
            objects,
            config.default_granularity,
        ))
    } else {
        Arc::new(objects)
    };

    let server = NbdServer::new(backend, config);
    let listener = server.bind().await?;
    server
        .serve_until(listener, async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl-C");
            }
        })
        .await?;

    Ok(())
}

/// Merge file, environment and command-line settings
fn load_config(cli: Cli) -> Result<NbdConfig> {
    let mut config = match &cli.config {
        Some(path) => NbdConfig::load(path)?,
        None => NbdConfig::default(),
    }
    .apply_env_overrides()?;

    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }
    if cli.no_ordering {
        config.ordered = false;
    }
    config.volumes.extend(cli.volumes);

    config.validate()?;
    Ok(config)
}
