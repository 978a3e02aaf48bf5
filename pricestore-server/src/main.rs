//! Price service with an embedded pricestore.
//!
//! This binary opens the store, pulls prices from CoinGecko on a fixed
//! schedule and answers framed requests over TCP until interrupted.

mod transport;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use pricestore::collector::CoinGeckoCollector;
use pricestore::rpc::Service;
use pricestore::{CollectionScheduler, Collector, QueryResolver, ServiceConfig, StorageEngine};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Name of the config entry holding the node seed.
const SEED_NAME: &str = "rpc-seed";

/// pricestore-server - Scheduled price collection behind a framed TCP boundary.
#[derive(Parser)]
#[command(name = "pricestore-server", version, about)]
struct Cli {
    /// JSON configuration file; built-in defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to the store directory.
    #[arg(long)]
    store: Option<PathBuf>,

    /// Address to listen on, e.g. 127.0.0.1:40001.
    #[arg(long)]
    listen: Option<String>,

    /// Seconds between scheduled collection runs.
    #[arg(long)]
    interval_secs: Option<u64>,

    /// Do not arm the collection schedule at startup.
    #[arg(long)]
    no_autostart: bool,

    /// CoinGecko demo API key.
    #[arg(long, env = "COINGECKO_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
}

impl Cli {
    /// Overlays command-line values on a loaded configuration.
    fn apply(self, config: &mut ServiceConfig) {
        if let Some(store) = self.store {
            config.store_path = store;
        }
        if let Some(listen) = self.listen {
            config.listen_addr = listen;
        }
        if let Some(secs) = self.interval_secs {
            config.collection.interval_ms = secs.saturating_mul(1000);
        }
        if self.no_autostart {
            config.collection.autostart = false;
        }
        if self.api_key.is_some() {
            config.source.api_key = self.api_key;
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        tracing::error!("server failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => ServiceConfig::load(path)?,
        None => ServiceConfig::default(),
    };
    cli.apply(&mut config);
    config.validate()?;

    let store = Arc::new(StorageEngine::open(&config.store_path)?);
    let node_id = hex::encode(store.get_or_create_seed(SEED_NAME)?);
    tracing::info!(
        path = %config.store_path.display(),
        keys = store.key_count()?,
        node_id = %node_id,
        "store opened"
    );

    let collector: Arc<dyn Collector> = Arc::new(CoinGeckoCollector::new(config.source.clone())?);
    let scheduler = Arc::new(CollectionScheduler::new(Arc::clone(&store), Arc::clone(&collector)));
    let resolver = QueryResolver::new(store, collector);
    let service = Service::new(Arc::clone(&scheduler), resolver, &config);

    if config.collection.autostart {
        scheduler.start(config.interval())?;
    }

    let listener = TcpListener::bind(&config.listen_addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    transport::serve(listener, service, shutdown_signal()).await;

    scheduler.stop();
    tracing::info!("server exited cleanly");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
}
