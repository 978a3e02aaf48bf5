//! CLI for the pricestore price store.
//!
//! Provides commands for inspecting and querying stores on disk and for
//! calling methods on a running price service.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use pricestore::point::now_ms;
use pricestore::{PricePoint, StorageEngine, frame};
use tokio::net::TcpStream;

/// pricestore - Embedded append-only price time-series store CLI.
#[derive(Parser)]
#[command(name = "pricestore", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Display store metadata, tracked assets and disk usage.
    Info {
        /// Path to the store directory.
        store_path: PathBuf,
    },

    /// Show the latest stored point per asset.
    Latest {
        /// Path to the store directory.
        store_path: PathBuf,

        /// Asset ids to show; every stored asset when omitted.
        ids: Vec<String>,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },

    /// Show stored points for one asset over a recent time range.
    History {
        /// Path to the store directory.
        store_path: PathBuf,

        /// Asset id to query.
        asset: String,

        /// Time range to query (e.g., "1h", "30m", "7d").
        #[arg(long, default_value = "24h")]
        range: String,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },

    /// Call a method on a running price service and print the response.
    Call {
        /// Method name, e.g. getLatestPrices.
        method: String,

        /// JSON request body.
        #[arg(default_value = "")]
        body: String,

        /// Service address.
        #[arg(long, default_value = "127.0.0.1:40001")]
        addr: String,
    },
}

/// Output format for query results.
#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Comma-separated values.
    Csv,
    /// JSON array of objects.
    Json,
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Info { store_path } => cmd_info(&store_path),
        Commands::Latest {
            store_path,
            ids,
            format,
        } => cmd_latest(&store_path, &ids, &format),
        Commands::History {
            store_path,
            asset,
            range,
            format,
        } => cmd_history(&store_path, &asset, &range, &format),
        Commands::Call { method, body, addr } => cmd_call(&addr, &method, &body),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Opens an existing store without taking the write side.
fn open_store(store_path: &Path) -> Result<StorageEngine, Box<dyn std::error::Error>> {
    if !store_path.join("meta.json").exists() {
        return Err(format!("No store found at '{}'", store_path.display()).into());
    }
    Ok(StorageEngine::open_read_only(store_path)?)
}

/// Implements `pricestore info <store_path>`.
fn cmd_info(store_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(store_path)?;

    let meta_data = std::fs::read_to_string(store_path.join("meta.json"))?;
    let meta: serde_json::Value = serde_json::from_str(&meta_data)?;

    println!("Store: {}", store_path.display());
    if let Some(version) = meta.get("version").and_then(serde_json::Value::as_u64) {
        println!("Format version: {version}");
    }
    println!("Keys: {}", store.key_count()?);
    println!();

    let assets = store.summary()?;
    println!("Assets: {}", assets.len());
    for asset in &assets {
        let span = format_duration_secs(asset.last_ms.saturating_sub(asset.first_ms) / 1000);
        println!(
            "  - {}: {} points, {}..{} ({span})",
            asset.asset_id, asset.points, asset.first_ms, asset.last_ms
        );
    }
    println!();

    let total_size = dir_size(store_path)?;
    println!("Total disk usage: {} ({total_size} bytes)", format_bytes(total_size));

    Ok(())
}

/// Implements `pricestore latest <store_path> [ids...]`.
fn cmd_latest(
    store_path: &Path,
    ids: &[String],
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(store_path)?;
    let latest = store.get_latest(ids)?;

    let points: Vec<&PricePoint> = latest.values().collect();
    print_points(&points, format)
}

/// Implements `pricestore history <store_path> <asset>`.
fn cmd_history(
    store_path: &Path,
    asset: &str,
    range: &str,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(store_path)?;

    let range_ms = parse_duration(range)?;
    let to_ms = now_ms();
    let from_ms = to_ms.saturating_sub(range_ms);

    let series = store.get_range(asset, from_ms, to_ms)?;
    let points: Vec<&PricePoint> = series.iter().collect();
    print_points(&points, format)
}

/// Implements `pricestore call <method> [body]`.
fn cmd_call(addr: &str, method: &str, body: &str) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    let response = runtime.block_on(request(addr, method, body))?;

    let value: serde_json::Value = serde_json::from_slice(&response)?;
    println!("{}", serde_json::to_string_pretty(&value)?);

    if value.get("error").is_some() {
        return Err(format!("{method} failed").into());
    }
    Ok(())
}

/// Sends one framed request and waits for its response.
async fn request(
    addr: &str,
    method: &str,
    body: &str,
) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(addr).await?;
    frame::write_request(&mut stream, method, body.as_bytes()).await?;
    let response = frame::read_response(&mut stream)
        .await?
        .ok_or("connection closed before a response")?;
    Ok(response)
}

fn print_points(
    points: &[&PricePoint],
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Csv => {
            println!("# points={}", points.len());
            println!("id,symbol,timestamp_ms,price_usdt,price_change_24h,market_cap,volume_24h,exchanges");
            for p in points {
                println!(
                    "{},{},{},{},{},{},{},{}",
                    p.asset_id,
                    p.symbol,
                    p.timestamp_ms,
                    p.price_usdt,
                    p.price_change_24h_pct,
                    p.market_cap_usd,
                    p.volume_24h_usd,
                    p.exchanges.len()
                );
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(points)?);
        }
    }
    Ok(())
}

/// Parses a human-readable duration string (e.g., "1h", "30m", "7d") to milliseconds.
fn parse_duration(s: &str) -> Result<u64, Box<dyn std::error::Error>> {
    let s = s.trim();
    let Some((split, _)) = s.char_indices().last() else {
        return Err("Empty duration string".into());
    };
    let (num_str, unit) = s.split_at(split);
    let num: u64 = num_str.parse()?;

    let secs = match unit {
        "s" => num,
        "m" => num * 60,
        "h" => num * 3600,
        "d" => num * 86400,
        _ => return Err(format!("Unknown duration unit: '{unit}'. Use s, m, h, or d.").into()),
    };

    Ok(secs * 1000)
}

/// Formats seconds as a human-readable duration.
fn format_duration_secs(secs: u64) -> String {
    if secs >= 86400 && secs.is_multiple_of(86400) {
        format!("{}d", secs / 86400)
    } else if secs >= 3600 && secs.is_multiple_of(3600) {
        format!("{}h", secs / 3600)
    } else if secs >= 60 && secs.is_multiple_of(60) {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

/// Formats a byte count as a human-readable string.
#[allow(clippy::cast_precision_loss)] // Byte counts are display-only
fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{bytes} B")
    }
}

/// Recursively calculates directory size.
fn dir_size(path: &Path) -> Result<u64, Box<dyn std::error::Error>> {
    let mut total = 0;
    if path.is_dir() {
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                total += dir_size(&path)?;
            } else {
                total += entry.metadata()?.len();
            }
        }
    }
    Ok(total)
}
