//! Shoal CLI
//!
//! Runs a rendezvous server, inspects the peer set seen through one,
//! classifies regions and builds file manifests.

mod config;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use shoal_core::{ChunkFetcher, ChunkRequest, FetchError, Node, TaskContext};
use shoal_discovery::region::UNKNOWN_REGION;
use shoal_discovery::{Coordinate, PeerId, RegionCatalogue, RendezvousServer, now_millis};
use shoal_files::{FileId, FileManifest};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use config::Config;

/// Shoal - multi-source peer-to-peer file sharing
#[derive(Parser)]
#[command(name = "shoal")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug output (implies --verbose)
    #[arg(short, long)]
    debug: bool,

    /// Configuration file path (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a rendezvous server until interrupted
    Rendezvous {
        /// Listen address (overrides rendezvous.bind_addr)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Classify a coordinate or timezone into a region
    Region {
        /// Latitude in decimal degrees
        #[arg(long, allow_hyphen_values = true, requires = "lon")]
        lat: Option<f64>,

        /// Longitude in decimal degrees
        #[arg(long, allow_hyphen_values = true, requires = "lat")]
        lon: Option<f64>,

        /// IANA timezone id, e.g. Europe/Berlin
        #[arg(long, conflicts_with_all = ["lat", "lon"])]
        timezone: Option<String>,
    },

    /// Register with a rendezvous server and list ranked peers
    Peers {
        /// Server URL (overrides rendezvous.server_url)
        #[arg(short, long)]
        server: Option<String>,

        /// Seconds to wait for the first peer list
        #[arg(short, long, default_value = "3")]
        wait: u64,

        /// Rank for relaying instead of downloading
        #[arg(long)]
        relay: bool,
    },

    /// Build a manifest for a local file
    Manifest {
        /// File to describe
        #[arg(required = true)]
        file: PathBuf,

        /// Chunk size in bytes (overrides transfer.chunk_size)
        #[arg(long)]
        chunk_size: Option<usize>,

        /// File id (defaults to the content digest)
        #[arg(long)]
        id: Option<String>,

        /// Write the manifest here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// View or modify configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show {
        /// Show a single `section.field` key
        key: Option<String>,
    },

    /// Set a configuration value
    Set {
        /// `section.field` key to set
        key: String,

        /// Value to set
        value: String,
    },

    /// Print the configuration file path
    Path,
}

/// Chunk fetcher for commands that never download
struct NoDataChannel;

#[async_trait]
impl ChunkFetcher for NoDataChannel {
    async fn fetch_chunk(
        &self,
        _peer: &PeerId,
        _request: ChunkRequest,
    ) -> Result<Vec<u8>, FetchError> {
        Err(FetchError::Unavailable(
            "the CLI has no chunk data channel".to_string(),
        ))
    }
}

/// Expand a leading `~/` to the home directory
fn expand_path(path: &str) -> anyhow::Result<PathBuf> {
    expand_with_home(path, dirs::home_dir())
}

fn expand_with_home(path: &str, home: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => home
            .map(|home| home.join(rest))
            .ok_or_else(|| anyhow::anyhow!("Cannot expand {}: no home directory", path)),
        None => Ok(PathBuf::from(path)),
    }
}

fn config_path(cli_path: Option<&str>) -> anyhow::Result<PathBuf> {
    cli_path.map_or_else(|| Ok(Config::default_path()), expand_path)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = config_path(cli.config.as_deref())?;
    let config = if cli.config.is_some() {
        Config::load(&config_path)?
    } else {
        Config::load_or_default()?
    };

    let log_level = if cli.debug {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    config.validate()?;

    match cli.command {
        Commands::Rendezvous { bind } => {
            run_rendezvous(bind, &config).await?;
        }
        Commands::Region { lat, lon, timezone } => {
            show_region(lat, lon, timezone, &config)?;
        }
        Commands::Peers {
            server,
            wait,
            relay,
        } => {
            list_peers(server, wait, relay, &config).await?;
        }
        Commands::Manifest {
            file,
            chunk_size,
            id,
            output,
        } => {
            build_manifest(file, chunk_size, id, output, &config)?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show { key } => {
                config_show(key, &config)?;
            }
            ConfigAction::Set { key, value } => {
                config_set(&key, &value, &config_path)?;
            }
            ConfigAction::Path => {
                println!("{}", config_path.display());
            }
        },
    }

    Ok(())
}

/// Run a rendezvous server until Ctrl-C
async fn run_rendezvous(bind: Option<String>, config: &Config) -> anyhow::Result<()> {
    let mut server_config = config.server_config()?;
    if let Some(bind) = bind {
        server_config.bind_addr = bind
            .parse()
            .with_context(|| format!("Invalid bind address: {}", bind))?;
    }

    let handle = RendezvousServer::bind(server_config).await?.spawn();
    tracing::info!("Rendezvous server bound to {}", handle.local_addr());
    println!("Rendezvous server listening on {}", handle.url());
    println!("Press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;

    println!("Shutting down ({} peers connected)", handle.peer_count());
    handle.shutdown().await;
    Ok(())
}

/// Print the region for a coordinate, a timezone, or the configured node
fn show_region(
    lat: Option<f64>,
    lon: Option<f64>,
    timezone: Option<String>,
    config: &Config,
) -> anyhow::Result<()> {
    let catalogue = RegionCatalogue::default();

    let region = match (lat, lon, timezone) {
        (Some(lat), Some(lon), _) => {
            if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
                anyhow::bail!("Coordinate out of range: {}, {}", lat, lon);
            }
            catalogue.region_for_coordinate(Coordinate::new(lat, lon))
        }
        (_, _, Some(timezone)) => catalogue
            .region_for_timezone(&timezone)
            .unwrap_or(&UNKNOWN_REGION),
        _ => match config.region()? {
            Some(id) => catalogue.get(id).unwrap_or(&UNKNOWN_REGION),
            None => {
                println!("No region configured; pass --lat/--lon or --timezone");
                return Ok(());
            }
        },
    };

    println!("{}  {}", region.id, region.name);
    if !region.id.is_unknown() {
        println!("  Reference point: {:.2}, {:.2}", region.lat, region.lng);
    }

    if let Some(local) = config.region()?
        && local != region.id
        && let Some(km) = catalogue.proximity_km(local, region.id)
    {
        println!("  Distance from {}: {:.0} km", local, km);
    }

    Ok(())
}

/// Register with the rendezvous server and print ranked candidates
async fn list_peers(
    server: Option<String>,
    wait: u64,
    relay: bool,
    config: &Config,
) -> anyhow::Result<()> {
    let mut node_config = config.node_config()?;
    if let Some(url) = server {
        node_config.rendezvous.server_url = url;
    }
    let server_url = node_config.rendezvous.server_url.clone();

    let (node, _events) = Node::start(node_config, Arc::new(NoDataChannel)).await?;
    println!("Connected to {}", server_url);
    println!(
        "Peer ID: {} (region {})",
        node.peer_id(),
        node.region().map_or("unknown", |r| r.as_str())
    );
    println!();

    tracing::debug!("Waiting up to {}s for a peer list", wait);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(wait);
    while node.peers().is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let ctx = if relay {
        TaskContext::relay(node.region())
    } else {
        TaskContext::download(node.region())
    };
    let candidates = node.candidates(&ctx);

    println!(
        "{} peers known, {} {} candidates",
        node.peers().len(),
        candidates.len(),
        if relay { "relay" } else { "download" }
    );
    if !candidates.is_empty() {
        println!();
        println!(
            "{:>4}  {:<34}  {:<20}  {:>5}  {:>8}  {:>9}",
            "RANK", "PEER", "REGION", "SCORE", "KM", "SEEN"
        );
        let now = now_millis();
        for (rank, candidate) in candidates.candidates().iter().enumerate() {
            let region = node
                .peers()
                .get(&candidate.peer_id)
                .and_then(|record| record.region)
                .map_or("unknown", |r| r.as_str());
            let distance = candidate
                .distance_km
                .map_or_else(|| "-".to_string(), |km| format!("{:.0}", km));
            let seen = format!("{}s ago", now.saturating_sub(candidate.last_seen) / 1000);
            println!(
                "{:>4}  {:<34}  {:<20}  {:>5.2}  {:>8}  {:>9}",
                rank + 1,
                candidate.peer_id,
                region,
                candidate.score,
                distance,
                seen
            );
        }
    }

    node.disconnect();
    Ok(())
}

/// Build a manifest and print or save it as JSON
fn build_manifest(
    file: PathBuf,
    chunk_size: Option<usize>,
    id: Option<String>,
    output: Option<PathBuf>,
    config: &Config,
) -> anyhow::Result<()> {
    let chunk_size = chunk_size.unwrap_or(config.transfer.chunk_size);
    let manifest = FileManifest::from_file(&file, chunk_size, id.map(FileId::new))
        .with_context(|| format!("Failed to build manifest for {}", file.display()))?;
    let json = serde_json::to_string_pretty(&manifest)?;

    match output {
        Some(path) => {
            std::fs::write(&path, json)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!(
                "Manifest for {} ({} bytes, {} chunks) written to {}",
                manifest.file_id,
                manifest.total_size,
                manifest.chunk_hashes.len(),
                path.display()
            );
        }
        None => println!("{}", json),
    }

    Ok(())
}

/// Show the whole configuration or one `section.field` key
fn config_show(key: Option<String>, config: &Config) -> anyhow::Result<()> {
    match key {
        Some(key) => {
            let root = toml::Value::try_from(config)?;
            let (section, field) = split_key(&key)?;
            match root.get(section).and_then(|s| s.get(field)) {
                Some(toml::Value::String(s)) => println!("{}", s),
                Some(value) => println!("{}", value),
                None if is_optional_key(section, field) => println!("(not set)"),
                None => anyhow::bail!("Unknown configuration key: {}", key),
            }
        }
        None => {
            println!("Shoal Configuration");
            println!();
            print!("{}", toml::to_string_pretty(config)?);
        }
    }
    Ok(())
}

/// Set one `section.field` key and save the file
fn config_set(key: &str, value: &str, config_path: &std::path::Path) -> anyhow::Result<()> {
    let config = if config_path.exists() {
        Config::load(config_path)?
    } else {
        Config::default()
    };

    let (section, field) = split_key(key)?;
    let mut root = toml::Value::try_from(&config)?;
    let table = root
        .get_mut(section)
        .and_then(toml::Value::as_table_mut)
        .ok_or_else(|| anyhow::anyhow!("Unknown configuration key: {}", key))?;

    let new_value = match table.get(field) {
        Some(toml::Value::Integer(_)) => toml::Value::Integer(
            value
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid number for {}: {}", key, value))?,
        ),
        Some(toml::Value::Float(_)) => toml::Value::Float(
            value
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid number for {}: {}", key, value))?,
        ),
        Some(toml::Value::Boolean(_)) => toml::Value::Boolean(
            value
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid boolean value for {}: {}", key, value))?,
        ),
        Some(toml::Value::String(_)) => toml::Value::String(value.to_string()),
        None if is_optional_key(section, field) => toml::Value::String(value.to_string()),
        _ => anyhow::bail!("Unknown configuration key: {}", key),
    };
    tracing::debug!("Setting {} = {}", key, new_value);
    table.insert(field.to_string(), new_value);

    let config: Config = root.try_into()?;
    config.validate()?;
    config.save(config_path)?;

    println!("Configuration updated: {} = {}", key, value);
    println!("Saved to: {}", config_path.display());
    Ok(())
}

fn split_key(key: &str) -> anyhow::Result<(&str, &str)> {
    key.split_once('.')
        .ok_or_else(|| anyhow::anyhow!("Configuration keys take the form section.field: {}", key))
}

/// Keys that are omitted from the file while unset
fn is_optional_key(section: &str, field: &str) -> bool {
    matches!((section, field), ("node", "region") | ("node", "timezone"))
}
