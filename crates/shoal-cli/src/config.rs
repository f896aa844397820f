//! Configuration file for the `shoal` binary.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use shoal_core::{
    CoordinatorConfig, MaintenanceConfig, NodeConfig, RacePolicy, ReputationConfig,
    SelectionConfig,
};
use shoal_discovery::{RegionCatalogue, RegionId, RendezvousClientConfig, RendezvousServerConfig};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Rendezvous server and client settings
    pub rendezvous: RendezvousSection,
    /// Local node identity hints
    pub node: NodeSection,
    /// Candidate ranking
    pub selection: SelectionSection,
    /// Reputation scoring
    pub reputation: ReputationSection,
    /// Download coordination
    pub transfer: TransferSection,
    /// Log output
    pub logging: LoggingSection,
}

/// `[rendezvous]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendezvousSection {
    /// Server URL clients connect to
    pub server_url: String,
    /// Address `shoal rendezvous` listens on
    pub bind_addr: String,
    /// Seconds a client waits for the registration acknowledgement
    pub register_timeout_secs: u64,
    /// Seconds between client heartbeats
    pub heartbeat_interval_secs: u64,
    /// Seconds between server peer-list pushes
    pub peer_list_interval_secs: u64,
    /// Seconds of silence after which the server drops a connection
    pub stale_after_secs: u64,
}

impl Default for RendezvousSection {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8765".to_string(),
            bind_addr: "0.0.0.0:8765".to_string(),
            register_timeout_secs: 10,
            heartbeat_interval_secs: 20,
            peer_list_interval_secs: 15,
            stale_after_secs: 60,
        }
    }
}

/// `[node]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Region announced to the rendezvous server
    pub region: Option<String>,
    /// IANA timezone used to derive the region when `region` is unset
    pub timezone: Option<String>,
    /// Seconds between reputation decay and peer pruning passes
    pub maintenance_interval_secs: u64,
    /// Seconds after which an unseen peer is forgotten
    pub peer_stale_after_secs: u64,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            region: None,
            timezone: None,
            maintenance_interval_secs: 30,
            peer_stale_after_secs: 120,
        }
    }
}

/// `[selection]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionSection {
    /// Weight of reputation in the ranking key
    pub reputation_weight: f64,
    /// Weight of proximity in the ranking key
    pub proximity_weight: f64,
    /// Candidates returned per request
    pub max_candidates: usize,
    /// Minimum score for relay candidates
    pub relay_min_score: f64,
}

impl Default for SelectionSection {
    fn default() -> Self {
        let defaults = SelectionConfig::default();
        Self {
            reputation_weight: defaults.reputation_weight,
            proximity_weight: defaults.proximity_weight,
            max_candidates: defaults.max_candidates,
            relay_min_score: defaults.relay_min_score,
        }
    }
}

/// `[reputation]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReputationSection {
    /// Score of an unknown peer
    pub neutral_score: f64,
    /// Step toward 1.0 on success
    pub success_step: f64,
    /// Step toward 0.0 on failure
    pub failure_step: f64,
    /// Step toward 0.0 on timeout
    pub timeout_step: f64,
    /// Seconds for an idle score to move halfway back to neutral
    pub decay_half_life_secs: u64,
}

impl Default for ReputationSection {
    fn default() -> Self {
        let defaults = ReputationConfig::default();
        Self {
            neutral_score: defaults.neutral_score,
            success_step: defaults.success_step,
            failure_step: defaults.failure_step,
            timeout_step: defaults.timeout_step,
            decay_half_life_secs: defaults.decay_half_life.as_secs(),
        }
    }
}

/// `[transfer]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSection {
    /// Chunk size for manifests built by `shoal manifest`
    pub chunk_size: usize,
    /// Candidates considered per assignment pass
    pub max_candidates: usize,
    /// In-flight requests per peer
    pub per_peer_concurrency: usize,
    /// In-flight requests per download
    pub max_in_flight: usize,
    /// Minimum per-chunk deadline in milliseconds
    pub deadline_floor_ms: u64,
    /// Throughput assumed for deadlines, bytes per second
    pub estimated_throughput: u64,
    /// Milliseconds between housekeeping passes
    pub pass_interval_ms: u64,
    /// Passes without progress before a download stalls
    pub max_idle_passes: u32,
    /// Largest file a download may buffer, in bytes
    pub max_file_size: u64,
    /// Whether slow chunks may be requested twice
    pub race_enabled: bool,
    /// Cap on duplicated chunks as a fraction of remaining chunks
    pub race_max_fraction: f64,
    /// Milliseconds without progress before racing starts
    pub race_stall_after_ms: u64,
}

impl Default for TransferSection {
    fn default() -> Self {
        let defaults = CoordinatorConfig::default();
        Self {
            chunk_size: shoal_files::DEFAULT_CHUNK_SIZE,
            max_candidates: defaults.max_candidates,
            per_peer_concurrency: defaults.per_peer_concurrency,
            max_in_flight: defaults.max_in_flight,
            deadline_floor_ms: millis(defaults.deadline_floor),
            estimated_throughput: defaults.estimated_throughput,
            pass_interval_ms: millis(defaults.pass_interval),
            max_idle_passes: defaults.max_idle_passes,
            max_file_size: defaults.max_file_size,
            race_enabled: defaults.race.enabled,
            race_max_fraction: defaults.race.max_fraction,
            race_stall_after_ms: millis(defaults.race.stall_after),
        }
    }
}

/// `[logging]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Filter directive used without `-v`/`-d`
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Config {
    /// `<config dir>/shoal/config.toml`
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("shoal")
            .join("config.toml")
    }

    /// Read and parse a configuration file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Read the default file, or fall back to defaults when it is absent
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Write the configuration, creating parent directories
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let text = toml::to_string_pretty(self)?;
        std::fs::write(path, text)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    /// Check every section by building the library configurations
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.transfer.chunk_size == 0 {
            anyhow::bail!("transfer.chunk_size must be greater than zero");
        }
        self.server_config()?.validate()?;
        self.node_config()?.validate()?;
        Ok(())
    }

    /// Region to announce: `node.region`, else derived from `node.timezone`
    pub fn region(&self) -> anyhow::Result<Option<RegionId>> {
        if let Some(name) = &self.node.region {
            let id = name
                .parse::<RegionId>()
                .map_err(|e| anyhow::anyhow!("node.region: {}", e))?;
            return Ok(Some(id));
        }
        Ok(self.node.timezone.as_deref().and_then(|tz| {
            RegionCatalogue::default()
                .region_for_timezone(tz)
                .map(|region| region.id)
        }))
    }

    /// Rendezvous server settings
    pub fn server_config(&self) -> anyhow::Result<RendezvousServerConfig> {
        let rendezvous = &self.rendezvous;
        let bind_addr: SocketAddr = rendezvous
            .bind_addr
            .parse()
            .with_context(|| format!("Invalid rendezvous.bind_addr: {}", rendezvous.bind_addr))?;
        Ok(RendezvousServerConfig {
            bind_addr,
            register_timeout: Duration::from_secs(rendezvous.register_timeout_secs),
            peer_list_interval: Duration::from_secs(rendezvous.peer_list_interval_secs),
            stale_after: Duration::from_secs(rendezvous.stale_after_secs),
        })
    }

    /// Node settings
    pub fn node_config(&self) -> anyhow::Result<NodeConfig> {
        let transfer = &self.transfer;
        Ok(NodeConfig {
            rendezvous: RendezvousClientConfig {
                server_url: self.rendezvous.server_url.clone(),
                region: self.region()?,
                register_timeout: Duration::from_secs(self.rendezvous.register_timeout_secs),
                heartbeat_interval: Duration::from_secs(self.rendezvous.heartbeat_interval_secs),
            },
            reputation: ReputationConfig {
                neutral_score: self.reputation.neutral_score,
                success_step: self.reputation.success_step,
                failure_step: self.reputation.failure_step,
                timeout_step: self.reputation.timeout_step,
                decay_half_life: Duration::from_secs(self.reputation.decay_half_life_secs),
            },
            selection: SelectionConfig {
                reputation_weight: self.selection.reputation_weight,
                proximity_weight: self.selection.proximity_weight,
                max_candidates: self.selection.max_candidates,
                relay_min_score: self.selection.relay_min_score,
            },
            coordinator: CoordinatorConfig {
                max_candidates: transfer.max_candidates,
                per_peer_concurrency: transfer.per_peer_concurrency,
                max_in_flight: transfer.max_in_flight,
                deadline_floor: Duration::from_millis(transfer.deadline_floor_ms),
                estimated_throughput: transfer.estimated_throughput,
                pass_interval: Duration::from_millis(transfer.pass_interval_ms),
                max_idle_passes: transfer.max_idle_passes,
                max_file_size: transfer.max_file_size,
                race: RacePolicy {
                    enabled: transfer.race_enabled,
                    max_fraction: transfer.race_max_fraction,
                    stall_after: Duration::from_millis(transfer.race_stall_after_ms),
                },
            },
            maintenance: MaintenanceConfig {
                interval: Duration::from_secs(self.node.maintenance_interval_secs),
                peer_stale_after: Duration::from_secs(self.node.peer_stale_after_secs),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.node_config().unwrap().coordinator, CoordinatorConfig::default());
        assert_eq!(config.node_config().unwrap().reputation, ReputationConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.node.region = Some("east-asia".to_string());
        config.transfer.per_peer_concurrency = 2;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.region().unwrap(), Some(RegionId::EastAsia));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "[selection]\nproximity_weight = 0.5\n").unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.selection.proximity_weight, 0.5);
        assert_eq!(loaded.rendezvous, RendezvousSection::default());
    }

    #[test]
    fn test_region_from_timezone() {
        let mut config = Config::default();
        config.node.timezone = Some("Europe/Berlin".to_string());
        assert_eq!(config.region().unwrap(), Some(RegionId::EuropeWest));

        config.node.region = Some("oceania".to_string());
        assert_eq!(config.region().unwrap(), Some(RegionId::Oceania));

        config.node.region = Some("atlantis".to_string());
        assert!(config.region().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.rendezvous.bind_addr = "not an address".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.reputation.failure_step = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.rendezvous.server_url = "http://example.com".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.transfer.chunk_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_fails() {
        let temp_dir = TempDir::new().unwrap();
        assert!(Config::load(&temp_dir.path().join("absent.toml")).is_err());
    }
}
