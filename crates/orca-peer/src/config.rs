//! Node configuration

use orca_core::PeerAddress;
use orca_dht::OverlayConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::content_store::StoreLimits;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory path
    pub data_dir: String,

    /// Overlay configuration
    pub overlay: OverlaySection,

    /// Content store configuration
    pub store: StoreSection,

    /// Transfer configuration
    pub transfer: TransferSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlaySection {
    /// Address the DHT listener binds to
    pub listen_addr: String,
    /// Address peers should dial instead of the bound one
    pub advertise_addr: Option<String>,
    /// Bootstrap nodes
    pub bootstrap_nodes: Vec<String>,
    /// Key namespace shared by all peers of one network
    pub namespace: String,
    /// K parameter (nodes per bucket)
    pub k: usize,
    /// Alpha parameter (lookup parallelism)
    pub alpha: usize,
    pub discovery_interval_secs: u64,
    /// Per-RPC timeout in seconds
    pub query_timeout_secs: u64,
    pub record_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// Memory tier capacity in bytes
    pub memory_cap: usize,
    /// Drive tier capacity in bytes
    pub drive_cap: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSection {
    /// Address the HTTP transfer server binds to
    pub http_addr: String,
    /// How long an incoming request waits for the operator
    pub confirm_timeout_secs: u64,
    /// Bodies above this size are streamed in chunks
    pub chunk_threshold: usize,
    /// HTTP client request timeout in seconds
    pub request_timeout_secs: u64,
    /// Price quoted per stored byte
    pub price_per_byte: f64,
}

impl Default for OverlaySection {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:4001".to_string(),
            advertise_addr: None,
            bootstrap_nodes: vec![],
            namespace: "orca".to_string(),
            k: 20,
            alpha: 3,
            discovery_interval_secs: 10,
            query_timeout_secs: 5,
            record_ttl_secs: 3600,
        }
    }
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            memory_cap: 4_000,
            drive_cap: 1_000_000,
        }
    }
}

impl Default for TransferSection {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:8080".to_string(),
            confirm_timeout_secs: 60,
            chunk_threshold: orca_core::CHUNK_THRESHOLD,
            request_timeout_secs: 30,
            price_per_byte: 0.0001,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: "~/.orca".to_string(),
            overlay: OverlaySection::default(),
            store: StoreSection::default(),
            transfer: TransferSection::default(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Write configuration as TOML
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Expand ~ in data_dir path
    pub fn data_dir(&self) -> PathBuf {
        if let Some(rest) = self.data_dir.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(rest);
            }
        }
        PathBuf::from(&self.data_dir)
    }

    /// Content blobs, one read-only file per key
    pub fn store_dir(&self) -> PathBuf {
        self.data_dir().join("store")
    }

    pub fn names_db(&self) -> PathBuf {
        self.data_dir().join("names.db")
    }

    /// Audit trail of transaction submissions
    pub fn transactions_dir(&self) -> PathBuf {
        self.data_dir().join("transactions")
    }

    /// Where fetched files land
    pub fn requested_dir(&self) -> PathBuf {
        self.data_dir().join("requested")
    }

    pub fn node_key_path(&self) -> PathBuf {
        self.data_dir().join("node_key.pem")
    }

    pub fn wallet_key_path(&self) -> PathBuf {
        self.data_dir().join("wallet_key.pem")
    }

    pub fn store_limits(&self) -> StoreLimits {
        StoreLimits {
            memory_cap: self.store.memory_cap,
            drive_cap: self.store.drive_cap,
        }
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer.confirm_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer.request_timeout_secs)
    }

    /// Overlay settings with addresses parsed and the identity path filled in
    pub fn overlay_config(&self) -> anyhow::Result<OverlayConfig> {
        let overlay = &self.overlay;
        let bootstrap_nodes = overlay
            .bootstrap_nodes
            .iter()
            .map(|s| s.parse::<PeerAddress>())
            .collect::<Result<Vec<_>, _>>()?;
        let advertise_addr = overlay
            .advertise_addr
            .as_deref()
            .map(str::parse::<PeerAddress>)
            .transpose()?;

        Ok(OverlayConfig {
            listen_addr: overlay.listen_addr.parse()?,
            advertise_addr,
            bootstrap_nodes,
            namespace: overlay.namespace.clone(),
            k: overlay.k,
            alpha: overlay.alpha,
            discovery_interval: Duration::from_secs(overlay.discovery_interval_secs),
            query_timeout: Duration::from_secs(overlay.query_timeout_secs),
            record_ttl: Duration::from_secs(overlay.record_ttl_secs),
            identity_path: Some(self.node_key_path()),
            ..OverlayConfig::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            data_dir = "/tmp/orca-test"

            [store]
            drive_cap = 2048
            "#,
        )
        .unwrap();

        assert_eq!(config.store.drive_cap, 2048);
        assert_eq!(config.store.memory_cap, 4_000);
        assert_eq!(config.overlay.k, 20);
        assert_eq!(config.transfer.chunk_threshold, 1024);
        assert_eq!(config.data_dir(), PathBuf::from("/tmp/orca-test"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.overlay.bootstrap_nodes = vec!["10.0.0.1:4001".to_string()];
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.overlay.bootstrap_nodes, config.overlay.bootstrap_nodes);
        assert_eq!(loaded.transfer.http_addr, "0.0.0.0:8080");
    }

    #[test]
    fn test_overlay_config_rejects_bad_bootstrap() {
        let mut config = Config::default();
        config.overlay.bootstrap_nodes = vec!["no-port".to_string()];
        assert!(config.overlay_config().is_err());

        config.overlay.bootstrap_nodes = vec!["10.0.0.1:4001".to_string()];
        let overlay = config.overlay_config().unwrap();
        assert_eq!(overlay.bootstrap_nodes.len(), 1);
        assert_eq!(overlay.query_timeout, Duration::from_secs(5));
        assert!(overlay.identity_path.unwrap().ends_with("node_key.pem"));
    }
}
