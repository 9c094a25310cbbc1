//! Orca DHT - Kademlia overlay for peer discovery
//!
//! This crate provides a distributed hash table mapping namespaced keys to
//! `host:port` values, so peers can find who holds a piece of content.

pub mod node;
pub mod overlay;
pub mod routing;
pub mod storage;
pub mod validator;

pub use node::DhtNode;
pub use overlay::{DiscoveryHandle, Overlay, ValueStream};
pub use validator::{AcceptAll, AddressValues, RecordValidator};

use orca_core::PeerAddress;
use std::path::PathBuf;
use std::time::Duration;

/// Logical key peers advertise themselves under
pub const DISCOVERY_KEY: &str = "discovery";

/// DHT node configuration
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    /// Address the RPC listener binds to (port 0 picks a free port)
    pub listen_addr: PeerAddress,
    /// Address other peers should dial, if different from the bound one
    pub advertise_addr: Option<PeerAddress>,
    /// Peers contacted on join
    pub bootstrap_nodes: Vec<PeerAddress>,
    /// Prefix applied to every key
    pub namespace: String,
    /// Number of nodes per k-bucket
    pub k: usize,
    /// Parallelism factor for lookups
    pub alpha: usize,
    /// Period of the discovery loop
    pub discovery_interval: Duration,
    /// Timeout for a single RPC
    pub query_timeout: Duration,
    /// Records not refreshed within this window are dropped
    pub record_ttl: Duration,
    /// Values kept per key before the oldest is replaced
    pub max_values_per_key: usize,
    /// Where the node identity is persisted; `None` uses a fresh identity
    pub identity_path: Option<PathBuf>,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            listen_addr: PeerAddress::new("0.0.0.0:4001"),
            advertise_addr: None,
            bootstrap_nodes: Vec::new(),
            namespace: "orca".to_string(),
            k: 20,
            alpha: 3,
            discovery_interval: Duration::from_secs(10),
            query_timeout: Duration::from_secs(5),
            record_ttl: Duration::from_secs(3600),
            max_values_per_key: 20,
            identity_path: None,
        }
    }
}

impl OverlayConfig {
    /// Apply the namespace prefix to a logical key
    pub fn namespaced(&self, key: &str) -> String {
        format!("{}/{}", self.namespace, key)
    }
}
