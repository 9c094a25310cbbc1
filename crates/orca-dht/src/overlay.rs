//! Overlay membership: join, publish, search and the discovery loop

use crate::node::{key_id, DhtNode};
use crate::validator::{AcceptAll, RecordValidator};
use crate::{OverlayConfig, DISCOVERY_KEY};
use futures::future::join_all;
use orca_core::{Error, Keypair, ListenerGuard, NodeId, PeerAddress, Result, Transport};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;

/// Buffered values per search before the lookup waits for the reader
const SEARCH_BUFFER: usize = 64;

struct OverlayInner {
    node: Arc<DhtNode>,
    config: OverlayConfig,
    identity: Keypair,
    /// Records this node published, republished by the discovery loop
    published: Mutex<Vec<(String, String)>>,
    _listener: ListenerGuard,
}

/// A joined overlay node
///
/// Cheap to clone; all clones share the same DHT node.
#[derive(Clone)]
pub struct Overlay {
    inner: Arc<OverlayInner>,
}

/// Controls the background discovery task
pub struct DiscoveryHandle {
    task: JoinHandle<()>,
}

impl DiscoveryHandle {
    /// Stop the discovery loop and wait for it to exit
    pub async fn shutdown(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}

/// Values found by a search, delivered as they arrive
///
/// The lookup runs in its own task; it is aborted when the stream is dropped
/// or when [`ValueStream::collect_within`] reaches its deadline.
pub struct ValueStream {
    rx: mpsc::Receiver<String>,
    task: AbortHandle,
}

impl ValueStream {
    /// Next value, or `None` once the lookup has finished
    pub async fn next(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Gather values until the lookup ends or `wait` elapses
    pub async fn collect_within(mut self, wait: Duration) -> Vec<String> {
        let deadline = Instant::now() + wait;
        let mut values = Vec::new();
        while let Ok(Some(value)) = tokio::time::timeout_at(deadline, self.rx.recv()).await {
            values.push(value);
        }
        self.task.abort();
        values
    }
}

impl Drop for ValueStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl Overlay {
    /// Join the overlay
    ///
    /// Binds the RPC listener, contacts the bootstrap peers and starts the
    /// discovery loop. Only a bind failure is fatal; unreachable bootstrap
    /// peers are logged and skipped.
    pub async fn join(
        config: OverlayConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<(Overlay, DiscoveryHandle)> {
        Self::join_with_validator(config, transport, Arc::new(AcceptAll)).await
    }

    /// Join with a custom record validator
    pub async fn join_with_validator(
        config: OverlayConfig,
        transport: Arc<dyn Transport>,
        validator: Arc<dyn RecordValidator>,
    ) -> Result<(Overlay, DiscoveryHandle)> {
        let identity = match &config.identity_path {
            Some(path) => Keypair::load_or_generate(path)?,
            None => Keypair::generate()?,
        };
        let node = Arc::new(DhtNode::new(
            identity.node_id(),
            &config,
            transport.clone(),
            validator,
        ));

        let listener = transport.listen(&config.listen_addr, node.clone()).await?;
        let advertised = match &config.advertise_addr {
            Some(addr) => addr.clone(),
            None => advertisable(listener.address()),
        };
        node.set_address(advertised.clone());

        tracing::info!(
            "Joined overlay as {} at {}",
            orca_core::hash_to_hex(&identity.node_id()),
            advertised
        );

        let overlay = Overlay {
            inner: Arc::new(OverlayInner {
                node,
                config,
                identity,
                published: Mutex::new(Vec::new()),
                _listener: listener,
            }),
        };

        overlay.bootstrap().await;

        let discovery = overlay.clone();
        let task = tokio::spawn(async move { discovery.discovery_loop().await });

        Ok((overlay, DiscoveryHandle { task }))
    }

    async fn bootstrap(&self) {
        let node = &self.inner.node;
        let mut reached = 0;

        for peer in &self.inner.config.bootstrap_nodes {
            if *peer == node.address() {
                continue;
            }
            match node.ping(peer).await {
                Ok(info) => {
                    tracing::info!("Bootstrap peer {} is up", info.address);
                    reached += 1;
                }
                Err(e) => tracing::warn!("Bootstrap peer {} unreachable: {}", peer, e),
            }
        }

        if reached > 0 {
            node.find_node(*node.node_id()).await;
            tracing::info!("Bootstrap complete, {} peers known", node.peer_count());
        } else if !self.inner.config.bootstrap_nodes.is_empty() {
            tracing::warn!("No bootstrap peer answered, starting alone");
        }
    }

    async fn discovery_loop(self) {
        let mut interval = tokio::time::interval(self.inner.config.discovery_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            self.discovery_round().await;
        }
    }

    /// One pass of the discovery loop
    pub async fn discovery_round(&self) {
        let node = &self.inner.node;
        let own = node.address();

        if let Err(e) = self.put_value(DISCOVERY_KEY, own.as_str()).await {
            tracing::warn!("Failed to advertise under discovery key: {}", e);
        }

        let seen = self
            .search_value(DISCOVERY_KEY)
            .collect_within(self.inner.config.query_timeout)
            .await;
        for value in seen {
            let Ok(peer) = value.parse::<PeerAddress>() else {
                tracing::debug!("Ignoring malformed discovery value {:?}", value);
                continue;
            };
            if peer == own || node.knows_address(&peer) {
                continue;
            }
            match node.ping(&peer).await {
                Ok(info) => tracing::info!("Discovered peer {}", info.address),
                Err(e) => tracing::debug!("Discovered peer {} unreachable: {}", peer, e),
            }
        }

        self.republish().await;

        let expired = node.expire_records(self.inner.config.record_ttl);
        if expired > 0 {
            tracing::debug!("Expired {} records", expired);
        }
    }

    async fn republish(&self) {
        let records = self
            .inner
            .published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for (key, value) in records {
            if key == self.inner.config.namespaced(DISCOVERY_KEY) {
                continue;
            }
            if let Err(e) = self.store_namespaced(&key, &value).await {
                tracing::debug!("Republish of {} failed: {}", key, e);
            }
        }
    }

    /// Publish `value` under `key` in this overlay's namespace
    ///
    /// Stores locally and on the closest known nodes. Fails with
    /// [`Error::Network`] only when remote nodes were known but none took the
    /// value.
    pub async fn put_value(&self, key: &str, value: &str) -> Result<()> {
        let full_key = self.inner.config.namespaced(key);
        {
            let mut published = self
                .inner
                .published
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            let record = (full_key.clone(), value.to_string());
            if !published.contains(&record) {
                published.push(record);
            }
        }
        self.store_namespaced(&full_key, value).await
    }

    async fn store_namespaced(&self, full_key: &str, value: &str) -> Result<()> {
        let node = &self.inner.node;
        node.store_local(full_key, value)?;

        let known_before = node.peer_count();
        let targets = node.find_node(key_id(full_key)).await;
        if targets.is_empty() {
            if known_before > 0 {
                return Err(Error::Network(format!(
                    "no node reachable to store {}",
                    full_key
                )));
            }
            tracing::debug!("Stored {} locally only, no peers known", full_key);
            return Ok(());
        }

        let results = join_all(targets.iter().map(|n| node.store_at(n, full_key, value))).await;
        let stored = results.iter().filter(|r| r.is_ok()).count();
        for (target, result) in targets.iter().zip(&results) {
            if let Err(e) = result {
                tracing::debug!("STORE on {} failed: {}", target.address, e);
            }
        }

        if stored == 0 {
            return Err(Error::Network(format!(
                "{} reached no node ({} tried)",
                full_key,
                targets.len()
            )));
        }
        tracing::debug!("Stored {} on {} nodes", full_key, stored);
        Ok(())
    }

    /// Search for every value under `key` in this overlay's namespace
    ///
    /// An unpublished key yields an empty stream, not an error.
    pub fn search_value(&self, key: &str) -> ValueStream {
        let full_key = self.inner.config.namespaced(key);
        let (tx, rx) = mpsc::channel(SEARCH_BUFFER);
        let node = self.inner.node.clone();
        let task = tokio::spawn(async move { node.find_value(&full_key, tx).await });
        ValueStream {
            rx,
            task: task.abort_handle(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        *self.inner.node.node_id()
    }

    /// Address other peers dial to reach this node
    pub fn address(&self) -> PeerAddress {
        self.inner.node.address()
    }

    pub fn identity(&self) -> &Keypair {
        &self.inner.identity
    }

    pub fn peer_count(&self) -> usize {
        self.inner.node.peer_count()
    }

    pub fn config(&self) -> &OverlayConfig {
        &self.inner.config
    }
}

/// Replace a wildcard bind host with loopback so peers get a dialable address
fn advertisable(bound: &PeerAddress) -> PeerAddress {
    match bound.host() {
        "0.0.0.0" | "[::]" | "::" => {
            let port = bound.port().unwrap_or_default();
            tracing::warn!(
                "Listening on wildcard {}, advertising 127.0.0.1:{}; set advertise_addr for remote peers",
                bound,
                port
            );
            PeerAddress::new(format!("127.0.0.1:{}", port))
        }
        _ => bound.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orca_core::transport::mock::MemoryNetwork;

    fn config(bootstrap: Vec<PeerAddress>) -> OverlayConfig {
        OverlayConfig {
            listen_addr: PeerAddress::new("mem:0"),
            bootstrap_nodes: bootstrap,
            discovery_interval: Duration::from_secs(3600),
            query_timeout: Duration::from_millis(500),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_search_nonexistent_key_is_empty() {
        let network = MemoryNetwork::new();
        let (overlay, _discovery) = Overlay::join(config(vec![]), Arc::new(network.transport()))
            .await
            .unwrap();

        let values = overlay
            .search_value("nonexistent")
            .collect_within(Duration::from_millis(200))
            .await;
        assert!(values.is_empty());
    }

    #[tokio::test]
    async fn test_bootstrap_failure_is_not_fatal() {
        let network = MemoryNetwork::new();
        let (overlay, _discovery) = Overlay::join(
            config(vec![PeerAddress::new("nobody:9")]),
            Arc::new(network.transport()),
        )
        .await
        .unwrap();

        assert_eq!(overlay.peer_count(), 0);
        overlay.put_value("market/x", "10.0.0.1:80").await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_is_startup_error() {
        let network = MemoryNetwork::new();
        let transport: Arc<dyn Transport> = Arc::new(network.transport());
        let fixed = OverlayConfig {
            listen_addr: PeerAddress::new("mem:5000"),
            ..config(vec![])
        };
        let (_first, _d) = Overlay::join(fixed.clone(), transport.clone()).await.unwrap();
        let second = Overlay::join(fixed, transport).await;
        assert!(matches!(second, Err(Error::Startup(_))));
    }

    #[tokio::test]
    async fn test_identity_persisted_across_joins() {
        let dir = tempfile::TempDir::new().unwrap();
        let network = MemoryNetwork::new();
        let with_path = || OverlayConfig {
            identity_path: Some(dir.path().join("node_key.pem")),
            ..config(vec![])
        };

        let (first, d1) = Overlay::join(with_path(), Arc::new(network.transport()))
            .await
            .unwrap();
        let id = first.node_id();
        d1.shutdown().await;
        drop(first);

        let (second, _d2) = Overlay::join(with_path(), Arc::new(network.transport()))
            .await
            .unwrap();
        assert_eq!(second.node_id(), id);
    }

    #[tokio::test]
    async fn test_put_and_search_across_nodes() {
        let network = MemoryNetwork::new();
        let (seed, _d0) = Overlay::join(config(vec![]), Arc::new(network.transport()))
            .await
            .unwrap();

        let mut overlays = Vec::new();
        for _ in 0..4 {
            let (overlay, discovery) =
                Overlay::join(config(vec![seed.address()]), Arc::new(network.transport()))
                    .await
                    .unwrap();
            overlays.push((overlay, discovery));
        }

        overlays[0]
            .0
            .put_value("market/abc", "10.0.0.1:8080")
            .await
            .unwrap();
        overlays[1]
            .0
            .put_value("market/abc", "10.0.0.2:8080")
            .await
            .unwrap();

        let mut values = overlays[3]
            .0
            .search_value("market/abc")
            .collect_within(Duration::from_secs(2))
            .await;
        values.sort();
        assert_eq!(values, vec!["10.0.0.1:8080", "10.0.0.2:8080"]);
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let network = MemoryNetwork::new();
        let (a, _da) = Overlay::join(config(vec![]), Arc::new(network.transport()))
            .await
            .unwrap();
        let other_ns = OverlayConfig {
            namespace: "other".to_string(),
            ..config(vec![a.address()])
        };
        let (b, _db) = Overlay::join(other_ns, Arc::new(network.transport()))
            .await
            .unwrap();

        a.put_value("market/abc", "10.0.0.1:8080").await.unwrap();
        let values = b
            .search_value("market/abc")
            .collect_within(Duration::from_secs(1))
            .await;
        assert!(values.is_empty());
    }

    #[tokio::test]
    async fn test_discovery_round_finds_peers() {
        let network = MemoryNetwork::new();
        let (hub, _dh) = Overlay::join(config(vec![]), Arc::new(network.transport()))
            .await
            .unwrap();
        let (a, _da) = Overlay::join(config(vec![hub.address()]), Arc::new(network.transport()))
            .await
            .unwrap();
        let (b, _db) = Overlay::join(config(vec![hub.address()]), Arc::new(network.transport()))
            .await
            .unwrap();

        a.discovery_round().await;
        b.discovery_round().await;

        assert!(b.inner.node.knows_address(&a.address()));
    }

    #[tokio::test]
    async fn test_put_fails_when_every_known_peer_is_gone() {
        let network = MemoryNetwork::new();
        let (a, _da) = Overlay::join(config(vec![]), Arc::new(network.transport()))
            .await
            .unwrap();
        let (b, _db) = Overlay::join(config(vec![a.address()]), Arc::new(network.transport()))
            .await
            .unwrap();

        network.take_offline(&a.address());
        let result = b.put_value("market/abc", "10.0.0.1:8080").await;
        assert!(matches!(result, Err(Error::Network(_))));
    }
}
