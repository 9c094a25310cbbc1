//! DHT node: RPC handling and iterative lookups
//!
//! A [`DhtNode`] answers PING, FIND_NODE, FIND_VALUE and STORE requests from
//! its routing table and record store, and drives the client side of the same
//! RPCs for lookups. Inbound handling is synchronous; outbound lookups query
//! `alpha` peers at a time until no closer unqueried peer remains.

use crate::routing::{xor_distance, NodeInfo, RoutingTable};
use crate::storage::RecordStore;
use crate::validator::RecordValidator;
use crate::OverlayConfig;
use futures::future::join_all;
use orca_core::proto::{
    self, error_codes, Envelope, FindNodeRequest, FindNodeResponse, FindValueRequest,
    FindValueResponse, Payload, PingRequest, PingResponse, StoreRequest, StoreResponse,
};
use orca_core::{sha256, Error, MessageHandler, NodeId, PeerAddress, Result, Transport};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;

/// Lookup target id for a namespaced key
pub fn key_id(key: &str) -> NodeId {
    sha256(key.as_bytes())
}

/// A Kademlia node
pub struct DhtNode {
    node_id: NodeId,
    /// Address advertised to peers; set once the listener is bound
    address: RwLock<PeerAddress>,
    routing: Mutex<RoutingTable>,
    records: Mutex<RecordStore>,
    validator: Arc<dyn RecordValidator>,
    transport: Arc<dyn Transport>,
    next_request_id: AtomicU64,
    k: usize,
    alpha: usize,
    query_timeout: Duration,
}

impl DhtNode {
    pub fn new(
        node_id: NodeId,
        config: &OverlayConfig,
        transport: Arc<dyn Transport>,
        validator: Arc<dyn RecordValidator>,
    ) -> Self {
        Self {
            node_id,
            address: RwLock::new(config.listen_addr.clone()),
            routing: Mutex::new(RoutingTable::new(node_id, config.k)),
            records: Mutex::new(RecordStore::new(config.max_values_per_key)),
            validator,
            transport,
            next_request_id: AtomicU64::new(1),
            k: config.k.max(1),
            alpha: config.alpha.max(1),
            query_timeout: config.query_timeout,
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn address(&self) -> PeerAddress {
        self.address
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_address(&self, address: PeerAddress) {
        *self.address.write().unwrap_or_else(|e| e.into_inner()) = address;
    }

    /// This node as peers see it
    pub fn local_info(&self) -> NodeInfo {
        NodeInfo::new(self.node_id, self.address())
    }

    fn routing(&self) -> MutexGuard<'_, RoutingTable> {
        self.routing.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn records(&self) -> MutexGuard<'_, RecordStore> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of peers in the routing table
    pub fn peer_count(&self) -> usize {
        self.routing().len()
    }

    /// Whether a peer with this address is already in the routing table
    pub fn knows_address(&self, address: &PeerAddress) -> bool {
        self.routing().contains_address(address)
    }

    /// Record a peer we heard from
    pub fn learn(&self, node: NodeInfo) {
        let node_id = node.node_id;
        if let Some(oldest) = self.routing().upsert(node) {
            tracing::debug!(
                "Bucket full, dropping {} (oldest is {})",
                orca_core::hash_to_hex(&node_id),
                oldest.address
            );
        }
    }

    /// Validate and store a record locally
    pub fn store_local(&self, key: &str, value: &str) -> Result<()> {
        self.validator.validate(key, value)?;
        self.records().store(key, value, orca_core::unix_now());
        Ok(())
    }

    /// Values held locally for a key
    pub fn local_values(&self, key: &str) -> Vec<String> {
        self.records().get(key)
    }

    /// Drop records older than `ttl`, returning how many went
    pub fn expire_records(&self, ttl: Duration) -> usize {
        let min_timestamp = orca_core::unix_now().saturating_sub(ttl.as_secs());
        self.records().cleanup(min_timestamp)
    }

    // ----- Inbound -----

    fn handle_envelope(&self, request: &[u8]) -> Envelope {
        let sender = Some(self.local_info().to_proto());

        let envelope = match Envelope::from_bytes(request) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!("Failed to decode RPC: {}", e);
                let code = match &e {
                    Error::VersionMismatch { .. } => error_codes::VERSION_MISMATCH,
                    _ => error_codes::INVALID_MESSAGE,
                };
                return proto::error_response(0, sender, code, format!("decode error: {}", e));
            }
        };

        if let Some(info) = envelope.sender.as_ref().and_then(NodeInfo::from_proto) {
            self.learn(info);
        }

        let request_id = envelope.request_id;
        let payload = match envelope.payload {
            Some(Payload::PingRequest(_)) => Payload::PingResponse(PingResponse {}),
            Some(Payload::FindNodeRequest(req)) => self.handle_find_node(req),
            Some(Payload::FindValueRequest(req)) => self.handle_find_value(req),
            Some(Payload::StoreRequest(req)) => self.handle_store(req),
            Some(other) => {
                tracing::warn!("Unexpected message type: {:?}", other);
                return proto::error_response(
                    request_id,
                    sender,
                    error_codes::INVALID_MESSAGE,
                    "unexpected message type".to_string(),
                );
            }
            None => {
                return proto::error_response(
                    request_id,
                    sender,
                    error_codes::INVALID_MESSAGE,
                    "empty payload".to_string(),
                );
            }
        };

        Envelope::new(request_id, sender, payload)
    }

    fn handle_find_node(&self, req: FindNodeRequest) -> Payload {
        let target: NodeId = match req.target_id.as_slice().try_into() {
            Ok(target) => target,
            Err(_) => {
                return Payload::ErrorResponse(proto::ErrorResponse {
                    code: error_codes::INVALID_DATA,
                    message: "invalid target id length".to_string(),
                })
            }
        };
        let nodes = self
            .routing()
            .closest_nodes(&target, self.k)
            .iter()
            .map(NodeInfo::to_proto)
            .collect();
        Payload::FindNodeResponse(FindNodeResponse { nodes })
    }

    fn handle_find_value(&self, req: FindValueRequest) -> Payload {
        tracing::debug!("FIND_VALUE {}", req.key);
        let values = self.local_values(&req.key);
        let nodes = self
            .routing()
            .closest_nodes(&key_id(&req.key), self.k)
            .iter()
            .map(NodeInfo::to_proto)
            .collect();
        Payload::FindValueResponse(FindValueResponse { values, nodes })
    }

    fn handle_store(&self, req: StoreRequest) -> Payload {
        tracing::debug!("STORE {} -> {}", req.key, req.value);
        match self.store_local(&req.key, &req.value) {
            Ok(()) => Payload::StoreResponse(StoreResponse {
                success: true,
                error: String::new(),
            }),
            Err(e) => {
                tracing::warn!("Rejected record {}: {}", req.key, e);
                Payload::StoreResponse(StoreResponse {
                    success: false,
                    error: e.to_string(),
                })
            }
        }
    }

    // ----- Outbound -----

    async fn rpc(&self, peer: &PeerAddress, payload: Payload) -> Result<Payload> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let envelope = Envelope::new(request_id, Some(self.local_info().to_proto()), payload);

        let bytes = self
            .transport
            .request(peer, envelope.to_bytes(), self.query_timeout)
            .await?;
        let response = Envelope::from_bytes(&bytes)?;

        if response.request_id != request_id {
            return Err(Error::Protocol(format!(
                "response id {} does not match request {}",
                response.request_id, request_id
            )));
        }
        if let Some(info) = response.sender.as_ref().and_then(NodeInfo::from_proto) {
            self.learn(info);
        }

        match response.payload {
            Some(Payload::ErrorResponse(e)) => Err(Error::Protocol(format!(
                "{} answered error {}: {}",
                peer, e.code, e.message
            ))),
            Some(payload) => Ok(payload),
            None => Err(Error::Protocol(format!("{} sent an empty payload", peer))),
        }
    }

    /// RPC to a routing table entry, forgetting it if it does not answer
    async fn rpc_node(&self, node: &NodeInfo, payload: Payload) -> Result<Payload> {
        let result = self.rpc(&node.address, payload).await;
        if let Err(Error::Network(_) | Error::Timeout(_)) = &result {
            self.routing().remove(&node.node_id);
        }
        result
    }

    /// Ping an address and add the responder to the routing table
    pub async fn ping(&self, peer: &PeerAddress) -> Result<NodeInfo> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let envelope = Envelope::new(
            request_id,
            Some(self.local_info().to_proto()),
            Payload::PingRequest(PingRequest {}),
        );
        let bytes = self
            .transport
            .request(peer, envelope.to_bytes(), self.query_timeout)
            .await?;
        let response = Envelope::from_bytes(&bytes)?;

        match response.payload {
            Some(Payload::PingResponse(_)) => {}
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected ping reply from {}: {:?}",
                    peer, other
                )))
            }
        }

        let info = response
            .sender
            .as_ref()
            .and_then(NodeInfo::from_proto)
            .ok_or_else(|| Error::Protocol(format!("{} did not identify itself", peer)))?;
        self.learn(info.clone());
        Ok(info)
    }

    /// Store a record on one remote node
    pub async fn store_at(&self, node: &NodeInfo, key: &str, value: &str) -> Result<()> {
        let payload = Payload::StoreRequest(StoreRequest {
            key: key.to_string(),
            value: value.to_string(),
        });
        match self.rpc_node(node, payload).await? {
            Payload::StoreResponse(resp) if resp.success => Ok(()),
            Payload::StoreResponse(resp) => Err(Error::Validation(format!(
                "{} rejected {}: {}",
                node.address, key, resp.error
            ))),
            other => Err(Error::Protocol(format!(
                "unexpected store reply: {:?}",
                other
            ))),
        }
    }

    /// One lookup step against one node: values found and closer nodes
    async fn query(
        &self,
        node: &NodeInfo,
        target: &NodeId,
        value_key: Option<&str>,
    ) -> Result<(Vec<String>, Vec<NodeInfo>)> {
        let payload = match value_key {
            Some(key) => Payload::FindValueRequest(FindValueRequest {
                key: key.to_string(),
            }),
            None => Payload::FindNodeRequest(FindNodeRequest {
                target_id: target.to_vec(),
            }),
        };

        let (values, nodes) = match self.rpc_node(node, payload).await? {
            Payload::FindNodeResponse(resp) => (Vec::new(), resp.nodes),
            Payload::FindValueResponse(resp) => (resp.values, resp.nodes),
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected lookup reply: {:?}",
                    other
                )))
            }
        };

        let nodes = nodes.iter().filter_map(NodeInfo::from_proto).collect();
        Ok((values, nodes))
    }

    /// Iterative lookup towards `target`
    ///
    /// With `values`, each node is asked FIND_VALUE and every new value is
    /// forwarded as soon as it arrives. Returns the closest nodes that
    /// answered.
    async fn lookup(
        &self,
        target: NodeId,
        value_key: Option<&str>,
        values: Option<&mpsc::Sender<String>>,
    ) -> Vec<NodeInfo> {
        let mut shortlist = self.routing().closest_nodes(&target, self.k);
        let mut queried: HashSet<NodeId> = HashSet::new();
        let mut responded: Vec<NodeInfo> = Vec::new();
        let mut seen_values: HashSet<String> = HashSet::new();

        loop {
            let batch: Vec<NodeInfo> = shortlist
                .iter()
                .filter(|n| !queried.contains(&n.node_id))
                .take(self.alpha)
                .cloned()
                .collect();
            if batch.is_empty() {
                break;
            }
            queried.extend(batch.iter().map(|n| n.node_id));

            let results = join_all(batch.iter().map(|n| self.query(n, &target, value_key))).await;

            for (node, result) in batch.into_iter().zip(results) {
                match result {
                    Ok((found, closer)) => {
                        for value in found {
                            if !seen_values.insert(value.clone()) {
                                continue;
                            }
                            if let Some(tx) = values {
                                if tx.send(value).await.is_err() {
                                    // Receiver gone, nobody wants more
                                    return responded;
                                }
                            }
                        }
                        for candidate in closer {
                            if candidate.node_id != self.node_id
                                && !shortlist.iter().any(|n| n.node_id == candidate.node_id)
                            {
                                shortlist.push(candidate);
                            }
                        }
                        responded.push(node);
                    }
                    Err(e) => {
                        tracing::debug!("Lookup query to {} failed: {}", node.address, e);
                        shortlist.retain(|n| n.node_id != node.node_id);
                    }
                }
            }

            shortlist.sort_by_key(|n| xor_distance(&n.node_id, &target));
            shortlist.truncate(self.k);
        }

        responded.sort_by_key(|n| xor_distance(&n.node_id, &target));
        responded.truncate(self.k);
        responded
    }

    /// Find the k closest responsive nodes to a target id
    pub async fn find_node(&self, target: NodeId) -> Vec<NodeInfo> {
        self.lookup(target, None, None).await
    }

    /// Stream every value stored under `key`, local values first
    pub async fn find_value(&self, key: &str, values: mpsc::Sender<String>) {
        let mut local = self.local_values(key);
        local.dedup();
        let mut sent: HashSet<String> = HashSet::new();
        for value in local {
            if sent.insert(value.clone()) && values.send(value).await.is_err() {
                return;
            }
        }

        let (tx, mut rx) = mpsc::channel::<String>(32);
        let forward = async {
            while let Some(value) = rx.recv().await {
                if sent.insert(value.clone()) && values.send(value).await.is_err() {
                    break;
                }
            }
        };
        let search = async move {
            self.lookup(key_id(key), Some(key), Some(&tx)).await;
            drop(tx);
        };
        tokio::join!(search, forward);
    }
}

impl MessageHandler for DhtNode {
    fn handle(&self, request: &[u8]) -> Vec<u8> {
        self.handle_envelope(request).to_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::{AcceptAll, AddressValues};
    use orca_core::transport::mock::MemoryNetwork;

    async fn spawn_node(
        network: &Arc<MemoryNetwork>,
        seed: u8,
        validator: Arc<dyn RecordValidator>,
    ) -> (Arc<DhtNode>, orca_core::ListenerGuard) {
        let config = OverlayConfig {
            listen_addr: PeerAddress::new("mem:0"),
            ..Default::default()
        };
        let node = Arc::new(DhtNode::new(
            sha256(&[seed]),
            &config,
            Arc::new(network.transport()),
            validator,
        ));
        let guard = network
            .transport()
            .listen(&config.listen_addr, node.clone())
            .await
            .unwrap();
        node.set_address(guard.address().clone());
        (node, guard)
    }

    #[tokio::test]
    async fn test_ping_learns_both_sides() {
        let network = MemoryNetwork::new();
        let (a, _ga) = spawn_node(&network, 1, Arc::new(AcceptAll)).await;
        let (b, _gb) = spawn_node(&network, 2, Arc::new(AcceptAll)).await;

        let info = a.ping(&b.address()).await.unwrap();
        assert_eq!(info.node_id, *b.node_id());
        assert_eq!(a.peer_count(), 1);
        assert_eq!(b.peer_count(), 1);
    }

    #[tokio::test]
    async fn test_find_node_walks_the_network() {
        let network = MemoryNetwork::new();
        let mut nodes = Vec::new();
        for seed in 0..6u8 {
            nodes.push(spawn_node(&network, seed, Arc::new(AcceptAll)).await);
        }
        // Chain: each node only knows its predecessor
        for pair in nodes.windows(2) {
            pair[1].0.ping(&pair[0].0.address()).await.unwrap();
        }

        let last = &nodes[5].0;
        let target = *nodes[0].0.node_id();
        let found = last.find_node(target).await;
        assert!(found.iter().any(|n| n.node_id == target));
    }

    #[tokio::test]
    async fn test_store_rejected_by_validator() {
        let network = MemoryNetwork::new();
        let (a, _ga) = spawn_node(&network, 1, Arc::new(AcceptAll)).await;
        let (b, _gb) = spawn_node(&network, 2, Arc::new(AddressValues)).await;

        let b_info = a.ping(&b.address()).await.unwrap();
        let result = a.store_at(&b_info, "orca/market/x", "garbage").await;
        assert!(matches!(result, Err(Error::Validation(_))));
        assert!(b.local_values("orca/market/x").is_empty());

        a.store_at(&b_info, "orca/market/x", "10.0.0.1:80").await.unwrap();
        assert_eq!(b.local_values("orca/market/x"), vec!["10.0.0.1:80"]);
    }

    #[tokio::test]
    async fn test_unreachable_node_removed() {
        let network = MemoryNetwork::new();
        let (a, _ga) = spawn_node(&network, 1, Arc::new(AcceptAll)).await;
        let (b, _gb) = spawn_node(&network, 2, Arc::new(AcceptAll)).await;

        a.ping(&b.address()).await.unwrap();
        network.take_offline(&b.address());

        let found = a.find_node(*b.node_id()).await;
        assert!(found.is_empty());
        assert_eq!(a.peer_count(), 0);
    }

    #[test]
    fn test_garbage_request_gets_error_response() {
        let network = MemoryNetwork::new();
        let node = DhtNode::new(
            [1u8; 32],
            &OverlayConfig::default(),
            Arc::new(network.transport()),
            Arc::new(AcceptAll),
        );
        let response = Envelope::from_bytes(&node.handle(&[0xff, 0xff, 0xff])).unwrap();
        assert!(matches!(
            response.payload,
            Some(Payload::ErrorResponse(proto::ErrorResponse {
                code: error_codes::INVALID_MESSAGE,
                ..
            }))
        ));
    }
}
