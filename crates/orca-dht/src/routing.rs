//! Kademlia routing table implementation

use orca_core::{proto, NodeId, PeerAddress};
use std::collections::VecDeque;

/// XOR distance between two node IDs
pub fn xor_distance(a: &NodeId, b: &NodeId) -> NodeId {
    let mut result = [0u8; 32];
    for i in 0..32 {
        result[i] = a[i] ^ b[i];
    }
    result
}

/// Find the index of the most significant bit that differs
pub fn bucket_index(distance: &NodeId) -> usize {
    for (i, byte) in distance.iter().enumerate() {
        if *byte != 0 {
            let leading = byte.leading_zeros() as usize;
            return 255 - (i * 8 + leading);
        }
    }
    0
}

/// Information about a node in the routing table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub address: PeerAddress,
    pub last_seen: u64,
}

impl NodeInfo {
    pub fn new(node_id: NodeId, address: PeerAddress) -> Self {
        Self {
            node_id,
            address,
            last_seen: orca_core::unix_now(),
        }
    }

    /// Convert from the wire form, rejecting malformed ids and addresses
    pub fn from_proto(info: &proto::NodeInfo) -> Option<Self> {
        let node_id: NodeId = info.node_id.as_slice().try_into().ok()?;
        let address: PeerAddress = info.address.parse().ok()?;
        Some(Self::new(node_id, address))
    }

    pub fn to_proto(&self) -> proto::NodeInfo {
        proto::NodeInfo {
            node_id: self.node_id.to_vec(),
            address: self.address.as_str().to_string(),
        }
    }
}

/// A k-bucket in the routing table
#[derive(Debug, Clone)]
pub struct KBucket {
    /// Maximum number of nodes in this bucket
    k: usize,
    /// Nodes in this bucket, ordered by last seen (most recent at back)
    nodes: VecDeque<NodeInfo>,
}

impl KBucket {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            nodes: VecDeque::with_capacity(k),
        }
    }

    /// Add or update a node in the bucket
    /// Returns true if the node was added/updated, false if bucket is full
    pub fn upsert(&mut self, node: NodeInfo) -> bool {
        // Check if node already exists
        if let Some(pos) = self.nodes.iter().position(|n| n.node_id == node.node_id) {
            // Move to back (most recently seen)
            self.nodes.remove(pos);
            self.nodes.push_back(node);
            return true;
        }

        // Add new node if space available
        if self.nodes.len() < self.k {
            self.nodes.push_back(node);
            return true;
        }

        false
    }

    /// Remove a node, returning whether it was present
    pub fn remove(&mut self, node_id: &NodeId) -> bool {
        match self.nodes.iter().position(|n| &n.node_id == node_id) {
            Some(pos) => {
                self.nodes.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Get all nodes in the bucket
    pub fn nodes(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.iter()
    }

    /// Least recently seen node
    pub fn oldest(&self) -> Option<&NodeInfo> {
        self.nodes.front()
    }

    /// Check if bucket is full
    pub fn is_full(&self) -> bool {
        self.nodes.len() >= self.k
    }
}

/// Kademlia routing table
pub struct RoutingTable {
    /// Our node ID
    local_id: NodeId,
    /// K-buckets (256 buckets for 256-bit IDs)
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId, k: usize) -> Self {
        Self {
            local_id,
            buckets: (0..256).map(|_| KBucket::new(k)).collect(),
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// Add or update a node in the routing table
    ///
    /// Our own id is never stored. When the target bucket is full the node is
    /// dropped and the bucket's least recently seen entry is returned so the
    /// caller can probe it.
    pub fn upsert(&mut self, node: NodeInfo) -> Option<NodeInfo> {
        if node.node_id == self.local_id {
            return None;
        }
        let distance = xor_distance(&self.local_id, &node.node_id);
        let bucket = &mut self.buckets[bucket_index(&distance)];
        if bucket.upsert(node) {
            None
        } else {
            bucket.oldest().cloned()
        }
    }

    /// Remove a node that stopped answering
    pub fn remove(&mut self, node_id: &NodeId) -> bool {
        let distance = xor_distance(&self.local_id, node_id);
        self.buckets[bucket_index(&distance)].remove(node_id)
    }

    /// Find the `count` closest nodes to a target
    pub fn closest_nodes(&self, target: &NodeId, count: usize) -> Vec<NodeInfo> {
        let mut all_nodes: Vec<_> = self
            .buckets
            .iter()
            .flat_map(|b| b.nodes())
            .cloned()
            .collect();

        // Sort by distance to target
        all_nodes.sort_by(|a, b| {
            let dist_a = xor_distance(&a.node_id, target);
            let dist_b = xor_distance(&b.node_id, target);
            dist_a.cmp(&dist_b)
        });

        all_nodes.truncate(count);
        all_nodes
    }

    /// Whether a node with this address is already known
    pub fn contains_address(&self, address: &PeerAddress) -> bool {
        self.buckets
            .iter()
            .flat_map(|b| b.nodes())
            .any(|n| &n.address == address)
    }

    /// Number of known nodes
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.nodes.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
