//! Consistent-hashing token ring.
//!
//! The ring maps 64-bit tokens to node ids. Each node contributes
//! `virtual_nodes` tokens, derived by hashing `"{node_id}:{index}"` through
//! SHA-256 and taking the low 64 bits. Ownership of a vector id is the
//! clockwise walk from `hash(vector_id)`, collecting the first
//! `replication_factor` distinct nodes.
//!
//! Two rings built by applying the same ordered sequence of add/remove
//! operations hold identical sorted token lists, so every node computes the
//! same placement.

use lattice_core::{NodeId, VectorId};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};

/// Consistent-hashing ring with virtual nodes and replication.
#[derive(Debug, Clone)]
pub struct TokenRing {
    /// Token to owning node; sorted by construction.
    tokens: BTreeMap<u64, NodeId>,
    /// Tokens owned by each node.
    node_tokens: HashMap<NodeId, Vec<u64>>,
    /// Virtual tokens per physical node.
    virtual_nodes: usize,
    /// Distinct replicas per vector id.
    replication_factor: usize,
}

impl TokenRing {
    /// Creates an empty ring.
    pub fn new(virtual_nodes: usize, replication_factor: usize) -> Self {
        Self {
            tokens: BTreeMap::new(),
            node_tokens: HashMap::new(),
            virtual_nodes,
            replication_factor,
        }
    }

    /// Virtual tokens per node.
    pub fn virtual_nodes(&self) -> usize {
        self.virtual_nodes
    }

    /// Configured replication factor.
    pub fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    /// Adds a node and its virtual tokens. Idempotent.
    ///
    /// On the (astronomically unlikely) event that a token collides with one
    /// owned by a different node, the later inserter rehashes with an
    /// incremented `#n` suffix until a free slot is found.
    pub fn add_node(&mut self, node: &NodeId) {
        if self.node_tokens.contains_key(node) {
            return;
        }

        let mut owned = Vec::with_capacity(self.virtual_nodes);
        for i in 0..self.virtual_nodes {
            let mut salt = 0u32;
            let mut token = hash_key(&format!("{}:{}", node, i));
            while self.tokens.contains_key(&token) {
                salt += 1;
                token = hash_key(&format!("{}:{}#{}", node, i, salt));
            }
            self.tokens.insert(token, node.clone());
            owned.push(token);
        }

        self.node_tokens.insert(node.clone(), owned);
    }

    /// Removes a node and all of its tokens. Idempotent.
    pub fn remove_node(&mut self, node: &NodeId) {
        let owned = match self.node_tokens.remove(node) {
            Some(tokens) => tokens,
            None => return,
        };
        for token in owned {
            self.tokens.remove(&token);
        }
    }

    /// Returns the ordered replica list for a vector id.
    ///
    /// Walks clockwise from the first token at or after `hash(id)`,
    /// appending each distinct node until `replication_factor` owners are
    /// collected or the ring is exhausted. Empty ring yields an empty list.
    pub fn owners(&self, id: &VectorId) -> Vec<NodeId> {
        if self.tokens.is_empty() {
            return Vec::new();
        }

        let hash = hash_key(id.as_str());
        let mut result: Vec<NodeId> = Vec::with_capacity(self.replication_factor);

        let walk = self
            .tokens
            .range(hash..)
            .chain(self.tokens.range(..hash))
            .map(|(_, node)| node);

        for node in walk {
            if result.len() >= self.replication_factor {
                break;
            }
            if !result.contains(node) {
                result.push(node.clone());
            }
        }

        result
    }

    /// Returns the primary owner for a vector id, if the ring is non-empty.
    pub fn primary(&self, id: &VectorId) -> Option<NodeId> {
        self.owners(id).into_iter().next()
    }

    /// Returns true if the node has tokens on the ring.
    pub fn contains(&self, node: &NodeId) -> bool {
        self.node_tokens.contains_key(node)
    }

    /// All nodes currently on the ring.
    pub fn all_nodes(&self) -> Vec<NodeId> {
        self.node_tokens.keys().cloned().collect()
    }

    /// Number of nodes on the ring.
    pub fn node_count(&self) -> usize {
        self.node_tokens.len()
    }

    /// Returns true if the ring has no nodes.
    pub fn is_empty(&self) -> bool {
        self.node_tokens.is_empty()
    }

    /// Tokens owned by a node; empty if the node is unknown.
    pub fn tokens_for(&self, node: &NodeId) -> Vec<u64> {
        self.node_tokens.get(node).cloned().unwrap_or_default()
    }

    /// Token count per node.
    pub fn distribution(&self) -> HashMap<NodeId, usize> {
        self.node_tokens
            .iter()
            .map(|(node, tokens)| (node.clone(), tokens.len()))
            .collect()
    }

    /// The full sorted token list.
    pub fn sorted_tokens(&self) -> Vec<u64> {
        self.tokens.keys().copied().collect()
    }

    /// Computes, per destination node, the vector ids it must receive when
    /// moving from `old` to `self`.
    ///
    /// An id is emitted to every new owner that was not an owner under the
    /// old ring.
    pub fn diff_moves(
        &self,
        old: &TokenRing,
        ids: &[VectorId],
    ) -> HashMap<NodeId, Vec<VectorId>> {
        let mut moves: HashMap<NodeId, Vec<VectorId>> = HashMap::new();

        for id in ids {
            let old_owners = old.owners(id);
            for new_owner in self.owners(id) {
                if !old_owners.contains(&new_owner) {
                    moves.entry(new_owner).or_default().push(id.clone());
                }
            }
        }

        moves
    }
}

/// Hashes a key to a ring position: low 64 bits of SHA-256, little-endian.
fn hash_key(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}
