//! External replicated-log contract.
//!
//! The cluster assumes a replicated-log service that accepts command blobs,
//! totally orders them across all nodes, and notifies subscribers of newly
//! committed entries in order. Its implementation (consensus, leader
//! election) is out of scope; this module defines the contract the core
//! submits to, plus an in-memory reference used by tests and single-process
//! deployments.

use crate::membership::ClusterChangeEvent;
use lattice_core::{NodeId, VectorId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

/// Final ownership of one vector id after a rebalance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnershipEntry {
    pub vector_id: VectorId,
    pub owners: Vec<NodeId>,
}

/// Metadata commit swapping the cluster from one ring to the next.
///
/// Appliers rebuild the new ring by adding `new_nodes` in order; ring
/// construction is deterministic, so every node derives the same tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RingCommit {
    pub operation_id: String,
    pub old_nodes: Vec<NodeId>,
    pub new_nodes: Vec<NodeId>,
    pub virtual_nodes: usize,
    pub replication_factor: usize,
    /// Final ownership for the ids that moved.
    pub ownership: Vec<OwnershipEntry>,
}

/// Commands the core submits to the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogCommand {
    /// A membership change observation, recorded for replay.
    Membership(ClusterChangeEvent),
    /// A ring/ownership swap, applied atomically on every node.
    RingCommit(RingCommit),
}

/// An entry the log has committed, delivered to subscribers in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommittedEntry {
    /// Position in the total order, starting at 0.
    pub index: u64,
    pub command: LogCommand,
}

/// Submission failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LogError {
    /// The service lost its leader; the caller should retry with backoff.
    #[error("leader lost")]
    LeaderLost,
    /// The log is shut down and accepts no further commands.
    #[error("log closed")]
    Closed,
}

/// The replicated-log service contract.
pub trait ReplicatedLog: Send + Sync {
    /// Appends a command to the total order, returning its index.
    fn submit(&self, command: LogCommand) -> Result<u64, LogError>;

    /// Subscribes to committed entries, delivered in log order.
    fn subscribe(&self) -> broadcast::Receiver<CommittedEntry>;
}

/// In-memory single-process log: total order under a mutex, fan-out via a
/// broadcast channel.
pub struct InMemoryLog {
    entries: Mutex<Vec<CommittedEntry>>,
    committed: broadcast::Sender<CommittedEntry>,
}

impl InMemoryLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        let (committed, _) = broadcast::channel(1024);
        Self {
            entries: Mutex::new(Vec::new()),
            committed,
        }
    }

    /// Number of committed entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if nothing has been committed.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Snapshot of all committed entries, in order.
    pub fn entries(&self) -> Vec<CommittedEntry> {
        self.entries.lock().clone()
    }
}

impl Default for InMemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicatedLog for InMemoryLog {
    fn submit(&self, command: LogCommand) -> Result<u64, LogError> {
        let mut entries = self.entries.lock();
        let index = entries.len() as u64;
        let entry = CommittedEntry { index, command };
        entries.push(entry.clone());
        // No subscribers is fine; the entry is still committed.
        let _ = self.committed.send(entry);
        Ok(index)
    }

    fn subscribe(&self) -> broadcast::Receiver<CommittedEntry> {
        self.committed.subscribe()
    }
}
