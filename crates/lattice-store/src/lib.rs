//! # Lattice Store
//!
//! Distributed in-memory vector store. Vectors live under stable string
//! ids, are placed on cluster nodes by a consistent-hashing token ring with
//! a configurable replication factor, and are served by a node-local store
//! answering k-nearest-neighbor queries with metadata filtering.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                           one node                             │
//! │                                                                │
//! │  MembershipService ──(debounced events)──► RebalanceCoordinator│
//! │         │                                        │             │
//! │         │ heartbeats                   diff old/new TokenRing  │
//! │         ▼                                        │             │
//! │    node table                                    ▼             │
//! │                                          TransferService       │
//! │                                        (priority queue, retry) │
//! │                                                  │             │
//! │   VectorStore ◄──(receive_vectors)── TransferExecutor ─► peers │
//! │   (RwLock map + LinearIndex)                                   │
//! │                                                                │
//! │   ring swaps apply from the ReplicatedLog, in log order        │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The modules mirror that picture: [`ring`] places ids, [`store`] /
//! [`collection`] / [`index`] serve reads and writes, [`membership`]
//! debounces churn, [`transfer`] moves data under resource limits,
//! [`coordinator`] plans rebalances and commits ring swaps through
//! [`repl_log`]. [`query`] and [`api`] are the client-facing shapes;
//! [`config`], [`logging`], and [`metrics`] carry the operational side.

pub mod api;
pub mod collection;
pub mod config;
pub mod coordinator;
pub mod distance;
pub mod index;
pub mod logging;
pub mod membership;
pub mod metrics;
pub mod query;
pub mod repl_log;
pub mod ring;
pub mod store;
pub mod transfer;

// Re-exports
pub use collection::Collection;
pub use config::{ConfigError, NodeConfig};
pub use coordinator::{
    OperationStatus, RebalanceConfig, RebalanceCoordinator, RebalanceOperation,
};
pub use index::{LinearIndex, VectorIndex};
pub use membership::{
    ChangeKind, ClusterChangeEvent, MemberInfo, MembershipConfig, MembershipService, NodeStatus,
};
pub use query::{QueryProcessor, QueryRequest, QueryResponse, RecommendParams, ScrollParams};
pub use repl_log::{
    CommittedEntry, InMemoryLog, LogCommand, LogError, OwnershipEntry, ReplicatedLog, RingCommit,
};
pub use ring::TokenRing;
pub use store::{StoreConfig, StoreStats, VectorStore};
pub use transfer::{
    AdaptiveThrottle, InMemoryExecutor, RetryConfig, SubTask, TaskEvent, TaskMetrics, TaskState,
    TransferExecutor, TransferService, TransferTask,
};
