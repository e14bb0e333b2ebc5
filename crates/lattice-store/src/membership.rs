//! Cluster membership and churn debouncing.
//!
//! The membership service records join/leave events and coalesces rapid
//! churn behind a stabilization window: a rebalance trigger fires only once
//! the cluster has been quiet for the whole window, and it carries every
//! event observed since the last trigger. A failure detector unregisters
//! nodes whose heartbeats go stale.
//!
//! Watermark comparisons use the monotone clock and `>=`, so an event
//! landing exactly on a tick boundary cannot slip past a trigger check.

use crate::coordinator::RebalanceCoordinator;
use lattice_core::{now_nanos, NodeId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Kind of a cluster membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    NodeJoined,
    NodeLeft,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::NodeJoined => write!(f, "node_joined"),
            ChangeKind::NodeLeft => write!(f, "node_left"),
        }
    }
}

/// A single membership change observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterChangeEvent {
    pub kind: ChangeKind,
    pub node_id: NodeId,
    /// Wall-clock nanoseconds since epoch.
    pub timestamp: i64,
}

impl ClusterChangeEvent {
    /// Creates an event stamped with the current time.
    pub fn new(kind: ChangeKind, node_id: NodeId) -> Self {
        Self {
            kind,
            node_id,
            timestamp: now_nanos(),
        }
    }
}

/// Liveness status of a cluster node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Unknown,
    Joining,
    Active,
    Leaving,
    Dead,
}

/// What the membership service knows about one node.
#[derive(Debug, Clone)]
pub struct MemberInfo {
    pub id: NodeId,
    pub address: String,
    pub status: NodeStatus,
    /// Wall-clock nanoseconds since epoch.
    pub join_time: i64,
    /// Monotone instant of the last heartbeat.
    pub last_heartbeat: Instant,
}

/// Tuning for the membership service.
#[derive(Debug, Clone)]
pub struct MembershipConfig {
    /// Quiet period required before a rebalance trigger fires.
    pub stabilization_window: Duration,
    /// Heartbeat age after which a node is considered failed.
    pub liveness_window: Duration,
    /// Failure-detector tick interval.
    pub failure_check_interval: Duration,
    /// Stabilization-checker tick interval.
    pub stabilization_check_interval: Duration,
    /// Bound on the pending event queue; the oldest event is dropped on
    /// overflow.
    pub max_pending_events: usize,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            stabilization_window: Duration::from_secs(30),
            liveness_window: Duration::from_secs(30),
            failure_check_interval: Duration::from_secs(10),
            stabilization_check_interval: Duration::from_secs(5),
            max_pending_events: 100,
        }
    }
}

struct MembershipState {
    nodes: std::collections::HashMap<NodeId, MemberInfo>,
    pending: Vec<ClusterChangeEvent>,
    last_event: Instant,
}

/// Tracks cluster membership and emits debounced rebalance triggers.
pub struct MembershipService {
    /// Self-handle for the background loops.
    me: Weak<MembershipService>,
    config: MembershipConfig,
    state: Mutex<MembershipState>,
    shutdown: watch::Sender<bool>,
}

impl MembershipService {
    /// Creates a new membership service.
    pub fn new(config: MembershipConfig) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            state: Mutex::new(MembershipState {
                nodes: std::collections::HashMap::new(),
                pending: Vec::new(),
                last_event: Instant::now(),
            }),
            shutdown,
        })
    }

    /// Service configuration.
    pub fn config(&self) -> &MembershipConfig {
        &self.config
    }

    /// Registers a node.
    ///
    /// First registration marks it `joining` and enqueues a `node_joined`
    /// event; re-registration refreshes the heartbeat and promotes the node
    /// to `active`.
    pub fn register(&self, node_id: NodeId, address: impl Into<String>) {
        let mut state = self.state.lock();
        let now = Instant::now();

        match state.nodes.get_mut(&node_id) {
            Some(info) => {
                info.status = NodeStatus::Active;
                info.last_heartbeat = now;
                debug!(node_id = %node_id, "node re-registered, now active");
            }
            None => {
                state.nodes.insert(
                    node_id.clone(),
                    MemberInfo {
                        id: node_id.clone(),
                        address: address.into(),
                        status: NodeStatus::Joining,
                        join_time: now_nanos(),
                        last_heartbeat: now,
                    },
                );
                info!(node_id = %node_id, "node joined");
                Self::enqueue(
                    &mut state,
                    self.config.max_pending_events,
                    ClusterChangeEvent::new(ChangeKind::NodeJoined, node_id),
                    now,
                );
            }
        }
    }

    /// Marks a node as leaving and enqueues a `node_left` event.
    ///
    /// Unknown nodes are ignored.
    pub fn unregister(&self, node_id: &NodeId) {
        let mut state = self.state.lock();
        let Some(info) = state.nodes.get_mut(node_id) else {
            return;
        };
        if info.status == NodeStatus::Leaving {
            return;
        }
        info.status = NodeStatus::Leaving;
        info!(node_id = %node_id, "node leaving");
        Self::enqueue(
            &mut state,
            self.config.max_pending_events,
            ClusterChangeEvent::new(ChangeKind::NodeLeft, node_id.clone()),
            Instant::now(),
        );
    }

    /// Refreshes a node's heartbeat. Unknown nodes are ignored.
    pub fn heartbeat(&self, node_id: &NodeId) {
        let mut state = self.state.lock();
        if let Some(info) = state.nodes.get_mut(node_id) {
            info.last_heartbeat = Instant::now();
        }
    }

    fn enqueue(
        state: &mut MembershipState,
        max_pending: usize,
        event: ClusterChangeEvent,
        now: Instant,
    ) {
        if state.pending.len() >= max_pending {
            warn!("pending membership events at capacity, dropping oldest");
            state.pending.remove(0);
        }
        state.pending.push(event);
        state.last_event = now;
    }

    /// Nodes currently `joining` or `active`.
    pub fn active_nodes(&self) -> Vec<MemberInfo> {
        self.state
            .lock()
            .nodes
            .values()
            .filter(|n| matches!(n.status, NodeStatus::Active | NodeStatus::Joining))
            .cloned()
            .collect()
    }

    /// Total known nodes, regardless of status.
    pub fn node_count(&self) -> usize {
        self.state.lock().nodes.len()
    }

    /// Number of events waiting for the next trigger.
    pub fn pending_event_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Drains and returns the pending batch when the cluster has been quiet
    /// for the full stabilization window; `None` otherwise.
    pub fn check_stabilization(&self) -> Option<Vec<ClusterChangeEvent>> {
        let mut state = self.state.lock();
        if state.pending.is_empty() {
            return None;
        }
        if Instant::now().duration_since(state.last_event) >= self.config.stabilization_window {
            let events = std::mem::take(&mut state.pending);
            info!(events = events.len(), "cluster stabilized, emitting rebalance trigger");
            return Some(events);
        }
        None
    }

    /// Unregisters nodes whose heartbeats exceed the liveness window.
    ///
    /// Returns the ids that were expired.
    pub fn check_failures(&self) -> Vec<NodeId> {
        let stale: Vec<NodeId> = {
            let state = self.state.lock();
            let now = Instant::now();
            state
                .nodes
                .values()
                .filter(|n| !matches!(n.status, NodeStatus::Leaving | NodeStatus::Dead))
                .filter(|n| now.duration_since(n.last_heartbeat) >= self.config.liveness_window)
                .map(|n| n.id.clone())
                .collect()
        };

        for node_id in &stale {
            warn!(node_id = %node_id, "heartbeat expired, unregistering node");
            self.unregister(node_id);
        }
        stale
    }

    /// Starts the failure-detector and stabilization-checker loops.
    ///
    /// Both loops observe the shutdown signal between ticks; an in-flight
    /// trigger hand-off runs to completion. The loops hold only a weak
    /// handle and stop when the service is dropped.
    pub fn start(&self, coordinator: Arc<RebalanceCoordinator>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(2);

        let weak = self.me.clone();
        let interval = self.config.failure_check_interval;
        let mut shutdown_rx = self.shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let Some(service) = weak.upgrade() else { break };
                        service.check_failures();
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        }));

        let weak = self.me.clone();
        let interval = self.config.stabilization_check_interval;
        let mut shutdown_rx = self.shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let Some(service) = weak.upgrade() else { break };
                        if let Some(events) = service.check_stabilization() {
                            coordinator.trigger_rebalance(events).await;
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        }));

        handles
    }

    /// Signals the background loops to stop after their current tick.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl fmt::Debug for MembershipService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MembershipService")
            .field("nodes", &state.nodes.len())
            .field("pending_events", &state.pending.len())
            .finish()
    }
}
