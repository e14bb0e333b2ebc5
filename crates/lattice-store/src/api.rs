//! REST wire models.
//!
//! JSON request/response shapes for the node's HTTP surface. The HTTP
//! server itself lives outside this crate; these types define the contract
//! it serves. Field names are camelCase on the wire.

use crate::coordinator::{OperationStatus, RebalanceOperation};
use crate::store::StoreStats;
use lattice_core::{
    DistanceMetric, LatticeError, Metadata, MetadataFilter, NodeId, SearchParams, SearchResult,
    VectorId,
};
use serde::{Deserialize, Serialize};

/// `PUT /vectors` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutVectorRequest {
    pub id: VectorId,
    pub values: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

/// `201` response to a vector write.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutVectorResponse {
    pub id: VectorId,
}

/// `GET /vectors/{id}` response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetVectorResponse {
    pub id: VectorId,
    pub values: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

/// `POST /search` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    pub query: Vec<f32>,
    pub k: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<MetadataFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<SearchParams>,
}

/// One entry of a `POST /search` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponseItem {
    pub id: VectorId,
    pub distance: f32,
    pub score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl From<SearchResult> for SearchResponseItem {
    fn from(result: SearchResult) -> Self {
        let (vector, metadata) = match result.vector {
            Some(v) => (Some(v.values), v.metadata),
            None => (None, None),
        };
        Self {
            id: result.id,
            distance: result.distance,
            score: result.score,
            vector,
            metadata,
        }
    }
}

/// Cluster membership actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterAction {
    Join,
    Leave,
}

/// `POST /cluster` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRequest {
    pub action: ClusterAction,
    pub node_id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// `200` response to a cluster action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterResponse {
    pub operation_id: String,
}

/// Rebalance summary embedded in `GET /stats`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebalanceSummary {
    pub id: String,
    pub status: String,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
}

impl From<&RebalanceOperation> for RebalanceSummary {
    fn from(op: &RebalanceOperation) -> Self {
        let status = match op.status {
            OperationStatus::Pending => "pending",
            OperationStatus::Running => "running",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
        };
        Self {
            id: op.id.clone(),
            status: status.to_string(),
            total_tasks: op.total_tasks,
            completed_tasks: op.completed_tasks,
            failed_tasks: op.failed_tasks,
        }
    }
}

/// `GET /stats` response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub node_id: NodeId,
    pub dimensions: usize,
    pub distance_function: DistanceMetric,
    pub total_vectors: usize,
    pub local_vectors: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rebalance: Option<RebalanceSummary>,
}

impl StatsResponse {
    /// Builds the stats payload from store stats and an optional current
    /// rebalance operation.
    pub fn new(stats: StoreStats, rebalance: Option<&RebalanceOperation>) -> Self {
        Self {
            node_id: stats.node_id,
            dimensions: stats.dimensions,
            distance_function: stats.distance_function,
            total_vectors: stats.total_vectors,
            local_vectors: stats.local_vectors,
            rebalance: rebalance.map(RebalanceSummary::from),
        }
    }
}

/// Error payload returned with non-2xx statuses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
    pub kind: String,
}

impl From<&LatticeError> for ErrorResponse {
    fn from(err: &LatticeError) -> Self {
        let kind = match err {
            LatticeError::DimensionMismatch { .. } => "dimension_mismatch",
            LatticeError::SchemaViolation(_) => "schema_violation",
            LatticeError::NotFound(_) => "not_found",
            LatticeError::NotOwner(_) => "not_owner",
            LatticeError::TransferFailed(_) => "transfer_failed",
            LatticeError::Cancelled => "cancelled",
            LatticeError::UnderReplicated { .. } => "under_replicated",
            LatticeError::LogSubmitFailed(_) => "log_submit_failed",
            LatticeError::UnsupportedMetric(_) => "unsupported_metric",
            LatticeError::InvalidSparseVector(_) => "invalid_sparse_vector",
            LatticeError::InvalidQuery(_) => "invalid_query",
            LatticeError::InvalidConfig(_) => "invalid_config",
        };
        Self {
            error: err.to_string(),
            kind: kind.to_string(),
        }
    }
}
