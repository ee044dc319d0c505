//! Ambient REST surface for a DuxNet node process.
//!
//! Exposes health/status plus a minimal escrow/task/governance surface
//! over the in-process components the orchestrator (`duxnet-node`)
//! wires up. This is scaffolding, not a specified wire protocol: error
//! bodies and route shapes are deliberately plain and may change
//! without a version bump.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use duxnet_core::{DisputeId, DuxError, EscrowId, NodeId, ProposalId, TaskId, WalletId};
use duxnet_escrow::{DisputeResolver, EscrowEngine};
use duxnet_governance::GovernanceEngine;
use duxnet_registry::NodeRegistry;
use duxnet_tasks::{ExecutionSandbox, Task, TaskScheduler};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::info;

/// The component handles a REST handler is allowed to reach. Built by
/// `duxnet-node` and handed to [`start_servers`]; none of these types
/// are owned by this crate.
#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<NodeRegistry>,
    pub escrow: Arc<EscrowEngine>,
    pub disputes: Arc<DisputeResolver>,
    pub governance: Arc<GovernanceEngine>,
    pub scheduler: Arc<TaskScheduler>,
    pub sandbox: Arc<ExecutionSandbox>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct StatusResponse {
    pending_tasks: usize,
    assigned_tasks: u64,
    failed_assignments: u64,
    registered_nodes: usize,
}

struct ApiError(DuxError);

impl From<DuxError> for ApiError {
    fn from(e: DuxError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            DuxError::Validation(_) => StatusCode::BAD_REQUEST,
            DuxError::State(_) => StatusCode::CONFLICT,
            DuxError::Auth(_) => StatusCode::UNAUTHORIZED,
            DuxError::Resource(_) => StatusCode::SERVICE_UNAVAILABLE,
            DuxError::External(_) => StatusCode::BAD_GATEWAY,
            DuxError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

pub async fn start_servers(listen_addr: &str, state: ApiState) -> Result<()> {
    let addr: SocketAddr = listen_addr.parse()?;
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("REST API listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/nodes", get(list_nodes))
        .route("/nodes/:node_id", get(get_node))
        .route("/tasks", post(submit_task))
        .route("/tasks/:task_id", post(cancel_task))
        .route("/escrows/:escrow_id", get(get_escrow))
        .route("/escrows/:escrow_id/release", post(release_escrow))
        .route("/escrows/:escrow_id/refund", post(refund_escrow))
        .route("/disputes", post(create_dispute))
        .route("/disputes/:dispute_id", get(get_dispute))
        .route("/disputes/:dispute_id/evidence", post(add_dispute_evidence))
        .route("/disputes/:dispute_id/reject", post(reject_dispute))
        .route("/governance/proposals/:proposal_id", get(get_proposal))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let metrics = state.scheduler.metrics();
    Json(StatusResponse {
        pending_tasks: state.scheduler.pending_count(),
        assigned_tasks: metrics.assigned_tasks,
        failed_assignments: metrics.failed_assignments,
        registered_nodes: state.registry.list_all().len(),
    })
}

async fn list_nodes(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "nodes": state.registry.list_all() }))
}

async fn get_node(State(state): State<ApiState>, Path(node_id): Path<NodeId>) -> Result<Json<serde_json::Value>, ApiError> {
    let node = state.registry.get(node_id).ok_or_else(|| DuxError::validation("unknown node_id"))?;
    Ok(Json(serde_json::json!({ "node": node })))
}

#[derive(Deserialize)]
struct TaskSubmission {
    #[serde(flatten)]
    task: Task,
}

#[derive(Serialize)]
struct TaskSubmissionResponse {
    task_id: TaskId,
}

async fn submit_task(
    State(state): State<ApiState>,
    Json(req): Json<TaskSubmission>,
) -> Result<Json<TaskSubmissionResponse>, ApiError> {
    let task_id = state.scheduler.submit(req.task)?;
    Ok(Json(TaskSubmissionResponse { task_id }))
}

async fn cancel_task(State(state): State<ApiState>, Path(task_id): Path<TaskId>) -> Result<Json<serde_json::Value>, ApiError> {
    let status = state.scheduler.cancel(task_id)?;
    // Removing a still-pending task from its queue needs nothing more;
    // an assigned/running one also needs its sandbox process killed.
    state.sandbox.cancel(task_id).await;
    Ok(Json(serde_json::json!({ "status": status })))
}

async fn get_escrow(State(state): State<ApiState>, Path(escrow_id): Path<EscrowId>) -> Result<Json<serde_json::Value>, ApiError> {
    let escrow = state.escrow.get(escrow_id)?;
    Ok(Json(serde_json::json!({ "escrow": escrow })))
}

#[derive(Deserialize)]
struct ReleaseRequest {
    result_hash: String,
    provider_signature: String,
    timestamp: i64,
}

async fn release_escrow(
    State(state): State<ApiState>,
    Path(escrow_id): Path<EscrowId>,
    Json(req): Json<ReleaseRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let now_ts = chrono::Utc::now().timestamp();
    let escrow = state
        .escrow
        .release(escrow_id, req.result_hash, req.provider_signature, req.timestamp, now_ts)
        .await?;
    Ok(Json(serde_json::json!({ "escrow": escrow })))
}

#[derive(Deserialize)]
struct RefundRequest {
    reason: String,
}

async fn refund_escrow(
    State(state): State<ApiState>,
    Path(escrow_id): Path<EscrowId>,
    Json(req): Json<RefundRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let escrow = state.escrow.refund(escrow_id, req.reason).await?;
    Ok(Json(serde_json::json!({ "escrow": escrow })))
}

#[derive(Deserialize)]
struct CreateDisputeRequest {
    escrow_id: EscrowId,
    initiator_wallet_id: WalletId,
    reason: String,
    evidence: Option<String>,
}

async fn create_dispute(
    State(state): State<ApiState>,
    Json(req): Json<CreateDisputeRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let dispute = state
        .disputes
        .create_dispute(req.escrow_id, req.initiator_wallet_id, req.reason, req.evidence)?;
    Ok(Json(serde_json::json!({ "dispute": dispute })))
}

async fn get_dispute(
    State(state): State<ApiState>,
    Path(dispute_id): Path<DisputeId>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let dispute = state.disputes.get(dispute_id)?;
    Ok(Json(serde_json::json!({ "dispute": dispute })))
}

#[derive(Deserialize)]
struct EvidenceRequest {
    wallet_id: WalletId,
    evidence: String,
}

async fn add_dispute_evidence(
    State(state): State<ApiState>,
    Path(dispute_id): Path<DisputeId>,
    Json(req): Json<EvidenceRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.disputes.add_evidence(dispute_id, req.wallet_id, req.evidence)?;
    Ok(Json(serde_json::json!({ "status": "recorded" })))
}

async fn reject_dispute(
    State(state): State<ApiState>,
    Path(dispute_id): Path<DisputeId>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let dispute = state.disputes.reject_dispute(dispute_id)?;
    Ok(Json(serde_json::json!({ "dispute": dispute })))
}

async fn get_proposal(
    State(state): State<ApiState>,
    Path(proposal_id): Path<ProposalId>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let proposal = state.governance.get(proposal_id)?;
    let votes = state.governance.votes_for(proposal_id);
    Ok(Json(serde_json::json!({ "proposal": proposal, "votes": votes })))
}
