//! Inbound HTTP surface: the agents' completion callback plus the operator
//! calls that start, stop, inspect and delete runs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tboard_core::types::{CabinetId, DeviceId, JobId, RunId, RunMetadata, ShardPlan, TestRun};
use tboard_store::StoreError;
use tboard_wire::EndTboardRequest;

use crate::agent::ShardTransportError;
use crate::cancel::CancelOutcome;
use crate::coordinator::Coordinator;
use crate::deletion::{DeletionPipeline, EnqueueOutcome, LedgerSnapshot};
use crate::dispatch::{DispatchOutcome, DispatchRequest};
use crate::error::{CancelError, DeletionError, DispatchError, IngestError};

#[derive(Clone)]
pub struct ApiState {
    pub coordinator: Coordinator,
    pub deletion: DeletionPipeline,
}

type SharedState = Arc<ApiState>;

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/tboards/", post(dispatch_handler))
        .route("/tboards/{run_id}/", get(run_handler).delete(cancel_handler))
        .route("/tboards/{run_id}/deletion/", post(deletion_handler))
        .route("/deletions/", get(ledger_handler))
        .route("/end_tboard/{run_id}/", put(end_tboard_handler))
        .with_state(Arc::new(state))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchBody {
    pub devices: BTreeSet<DeviceId>,
    pub jobs: Vec<JobId>,
    #[serde(default = "one")]
    pub repeat_count: u32,
    #[serde(default)]
    pub metadata: RunMetadata,
}

fn one() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchReply {
    pub run_id: RunId,
    pub shards: ShardPlan,
    /// Cabinets that did not accept their shard, with the reason.
    #[serde(default)]
    pub failed: BTreeMap<CabinetId, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelReply {
    pub stopped: Vec<CabinetId>,
    #[serde(default)]
    pub failed: BTreeMap<CabinetId, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndTboardReply {
    pub applied: Vec<CabinetId>,
    pub ignored: Vec<CabinetId>,
    pub released: usize,
    pub finalized: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletionReply {
    pub queued: bool,
    pub retried: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, err: impl ToString) -> Self {
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::warn!(status = %self.status, error = %self.message, "request failed");
        }
        (self.status, Json(ErrorBody { error: self.message })).into_response()
    }
}

fn store_status(err: &StoreError) -> StatusCode {
    match err {
        StoreError::RunNotFound(_) | StoreError::ResultNotFound(_) => StatusCode::NOT_FOUND,
        StoreError::ResultImmutable(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::new(store_status(&err), err)
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        let status = match &err {
            DispatchError::Validation(_) => StatusCode::BAD_REQUEST,
            DispatchError::AllShardsFailed { .. } => StatusCode::BAD_GATEWAY,
            DispatchError::Store(e) => store_status(e),
        };
        Self::new(status, err)
    }
}

impl From<CancelError> for ApiError {
    fn from(err: CancelError) -> Self {
        let CancelError::Store(e) = &err;
        Self::new(store_status(e), err)
    }
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        let status = match &err {
            IngestError::Immutable(_) => StatusCode::CONFLICT,
            IngestError::Convert(_) => StatusCode::BAD_REQUEST,
            IngestError::Store(e) => store_status(e),
        };
        Self::new(status, err)
    }
}

impl From<DeletionError> for ApiError {
    fn from(err: DeletionError) -> Self {
        let status = match &err {
            DeletionError::Store(e) => store_status(e),
            DeletionError::WorkerStopped => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err)
    }
}

fn reasons(failed: &BTreeMap<CabinetId, ShardTransportError>) -> BTreeMap<CabinetId, String> {
    failed
        .iter()
        .map(|(c, e)| (c.clone(), e.to_string()))
        .collect()
}

async fn dispatch_handler(
    State(state): State<SharedState>,
    Json(body): Json<DispatchBody>,
) -> Result<Json<DispatchReply>, ApiError> {
    let outcome = state
        .coordinator
        .dispatch(DispatchRequest {
            devices: body.devices,
            jobs: body.jobs,
            repeat_count: body.repeat_count,
            metadata: body.metadata,
        })
        .await?;
    let failed = match &outcome {
        DispatchOutcome::Accepted(_) => BTreeMap::new(),
        DispatchOutcome::Partial { failed, .. } => reasons(failed),
    };
    let run = outcome.run();
    Ok(Json(DispatchReply {
        run_id: run.run_id,
        shards: run.shards.clone(),
        failed,
    }))
}

async fn run_handler(
    State(state): State<SharedState>,
    Path(run_id): Path<u64>,
) -> Result<Json<TestRun>, ApiError> {
    Ok(Json(state.coordinator.run(RunId(run_id))?))
}

async fn cancel_handler(
    State(state): State<SharedState>,
    Path(run_id): Path<u64>,
) -> Result<(StatusCode, Json<CancelReply>), ApiError> {
    let reply = match state.coordinator.cancel(RunId(run_id)).await? {
        CancelOutcome::Success { stopped } => (
            StatusCode::OK,
            CancelReply {
                stopped,
                failed: BTreeMap::new(),
            },
        ),
        CancelOutcome::Partial { stopped, failed } => (
            StatusCode::OK,
            CancelReply {
                stopped,
                failed: reasons(&failed),
            },
        ),
        CancelOutcome::AllFailed { failed } => (
            StatusCode::BAD_GATEWAY,
            CancelReply {
                stopped: Vec::new(),
                failed: reasons(&failed),
            },
        ),
    };
    Ok((reply.0, Json(reply.1)))
}

async fn end_tboard_handler(
    State(state): State<SharedState>,
    Path(run_id): Path<u64>,
    Json(body): Json<EndTboardRequest>,
) -> Result<Json<EndTboardReply>, ApiError> {
    let outcome = state
        .coordinator
        .end_of_run_from_wire(RunId(run_id), &body)?;
    Ok(Json(EndTboardReply {
        applied: outcome.applied,
        ignored: outcome.ignored,
        released: outcome.released,
        finalized: outcome.finalized,
    }))
}

async fn deletion_handler(
    State(state): State<SharedState>,
    Path(run_id): Path<u64>,
) -> Result<(StatusCode, Json<DeletionReply>), ApiError> {
    let reply = match state.deletion.enqueue(RunId(run_id)).await? {
        EnqueueOutcome::Queued { retried } => DeletionReply {
            queued: true,
            retried,
        },
        EnqueueOutcome::AlreadyQueued => DeletionReply {
            queued: false,
            retried: false,
        },
    };
    Ok((StatusCode::ACCEPTED, Json(reply)))
}

async fn ledger_handler(
    State(state): State<SharedState>,
) -> Result<Json<LedgerSnapshot>, ApiError> {
    Ok(Json(state.deletion.ledger_snapshot()?))
}
