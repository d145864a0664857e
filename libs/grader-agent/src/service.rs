// HTTP surface of a remote agent: job dispatch, task sync, alias updates

use crate::agent::{Agent, RUN_FAILED_TEXT};
use axum::{
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post, put},
    Router,
};
use grader_common::protocol::{
    AgentInfo, DirectoryHashesResponse, NewJobRequest, UpdateAliasesRequest, UpdateDirectoryRequest,
};
use grader_common::sync::SyncError;
use grader_common::types::RawResult;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// Task archives can be much larger than axum's default body limit
const MAX_BODY_BYTES: usize = 256 << 20;

pub fn routes(agent: Arc<Agent>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(agent_info))
        .route("/jobs", post(new_job))
        .route("/directory", get(directory_hashes).post(update_directory))
        .route("/aliases", put(update_aliases))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(agent)
}

/// Serve until the listener fails or the future is dropped
pub async fn serve(listener: TcpListener, agent: Arc<Agent>) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Agent listening on {}", addr);
    }
    axum::serve(listener, routes(agent)).await
}

/// GET /health
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /info
async fn agent_info(State(agent): State<Arc<Agent>>) -> Json<AgentInfo> {
    Json(AgentInfo {
        concurrency: agent.concurrency(),
        sync_enabled: agent.sync_enabled(),
    })
}

/// POST /jobs - Run one job and answer with its raw result
///
/// The job runs in its own task so a client disconnect does not abandon a
/// container half way through its lifecycle.
async fn new_job(
    State(agent): State<Arc<Agent>>,
    Json(request): Json<NewJobRequest>,
) -> Json<RawResult> {
    let job_id = request.job_id;
    info!(job_id = %job_id, course = %request.course_id, task = %request.task_id, "Job received");

    let result = match tokio::spawn(async move { agent.run_job(request).await }).await {
        Ok(result) => result,
        Err(e) => {
            error!(job_id = %job_id, error = %e, "Job task failed");
            RawResult::crash(RUN_FAILED_TEXT)
        }
    };
    Json(result)
}

/// GET /directory - Hashes of the local task directory
async fn directory_hashes(State(agent): State<Arc<Agent>>) -> impl IntoResponse {
    match agent.directory_hashes().await {
        Ok(hashes) => (StatusCode::OK, Json(DirectoryHashesResponse { hashes })).into_response(),
        Err(e) => {
            error!(error = %format!("{:#}", e), "Failed to hash task directory");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

fn sync_error_status(error: &SyncError) -> StatusCode {
    match error {
        SyncError::PathOutsideRoot(_) | SyncError::UnsupportedEntry(_) | SyncError::Archive(_) => {
            StatusCode::BAD_REQUEST
        }
        SyncError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// POST /directory - Apply a delta pushed by the backend
async fn update_directory(
    State(agent): State<Arc<Agent>>,
    Json(request): Json<UpdateDirectoryRequest>,
) -> impl IntoResponse {
    if !agent.sync_enabled() {
        return (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({ "error": "Synchronisation is disabled on this agent" })),
        )
            .into_response();
    }

    let archive = match request.archive_bytes() {
        Ok(archive) => archive,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": format!("Invalid archive encoding: {}", e) })),
            )
                .into_response();
        }
    };

    match agent.update_directory(archive, request.delete).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            warn!(error = %e, "Rejected directory update");
            (
                sync_error_status(&e),
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// PUT /aliases - Replace the environment → image table
async fn update_aliases(
    State(agent): State<Arc<Agent>>,
    Json(request): Json<UpdateAliasesRequest>,
) -> impl IntoResponse {
    agent.update_aliases(request.aliases);
    StatusCode::NO_CONTENT
}
