use axum::extract::{Extension, Path};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::common::Result;
use crate::kernel::jobs::payload::JobPayload;
use crate::server::app::AppState;

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

pub async fn register_handler(
    Extension(state): Extension<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<serde_json::Value>> {
    let runner = state
        .deps
        .runners
        .register(request.name, request.labels, request.capabilities)
        .await?;

    // Provision the proxy in the background.
    let prepare = JobPayload::PrepareRunner {
        runner_id: runner.id,
        labels: runner.labels.clone(),
    };
    state.deps.queue.enqueue(prepare).await?;

    Ok(Json(serde_json::json!({"success": true, "data": runner})))
}

pub async fn list_handler(
    Extension(state): Extension<AppState>,
) -> Result<Json<serde_json::Value>> {
    let runners = state.deps.runners.list().await;
    Ok(Json(serde_json::json!({"success": true, "data": runners})))
}

/// Assignment poll: also counts as a heartbeat.
pub async fn assignment_handler(
    Extension(state): Extension<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>> {
    state.deps.runners.heartbeat(id).await?;
    let assignment = state.deps.runners.take_assignment(id).await?;
    Ok(Json(serde_json::json!({"success": true, "data": assignment})))
}

pub async fn remove_handler(
    Extension(state): Extension<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>> {
    state
        .deps
        .queue
        .enqueue(JobPayload::CleanupRunner { runner_id: id })
        .await?;
    Ok(Json(serde_json::json!({"success": true, "data": {"scheduled": true}})))
}
