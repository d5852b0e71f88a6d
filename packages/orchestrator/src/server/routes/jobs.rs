use axum::extract::{Extension, Path, Query};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::common::{Error, Result};
use crate::kernel::containers::engine::ContainerEngine;
use crate::kernel::jobs::engine::EnqueueOptions;
use crate::kernel::jobs::job::{JobState, QueueName};
use crate::kernel::jobs::payload::JobPayload;
use crate::kernel::jobs::store::JobStore;
use crate::server::app::AppState;

#[derive(Deserialize)]
pub struct DelegateRequest {
    pub repository: String,
    pub workflow: String,
    #[serde(default = "default_event")]
    pub event: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    /// Runner prepared for this execution, when the caller manages one.
    #[serde(default)]
    pub runner_id: Option<Uuid>,
}

fn default_event() -> String {
    "workflow_dispatch".to_string()
}

/// Submit a workflow job for delegation.
pub async fn delegate_handler(
    Extension(state): Extension<AppState>,
    Json(request): Json<DelegateRequest>,
) -> Result<Json<serde_json::Value>> {
    let payload = JobPayload::ExecuteWorkflow {
        repository: request.repository,
        workflow: request.workflow,
        event: request.event,
        labels: request.labels,
        delivery_id: None,
        forge_job_id: None,
        runner_id: request.runner_id,
    };
    let result = state
        .deps
        .queue
        .enqueue_with(
            payload,
            EnqueueOptions {
                idempotency_key: request.idempotency_key,
                source_event_id: None,
            },
        )
        .await?;

    Ok(Json(serde_json::json!({
        "success": true,
        "data": {
            "job_id": result.job_id(),
            "duplicate": !result.is_created(),
        }
    })))
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub queue: Option<String>,
    pub state: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    50
}

pub async fn list_handler(
    Extension(state): Extension<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>> {
    let queue = match &query.queue {
        Some(raw) => Some(
            raw.parse::<QueueName>()
                .map_err(|_| Error::validation(format!("unknown queue {raw}")))?,
        ),
        None => None,
    };
    let job_state = match &query.state {
        Some(raw) => Some(
            serde_json::from_value::<JobState>(serde_json::json!(raw))
                .map_err(|_| Error::validation(format!("unknown state {raw}")))?,
        ),
        None => None,
    };

    let jobs = state
        .deps
        .queue
        .store()
        .list(queue, job_state, query.limit.clamp(1, 500))
        .await?;
    Ok(Json(serde_json::json!({"success": true, "data": jobs})))
}

pub async fn get_handler(
    Extension(state): Extension<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>> {
    let job = state
        .deps
        .queue
        .store()
        .find(id)
        .await?
        .ok_or_else(|| Error::not_found(format!("job {id} not found")))?;
    Ok(Json(serde_json::json!({"success": true, "data": job})))
}

#[derive(Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    pub tail: Option<i64>,
    /// Unix seconds; only lines after this instant.
    #[serde(default)]
    pub since: Option<i64>,
}

/// Logs of the sandbox currently (or last) assigned to the job.
pub async fn logs_handler(
    Extension(state): Extension<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<serde_json::Value>> {
    let sandbox = state
        .deps
        .pool
        .list()
        .await?
        .into_iter()
        .find(|sandbox| sandbox.assigned_job == Some(id))
        .ok_or_else(|| Error::not_found("no sandbox attached to this job"))?;

    let lines = state
        .deps
        .container_engine
        .logs(
            &sandbox.engine_id,
            Some(query.tail.unwrap_or(500).clamp(1, 5000)),
            query.since,
        )
        .await?;
    let rendered: Vec<serde_json::Value> = lines
        .into_iter()
        .map(|line| serde_json::json!({"stream": line.stream, "message": line.message}))
        .collect();
    Ok(Json(serde_json::json!({"success": true, "data": rendered})))
}

#[derive(Deserialize)]
pub struct StatusReport {
    pub status: String,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub artifacts: Option<Vec<String>>,
    #[serde(default)]
    pub runner_id: Option<Uuid>,
}

/// Status report from a proxy runner; mirrored through the monitoring
/// queue so subscribers and the forge see the transition in order.
pub async fn status_handler(
    Extension(state): Extension<AppState>,
    Path(id): Path<Uuid>,
    Json(report): Json<StatusReport>,
) -> Result<Json<serde_json::Value>> {
    if report.status.is_empty() {
        return Err(Error::validation("status must not be empty"));
    }

    if let Some(runner_id) = report.runner_id {
        if matches!(report.status.as_str(), "completed" | "failed" | "cancelled") {
            state.deps.runners.complete_assignment(runner_id).await.ok();
        }
    }

    state
        .deps
        .queue
        .enqueue(JobPayload::UpdateStatus {
            job_id: id,
            status: report.status.clone(),
            exit_code: report.exit_code,
        })
        .await?;

    Ok(Json(serde_json::json!({"success": true, "data": {"accepted": true}})))
}
