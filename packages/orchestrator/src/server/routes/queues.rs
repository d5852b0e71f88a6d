use axum::extract::{Extension, Path};
use axum::Json;
use uuid::Uuid;

use crate::common::{Error, Result};
use crate::kernel::jobs::job::QueueName;
use crate::kernel::jobs::store::JobStore;
use crate::server::app::AppState;

fn parse_queue(raw: &str) -> Result<QueueName> {
    raw.parse()
        .map_err(|_| Error::validation(format!("unknown queue {raw}")))
}

pub async fn status_handler(
    Extension(state): Extension<AppState>,
) -> Result<Json<serde_json::Value>> {
    let mut queues = serde_json::Map::new();
    for queue in QueueName::ALL {
        let counts = state.deps.queue.store().counts(queue).await?;
        queues.insert(
            queue.as_str().to_string(),
            serde_json::json!({
                "counts": counts,
                "paused": state.deps.queue.is_paused(queue).await,
                "concurrency": state.deps.queue.concurrency(queue),
            }),
        );
    }
    Ok(Json(serde_json::json!({"success": true, "data": queues})))
}

pub async fn pause_handler(
    Extension(state): Extension<AppState>,
    Path(queue): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let queue = parse_queue(&queue)?;
    state.deps.queue.pause(queue).await;
    audit(&state, "queue.pause", queue.as_str()).await;
    Ok(Json(serde_json::json!({"success": true, "data": {"paused": true}})))
}

pub async fn resume_handler(
    Extension(state): Extension<AppState>,
    Path(queue): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let queue = parse_queue(&queue)?;
    state.deps.queue.resume(queue).await;
    audit(&state, "queue.resume", queue.as_str()).await;
    Ok(Json(serde_json::json!({"success": true, "data": {"paused": false}})))
}

pub async fn delete_failed_handler(
    Extension(state): Extension<AppState>,
    Path(queue): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let queue = parse_queue(&queue)?;
    let removed = state.deps.queue.store().delete_failed(queue).await?;
    audit(&state, "queue.delete_failed", queue.as_str()).await;
    Ok(Json(serde_json::json!({"success": true, "data": {"removed": removed}})))
}

/// Dead-letter replay: return a dead job to its queue with a clean slate.
pub async fn retry_dead_handler(
    Extension(state): Extension<AppState>,
    Path((queue, id)): Path<(String, Uuid)>,
) -> Result<Json<serde_json::Value>> {
    parse_queue(&queue)?;
    let requeued = state.deps.queue.store().requeue_dead(id).await?;
    if !requeued {
        return Err(Error::not_found(format!("no dead job {id} in {queue}")));
    }
    audit(&state, "queue.retry_dead", &id.to_string()).await;
    Ok(Json(serde_json::json!({"success": true, "data": {"requeued": true}})))
}

async fn audit(state: &AppState, action: &str, resource: &str) {
    if let Some(audit) = &state.deps.audit {
        if let Err(err) = audit.record("api", action, resource, "ok").await {
            tracing::warn!(error = %err, "audit write failed");
        }
    }
}
