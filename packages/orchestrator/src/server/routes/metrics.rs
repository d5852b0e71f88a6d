use axum::extract::Extension;
use axum::Json;

use crate::common::Result;
use crate::kernel::jobs::job::QueueName;
use crate::kernel::jobs::store::JobStore;
use crate::kernel::metrics::MetricsSink;
use crate::server::app::AppState;

pub async fn metrics_handler(
    Extension(state): Extension<AppState>,
) -> Result<Json<serde_json::Value>> {
    let snapshot = state.deps.metrics.snapshot();
    Ok(Json(serde_json::json!({"success": true, "data": snapshot})))
}

/// Operator dashboard: component health, leadership, queues, pool.
pub async fn dashboard_handler(
    Extension(state): Extension<AppState>,
) -> Result<Json<serde_json::Value>> {
    let health: Vec<_> = state.health.read().await.values().cloned().collect();

    let mut queues = serde_json::Map::new();
    for queue in QueueName::ALL {
        let counts = state.deps.queue.store().counts(queue).await?;
        queues.insert(queue.as_str().to_string(), serde_json::json!(counts));
    }

    let pool = state.deps.pool.status().await?;

    Ok(Json(serde_json::json!({
        "success": true,
        "data": {
            "node_id": state.node_id,
            "leader": state.leader.is_leader(),
            "leader_generation": state.leader.generation(),
            "components": health,
            "queues": queues,
            "pool": pool,
            "dropped_events": state.deps.hub.dropped_count(),
        }
    })))
}

/// Audit chain verification: reports the first break, if any.
pub async fn audit_verify_handler(
    Extension(state): Extension<AppState>,
) -> Result<Json<serde_json::Value>> {
    let Some(audit) = &state.deps.audit else {
        return Ok(Json(serde_json::json!({
            "success": true,
            "data": {"intact": true, "entries_checked": 0}
        })));
    };
    let broken = audit.verify().await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "data": {"intact": broken.is_none(), "break": broken}
    })))
}

/// Forge connectivity probe.
pub async fn forge_status_handler(
    Extension(state): Extension<AppState>,
) -> Result<Json<serde_json::Value>> {
    let Some(forge) = &state.deps.forge else {
        return Ok(Json(serde_json::json!({
            "success": true,
            "data": {"configured": false}
        })));
    };

    match forge.rate_limit().await {
        Ok(status) => Ok(Json(serde_json::json!({
            "success": true,
            "data": {
                "configured": true,
                "reachable": true,
                "rate_limit": status.resources.core,
            }
        }))),
        Err(err) => Ok(Json(serde_json::json!({
            "success": true,
            "data": {
                "configured": true,
                "reachable": false,
                "error": err.to_string(),
            }
        }))),
    }
}
