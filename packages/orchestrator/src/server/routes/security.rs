use axum::extract::Extension;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::common::{Error, Result};
use crate::kernel::jobs::payload::JobPayload;
use crate::kernel::security::evaluator::ScanFindings;
use crate::server::app::AppState;

#[derive(Deserialize)]
pub struct ScanRequest {
    pub container_id: Uuid,
    #[serde(default = "default_scan_type")]
    pub scan_type: String,
}

fn default_scan_type() -> String {
    "vulnerability".to_string()
}

/// On-demand assessment of a pooled sandbox.
pub async fn scan_handler(
    Extension(state): Extension<AppState>,
    Json(request): Json<ScanRequest>,
) -> Result<Json<serde_json::Value>> {
    let sandbox = state
        .deps
        .pool
        .list()
        .await?
        .into_iter()
        .find(|sandbox| sandbox.id == request.container_id)
        .ok_or_else(|| Error::not_found("container not in pool"))?;

    let snapshot = crate::kernel::jobs::processors::sandbox_snapshot(&sandbox);
    let evaluation = state
        .deps
        .security
        .assess(&snapshot, ScanFindings::default())
        .await;
    state
        .deps
        .security
        .enforce(
            &evaluation,
            &sandbox,
            &state.deps.pool,
            &state.deps.container_engine,
            &state.deps.queue,
        )
        .await?;

    // Follow-up health probe keeps the assessment fresh.
    state
        .deps
        .queue
        .enqueue(JobPayload::HealthCheck {
            container_id: Some(sandbox.id),
        })
        .await
        .ok();

    Ok(Json(serde_json::json!({
        "success": true,
        "data": {
            "scan_type": request.scan_type,
            "evaluation": evaluation,
        }
    })))
}
