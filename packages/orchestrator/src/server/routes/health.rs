use axum::{extract::Extension, http::StatusCode, Json};
use serde::Serialize;

use crate::server::app::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    store: StoreHealth,
    pool: Option<crate::kernel::containers::PoolStatus>,
    node_id: String,
    leader: bool,
}

#[derive(Serialize)]
pub struct StoreHealth {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Liveness endpoint. Unauthenticated; returns 503 when the store probe
/// fails so load balancers stop routing here.
pub async fn health_handler(
    Extension(state): Extension<AppState>,
) -> (StatusCode, Json<HealthResponse>) {
    let store = match &state.deps.db {
        Some(db) => {
            match tokio::time::timeout(
                std::time::Duration::from_secs(5),
                sqlx::query("SELECT 1").execute(db),
            )
            .await
            {
                Ok(Ok(_)) => StoreHealth {
                    status: "ok".to_string(),
                    error: None,
                },
                Ok(Err(err)) => StoreHealth {
                    status: "error".to_string(),
                    error: Some(err.to_string()),
                },
                Err(_) => StoreHealth {
                    status: "error".to_string(),
                    error: Some("query timeout (>5s)".to_string()),
                },
            }
        }
        None => StoreHealth {
            status: "ok".to_string(),
            error: None,
        },
    };

    let pool = state.deps.pool.status().await.ok();
    let healthy = store.status == "ok";

    let response = HealthResponse {
        status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
        store,
        pool,
        node_id: state.node_id.clone(),
        leader: state.leader.is_leader(),
    };

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(response))
}
