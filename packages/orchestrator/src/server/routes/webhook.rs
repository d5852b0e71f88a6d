use axum::body::Bytes;
use axum::extract::Extension;
use axum::http::HeaderMap;
use axum::Json;

use crate::common::Result;
use crate::kernel::webhooks::ingress::DeliveryHeaders;
use crate::server::app::AppState;

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// External event ingress. HMAC-authenticated; returns 200 for accepted,
/// ignored, and duplicate deliveries alike.
pub async fn webhook_handler(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>> {
    let delivery = DeliveryHeaders {
        delivery_id: header(&headers, "x-github-delivery").unwrap_or_default(),
        event_type: header(&headers, "x-github-event").unwrap_or_default(),
        signature: header(&headers, "x-hub-signature-256"),
    };

    let outcome = state
        .deps
        .ingress
        .handle(&delivery, &body)
        .await
        .map_err(|mut err| {
            // Transient store/enqueue failures tell the sender when to
            // redeliver.
            if err.kind.is_retryable() && err.retry_after.is_none() {
                err.retry_after = Some(30);
            }
            err
        })?;
    Ok(Json(serde_json::json!({
        "success": true,
        "data": {"status": outcome.as_str()}
    })))
}
