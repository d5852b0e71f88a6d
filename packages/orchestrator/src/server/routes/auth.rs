use axum::{extract::Extension, Json};
use serde::Deserialize;
use subtle::ConstantTimeEq;

use crate::common::{Error, Result};
use crate::server::app::AppState;

#[derive(Deserialize)]
pub struct LoginRequest {
    username: String,
    password: String,
}

/// Exchange credentials for a bearer token.
pub async fn login_handler(
    Extension(state): Extension<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<serde_json::Value>> {
    let user_ok: bool = request
        .username
        .as_bytes()
        .ct_eq(state.admin_user.as_bytes())
        .into();
    let pass_ok: bool = request
        .password
        .as_bytes()
        .ct_eq(state.admin_password.as_bytes())
        .into();
    if !(user_ok && pass_ok) {
        return Err(Error::authentication("invalid credentials"));
    }

    let token = state.auth.create_token(&request.username, true)?;
    Ok(Json(serde_json::json!({
        "success": true,
        "data": {"token": token, "token_type": "Bearer"}
    })))
}
