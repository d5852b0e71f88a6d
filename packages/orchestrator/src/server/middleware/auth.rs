//! Bearer-token authentication.
//!
//! Every `/api` route requires a valid token; `/health` and `/webhook` are
//! exempt (the webhook authenticates with its HMAC signature instead).

use std::sync::Arc;

use axum::{middleware::Next, response::IntoResponse, response::Response};
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::common::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: the account name.
    pub sub: String,
    pub iss: String,
    pub exp: i64,
    pub iat: i64,
    pub admin: bool,
}

/// Authenticated principal attached to the request.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub subject: String,
    pub is_admin: bool,
    /// Raw token, used as the rate-limit identity.
    pub token: String,
}

pub struct AuthService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
}

impl AuthService {
    pub fn new(secret: &str, issuer: String) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            issuer,
        }
    }

    pub fn create_token(&self, subject: &str, admin: bool) -> Result<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: subject.to_string(),
            iss: self.issuer.clone(),
            iat: now.timestamp(),
            exp: (now + chrono::Duration::hours(12)).timestamp(),
            admin,
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|err| Error::internal(format!("token encoding failed: {err}")))
    }

    pub fn verify_token(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::default();
        validation.set_issuer(&[self.issuer.clone()]);
        decode::<Claims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|_| Error::authentication("invalid or expired token"))
    }
}

fn bearer_token(request: &axum::http::Request<axum::body::Body>) -> Option<&str> {
    let header = request.headers().get("authorization")?.to_str().ok()?;
    Some(header.strip_prefix("Bearer ").unwrap_or(header))
}

/// Reject unauthenticated requests; attach `AuthUser` otherwise.
pub async fn require_auth(
    auth: Arc<AuthService>,
    mut request: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let Some(token) = bearer_token(&request) else {
        return Error::authentication("missing bearer token").into_response();
    };

    match auth.verify_token(token) {
        Ok(claims) => {
            let user = AuthUser {
                subject: claims.sub,
                is_admin: claims.admin,
                token: token.to_string(),
            };
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        Err(err) => err.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_tokens_verify() {
        let service = AuthService::new("secret", "runnerhub".into());
        let token = service.create_token("admin", true).unwrap();
        let claims = service.verify_token(&token).unwrap();
        assert_eq!(claims.sub, "admin");
        assert!(claims.admin);
    }

    #[test]
    fn wrong_secret_fails_verification() {
        let issuer = "runnerhub".to_string();
        let token = AuthService::new("secret-a", issuer.clone())
            .create_token("admin", false)
            .unwrap();
        assert!(AuthService::new("secret-b", issuer)
            .verify_token(&token)
            .is_err());
    }

    #[test]
    fn wrong_issuer_fails_verification() {
        let token = AuthService::new("secret", "issuer-a".into())
            .create_token("admin", false)
            .unwrap();
        assert!(AuthService::new("secret", "issuer-b".into())
            .verify_token(&token)
            .is_err());
    }

    #[test]
    fn garbage_token_fails() {
        let service = AuthService::new("secret", "runnerhub".into());
        assert!(service.verify_token("not-a-jwt").is_err());
    }
}
