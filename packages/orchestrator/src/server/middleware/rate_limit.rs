//! Fixed-window rate limiting.
//!
//! Data endpoints: per bearer token. Authentication endpoints: per source
//! IP, with a stricter limit. Rejections carry `Retry-After` for the
//! remainder of the window.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{middleware::Next, response::IntoResponse, response::Response};
use tokio::sync::Mutex;

use crate::common::{Error, Kind};
use crate::server::middleware::auth::AuthUser;

struct Window {
    started: Instant,
    count: u32,
}

pub struct RateLimiter {
    windows: Mutex<HashMap<String, Window>>,
    window: Duration,
    limit: u32,
}

impl RateLimiter {
    pub fn new(window: Duration, limit: u32) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            window,
            limit,
        }
    }

    /// Count one request for `identity`. `Err(retry_after)` past the limit.
    pub async fn check(&self, identity: &str) -> Result<(), u64> {
        let mut windows = self.windows.lock().await;
        let now = Instant::now();
        let entry = windows.entry(identity.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });

        if now.duration_since(entry.started) >= self.window {
            entry.started = now;
            entry.count = 0;
        }

        if entry.count >= self.limit {
            let elapsed = now.duration_since(entry.started);
            let remaining = self.window.saturating_sub(elapsed);
            return Err(remaining.as_secs().max(1));
        }

        entry.count += 1;
        Ok(())
    }

    /// Drop windows idle for more than one full period.
    pub async fn sweep(&self) {
        let mut windows = self.windows.lock().await;
        let window = self.window;
        windows.retain(|_, entry| entry.started.elapsed() < window * 2);
    }
}

fn client_ip(request: &axum::http::Request<axum::body::Body>) -> String {
    request
        .headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.split(',').next())
        .map(|ip| ip.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Data-endpoint limiter: keyed by bearer token, falling back to IP for
/// anything that slipped past auth.
pub async fn limit_by_token(
    limiter: Arc<RateLimiter>,
    request: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let identity = request
        .extensions()
        .get::<AuthUser>()
        .map(|user| user.token.clone())
        .unwrap_or_else(|| client_ip(&request));

    match limiter.check(&identity).await {
        Ok(()) => next.run(request).await,
        Err(retry_after) => Error::new(Kind::RateLimited, "rate limit exceeded")
            .with_retry_after(retry_after)
            .into_response(),
    }
}

/// Authentication-endpoint limiter: keyed by source IP.
pub async fn limit_by_ip(
    limiter: Arc<RateLimiter>,
    request: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let identity = client_ip(&request);
    match limiter.check(&identity).await {
        Ok(()) => next.run(request).await,
        Err(retry_after) => Error::new(Kind::RateLimited, "rate limit exceeded")
            .with_retry_after(retry_after)
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn requests_within_limit_pass() {
        let limiter = RateLimiter::new(Duration::from_secs(3600), 3);
        for _ in 0..3 {
            assert!(limiter.check("token-a").await.is_ok());
        }
        assert!(limiter.check("token-a").await.is_err());
    }

    #[tokio::test]
    async fn identities_are_independent() {
        let limiter = RateLimiter::new(Duration::from_secs(3600), 1);
        assert!(limiter.check("token-a").await.is_ok());
        assert!(limiter.check("token-b").await.is_ok());
        assert!(limiter.check("token-a").await.is_err());
    }

    #[tokio::test]
    async fn window_expiry_resets_the_count() {
        let limiter = RateLimiter::new(Duration::from_millis(50), 1);
        assert!(limiter.check("token-a").await.is_ok());
        assert!(limiter.check("token-a").await.is_err());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(limiter.check("token-a").await.is_ok());
    }

    #[tokio::test]
    async fn rejection_reports_retry_after() {
        let limiter = RateLimiter::new(Duration::from_secs(3600), 1);
        limiter.check("token-a").await.unwrap();
        let retry_after = limiter.check("token-a").await.unwrap_err();
        assert!(retry_after >= 1 && retry_after <= 3600);
    }
}
