pub mod auth;
pub mod rate_limit;

pub use auth::{require_auth, AuthService, AuthUser};
pub use rate_limit::{limit_by_ip, limit_by_token, RateLimiter};
