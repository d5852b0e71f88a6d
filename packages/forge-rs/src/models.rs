use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForgeRunner {
    pub id: i64,
    pub name: String,
    pub os: Option<String>,
    pub status: String,
    pub busy: bool,
    #[serde(default)]
    pub labels: Vec<ForgeRunnerLabel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForgeRunnerLabel {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerPage {
    pub total_count: i64,
    pub runners: Vec<ForgeRunner>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitStatus {
    pub resources: RateLimitResources,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitResources {
    pub core: RateLimitWindow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitWindow {
    pub limit: i64,
    pub remaining: i64,
    pub reset: i64,
}
