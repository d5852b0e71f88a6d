//! Minimal typed client for the code-hosting service ("the forge").
//!
//! The orchestrator only needs a narrow slice of the forge API: minting
//! registration tokens for proxy runners, removing runners, and probing
//! connectivity. Everything else (the forge's own scheduler, the runner
//! agent binary) stays on the forge side.

pub mod models;

use reqwest::{header, Client, StatusCode};

use crate::models::{ForgeRunner, RateLimitStatus, RegistrationToken, RunnerPage};

#[derive(Debug, thiserror::Error)]
pub enum ForgeError {
    #[error("forge request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("forge returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("forge credentials rejected")]
    Unauthorized,
}

#[derive(Debug, Clone)]
pub struct ForgeOptions {
    /// API base, e.g. `https://api.github.com`.
    pub base_url: String,
    /// Personal access token or installation token.
    pub token: String,
    /// `owner/name` scope runners are registered under.
    pub repository: String,
}

#[derive(Clone)]
pub struct ForgeClient {
    options: ForgeOptions,
    client: Client,
}

impl ForgeClient {
    pub fn new(options: ForgeOptions) -> Self {
        Self {
            options,
            client: Client::new(),
        }
    }

    fn headers(&self) -> header::HeaderMap {
        let mut headers = header::HeaderMap::new();
        if let Ok(auth) = format!("Bearer {}", self.options.token).parse() {
            headers.insert(header::AUTHORIZATION, auth);
        }
        if let Ok(accept) = "application/vnd.github+json".parse() {
            headers.insert(header::ACCEPT, accept);
        }
        if let Ok(agent) = "runnerhub-orchestrator".parse() {
            headers.insert(header::USER_AGENT, agent);
        }
        headers
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ForgeError> {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ForgeError::Unauthorized);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ForgeError::Api { status, body });
        }
        Ok(response)
    }

    /// Mint a short-lived registration token for a proxy runner.
    pub async fn registration_token(&self) -> Result<RegistrationToken, ForgeError> {
        let url = format!(
            "{}/repos/{}/actions/runners/registration-token",
            self.options.base_url, self.options.repository
        );
        let response = self
            .client
            .post(&url)
            .headers(self.headers())
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    /// List runners registered under the configured repository.
    pub async fn list_runners(&self) -> Result<Vec<ForgeRunner>, ForgeError> {
        let url = format!(
            "{}/repos/{}/actions/runners",
            self.options.base_url, self.options.repository
        );
        let response = self
            .client
            .get(&url)
            .headers(self.headers())
            .send()
            .await?;
        let page: RunnerPage = Self::check(response).await?.json().await?;
        Ok(page.runners)
    }

    /// Deregister a runner from the forge.
    pub async fn remove_runner(&self, runner_id: i64) -> Result<(), ForgeError> {
        let url = format!(
            "{}/repos/{}/actions/runners/{}",
            self.options.base_url, self.options.repository, runner_id
        );
        let response = self
            .client
            .delete(&url)
            .headers(self.headers())
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    /// Probe connectivity and remaining API quota.
    pub async fn rate_limit(&self) -> Result<RateLimitStatus, ForgeError> {
        let url = format!("{}/rate_limit", self.options.base_url);
        let response = self
            .client
            .get(&url)
            .headers(self.headers())
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }
}
