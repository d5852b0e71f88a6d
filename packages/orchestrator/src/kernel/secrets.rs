//! Secret store capability.
//!
//! Vault provisioning is out of scope; the orchestrator only consumes
//! secrets through this interface. The environment-backed implementation is
//! the default; tests use the in-memory one.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::common::{Error, Result};

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<String>>;

    async fn require(&self, name: &str) -> Result<String> {
        self.get(name)
            .await?
            .ok_or_else(|| Error::dependency(format!("secret {name} is not available")))
    }
}

/// Reads secrets from process environment variables.
pub struct EnvSecretStore;

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn get(&self, name: &str) -> Result<Option<String>> {
        Ok(std::env::var(name).ok())
    }
}

#[derive(Default)]
pub struct MemorySecretStore {
    values: HashMap<String, String>,
}

impl MemorySecretStore {
    pub fn new(values: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            values: values.into_iter().collect(),
        }
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, name: &str) -> Result<Option<String>> {
        Ok(self.values.get(name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn require_fails_for_missing_secret() {
        let store = MemorySecretStore::default();
        assert!(store.require("WEBHOOK_SECRET").await.is_err());
    }

    #[tokio::test]
    async fn memory_store_returns_seeded_values() {
        let store = MemorySecretStore::new([("TOKEN".to_string(), "abc".to_string())]);
        assert_eq!(store.get("TOKEN").await.unwrap().as_deref(), Some("abc"));
    }
}
