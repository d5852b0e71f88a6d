//! Webhook event persistence.
//!
//! One row per delivery id, ever. The processed flag is the only mutable
//! field; everything else is append-only.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use tokio::sync::Mutex;

use crate::common::Result;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub delivery_id: String,
    pub event_type: String,
    pub repository: Option<String>,
    pub payload: serde_json::Value,
    pub signature_valid: bool,
    pub processed: bool,
    pub received_at: DateTime<Utc>,
}

#[async_trait]
pub trait WebhookEventStore: Send + Sync {
    /// Insert-if-absent keyed on delivery id. Returns false on conflict.
    async fn insert(&self, event: &WebhookEvent) -> Result<bool>;

    async fn find(&self, delivery_id: &str) -> Result<Option<WebhookEvent>>;

    async fn mark_processed(&self, delivery_id: &str) -> Result<()>;
}

pub struct PostgresWebhookEventStore {
    db: PgPool,
}

impl PostgresWebhookEventStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl WebhookEventStore for PostgresWebhookEventStore {
    async fn insert(&self, event: &WebhookEvent) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO webhook_events (
                delivery_id, event_type, repository, payload,
                signature_valid, processed, received_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (delivery_id) DO NOTHING
            "#,
        )
        .bind(&event.delivery_id)
        .bind(&event.event_type)
        .bind(&event.repository)
        .bind(&event.payload)
        .bind(event.signature_valid)
        .bind(event.processed)
        .bind(event.received_at)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find(&self, delivery_id: &str) -> Result<Option<WebhookEvent>> {
        let event = sqlx::query_as::<_, WebhookEvent>(
            r#"
            SELECT delivery_id, event_type, repository, payload,
                   signature_valid, processed, received_at
            FROM webhook_events
            WHERE delivery_id = $1
            "#,
        )
        .bind(delivery_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(event)
    }

    async fn mark_processed(&self, delivery_id: &str) -> Result<()> {
        sqlx::query("UPDATE webhook_events SET processed = true WHERE delivery_id = $1")
            .bind(delivery_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct MemoryWebhookEventStore {
    events: Arc<Mutex<HashMap<String, WebhookEvent>>>,
}

impl MemoryWebhookEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.events.lock().await.len()
    }
}

#[async_trait]
impl WebhookEventStore for MemoryWebhookEventStore {
    async fn insert(&self, event: &WebhookEvent) -> Result<bool> {
        let mut events = self.events.lock().await;
        if events.contains_key(&event.delivery_id) {
            return Ok(false);
        }
        events.insert(event.delivery_id.clone(), event.clone());
        Ok(true)
    }

    async fn find(&self, delivery_id: &str) -> Result<Option<WebhookEvent>> {
        Ok(self.events.lock().await.get(delivery_id).cloned())
    }

    async fn mark_processed(&self, delivery_id: &str) -> Result<()> {
        if let Some(event) = self.events.lock().await.get_mut(delivery_id) {
            event.processed = true;
        }
        Ok(())
    }
}
