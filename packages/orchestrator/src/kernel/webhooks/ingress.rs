//! Webhook ingress pipeline.
//!
//! Size cap → signature → whitelist → repository validation → idempotent
//! persistence → route + enqueue. The HTTP handler is a thin wrapper over
//! [`WebhookIngress::handle`]; every outcome here already knows its status
//! code.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::common::{Error, Kind, Result};
use crate::config::WebhookConfig;
use crate::kernel::jobs::engine::{EnqueueOptions, QueueEngine};
use crate::kernel::jobs::payload::JobPayload;
use crate::kernel::webhooks::event::{WebhookEvent, WebhookEventStore};
use crate::kernel::webhooks::{signature, validate};

/// Headers the hosting service sends with each delivery.
#[derive(Debug, Clone)]
pub struct DeliveryHeaders {
    pub delivery_id: String,
    pub event_type: String,
    pub signature: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngressOutcome {
    /// Persisted and enqueued.
    Accepted,
    /// Event type outside the whitelist or an unusable repository field.
    Ignored,
    /// Delivery id seen before; at most one row and one job ever exist.
    Duplicate,
}

impl IngressOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngressOutcome::Accepted => "accepted",
            IngressOutcome::Ignored => "ignored",
            IngressOutcome::Duplicate => "duplicate",
        }
    }
}

pub struct WebhookIngress {
    config: WebhookConfig,
    store: Arc<dyn WebhookEventStore>,
    engine: Arc<QueueEngine>,
}

impl WebhookIngress {
    pub fn new(
        config: WebhookConfig,
        store: Arc<dyn WebhookEventStore>,
        engine: Arc<QueueEngine>,
    ) -> Self {
        Self {
            config,
            store,
            engine,
        }
    }

    pub async fn handle(&self, headers: &DeliveryHeaders, body: &[u8]) -> Result<IngressOutcome> {
        if body.len() > self.config.max_body_bytes {
            return Err(Error::validation(format!(
                "body of {} bytes exceeds the {} byte limit",
                body.len(),
                self.config.max_body_bytes
            )));
        }

        if headers.delivery_id.is_empty() {
            return Err(Error::validation("missing delivery id header"));
        }

        let signature_checked = if let Some(secret) = &self.config.secret {
            let provided = headers.signature.as_deref().unwrap_or_default();
            if !signature::verify(secret, body, provided) {
                warn!(delivery_id = %headers.delivery_id, "webhook signature mismatch");
                return Err(Error::authentication("webhook signature mismatch")
                    .with_code("invalid_signature"));
            }
            true
        } else {
            false
        };

        if !validate::is_whitelisted(&headers.event_type) {
            return Ok(IngressOutcome::Ignored);
        }

        let payload: serde_json::Value = serde_json::from_slice(body)
            .map_err(|err| Error::validation(format!("malformed json body: {err}")))?;

        let repository = payload
            .pointer("/repository/full_name")
            .and_then(|value| value.as_str())
            .map(str::to_string);

        // ping carries no repository; every routed event must.
        let repository = match (&repository, headers.event_type.as_str()) {
            (Some(name), _) if !validate::is_valid_repository(name) => {
                warn!(delivery_id = %headers.delivery_id, "rejected repository field");
                return Ok(IngressOutcome::Ignored);
            }
            (Some(name), _) => Some(name.clone()),
            (None, "ping") => None,
            (None, _) => return Ok(IngressOutcome::Ignored),
        };

        let event = WebhookEvent {
            delivery_id: headers.delivery_id.clone(),
            event_type: headers.event_type.clone(),
            repository: repository.clone(),
            payload,
            signature_valid: signature_checked,
            processed: false,
            received_at: Utc::now(),
        };

        let inserted = self.store.insert(&event).await?;
        if !inserted {
            // A redelivery whose first enqueue failed still owes a job.
            if let Some(existing) = self.store.find(&headers.delivery_id).await? {
                if !existing.processed {
                    self.enqueue(headers, repository.as_deref()).await?;
                    self.store.mark_processed(&headers.delivery_id).await?;
                }
            }
            return Ok(IngressOutcome::Duplicate);
        }

        if headers.event_type == "ping" {
            self.store.mark_processed(&headers.delivery_id).await?;
            return Ok(IngressOutcome::Accepted);
        }

        // Enqueue failure leaves processed=false; the row stays for the
        // redelivery to pick up, and the sender sees a retryable error.
        self.enqueue(headers, repository.as_deref()).await?;
        self.store.mark_processed(&headers.delivery_id).await?;

        info!(
            delivery_id = %headers.delivery_id,
            event_type = %headers.event_type,
            "webhook accepted"
        );
        Ok(IngressOutcome::Accepted)
    }

    async fn enqueue(&self, headers: &DeliveryHeaders, repository: Option<&str>) -> Result<()> {
        let payload = JobPayload::ProcessWebhook {
            delivery_id: headers.delivery_id.clone(),
            event_type: headers.event_type.clone(),
            repository: repository.unwrap_or_default().to_string(),
        };
        self.engine
            .enqueue_with(
                payload,
                EnqueueOptions {
                    idempotency_key: Some(format!("webhook:{}", headers.delivery_id)),
                    source_event_id: Some(headers.delivery_id.clone()),
                },
            )
            .await
            .map_err(|err| match err.kind {
                // Admission rejection propagates as a retryable 503.
                Kind::ResourceExhausted => err,
                _ => Error::new(Kind::DependencyUnavailable, err.message),
            })?;
        Ok(())
    }
}
