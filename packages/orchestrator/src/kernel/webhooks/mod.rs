//! Webhook ingress: signatures, validation, persistence, enqueue.

pub mod event;
pub mod ingress;
pub mod signature;
pub mod validate;

pub use event::{MemoryWebhookEventStore, PostgresWebhookEventStore, WebhookEvent, WebhookEventStore};
pub use ingress::{DeliveryHeaders, IngressOutcome, WebhookIngress};
