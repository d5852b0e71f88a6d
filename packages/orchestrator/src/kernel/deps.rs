//! Central capability carrier.
//!
//! Every external service the orchestrator touches sits behind a trait
//! object here, constructed once at startup and threaded through the
//! components that need it. No hidden global state; tests assemble the same
//! carrier from in-memory implementations.

use std::sync::Arc;

use sqlx::PgPool;
use tokio::sync::Mutex;

use crate::kernel::audit::AuditLog;
use crate::kernel::containers::engine::ContainerEngine;
use crate::kernel::containers::health::HealthProber;
use crate::kernel::containers::pool::PoolHandle;
use crate::kernel::coord::CoordStore;
use crate::kernel::jobs::engine::QueueEngine;
use crate::kernel::metrics::MetricsSink;
use crate::kernel::runners::RunnerRegistry;
use crate::kernel::secrets::SecretStore;
use crate::kernel::security::service::SecurityService;
use crate::kernel::stream_hub::StreamHub;
use crate::kernel::webhooks::event::WebhookEventStore;
use crate::kernel::webhooks::ingress::WebhookIngress;

#[derive(Clone)]
pub struct OrchestratorDeps {
    /// Durable store; absent only in pure in-memory test assemblies.
    pub db: Option<PgPool>,
    pub queue: Arc<QueueEngine>,
    pub coord: Arc<dyn CoordStore>,
    pub container_engine: Arc<dyn ContainerEngine>,
    pub pool: PoolHandle,
    pub runners: Arc<RunnerRegistry>,
    pub security: Arc<SecurityService>,
    pub prober: Arc<Mutex<HealthProber>>,
    pub webhook_events: Arc<dyn WebhookEventStore>,
    pub ingress: Arc<WebhookIngress>,
    pub secrets: Arc<dyn SecretStore>,
    pub metrics: Arc<dyn MetricsSink>,
    pub hub: StreamHub,
    pub audit: Option<Arc<AuditLog>>,
    pub forge: Option<Arc<forge::ForgeClient>>,
}
