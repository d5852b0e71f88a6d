//! Application assembly: capability construction, background services, and
//! the HTTP router.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{DefaultBodyLimit, Extension};
use axum::middleware;
use axum::routing::{delete, get, post, put};
use axum::Router;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::kernel::audit::AuditLog;
use crate::kernel::containers::engine::{ContainerEngine, DockerEngine, SecurityContext};
use crate::kernel::containers::health::{HealthProber, ProbeConfig};
use crate::kernel::containers::lifecycle::ContainerManager;
use crate::kernel::containers::pool::ContainerPool;
use crate::kernel::coord::{CoordStore, RedisCoordStore};
use crate::kernel::ha::failover::{FailoverCoordinator, FailoverStore};
use crate::kernel::ha::leader::LeaderElector;
use crate::kernel::ha::monitor::{
    ApiProbe, CoordProbe, EngineProbe, HealthMonitor, HealthProbe, StoreProbe,
};
use crate::kernel::jobs::engine::QueueEngine;
use crate::kernel::jobs::processors::{register_processors, ProcessorDeps};
use crate::kernel::jobs::recovery::recover_at_startup;
use crate::kernel::jobs::registry::JobRegistry;
use crate::kernel::jobs::scheduler::Scheduler;
use crate::kernel::jobs::store::{JobStore, PostgresJobStore};
use crate::kernel::jobs::worker::WorkerPool;
use crate::kernel::metrics::{MemoryMetricsSink, MetricsSink};
use crate::kernel::runners::RunnerRegistry;
use crate::kernel::secrets::{EnvSecretStore, SecretStore};
use crate::kernel::security::evaluator::Evaluator;
use crate::kernel::security::policy::{
    AttributeTarget, Condition, ConditionOperator, EnforcementMode, Policy, Rule, RuleAction,
    RuleSeverity,
};
use crate::kernel::security::service::SecurityService;
use crate::kernel::stream_hub::StreamHub;
use crate::kernel::webhooks::event::PostgresWebhookEventStore;
use crate::kernel::webhooks::ingress::WebhookIngress;
use crate::kernel::OrchestratorDeps;
use crate::server::middleware::{limit_by_ip, limit_by_token, require_auth, AuthService, RateLimiter};
use crate::server::routes;

/// Shared state injected into every handler.
#[derive(Clone)]
pub struct AppState {
    pub deps: OrchestratorDeps,
    pub auth: Arc<AuthService>,
    pub admin_user: String,
    pub admin_password: String,
    pub health: Arc<tokio::sync::RwLock<std::collections::HashMap<String, crate::kernel::ha::monitor::ComponentHealth>>>,
    pub leader: Arc<LeaderElector>,
    pub node_id: String,
}

/// A fully assembled process: router plus the background services that
/// drive it. Cancelling `shutdown` begins the graceful drain.
pub struct Runtime {
    pub router: Router,
    pub state: AppState,
    pub shutdown: CancellationToken,
    pub handles: Vec<tokio::task::JoinHandle<()>>,
}

/// Sandbox admission rules shipped by default. Operators extend the set
/// through SECURITY_POLICY_IDS-selected policy documents in the store.
fn baseline_policies(level: &str) -> Vec<Policy> {
    let mode = match level {
        "permissive" => EnforcementMode::Permissive,
        "detection" => EnforcementMode::Detection,
        "blocking" => EnforcementMode::Blocking,
        _ => EnforcementMode::Enforcement,
    };

    vec![Policy {
        id: "baseline".to_string(),
        name: "sandbox baseline".to_string(),
        rules: vec![
            Rule {
                id: "no-root-user".to_string(),
                category: "runtime".to_string(),
                severity: RuleSeverity::High,
                conditions: vec![Condition {
                    target: AttributeTarget::User,
                    operator: ConditionOperator::In,
                    value: serde_json::json!(["root", "0", "0:0"]),
                }],
                actions: vec![RuleAction::Alert, RuleAction::Block],
                mode,
                enabled: true,
                priority: 1,
            },
            Rule {
                id: "no-docker-socket".to_string(),
                category: "runtime".to_string(),
                severity: RuleSeverity::Critical,
                conditions: vec![Condition {
                    target: AttributeTarget::Volume,
                    operator: ConditionOperator::Contains,
                    value: serde_json::json!("docker.sock"),
                }],
                actions: vec![RuleAction::Alert, RuleAction::Block],
                mode,
                enabled: true,
                priority: 0,
            },
            Rule {
                id: "pinned-sandbox-image".to_string(),
                category: "supply-chain".to_string(),
                severity: RuleSeverity::Medium,
                conditions: vec![Condition {
                    target: AttributeTarget::ImageName,
                    operator: ConditionOperator::NotContains,
                    value: serde_json::json!("runnerhub/"),
                }],
                actions: vec![RuleAction::Log, RuleAction::Alert],
                mode: EnforcementMode::Detection,
                enabled: false,
                priority: 5,
            },
        ],
    }]
}

/// Connect the durable store and apply migrations.
async fn connect_store(config: &Config) -> anyhow::Result<(PgPool, Option<PgPool>)> {
    let primary = PgPoolOptions::new()
        .min_connections(config.store.pool_min)
        .max_connections(config.store.pool_max)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.store.url)
        .await?;
    sqlx::migrate!("./migrations").run(&primary).await?;

    let replica = match &config.store.replica_url {
        Some(url) => Some(
            PgPoolOptions::new()
                .min_connections(1)
                .max_connections(config.store.pool_max)
                .acquire_timeout(Duration::from_secs(10))
                .connect(url)
                .await?,
        ),
        None => None,
    };
    Ok((primary, replica))
}

/// Build every capability, spawn the background services, and assemble the
/// router.
pub async fn bootstrap(config: Config) -> anyhow::Result<Runtime> {
    let shutdown = CancellationToken::new();
    let hub = StreamHub::new();
    let metrics: Arc<dyn MetricsSink> = Arc::new(MemoryMetricsSink::new());
    let secrets: Arc<dyn SecretStore> = Arc::new(EnvSecretStore);

    // Durable store
    let (primary, replica) = connect_store(&config).await?;
    let job_store = Arc::new(FailoverStore::new(
        PostgresJobStore::new(primary.clone()),
        replica.clone().map(PostgresJobStore::new),
    ));
    let promote_handle = job_store.clone();
    let job_store: Arc<dyn JobStore> = job_store;

    // Coordination store
    let coord: Arc<dyn CoordStore> = Arc::new(
        RedisCoordStore::connect(&config.coord.url, &config.coord.key_prefix).await?,
    );

    // Container engine and pool
    let container_engine: Arc<dyn ContainerEngine> = Arc::new(DockerEngine::connect()?);
    let manager = Arc::new(ContainerManager::new(
        container_engine.clone(),
        config.limits.clone(),
        config.pool.clone(),
        std::env::var("SANDBOX_IMAGE")
            .unwrap_or_else(|_| "runnerhub/sandbox:latest".to_string()),
        SecurityContext {
            read_only_rootfs: config.security.read_only_rootfs,
            ..SecurityContext::default()
        },
        Some(primary.clone()),
    ));
    let (pool, pool_handle) = ContainerPool::new(manager, config.pool.clone());
    let pool_token = shutdown.clone();
    let pool_task = tokio::spawn(async move { pool.run(pool_token).await });

    // Queue engine
    let queue = Arc::new(QueueEngine::new(
        job_store.clone(),
        hub.clone(),
        metrics.clone(),
        config.queues.clone(),
    ));

    // Crash recovery before workers start draining.
    recover_at_startup(&job_store, Duration::from_secs(24 * 3600)).await?;

    // Security
    let security = Arc::new(SecurityService::new(
        Evaluator::new(baseline_policies(&config.security.level)),
        hub.clone(),
        Some(primary.clone()),
    ));

    // Runners and delegation
    let runners = Arc::new(RunnerRegistry::new(Some(primary.clone())));

    // Forge client
    let forge = (!config.forge.token.is_empty() && !config.forge.repository.is_empty()).then(
        || {
            Arc::new(forge::ForgeClient::new(forge::ForgeOptions {
                base_url: config.forge.base_url.clone(),
                token: config.forge.token.clone(),
                repository: config.forge.repository.clone(),
            }))
        },
    );

    // Processors and workers
    let prober = Arc::new(Mutex::new(HealthProber::new(
        container_engine.clone(),
        ProbeConfig::default(),
    )));
    let webhook_events = Arc::new(PostgresWebhookEventStore::new(primary.clone()));
    let mut registry = JobRegistry::new();
    register_processors(
        &mut registry,
        Arc::new(ProcessorDeps {
            queue: queue.clone(),
            pool: pool_handle.clone(),
            container_engine: container_engine.clone(),
            security: security.clone(),
            runners: runners.clone(),
            prober: prober.clone(),
            webhook_events: webhook_events.clone(),
            hub: hub.clone(),
            metrics: metrics.clone(),
            forge: forge.clone(),
            db: Some(primary.clone()),
            queue_config: config.queues.clone(),
        }),
    );
    let workers = Arc::new(WorkerPool::new(
        queue.clone(),
        Arc::new(registry),
        hub.clone(),
        config.core.node_id.clone(),
    ));
    let mut handles = workers.spawn(shutdown.clone());
    handles.push(pool_task);

    // Leader election and scheduler
    let elector = Arc::new(LeaderElector::new(
        coord.clone(),
        hub.clone(),
        config.core.node_id.clone(),
        config.ha.lease_ttl,
        config.ha.renew_interval,
    ));
    if config.ha.enabled {
        let run_elector = elector.clone();
        let token = shutdown.clone();
        handles.push(tokio::spawn(async move { run_elector.run(token).await }));
    } else {
        // Single-node deployments act as their own leader.
        elector
            .leader_flag()
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    let scheduler = Scheduler::new(queue.clone(), elector.leader_flag());
    let scheduler_token = shutdown.clone();
    handles.push(tokio::spawn(async move {
        scheduler.run(scheduler_token).await;
    }));

    // Health monitor and failover
    let mut probes: Vec<Arc<dyn HealthProbe>> = vec![
        Arc::new(StoreProbe::primary(primary.clone())),
        Arc::new(CoordProbe::new(coord.clone())),
        Arc::new(EngineProbe::new(container_engine.clone())),
        Arc::new(ApiProbe::new(config.core.listen_port)),
    ];
    if let Some(replica) = &replica {
        probes.push(Arc::new(StoreProbe::replica(replica.clone())));
    }
    let coordinator = Arc::new(FailoverCoordinator::new(
        queue.clone(),
        elector.clone(),
        hub.clone(),
        config.ha.store_failover_enabled,
        config.ha.coord_failover_enabled,
        Box::new(move || promote_handle.promote_replica()),
    ));
    let monitor = Arc::new(HealthMonitor::new(
        probes,
        coordinator,
        config.ha.health_check_interval,
    ));
    let health = monitor.statuses();
    let monitor_token = shutdown.clone();
    let run_monitor = monitor.clone();
    handles.push(tokio::spawn(async move {
        run_monitor.run(monitor_token).await;
    }));

    // Webhook ingress
    let ingress = Arc::new(WebhookIngress::new(
        config.webhook.clone(),
        webhook_events.clone(),
        queue.clone(),
    ));

    let deps = OrchestratorDeps {
        db: Some(primary.clone()),
        queue,
        coord,
        container_engine,
        pool: pool_handle,
        runners,
        security,
        prober,
        webhook_events,
        ingress,
        secrets,
        metrics,
        hub,
        audit: Some(Arc::new(AuditLog::new(primary))),
        forge,
    };

    let state = AppState {
        deps,
        auth: Arc::new(AuthService::new(
            &config.auth.jwt_secret,
            config.auth.jwt_issuer.clone(),
        )),
        admin_user: config.auth.admin_user.clone(),
        admin_password: config.auth.admin_password.clone(),
        health,
        leader: elector,
        node_id: config.core.node_id.clone(),
    };

    let router = build_router(state.clone(), &config);
    Ok(Runtime {
        router,
        state,
        shutdown,
        handles,
    })
}

/// Route and middleware assembly. Pure, so tests can mount it over
/// in-memory state.
pub fn build_router(state: AppState, config: &Config) -> Router {
    let data_limiter = Arc::new(RateLimiter::new(
        config.rate_limit.window,
        config.rate_limit.limit,
    ));
    let auth_limiter = Arc::new(RateLimiter::new(
        config.rate_limit.window,
        config.rate_limit.auth_limit,
    ));
    let auth_service = state.auth.clone();

    let protected = Router::new()
        .route("/api/jobs/delegate", post(routes::jobs::delegate_handler))
        .route("/api/jobs", get(routes::jobs::list_handler))
        .route("/api/jobs/:id", get(routes::jobs::get_handler))
        .route("/api/jobs/:id/logs", get(routes::jobs::logs_handler))
        .route("/api/jobs/:id/status", put(routes::jobs::status_handler))
        .route(
            "/api/runners",
            get(routes::runners::list_handler).post(routes::runners::register_handler),
        )
        .route(
            "/api/runners/:id/assignment",
            get(routes::runners::assignment_handler),
        )
        .route("/api/runners/:id", delete(routes::runners::remove_handler))
        .route("/api/github/status", get(routes::metrics::forge_status_handler))
        .route("/api/security/scan", post(routes::security::scan_handler))
        .route("/api/queues/status", get(routes::queues::status_handler))
        .route("/api/queues/:queue/pause", post(routes::queues::pause_handler))
        .route(
            "/api/queues/:queue/resume",
            post(routes::queues::resume_handler),
        )
        .route(
            "/api/queues/:queue/failed",
            delete(routes::queues::delete_failed_handler),
        )
        .route(
            "/api/queues/:queue/failed/:id/retry",
            post(routes::queues::retry_dead_handler),
        )
        .route("/api/metrics", get(routes::metrics::metrics_handler))
        .route(
            "/api/monitoring/dashboard",
            get(routes::metrics::dashboard_handler),
        )
        .route("/api/audit/verify", get(routes::metrics::audit_verify_handler))
        .route("/api/ws", get(routes::ws::ws_handler))
        .layer(middleware::from_fn({
            let limiter = data_limiter;
            move |req, next| limit_by_token(limiter.clone(), req, next)
        }))
        .layer(middleware::from_fn({
            let auth_service = auth_service.clone();
            move |req, next| require_auth(auth_service.clone(), req, next)
        }));

    let auth_routes = Router::new()
        .route("/api/auth/login", post(routes::auth::login_handler))
        .layer(middleware::from_fn({
            let limiter = auth_limiter;
            move |req, next| limit_by_ip(limiter.clone(), req, next)
        }));

    let public = Router::new()
        .route("/health", get(routes::health::health_handler))
        .route(
            "/webhook",
            post(routes::webhook::webhook_handler)
                .layer(DefaultBodyLimit::max(config.webhook.max_body_bytes)),
        );

    Router::new()
        .merge(protected)
        .merge(auth_routes)
        .merge(public)
        .layer(Extension(state))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
