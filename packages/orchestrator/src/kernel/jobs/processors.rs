//! Processors for every job class.
//!
//! Each processor holds the capabilities it needs and reports failure with
//! an error code the class's retry policy understands. Registration wires
//! the full routing table to concrete behavior.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::common::{Error, Kind, Result};
use crate::config::QueueConfig;
use crate::kernel::containers::engine::ContainerEngine;
use crate::kernel::containers::health::HealthProber;
use crate::kernel::containers::lifecycle::Sandbox;
use crate::kernel::containers::pool::PoolHandle;
use crate::kernel::jobs::engine::QueueEngine;
use crate::kernel::jobs::job::{JobClass, JobPriority};
use crate::kernel::jobs::payload::JobPayload;
use crate::kernel::jobs::registry::{JobProcessor, JobRegistry, ProcessContext};
use crate::kernel::jobs::store::JobStore;
use crate::kernel::metrics::MetricsSink;
use crate::kernel::runners::{Assignment, RunnerRegistry, RunnerState};
use crate::kernel::security::evaluator::ScanFindings;
use crate::kernel::security::policy::ContainerSnapshot;
use crate::kernel::security::service::SecurityService;
use crate::kernel::stream_hub::StreamHub;
use crate::kernel::webhooks::event::WebhookEventStore;

const SANDBOX_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(300);

/// Shared capabilities for all processors.
pub struct ProcessorDeps {
    pub queue: Arc<QueueEngine>,
    pub pool: PoolHandle,
    pub container_engine: Arc<dyn ContainerEngine>,
    pub security: Arc<SecurityService>,
    pub runners: Arc<RunnerRegistry>,
    pub prober: Arc<Mutex<HealthProber>>,
    pub webhook_events: Arc<dyn WebhookEventStore>,
    pub hub: StreamHub,
    pub metrics: Arc<dyn MetricsSink>,
    pub forge: Option<Arc<forge::ForgeClient>>,
    pub db: Option<PgPool>,
    pub queue_config: QueueConfig,
}

pub fn register_processors(registry: &mut JobRegistry, deps: Arc<ProcessorDeps>) {
    registry.register(
        JobClass::ExecuteWorkflow,
        Arc::new(ExecuteWorkflowProcessor { deps: deps.clone() }),
    );
    registry.register(
        JobClass::PrepareRunner,
        Arc::new(PrepareRunnerProcessor { deps: deps.clone() }),
    );
    registry.register(
        JobClass::CleanupRunner,
        Arc::new(CleanupRunnerProcessor { deps: deps.clone() }),
    );
    registry.register(
        JobClass::CreateContainer,
        Arc::new(CreateContainerProcessor { deps: deps.clone() }),
    );
    registry.register(
        JobClass::DestroyContainer,
        Arc::new(DestroyContainerProcessor { deps: deps.clone() }),
    );
    registry.register(
        JobClass::HealthCheck,
        Arc::new(HealthCheckProcessor { deps: deps.clone() }),
    );
    registry.register(
        JobClass::ProcessWebhook,
        Arc::new(ProcessWebhookProcessor { deps: deps.clone() }),
    );
    registry.register(
        JobClass::SyncExternalData,
        Arc::new(SyncExternalDataProcessor { deps: deps.clone() }),
    );
    registry.register(
        JobClass::CollectMetrics,
        Arc::new(CollectMetricsProcessor { deps: deps.clone() }),
    );
    registry.register(
        JobClass::SendAlert,
        Arc::new(SendAlertProcessor { deps: deps.clone() }),
    );
    registry.register(
        JobClass::UpdateStatus,
        Arc::new(UpdateStatusProcessor { deps: deps.clone() }),
    );
    registry.register(
        JobClass::CleanupOldJobs,
        Arc::new(CleanupOldJobsProcessor { deps: deps.clone() }),
    );
    registry.register(
        JobClass::CleanupContainers,
        Arc::new(CleanupContainersProcessor { deps: deps.clone() }),
    );
    registry.register(JobClass::CleanupLogs, Arc::new(CleanupLogsProcessor { deps }));
}

fn wrong_payload(class: JobClass) -> Error {
    Error::new(
        Kind::IntegrityViolation,
        format!("payload does not match {}", class.as_str()),
    )
}

/// Admission snapshot for a sandbox the orchestrator itself created: the
/// security context applied at create time is the ground truth.
pub fn sandbox_snapshot(sandbox: &Sandbox) -> ContainerSnapshot {
    let (image_name, image_tag) = match sandbox.image.rsplit_once(':') {
        Some((name, tag)) => (name.to_string(), tag.to_string()),
        None => (sandbox.image.clone(), "latest".to_string()),
    };
    ContainerSnapshot {
        container_id: sandbox.id,
        image_name,
        image_tag,
        registry: "docker.io".to_string(),
        labels: sandbox
            .labels
            .iter()
            .map(|label| (label.clone(), "true".to_string()))
            .collect(),
        env: Default::default(),
        ports: vec![],
        volumes: vec![],
        capabilities: vec![],
        user: "1000:1000".to_string(),
        command: String::new(),
        privileged: false,
        run_as_non_root: true,
        read_only_root_filesystem: sandbox.read_only_rootfs,
    }
}

// ============================================================================
// execute_workflow
// ============================================================================

struct ExecuteWorkflowProcessor {
    deps: Arc<ProcessorDeps>,
}

#[async_trait]
impl JobProcessor for ExecuteWorkflowProcessor {
    async fn process(&self, ctx: &ProcessContext, payload: JobPayload) -> Result<()> {
        let JobPayload::ExecuteWorkflow {
            repository,
            workflow,
            event,
            labels,
            ..
        } = payload
        else {
            return Err(wrong_payload(JobClass::ExecuteWorkflow));
        };

        ctx.progress.report(0.05, Some("acquiring sandbox")).await;
        let sandbox = self
            .deps
            .pool
            .acquire(
                labels.clone(),
                repository.clone(),
                JobPriority::High,
                ctx.job_id,
                SANDBOX_ACQUIRE_TIMEOUT,
            )
            .await?;

        // Security evaluation sits on the admission path: no workflow runs
        // in a sandbox the policy set rejects.
        let snapshot = sandbox_snapshot(&sandbox);
        let evaluation = self
            .deps
            .security
            .assess(&snapshot, ScanFindings::default())
            .await;
        self.deps
            .security
            .enforce(
                &evaluation,
                &sandbox,
                &self.deps.pool,
                &self.deps.container_engine,
                &self.deps.queue,
            )
            .await?;
        if evaluation.blocked() {
            return Err(Error::new(
                Kind::PolicyViolation,
                format!("sandbox {} blocked by security policy", sandbox.id),
            ));
        }

        ctx.progress.report(0.3, Some("sandbox admitted")).await;

        // Mirror the assignment to a registered proxy runner, if any; the
        // proxy reports transitions back over the delegation API.
        let delegated = self
            .deps
            .runners
            .assign(Assignment {
                job_id: ctx.job_id,
                repository: repository.clone(),
                workflow: workflow.clone(),
                labels: labels.clone(),
            })
            .await
            .ok();

        let result = self.run_in_sandbox(ctx, &sandbox, &repository, &workflow, &event).await;

        if let Some(runner) = &delegated {
            self.deps.runners.complete_assignment(runner.id).await.ok();
        }

        // Sandboxes are ephemeral: release the slot, then recycle through
        // the container-management queue.
        self.deps.pool.release(sandbox.id).await;
        let recycle = JobPayload::DestroyContainer {
            container_id: sandbox.id,
        };
        if let Err(err) = self.deps.queue.enqueue(recycle).await {
            warn!(container_id = %sandbox.id, error = %err, "failed to enqueue sandbox recycle");
        }

        result?;
        ctx.progress.report(1.0, Some("workflow complete")).await;
        Ok(())
    }
}

impl ExecuteWorkflowProcessor {
    async fn run_in_sandbox(
        &self,
        ctx: &ProcessContext,
        sandbox: &Sandbox,
        repository: &str,
        workflow: &str,
        event: &str,
    ) -> Result<()> {
        ctx.progress.report(0.5, Some("executing workflow")).await;
        let output = self
            .deps
            .container_engine
            .exec(
                &sandbox.engine_id,
                vec![
                    "/usr/local/bin/run-workflow".to_string(),
                    workflow.to_string(),
                ],
                vec![
                    format!("RUNNER_REPOSITORY={repository}"),
                    format!("RUNNER_EVENT={event}"),
                    format!("RUNNER_JOB_ID={}", ctx.job_id),
                ],
                None,
                Some("/workspace".to_string()),
            )
            .await?;

        self.deps
            .hub
            .publish(
                "jobs",
                serde_json::json!({
                    "event": "workflow_finished",
                    "job_id": ctx.job_id,
                    "exit_code": output.exit_code,
                }),
            )
            .await;

        if output.exit_code != 0 {
            return Err(Error::new(
                Kind::Internal,
                format!("workflow exited with code {}", output.exit_code),
            )
            .with_code("workflow_failed")
            .with_details(serde_json::json!({
                "stderr_tail": output.stderr.chars().rev().take(2000).collect::<String>()
                    .chars().rev().collect::<String>(),
            })));
        }
        Ok(())
    }
}

// ============================================================================
// runner preparation / cleanup
// ============================================================================

struct PrepareRunnerProcessor {
    deps: Arc<ProcessorDeps>,
}

#[async_trait]
impl JobProcessor for PrepareRunnerProcessor {
    async fn process(&self, _ctx: &ProcessContext, payload: JobPayload) -> Result<()> {
        let JobPayload::PrepareRunner { runner_id, .. } = payload else {
            return Err(wrong_payload(JobClass::PrepareRunner));
        };

        self.deps
            .runners
            .set_state(runner_id, RunnerState::Starting)
            .await?;

        // A fresh registration token keeps the proxy connected to the forge.
        if let Some(forge) = &self.deps.forge {
            forge.registration_token().await.map_err(|err| {
                Error::dependency(format!("registration token unavailable: {err}"))
            })?;
        }

        self.deps
            .runners
            .set_state(runner_id, RunnerState::Idle)
            .await?;
        Ok(())
    }
}

struct CleanupRunnerProcessor {
    deps: Arc<ProcessorDeps>,
}

#[async_trait]
impl JobProcessor for CleanupRunnerProcessor {
    async fn process(&self, _ctx: &ProcessContext, payload: JobPayload) -> Result<()> {
        let JobPayload::CleanupRunner { runner_id } = payload else {
            return Err(wrong_payload(JobClass::CleanupRunner));
        };

        match self.deps.runners.remove(runner_id).await {
            Ok(()) => {}
            // Already cleaned up elsewhere; compensation is idempotent.
            Err(err) if err.kind == Kind::NotFound => {}
            Err(err) => return Err(err),
        }
        Ok(())
    }
}

// ============================================================================
// container management
// ============================================================================

struct CreateContainerProcessor {
    deps: Arc<ProcessorDeps>,
}

#[async_trait]
impl JobProcessor for CreateContainerProcessor {
    async fn process(&self, _ctx: &ProcessContext, payload: JobPayload) -> Result<()> {
        let JobPayload::CreateContainer {
            repository, labels, ..
        } = payload
        else {
            return Err(wrong_payload(JobClass::CreateContainer));
        };
        self.deps.pool.prewarm(repository, labels).await;
        Ok(())
    }
}

struct DestroyContainerProcessor {
    deps: Arc<ProcessorDeps>,
}

#[async_trait]
impl JobProcessor for DestroyContainerProcessor {
    async fn process(&self, _ctx: &ProcessContext, payload: JobPayload) -> Result<()> {
        let JobPayload::DestroyContainer { container_id } = payload else {
            return Err(wrong_payload(JobClass::DestroyContainer));
        };

        match self.deps.pool.evict(container_id, true).await {
            Ok(()) => {
                self.deps.security.forget(container_id).await;
                Ok(())
            }
            Err(err) if err.kind == Kind::NotFound => {
                self.deps.security.forget(container_id).await;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

struct HealthCheckProcessor {
    deps: Arc<ProcessorDeps>,
}

#[async_trait]
impl JobProcessor for HealthCheckProcessor {
    async fn process(&self, _ctx: &ProcessContext, payload: JobPayload) -> Result<()> {
        let JobPayload::HealthCheck { container_id } = payload else {
            return Err(wrong_payload(JobClass::HealthCheck));
        };

        let sandboxes = self.deps.pool.list().await?;
        let targets: Vec<Sandbox> = sandboxes
            .into_iter()
            .filter(|sandbox| container_id.map_or(true, |id| sandbox.id == id))
            .collect();

        for sandbox in targets {
            let report = {
                let prober = self.deps.prober.lock().await;
                prober.probe(&sandbox).await?
            };
            if let Some(db) = &self.deps.db {
                let result = sqlx::query(
                    "INSERT INTO container_health (container_id, healthy, probes, checked_at) \
                     VALUES ($1, $2, $3, $4)",
                )
                .bind(sandbox.id)
                .bind(report.healthy)
                .bind(serde_json::json!(report.probes))
                .bind(report.checked_at)
                .execute(db)
                .await;
                if let Err(err) = result {
                    warn!(error = %err, "health mirror write failed");
                }
            }
            let quarantine = {
                let mut prober = self.deps.prober.lock().await;
                prober.record(&report)
            };
            if quarantine {
                warn!(container_id = %sandbox.id, "three failed probes, quarantining");
                self.deps.pool.quarantine(sandbox.id).await.ok();
                let alert = JobPayload::SendAlert {
                    severity: crate::kernel::jobs::payload::AlertSeverity::High,
                    message: format!("sandbox {} quarantined after failed health probes", sandbox.id),
                    source: "health_check".to_string(),
                };
                self.deps.queue.enqueue(alert).await.ok();
            }
        }
        Ok(())
    }
}

// ============================================================================
// webhook processing / external sync
// ============================================================================

struct ProcessWebhookProcessor {
    deps: Arc<ProcessorDeps>,
}

#[async_trait]
impl JobProcessor for ProcessWebhookProcessor {
    async fn process(&self, _ctx: &ProcessContext, payload: JobPayload) -> Result<()> {
        let JobPayload::ProcessWebhook {
            delivery_id,
            event_type,
            repository,
        } = payload
        else {
            return Err(wrong_payload(JobClass::ProcessWebhook));
        };

        let event = self
            .deps
            .webhook_events
            .find(&delivery_id)
            .await?
            .ok_or_else(|| {
                Error::new(Kind::IntegrityViolation, "webhook event row vanished")
                    .with_code("malformed_payload")
            })?;

        // Only queued workflow jobs fan out into executions; the remaining
        // whitelisted events are recorded state changes.
        if event_type == "workflow_job"
            && event.payload.pointer("/action").and_then(|a| a.as_str()) == Some("queued")
        {
            let workflow = event
                .payload
                .pointer("/workflow_job/workflow_name")
                .or_else(|| event.payload.pointer("/workflow_job/name"))
                .and_then(|value| value.as_str())
                .unwrap_or("unknown")
                .to_string();
            let labels = event
                .payload
                .pointer("/workflow_job/labels")
                .and_then(|value| value.as_array())
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|item| item.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            let forge_job_id = event
                .payload
                .pointer("/workflow_job/id")
                .and_then(|value| value.as_i64());

            let execute = JobPayload::ExecuteWorkflow {
                repository,
                workflow,
                event: event_type.clone(),
                labels,
                delivery_id: Some(delivery_id.clone()),
                forge_job_id,
                runner_id: None,
            };
            self.deps
                .queue
                .enqueue_with(
                    execute,
                    crate::kernel::jobs::engine::EnqueueOptions {
                        idempotency_key: Some(format!("execute:{delivery_id}")),
                        source_event_id: Some(delivery_id.clone()),
                    },
                )
                .await?;
        }

        info!(delivery_id = %delivery_id, event_type = %event_type, "webhook processed");
        Ok(())
    }
}

struct SyncExternalDataProcessor {
    deps: Arc<ProcessorDeps>,
}

#[async_trait]
impl JobProcessor for SyncExternalDataProcessor {
    async fn process(&self, _ctx: &ProcessContext, payload: JobPayload) -> Result<()> {
        let JobPayload::SyncExternalData { resource } = payload else {
            return Err(wrong_payload(JobClass::SyncExternalData));
        };

        // Heartbeat sweep runs regardless of forge connectivity.
        let offline = self
            .deps
            .runners
            .sweep_offline(chrono::Duration::minutes(5))
            .await;
        if !offline.is_empty() {
            info!(count = offline.len(), "runners marked offline");
        }

        if resource == "runners" {
            if let Some(forge) = &self.deps.forge {
                let remote = forge.list_runners().await.map_err(|err| match err {
                    forge::ForgeError::Api { status, .. } if status.as_u16() == 429 => {
                        Error::new(Kind::RateLimited, "forge rate limit").with_code("rate_limit")
                    }
                    other => Error::dependency(other.to_string()).with_code("network_error"),
                })?;
                self.deps
                    .metrics
                    .gauge("forge_runners_registered", remote.len() as f64);
            }
        }
        Ok(())
    }
}

// ============================================================================
// monitoring
// ============================================================================

struct CollectMetricsProcessor {
    deps: Arc<ProcessorDeps>,
}

#[async_trait]
impl JobProcessor for CollectMetricsProcessor {
    async fn process(&self, _ctx: &ProcessContext, payload: JobPayload) -> Result<()> {
        let JobPayload::CollectMetrics {} = payload else {
            return Err(wrong_payload(JobClass::CollectMetrics));
        };

        let mut depths = serde_json::Map::new();
        for queue in crate::kernel::jobs::job::QueueName::ALL {
            let counts = self.deps.queue.store().counts(queue).await?;
            self.deps.metrics.gauge(
                &format!("queue_depth_{}", queue.as_str()),
                (counts.queued + counts.delayed) as f64,
            );
            depths.insert(queue.as_str().to_string(), serde_json::json!(counts));
        }

        let pool = self.deps.pool.status().await?;
        self.deps.metrics.gauge("pool_utilization", pool.utilization);
        self.deps.metrics.gauge("pool_total", pool.total as f64);
        self.deps
            .metrics
            .gauge("stream_dropped_messages", self.deps.hub.dropped_count() as f64);

        if let Some(db) = &self.deps.db {
            let snapshot = serde_json::json!({
                "queues": depths,
                "pool": pool,
            });
            let result = sqlx::query(
                "INSERT INTO metrics_snapshots (captured_at, data) VALUES ($1, $2)",
            )
            .bind(Utc::now())
            .bind(&snapshot)
            .execute(db)
            .await;
            if let Err(err) = result {
                warn!(error = %err, "metrics snapshot write failed");
            }
        }
        Ok(())
    }
}

struct SendAlertProcessor {
    deps: Arc<ProcessorDeps>,
}

#[async_trait]
impl JobProcessor for SendAlertProcessor {
    async fn process(&self, _ctx: &ProcessContext, payload: JobPayload) -> Result<()> {
        let JobPayload::SendAlert {
            severity,
            message,
            source,
        } = payload
        else {
            return Err(wrong_payload(JobClass::SendAlert));
        };

        self.deps.metrics.incr("alerts_sent", 1);
        self.deps
            .hub
            .publish(
                "security",
                serde_json::json!({
                    "event": "alert",
                    "severity": severity,
                    "message": message,
                    "source": source,
                }),
            )
            .await;

        if let Some(db) = &self.deps.db {
            let result = sqlx::query(
                "INSERT INTO alerts (severity, message, source, created_at) VALUES ($1, $2, $3, $4)",
            )
            .bind(serde_json::json!(severity).as_str().unwrap_or("info").to_string())
            .bind(&message)
            .bind(&source)
            .bind(Utc::now())
            .execute(db)
            .await;
            if let Err(err) = result {
                return Err(Error::dependency(format!("alert write failed: {err}")));
            }
        }
        Ok(())
    }
}

struct UpdateStatusProcessor {
    deps: Arc<ProcessorDeps>,
}

#[async_trait]
impl JobProcessor for UpdateStatusProcessor {
    async fn process(&self, _ctx: &ProcessContext, payload: JobPayload) -> Result<()> {
        let JobPayload::UpdateStatus {
            job_id,
            status,
            exit_code,
        } = payload
        else {
            return Err(wrong_payload(JobClass::UpdateStatus));
        };

        // Mirror the proxy-reported transition to every subscriber; the
        // forge sees it through the proxy runner itself.
        self.deps
            .hub
            .publish(
                "jobs",
                serde_json::json!({
                    "event": "status_mirrored",
                    "job_id": job_id,
                    "status": status,
                    "exit_code": exit_code,
                }),
            )
            .await;
        self.deps.metrics.incr("status_updates_mirrored", 1);
        Ok(())
    }
}

// ============================================================================
// cleanup
// ============================================================================

struct CleanupOldJobsProcessor {
    deps: Arc<ProcessorDeps>,
}

#[async_trait]
impl JobProcessor for CleanupOldJobsProcessor {
    async fn process(&self, _ctx: &ProcessContext, payload: JobPayload) -> Result<()> {
        let JobPayload::CleanupOldJobs {} = payload else {
            return Err(wrong_payload(JobClass::CleanupOldJobs));
        };

        let now = Utc::now();
        let completed_before = now
            - chrono::Duration::from_std(self.deps.queue_config.completed_retention)
                .unwrap_or_default();
        let failed_before = now
            - chrono::Duration::from_std(self.deps.queue_config.failed_retention)
                .unwrap_or_default();
        let purged = self
            .deps
            .queue
            .store()
            .purge_terminal(completed_before, failed_before)
            .await?;
        if purged > 0 {
            info!(purged, "terminal jobs purged");
        }
        Ok(())
    }
}

struct CleanupContainersProcessor {
    deps: Arc<ProcessorDeps>,
}

#[async_trait]
impl JobProcessor for CleanupContainersProcessor {
    async fn process(&self, _ctx: &ProcessContext, payload: JobPayload) -> Result<()> {
        let JobPayload::CleanupContainers {} = payload else {
            return Err(wrong_payload(JobClass::CleanupContainers));
        };

        // Engine-side managed containers the pool no longer tracks are
        // leaks from a previous process; remove them.
        let tracked: std::collections::HashSet<String> = self
            .deps
            .pool
            .list()
            .await?
            .into_iter()
            .map(|sandbox| sandbox.engine_id)
            .collect();

        let mut removed = 0u32;
        for container in self.deps.container_engine.list_managed().await? {
            if !tracked.contains(&container.id) {
                if let Err(err) = self.deps.container_engine.remove(&container.id, true).await {
                    warn!(engine_id = %container.id, error = %err, "orphan removal failed");
                } else {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            info!(removed, "orphaned containers removed");
        }

        self.deps.pool.tick().await;
        Ok(())
    }
}

struct CleanupLogsProcessor {
    deps: Arc<ProcessorDeps>,
}

#[async_trait]
impl JobProcessor for CleanupLogsProcessor {
    async fn process(&self, _ctx: &ProcessContext, payload: JobPayload) -> Result<()> {
        let JobPayload::CleanupLogs {} = payload else {
            return Err(wrong_payload(JobClass::CleanupLogs));
        };
        self.deps.hub.cleanup().await;
        self.deps.metrics.incr("log_cleanup_runs", 1);
        Ok(())
    }
}
