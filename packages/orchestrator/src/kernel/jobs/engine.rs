//! Queue engine: the enqueue path and queue-level controls.
//!
//! Workers (worker.rs) drain what this module admits. Enqueueing validates
//! the payload, routes it, checks the queue's admission capacity, snapshots
//! the retry policy onto the row, and announces the job on the stream hub.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::common::{Error, Kind, Result};
use crate::config::QueueConfig;
use crate::kernel::jobs::job::{Job, JobClass, QueueName};
use crate::kernel::jobs::payload::{AlertSeverity, JobPayload};
use crate::kernel::jobs::router;
use crate::kernel::jobs::store::{EnqueueRequest, EnqueueResult, JobStore};
use crate::kernel::metrics::MetricsSink;
use crate::kernel::stream_hub::StreamHub;

/// Extra enqueue options beyond what the route derives.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub idempotency_key: Option<String>,
    pub source_event_id: Option<String>,
}

pub struct QueueEngine {
    store: Arc<dyn JobStore>,
    hub: StreamHub,
    metrics: Arc<dyn MetricsSink>,
    config: QueueConfig,
    paused: RwLock<HashSet<QueueName>>,
}

impl QueueEngine {
    pub fn new(
        store: Arc<dyn JobStore>,
        hub: StreamHub,
        metrics: Arc<dyn MetricsSink>,
        config: QueueConfig,
    ) -> Self {
        Self {
            store,
            hub,
            metrics,
            config,
            paused: RwLock::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Worker batch size for a queue (the configured concurrency).
    pub fn concurrency(&self, queue: QueueName) -> usize {
        match queue {
            QueueName::JobExecution => self.config.job_execution_concurrency,
            QueueName::ContainerManagement => self.config.container_management_concurrency,
            QueueName::Monitoring => self.config.monitoring_concurrency,
            QueueName::WebhookProcessing => self.config.webhook_processing_concurrency,
            QueueName::Cleanup => self.config.cleanup_concurrency,
            QueueName::MetricsCollection => self.config.metrics_collection_concurrency,
        }
    }

    pub async fn enqueue(&self, payload: JobPayload) -> Result<EnqueueResult> {
        self.enqueue_with(payload, EnqueueOptions::default()).await
    }

    pub async fn enqueue_with(
        &self,
        payload: JobPayload,
        options: EnqueueOptions,
    ) -> Result<EnqueueResult> {
        let value = payload.validate()?;
        let route = router::route(&payload);

        let depth = self.store.depth(route.queue).await?;
        if depth >= self.config.admission_capacity {
            self.metrics.incr("queue_admission_rejected", 1);
            return Err(Error::new(
                Kind::ResourceExhausted,
                format!("queue {} is at capacity", route.queue.as_str()),
            )
            .with_retry_after(30));
        }

        let class = payload.class();
        let result = self
            .store
            .enqueue(EnqueueRequest {
                class,
                queue: route.queue,
                priority: route.priority,
                payload: value,
                policy: route.policy,
                delay: route.delay,
                idempotency_key: options.idempotency_key,
                source_event_id: options.source_event_id,
            })
            .await?;

        if result.is_created() {
            self.metrics.incr("jobs_enqueued", 1);
            self.hub
                .publish(
                    "jobs",
                    serde_json::json!({
                        "event": "job_enqueued",
                        "job_id": result.job_id(),
                        "class": class.as_str(),
                        "queue": route.queue.as_str(),
                    }),
                )
                .await;
        }
        Ok(result)
    }

    pub async fn pause(&self, queue: QueueName) {
        self.paused.write().await.insert(queue);
        tracing::info!(queue = queue.as_str(), "queue paused");
    }

    pub async fn resume(&self, queue: QueueName) {
        self.paused.write().await.remove(&queue);
        tracing::info!(queue = queue.as_str(), "queue resumed");
    }

    /// Failover support: stop draining everywhere while jobs are still
    /// accepted into the store.
    pub async fn pause_all(&self) {
        let mut paused = self.paused.write().await;
        for queue in QueueName::ALL {
            paused.insert(queue);
        }
        tracing::warn!("all queues paused");
    }

    pub async fn resume_all(&self) {
        self.paused.write().await.clear();
        tracing::info!("all queues resumed");
    }

    pub async fn is_paused(&self, queue: QueueName) -> bool {
        self.paused.read().await.contains(&queue)
    }

    /// Consequences of a job dying: an alert sized to the failure, and a
    /// compensating runner cleanup for workflow executions.
    pub async fn handle_dead(&self, job: &Job, error: &Error) {
        self.metrics.incr("jobs_dead", 1);
        self.hub
            .publish(
                "jobs",
                serde_json::json!({
                    "event": "job_dead",
                    "job_id": job.id,
                    "class": job.class.as_str(),
                    "error_kind": error.kind.as_str(),
                }),
            )
            .await;

        // A dead alert must not fan out into another alert.
        if job.class != JobClass::SendAlert {
            let severity = severity_for(error.kind);
            let alert = JobPayload::SendAlert {
                severity,
                message: format!(
                    "{} job {} dead after {} attempts: {}",
                    job.class.as_str(),
                    job.id,
                    job.attempts,
                    error.message
                ),
                source: "queue_engine".to_string(),
            };
            if let Err(err) = self.enqueue(alert).await {
                tracing::error!(job_id = %job.id, error = %err, "failed to enqueue dead-job alert");
            }
        }

        if job.class == JobClass::ExecuteWorkflow {
            if let Some(runner_id) = runner_of(job) {
                let cleanup = JobPayload::CleanupRunner { runner_id };
                if let Err(err) = self.enqueue(cleanup).await {
                    tracing::error!(job_id = %job.id, error = %err, "failed to enqueue compensating cleanup");
                }
            }
        }
    }
}

fn severity_for(kind: Kind) -> AlertSeverity {
    match kind {
        Kind::ResourceExhausted | Kind::IntegrityViolation => AlertSeverity::Critical,
        Kind::DependencyUnavailable
        | Kind::DependencyTimeout
        | Kind::Internal
        | Kind::PolicyViolation => AlertSeverity::High,
        Kind::Validation | Kind::Conflict | Kind::NotFound => AlertSeverity::Medium,
        _ => AlertSeverity::Low,
    }
}

fn runner_of(job: &Job) -> Option<Uuid> {
    job.payload
        .get("runner_id")
        .and_then(|value| value.as_str())
        .and_then(|raw| Uuid::parse_str(raw).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::jobs::job::JobState;
    use crate::kernel::jobs::store::MemoryJobStore;
    use crate::kernel::metrics::MemoryMetricsSink;

    fn test_queue_config() -> QueueConfig {
        QueueConfig {
            job_execution_concurrency: 5,
            container_management_concurrency: 10,
            monitoring_concurrency: 3,
            webhook_processing_concurrency: 20,
            cleanup_concurrency: 1,
            metrics_collection_concurrency: 2,
            visibility_timeout: std::time::Duration::from_secs(60),
            admission_capacity: 3,
            completed_retention: std::time::Duration::from_secs(3600),
            failed_retention: std::time::Duration::from_secs(3600),
        }
    }

    fn engine() -> QueueEngine {
        QueueEngine::new(
            Arc::new(MemoryJobStore::new()),
            StreamHub::new(),
            Arc::new(MemoryMetricsSink::new()),
            test_queue_config(),
        )
    }

    fn health_check() -> JobPayload {
        JobPayload::HealthCheck { container_id: None }
    }

    #[tokio::test]
    async fn enqueue_routes_and_persists() {
        let engine = engine();
        let result = engine.enqueue(health_check()).await.unwrap();
        assert!(result.is_created());

        let job = engine
            .store()
            .find(result.job_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.queue, QueueName::ContainerManagement);
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.retry_policy.0.max_attempts, 1);
    }

    #[tokio::test]
    async fn admission_capacity_rejects_with_retryable_error() {
        let engine = engine();
        for _ in 0..3 {
            engine.enqueue(health_check()).await.unwrap();
        }
        let err = engine.enqueue(health_check()).await.unwrap_err();
        assert_eq!(err.kind, Kind::ResourceExhausted);
        assert!(err.kind.is_retryable());
        assert!(err.retry_after.is_some());
    }

    #[tokio::test]
    async fn delayed_route_lands_in_delayed_state() {
        let engine = engine();
        let result = engine
            .enqueue(JobPayload::CleanupRunner {
                runner_id: Uuid::new_v4(),
            })
            .await
            .unwrap();
        let job = engine
            .store()
            .find(result.job_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.state, JobState::Delayed);
        assert!(job.due_at.is_some());
    }

    #[tokio::test]
    async fn pause_all_flags_every_queue() {
        let engine = engine();
        engine.pause_all().await;
        for queue in QueueName::ALL {
            assert!(engine.is_paused(queue).await);
        }
        engine.resume_all().await;
        assert!(!engine.is_paused(QueueName::JobExecution).await);
    }

    #[tokio::test]
    async fn dead_workflow_spawns_alert_and_cleanup() {
        let engine = engine();
        let runner_id = Uuid::new_v4();
        let job = Job::builder()
            .class(JobClass::ExecuteWorkflow)
            .queue(QueueName::JobExecution)
            .payload(serde_json::json!({
                "class": "execute_workflow",
                "repository": "acme/widgets",
                "workflow": "ci",
                "event": "push",
                "runner_id": runner_id,
            }))
            .retry_policy(sqlx::types::Json(
                crate::kernel::jobs::retry::RetryPolicy::fixed(
                    std::time::Duration::from_secs(1),
                    3,
                ),
            ))
            .build();

        engine
            .handle_dead(&job, &Error::new(Kind::DependencyTimeout, "network_timeout"))
            .await;

        let monitoring = engine
            .store()
            .list(Some(QueueName::Monitoring), None, 10)
            .await
            .unwrap();
        assert_eq!(monitoring.len(), 1);
        assert_eq!(monitoring[0].class, JobClass::SendAlert);

        let execution = engine
            .store()
            .list(Some(QueueName::JobExecution), None, 10)
            .await
            .unwrap();
        assert_eq!(execution.len(), 1);
        assert_eq!(execution[0].class, JobClass::CleanupRunner);
    }

    #[tokio::test]
    async fn dead_alert_does_not_recurse() {
        let engine = engine();
        let job = Job::builder()
            .class(JobClass::SendAlert)
            .queue(QueueName::Monitoring)
            .payload(serde_json::json!({"class": "send_alert"}))
            .retry_policy(sqlx::types::Json(
                crate::kernel::jobs::retry::RetryPolicy::fixed(
                    std::time::Duration::from_secs(1),
                    5,
                ),
            ))
            .build();

        engine
            .handle_dead(&job, &Error::new(Kind::Internal, "sink offline"))
            .await;

        let monitoring = engine
            .store()
            .list(Some(QueueName::Monitoring), None, 10)
            .await
            .unwrap();
        assert!(monitoring.is_empty());
    }
}
