//! Per-queue worker pools.
//!
//! Each queue gets one claim loop that pulls up to its configured
//! concurrency in a batch and processes the batch concurrently. A claimed
//! job holds a TTL reservation; a heartbeat task extends it while the
//! processor runs. Workers honor the shutdown token cooperatively: in-flight
//! jobs get a drain window, anything slower is reclaimed later by the
//! stalled sweeper.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::common::{Error, Kind};
use crate::kernel::jobs::engine::QueueEngine;
use crate::kernel::jobs::job::{Job, QueueName};
use crate::kernel::jobs::payload::JobPayload;
use crate::kernel::jobs::registry::{JobRegistry, ProcessContext, ProgressSink};
use crate::kernel::jobs::retry::RetryStrategy;
use crate::kernel::jobs::store::JobStore;
use crate::kernel::stream_hub::StreamHub;

const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(500);
const STALLED_SWEEP_INTERVAL: Duration = Duration::from_secs(15);

pub struct WorkerPool {
    engine: Arc<QueueEngine>,
    registry: Arc<JobRegistry>,
    hub: StreamHub,
    node_id: String,
}

impl WorkerPool {
    pub fn new(
        engine: Arc<QueueEngine>,
        registry: Arc<JobRegistry>,
        hub: StreamHub,
        node_id: String,
    ) -> Self {
        Self {
            engine,
            registry,
            hub,
            node_id,
        }
    }

    /// Spawn the claim loop for every queue plus the stalled sweeper.
    /// Returns the join handles so shutdown can await the drain.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();
        for queue in QueueName::ALL {
            let pool = self.clone();
            let token = shutdown.clone();
            handles.push(tokio::spawn(async move {
                pool.run_queue(queue, token).await;
            }));
        }

        let pool = self.clone();
        let token = shutdown.clone();
        handles.push(tokio::spawn(async move {
            pool.run_stalled_sweeper(token).await;
        }));

        handles
    }

    async fn run_queue(&self, queue: QueueName, shutdown: CancellationToken) {
        let concurrency = self.engine.concurrency(queue);
        info!(
            queue = queue.as_str(),
            concurrency, "queue worker starting"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            if self.engine.is_paused(queue).await {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(IDLE_POLL_INTERVAL) => {}
                }
                continue;
            }

            let visibility = self.engine.config().visibility_timeout;
            let claimed = match self
                .engine
                .store()
                .claim(queue, &self.node_id, concurrency as i64, visibility)
                .await
            {
                Ok(jobs) => jobs,
                Err(err) => {
                    error!(queue = queue.as_str(), error = %err, "claim failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                    continue;
                }
            };

            if claimed.is_empty() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(IDLE_POLL_INTERVAL) => {}
                }
                continue;
            }

            debug!(queue = queue.as_str(), count = claimed.len(), "claimed jobs");

            let mut batch = Vec::with_capacity(claimed.len());
            for job in claimed {
                let shutdown = shutdown.clone();
                batch.push(async move {
                    self.process_job(job, shutdown).await;
                });
            }
            futures::future::join_all(batch).await;
        }

        info!(queue = queue.as_str(), "queue worker stopped");
    }

    async fn process_job(&self, job: Job, shutdown: CancellationToken) {
        let Some(token) = job.reservation_token else {
            error!(job_id = %job.id, "claimed job has no reservation token");
            return;
        };

        let payload = match JobPayload::from_value(&job.payload) {
            Ok(payload) => payload,
            Err(err) => {
                // A payload that validated at enqueue time but no longer
                // deserializes is a schema drift problem, never retryable.
                self.finish_failed(
                    &job,
                    token,
                    Error::new(Kind::IntegrityViolation, err.message)
                        .with_code("malformed_payload"),
                )
                .await;
                return;
            }
        };

        let Some(processor) = self.registry.get(job.class) else {
            self.finish_failed(
                &job,
                token,
                Error::new(
                    Kind::IntegrityViolation,
                    format!("no processor registered for {}", job.class.as_str()),
                ),
            )
            .await;
            return;
        };

        let job_cancel = shutdown.child_token();
        let ctx = ProcessContext {
            job_id: job.id,
            attempt: job.attempts + 1,
            cancel: job_cancel.clone(),
            progress: ProgressSink::new(self.engine.store().clone(), job.id),
        };

        // Keep the reservation alive while the processor runs.
        let heartbeat = {
            let store = self.engine.store().clone();
            let visibility = self.engine.config().visibility_timeout;
            let cancel = job_cancel.clone();
            let job_id = job.id;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(visibility / 3);
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = interval.tick() => {
                            match store.heartbeat(job_id, token, visibility).await {
                                Ok(true) => {}
                                Ok(false) => {
                                    warn!(job_id = %job_id, "reservation lost, stopping heartbeat");
                                    break;
                                }
                                Err(err) => {
                                    warn!(job_id = %job_id, error = %err, "heartbeat failed");
                                }
                            }
                        }
                    }
                }
            })
        };

        let result = tokio::select! {
            result = processor.process(&ctx, payload) => Some(result),
            _ = shutdown.cancelled() => None,
        };

        job_cancel.cancel();
        let _ = heartbeat.await;

        match result {
            Some(Ok(())) => {
                if let Err(err) = self.engine.store().complete(job.id, token).await {
                    error!(job_id = %job.id, error = %err, "failed to mark job completed");
                    return;
                }
                debug!(job_id = %job.id, class = job.class.as_str(), "job completed");
                self.hub
                    .publish(
                        "jobs",
                        serde_json::json!({
                            "event": "job_completed",
                            "job_id": job.id,
                            "class": job.class.as_str(),
                        }),
                    )
                    .await;
            }
            Some(Err(err)) => {
                warn!(
                    job_id = %job.id,
                    class = job.class.as_str(),
                    kind = err.kind.as_str(),
                    "job failed"
                );
                self.finish_failed(&job, token, err).await;
            }
            None => {
                // Shutdown preempted the processor. Leave the job active;
                // its lease lapses and the sweeper returns it to queued.
                info!(job_id = %job.id, "job interrupted by shutdown");
            }
        }
    }

    /// Persist the failure and apply the retry decision.
    async fn finish_failed(&self, job: &Job, token: uuid::Uuid, err: Error) {
        let attempts = match self
            .engine
            .store()
            .fail(job.id, token, &err.message, err.code_str())
            .await
        {
            Ok(attempts) => attempts,
            Err(store_err) => {
                error!(job_id = %job.id, error = %store_err, "failed to record job failure");
                return;
            }
        };

        let policy = &job.retry_policy.0;
        let retry =
            err.kind.is_retryable() && policy.should_retry(err.code_str(), attempts as u32);

        if retry {
            let backoff = if matches!(policy.strategy, RetryStrategy::Custom) {
                self.registry
                    .get(job.class)
                    .and_then(|processor| processor.custom_backoff(attempts as u32))
                    .unwrap_or(Duration::ZERO)
            } else {
                policy.backoff(attempts as u32)
            };
            let due_at =
                chrono::Utc::now() + chrono::Duration::from_std(backoff).unwrap_or_default();
            if let Err(store_err) = self.engine.store().schedule_retry(job.id, due_at).await {
                error!(job_id = %job.id, error = %store_err, "failed to schedule retry");
            }
            debug!(
                job_id = %job.id,
                attempts,
                backoff_ms = backoff.as_millis() as u64,
                "retry scheduled"
            );
        } else {
            if let Err(store_err) = self
                .engine
                .store()
                .mark_dead(job.id, &err.message)
                .await
            {
                error!(job_id = %job.id, error = %store_err, "failed to mark job dead");
                return;
            }
            let mut dead = job.clone();
            dead.attempts = attempts;
            self.engine.handle_dead(&dead, &err).await;
        }
    }

    async fn run_stalled_sweeper(&self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(STALLED_SWEEP_INTERVAL) => {}
            }

            match self.engine.store().release_stalled().await {
                Ok(released) if !released.is_empty() => {
                    for job in &released {
                        warn!(
                            job_id = %job.id,
                            queue = job.queue.as_str(),
                            stalled_count = job.stalled_count,
                            "stalled reservation returned to queue"
                        );
                    }
                    self.hub
                        .publish(
                            "jobs",
                            serde_json::json!({
                                "event": "jobs_stalled",
                                "count": released.len(),
                            }),
                        )
                        .await;
                }
                Ok(_) => {}
                Err(err) => {
                    error!(error = %err, "stalled sweep failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::kernel::jobs::job::{JobClass, JobState};
    use crate::kernel::jobs::registry::JobProcessor;
    use crate::kernel::jobs::store::MemoryJobStore;
    use crate::kernel::metrics::MemoryMetricsSink;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_queue_config() -> QueueConfig {
        QueueConfig {
            job_execution_concurrency: 1,
            container_management_concurrency: 1,
            monitoring_concurrency: 1,
            webhook_processing_concurrency: 1,
            cleanup_concurrency: 1,
            metrics_collection_concurrency: 1,
            visibility_timeout: Duration::from_secs(60),
            admission_capacity: 1000,
            completed_retention: Duration::from_secs(3600),
            failed_retention: Duration::from_secs(3600),
        }
    }

    struct CountingProcessor {
        calls: AtomicU32,
        fail_with: Option<(Kind, &'static str)>,
    }

    #[async_trait]
    impl JobProcessor for CountingProcessor {
        async fn process(&self, _ctx: &ProcessContext, _payload: JobPayload) -> crate::common::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.fail_with {
                Some((kind, code)) => Err(Error::new(kind, "induced failure").with_code(code)),
                None => Ok(()),
            }
        }
    }

    fn harness(
        fail_with: Option<(Kind, &'static str)>,
    ) -> (
        Arc<WorkerPool>,
        Arc<QueueEngine>,
        Arc<CountingProcessor>,
        MemoryJobStore,
    ) {
        let store = MemoryJobStore::new();
        let engine = Arc::new(QueueEngine::new(
            Arc::new(store.clone()),
            StreamHub::new(),
            Arc::new(MemoryMetricsSink::new()),
            test_queue_config(),
        ));
        let processor = Arc::new(CountingProcessor {
            calls: AtomicU32::new(0),
            fail_with,
        });
        let mut registry = JobRegistry::new();
        registry.register(JobClass::HealthCheck, processor.clone());
        registry.register(JobClass::ExecuteWorkflow, processor.clone());
        let pool = Arc::new(WorkerPool::new(
            engine.clone(),
            Arc::new(registry),
            StreamHub::new(),
            "test-node".into(),
        ));
        (pool, engine, processor, store)
    }

    async fn drive_one(pool: &WorkerPool, engine: &QueueEngine, queue: QueueName) {
        let claimed = engine
            .store()
            .claim(queue, "test-node", 1, Duration::from_secs(60))
            .await
            .unwrap();
        for job in claimed {
            pool.process_job(job, CancellationToken::new()).await;
        }
    }

    #[tokio::test]
    async fn successful_job_completes() {
        let (pool, engine, processor, _) = harness(None);
        let id = engine
            .enqueue(JobPayload::HealthCheck { container_id: None })
            .await
            .unwrap()
            .job_id();

        drive_one(&pool, &engine, QueueName::ContainerManagement).await;

        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
        let job = engine.store().find(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.progress, 1.0);
    }

    #[tokio::test]
    async fn retryable_failure_is_delayed_with_backoff() {
        let (pool, engine, _, _) = harness(Some((Kind::DependencyTimeout, "network_timeout")));
        let id = engine
            .enqueue(JobPayload::ExecuteWorkflow {
                repository: "acme/widgets".into(),
                workflow: "ci".into(),
                event: "push".into(),
                labels: vec![],
                delivery_id: None,
                forge_job_id: None,
                runner_id: None,
            })
            .await
            .unwrap()
            .job_id();

        drive_one(&pool, &engine, QueueName::JobExecution).await;

        let job = engine.store().find(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Delayed);
        assert_eq!(job.attempts, 1);
        // First exponential backoff for execute_workflow is 5 s.
        let delay = job.due_at.unwrap() - chrono::Utc::now();
        assert!(delay.num_milliseconds() > 4_000 && delay.num_milliseconds() <= 5_100);
    }

    #[tokio::test]
    async fn non_retryable_code_goes_straight_to_dead() {
        let (pool, engine, processor, _) =
            harness(Some((Kind::Validation, "invalid_workflow_configuration")));
        let id = engine
            .enqueue(JobPayload::ExecuteWorkflow {
                repository: "acme/widgets".into(),
                workflow: "ci".into(),
                event: "push".into(),
                labels: vec![],
                delivery_id: None,
                forge_job_id: None,
                runner_id: None,
            })
            .await
            .unwrap()
            .job_id();

        drive_one(&pool, &engine, QueueName::JobExecution).await;

        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
        let job = engine.store().find(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Dead);

        // The dead workflow raised an alert in MONITORING.
        let alerts = engine
            .store()
            .list(Some(QueueName::Monitoring), None, 10)
            .await
            .unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].class, JobClass::SendAlert);
    }

    #[tokio::test]
    async fn attempts_stop_at_policy_maximum_then_dead() {
        let (pool, engine, processor, store) =
            harness(Some((Kind::DependencyTimeout, "network_timeout")));
        let id = engine
            .enqueue(JobPayload::ExecuteWorkflow {
                repository: "acme/widgets".into(),
                workflow: "ci".into(),
                event: "push".into(),
                labels: vec![],
                delivery_id: None,
                forge_job_id: None,
                runner_id: None,
            })
            .await
            .unwrap()
            .job_id();

        // Drive every attempt, forcing each backoff due immediately.
        for _ in 0..6 {
            store.force_due(id).await;
            drive_one(&pool, &engine, QueueName::JobExecution).await;
        }

        // Max attempts for execute_workflow is 3; the job is dead after.
        assert_eq!(processor.calls.load(Ordering::SeqCst), 3);
        let job = engine.store().find(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Dead);
        assert_eq!(job.attempts, 3);
    }
}
