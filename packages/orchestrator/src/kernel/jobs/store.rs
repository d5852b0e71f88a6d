//! Durable job storage.
//!
//! Every state transition lands here before the engine acts on it. The
//! Postgres implementation is the production path; `MemoryJobStore` mirrors
//! its semantics for the engine's test harness and for single-process
//! development.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::common::{db_id, Error, Result};
use crate::kernel::jobs::job::{Job, JobClass, JobPriority, JobState, QueueName};
use crate::kernel::jobs::retry::RetryPolicy;

const JOB_COLUMNS: &str = "id, class, queue, priority, source_event_id, payload, retry_policy, \
     attempts, state, progress, stalled_count, reservation_token, lease_expires_at, worker_id, \
     last_error, error_kind, idempotency_key, enqueued_at, due_at, started_at, finished_at, \
     created_at, updated_at";

/// Everything needed to persist a new job. Built by the queue engine from a
/// validated payload and its route.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub class: JobClass,
    pub queue: QueueName,
    pub priority: JobPriority,
    pub payload: serde_json::Value,
    pub policy: RetryPolicy,
    pub delay: Option<Duration>,
    pub idempotency_key: Option<String>,
    pub source_event_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueResult {
    Created(Uuid),
    Duplicate(Uuid),
}

impl EnqueueResult {
    pub fn job_id(&self) -> Uuid {
        match self {
            EnqueueResult::Created(id) | EnqueueResult::Duplicate(id) => *id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueResult::Created(_))
    }
}

/// Per-queue state counts for `/api/queues/status`.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QueueCounts {
    pub queued: i64,
    pub active: i64,
    pub delayed: i64,
    pub failed: i64,
    pub completed: i64,
    pub dead: i64,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<EnqueueResult>;

    /// Atomically move up to `limit` claimable jobs (queued, or delayed and
    /// due) to active, minting a reservation token with the given TTL.
    async fn claim(
        &self,
        queue: QueueName,
        worker_id: &str,
        limit: i64,
        visibility: Duration,
    ) -> Result<Vec<Job>>;

    /// Extend the reservation iff `token` still holds it.
    async fn heartbeat(&self, id: Uuid, token: Uuid, visibility: Duration) -> Result<bool>;

    /// active → completed. Token must match.
    async fn complete(&self, id: Uuid, token: Uuid) -> Result<()>;

    /// active → failed, recording the error and incrementing attempts.
    /// Returns the attempts made so far.
    async fn fail(&self, id: Uuid, token: Uuid, error: &str, code: &str) -> Result<i32>;

    /// failed → delayed with a due time.
    async fn schedule_retry(&self, id: Uuid, due_at: DateTime<Utc>) -> Result<()>;

    /// failed → dead.
    async fn mark_dead(&self, id: Uuid, reason: &str) -> Result<()>;

    /// Return active jobs whose lease lapsed to queued, bumping
    /// `stalled_count`. Returns the jobs that were returned to the queue.
    async fn release_stalled(&self) -> Result<Vec<Job>>;

    /// Throttled progress updates from processors.
    async fn update_progress(&self, id: Uuid, progress: f32) -> Result<()>;

    async fn find(&self, id: Uuid) -> Result<Option<Job>>;

    async fn list(
        &self,
        queue: Option<QueueName>,
        state: Option<JobState>,
        limit: i64,
    ) -> Result<Vec<Job>>;

    /// Admission depth: queued + delayed jobs in the queue.
    async fn depth(&self, queue: QueueName) -> Result<i64>;

    async fn counts(&self, queue: QueueName) -> Result<QueueCounts>;

    /// dead → queued with attempts reset (dead-letter replay).
    async fn requeue_dead(&self, id: Uuid) -> Result<bool>;

    /// Drop failed and dead jobs from a queue. Returns rows removed.
    async fn delete_failed(&self, queue: QueueName) -> Result<u64>;

    /// Startup recovery: orphaned active jobs back to queued, and failed
    /// jobs younger than `max_age` back to queued for a fresh retry
    /// decision. Tags every touched payload with a `_recovery` stanza.
    async fn recover(&self, max_age: Duration) -> Result<Vec<Job>>;

    /// Retention sweep over terminal jobs. Returns rows removed.
    async fn purge_terminal(
        &self,
        completed_before: DateTime<Utc>,
        failed_before: DateTime<Utc>,
    ) -> Result<u64>;
}

// ============================================================================
// Postgres implementation
// ============================================================================

pub struct PostgresJobStore {
    db: PgPool,
}

impl PostgresJobStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    async fn find_by_key(&self, key: &str) -> Result<Option<Uuid>> {
        let id = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM jobs WHERE idempotency_key = $1 LIMIT 1",
        )
        .bind(key)
        .fetch_optional(&self.db)
        .await?;
        Ok(id)
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<EnqueueResult> {
        if let Some(key) = &request.idempotency_key {
            if let Some(existing) = self.find_by_key(key).await? {
                return Ok(EnqueueResult::Duplicate(existing));
            }
        }

        let id = db_id();
        let now = Utc::now();
        let (state, due_at) = match request.delay {
            Some(delay) => (
                JobState::Delayed,
                Some(now + chrono::Duration::from_std(delay).unwrap_or_default()),
            ),
            None => (JobState::Queued, None),
        };

        let inserted = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO jobs (
                id, class, queue, priority, source_event_id, payload, retry_policy,
                attempts, state, progress, stalled_count, idempotency_key,
                enqueued_at, due_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, 0, $8, 0, 0, $9, $10, $11, $10, $10)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(request.class)
        .bind(request.queue)
        .bind(request.priority)
        .bind(&request.source_event_id)
        .bind(&request.payload)
        .bind(sqlx::types::Json(&request.policy))
        .bind(state)
        .bind(&request.idempotency_key)
        .bind(now)
        .bind(due_at)
        .fetch_optional(&self.db)
        .await?;

        match inserted {
            Some(id) => Ok(EnqueueResult::Created(id)),
            None => {
                // Conflict raced our pre-check; surface the winner.
                let key = request
                    .idempotency_key
                    .as_deref()
                    .ok_or_else(|| Error::internal("insert returned no row without a key"))?;
                let existing = self
                    .find_by_key(key)
                    .await?
                    .ok_or_else(|| Error::internal("conflicting job vanished"))?;
                Ok(EnqueueResult::Duplicate(existing))
            }
        }
    }

    async fn claim(
        &self,
        queue: QueueName,
        worker_id: &str,
        limit: i64,
        visibility: Duration,
    ) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            r#"
            WITH next_jobs AS (
                SELECT id
                FROM jobs
                WHERE queue = $1
                  AND (
                    (state = 'queued' AND (due_at IS NULL OR due_at <= NOW()))
                    OR (state = 'delayed' AND due_at <= NOW())
                  )
                ORDER BY priority, enqueued_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET state = 'active',
                reservation_token = gen_random_uuid(),
                lease_expires_at = NOW() + ($3 || ' milliseconds')::INTERVAL,
                worker_id = $4,
                started_at = COALESCE(started_at, NOW()),
                updated_at = NOW()
            WHERE id IN (SELECT id FROM next_jobs)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(queue)
        .bind(limit)
        .bind((visibility.as_millis() as u64).to_string())
        .bind(worker_id)
        .fetch_all(&self.db)
        .await?;

        Ok(jobs)
    }

    async fn heartbeat(&self, id: Uuid, token: Uuid, visibility: Duration) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET lease_expires_at = NOW() + ($1 || ' milliseconds')::INTERVAL,
                updated_at = NOW()
            WHERE id = $2 AND reservation_token = $3 AND state = 'active'
            "#,
        )
        .bind((visibility.as_millis() as u64).to_string())
        .bind(id)
        .bind(token)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn complete(&self, id: Uuid, token: Uuid) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'completed',
                progress = 1.0,
                reservation_token = NULL,
                lease_expires_at = NULL,
                finished_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND reservation_token = $2 AND state = 'active'
            "#,
        )
        .bind(id)
        .bind(token)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::conflict("reservation no longer held"));
        }
        Ok(())
    }

    async fn fail(&self, id: Uuid, token: Uuid, error: &str, code: &str) -> Result<i32> {
        let attempts = sqlx::query_scalar::<_, i32>(
            r#"
            UPDATE jobs
            SET state = 'failed',
                attempts = attempts + 1,
                last_error = $1,
                error_kind = $2,
                reservation_token = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $3 AND reservation_token = $4 AND state = 'active'
            RETURNING attempts
            "#,
        )
        .bind(error)
        .bind(code)
        .bind(id)
        .bind(token)
        .fetch_optional(&self.db)
        .await?;

        attempts.ok_or_else(|| Error::conflict("reservation no longer held"))
    }

    async fn schedule_retry(&self, id: Uuid, due_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'delayed', due_at = $1, updated_at = NOW()
            WHERE id = $2 AND state = 'failed'
            "#,
        )
        .bind(due_at)
        .bind(id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn mark_dead(&self, id: Uuid, reason: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'dead', last_error = $1, finished_at = NOW(), updated_at = NOW()
            WHERE id = $2 AND state IN ('failed', 'active')
            "#,
        )
        .bind(reason)
        .bind(id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn release_stalled(&self) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE jobs
            SET state = 'queued',
                reservation_token = NULL,
                lease_expires_at = NULL,
                worker_id = NULL,
                stalled_count = stalled_count + 1,
                updated_at = NOW()
            WHERE state = 'active' AND lease_expires_at < NOW()
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .fetch_all(&self.db)
        .await?;
        Ok(jobs)
    }

    async fn update_progress(&self, id: Uuid, progress: f32) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET progress = $1, updated_at = NOW() WHERE id = $2 AND state = 'active'",
        )
        .bind(progress.clamp(0.0, 1.0))
        .bind(id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn find(&self, id: Uuid) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        Ok(job)
    }

    async fn list(
        &self,
        queue: Option<QueueName>,
        state: Option<JobState>,
        limit: i64,
    ) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE ($1::queue_name IS NULL OR queue = $1)
              AND ($2::job_state IS NULL OR state = $2)
            ORDER BY enqueued_at DESC
            LIMIT $3
            "#
        ))
        .bind(queue)
        .bind(state)
        .bind(limit)
        .fetch_all(&self.db)
        .await?;
        Ok(jobs)
    }

    async fn depth(&self, queue: QueueName) -> Result<i64> {
        let depth = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM jobs WHERE queue = $1 AND state IN ('queued', 'delayed')",
        )
        .bind(queue)
        .fetch_one(&self.db)
        .await?;
        Ok(depth)
    }

    async fn counts(&self, queue: QueueName) -> Result<QueueCounts> {
        let rows = sqlx::query_as::<_, (JobState, i64)>(
            "SELECT state, COUNT(*) FROM jobs WHERE queue = $1 GROUP BY state",
        )
        .bind(queue)
        .fetch_all(&self.db)
        .await?;

        let mut counts = QueueCounts::default();
        for (state, count) in rows {
            match state {
                JobState::Queued => counts.queued = count,
                JobState::Active => counts.active = count,
                JobState::Delayed => counts.delayed = count,
                JobState::Failed => counts.failed = count,
                JobState::Completed => counts.completed = count,
                JobState::Dead => counts.dead = count,
            }
        }
        Ok(counts)
    }

    async fn requeue_dead(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'queued',
                attempts = 0,
                last_error = NULL,
                error_kind = NULL,
                finished_at = NULL,
                due_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND state = 'dead'
            "#,
        )
        .bind(id)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_failed(&self, queue: QueueName) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM jobs WHERE queue = $1 AND state IN ('failed', 'dead')")
                .bind(queue)
                .execute(&self.db)
                .await?;
        Ok(result.rows_affected())
    }

    async fn recover(&self, max_age: Duration) -> Result<Vec<Job>> {
        let cutoff = Utc::now() - chrono::Duration::from_std(max_age).unwrap_or_default();
        let jobs = sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE jobs
            SET state = 'queued',
                reservation_token = NULL,
                lease_expires_at = NULL,
                worker_id = NULL,
                due_at = NULL,
                payload = jsonb_set(
                    payload,
                    '{{_recovery}}',
                    jsonb_build_object('recovered_at', to_jsonb(NOW()))
                ),
                updated_at = NOW()
            WHERE (state = 'active')
               OR (state = 'failed' AND updated_at >= $1)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(cutoff)
        .fetch_all(&self.db)
        .await?;
        Ok(jobs)
    }

    async fn purge_terminal(
        &self,
        completed_before: DateTime<Utc>,
        failed_before: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE (state = 'completed' AND finished_at < $1)
               OR (state IN ('failed', 'dead') AND updated_at < $2)
            "#,
        )
        .bind(completed_before)
        .bind(failed_before)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected())
    }
}

// ============================================================================
// In-memory implementation
// ============================================================================

#[derive(Default)]
struct MemoryInner {
    jobs: HashMap<Uuid, Job>,
    by_key: HashMap<String, Uuid>,
}

/// Single-process `JobStore` mirroring the Postgres semantics.
#[derive(Default, Clone)]
pub struct MemoryJobStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a delayed job immediately claimable. Test-harness convenience
    /// for driving retries without waiting out the backoff.
    pub async fn force_due(&self, id: Uuid) {
        let mut inner = self.inner.lock().await;
        if let Some(job) = inner.jobs.get_mut(&id) {
            if job.state == JobState::Delayed {
                job.due_at = Some(Utc::now());
            }
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<EnqueueResult> {
        let mut inner = self.inner.lock().await;
        if let Some(key) = &request.idempotency_key {
            if let Some(existing) = inner.by_key.get(key) {
                return Ok(EnqueueResult::Duplicate(*existing));
            }
        }

        let now = Utc::now();
        let (state, due_at) = match request.delay {
            Some(delay) => (
                JobState::Delayed,
                Some(now + chrono::Duration::from_std(delay).unwrap_or_default()),
            ),
            None => (JobState::Queued, None),
        };

        let mut builder = Job::builder()
            .class(request.class)
            .queue(request.queue)
            .priority(request.priority)
            .payload(request.payload)
            .retry_policy(sqlx::types::Json(request.policy))
            .state(state)
            .build();
        builder.source_event_id = request.source_event_id;
        builder.idempotency_key = request.idempotency_key.clone();
        builder.due_at = due_at;

        let id = builder.id;
        if let Some(key) = request.idempotency_key {
            inner.by_key.insert(key, id);
        }
        inner.jobs.insert(id, builder);
        Ok(EnqueueResult::Created(id))
    }

    async fn claim(
        &self,
        queue: QueueName,
        worker_id: &str,
        limit: i64,
        visibility: Duration,
    ) -> Result<Vec<Job>> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();

        let mut eligible: Vec<(JobPriority, DateTime<Utc>, Uuid)> = inner
            .jobs
            .values()
            .filter(|job| job.queue == queue && job.is_claimable(now))
            .map(|job| (job.priority, job.enqueued_at, job.id))
            .collect();
        eligible.sort();
        eligible.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(eligible.len());
        for (_, _, id) in eligible {
            if let Some(job) = inner.jobs.get_mut(&id) {
                job.state = JobState::Active;
                job.reservation_token = Some(Uuid::new_v4());
                job.lease_expires_at =
                    Some(now + chrono::Duration::from_std(visibility).unwrap_or_default());
                job.worker_id = Some(worker_id.to_string());
                job.started_at.get_or_insert(now);
                job.updated_at = now;
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn heartbeat(&self, id: Uuid, token: Uuid, visibility: Duration) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.jobs.get_mut(&id) {
            Some(job)
                if job.state == JobState::Active && job.reservation_token == Some(token) =>
            {
                job.lease_expires_at = Some(
                    Utc::now() + chrono::Duration::from_std(visibility).unwrap_or_default(),
                );
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete(&self, id: Uuid, token: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.jobs.get_mut(&id) {
            Some(job)
                if job.state == JobState::Active && job.reservation_token == Some(token) =>
            {
                job.state = JobState::Completed;
                job.progress = 1.0;
                job.reservation_token = None;
                job.lease_expires_at = None;
                job.finished_at = Some(Utc::now());
                job.updated_at = Utc::now();
                Ok(())
            }
            _ => Err(Error::conflict("reservation no longer held")),
        }
    }

    async fn fail(&self, id: Uuid, token: Uuid, error: &str, code: &str) -> Result<i32> {
        let mut inner = self.inner.lock().await;
        match inner.jobs.get_mut(&id) {
            Some(job)
                if job.state == JobState::Active && job.reservation_token == Some(token) =>
            {
                job.state = JobState::Failed;
                job.attempts += 1;
                job.last_error = Some(error.to_string());
                job.error_kind = Some(code.to_string());
                job.reservation_token = None;
                job.lease_expires_at = None;
                job.updated_at = Utc::now();
                Ok(job.attempts)
            }
            _ => Err(Error::conflict("reservation no longer held")),
        }
    }

    async fn schedule_retry(&self, id: Uuid, due_at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(job) = inner.jobs.get_mut(&id) {
            if job.state == JobState::Failed {
                job.state = JobState::Delayed;
                job.due_at = Some(due_at);
                job.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn mark_dead(&self, id: Uuid, reason: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(job) = inner.jobs.get_mut(&id) {
            if matches!(job.state, JobState::Failed | JobState::Active) {
                job.state = JobState::Dead;
                job.last_error = Some(reason.to_string());
                job.finished_at = Some(Utc::now());
                job.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn release_stalled(&self) -> Result<Vec<Job>> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let mut released = Vec::new();
        for job in inner.jobs.values_mut() {
            if job.state == JobState::Active
                && job.lease_expires_at.map_or(false, |at| at < now)
            {
                job.state = JobState::Queued;
                job.reservation_token = None;
                job.lease_expires_at = None;
                job.worker_id = None;
                job.stalled_count += 1;
                job.updated_at = now;
                released.push(job.clone());
            }
        }
        Ok(released)
    }

    async fn update_progress(&self, id: Uuid, progress: f32) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(job) = inner.jobs.get_mut(&id) {
            if job.state == JobState::Active {
                job.progress = progress.clamp(0.0, 1.0);
            }
        }
        Ok(())
    }

    async fn find(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.inner.lock().await.jobs.get(&id).cloned())
    }

    async fn list(
        &self,
        queue: Option<QueueName>,
        state: Option<JobState>,
        limit: i64,
    ) -> Result<Vec<Job>> {
        let inner = self.inner.lock().await;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|job| queue.map_or(true, |q| job.queue == q))
            .filter(|job| state.map_or(true, |s| job.state == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.enqueued_at.cmp(&a.enqueued_at));
        jobs.truncate(limit.max(0) as usize);
        Ok(jobs)
    }

    async fn depth(&self, queue: QueueName) -> Result<i64> {
        let inner = self.inner.lock().await;
        Ok(inner
            .jobs
            .values()
            .filter(|job| {
                job.queue == queue
                    && matches!(job.state, JobState::Queued | JobState::Delayed)
            })
            .count() as i64)
    }

    async fn counts(&self, queue: QueueName) -> Result<QueueCounts> {
        let inner = self.inner.lock().await;
        let mut counts = QueueCounts::default();
        for job in inner.jobs.values().filter(|job| job.queue == queue) {
            match job.state {
                JobState::Queued => counts.queued += 1,
                JobState::Active => counts.active += 1,
                JobState::Delayed => counts.delayed += 1,
                JobState::Failed => counts.failed += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Dead => counts.dead += 1,
            }
        }
        Ok(counts)
    }

    async fn requeue_dead(&self, id: Uuid) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.jobs.get_mut(&id) {
            Some(job) if job.state == JobState::Dead => {
                job.state = JobState::Queued;
                job.attempts = 0;
                job.last_error = None;
                job.error_kind = None;
                job.finished_at = None;
                job.due_at = None;
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_failed(&self, queue: QueueName) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let doomed: Vec<Uuid> = inner
            .jobs
            .values()
            .filter(|job| {
                job.queue == queue && matches!(job.state, JobState::Failed | JobState::Dead)
            })
            .map(|job| job.id)
            .collect();
        for id in &doomed {
            if let Some(job) = inner.jobs.remove(id) {
                if let Some(key) = job.idempotency_key {
                    inner.by_key.remove(&key);
                }
            }
        }
        Ok(doomed.len() as u64)
    }

    async fn recover(&self, max_age: Duration) -> Result<Vec<Job>> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let cutoff = now - chrono::Duration::from_std(max_age).unwrap_or_default();
        let mut recovered = Vec::new();
        for job in inner.jobs.values_mut() {
            let eligible = job.state == JobState::Active
                || (job.state == JobState::Failed && job.updated_at >= cutoff);
            if eligible {
                job.state = JobState::Queued;
                job.reservation_token = None;
                job.lease_expires_at = None;
                job.worker_id = None;
                job.due_at = None;
                if let Some(map) = job.payload.as_object_mut() {
                    map.insert(
                        "_recovery".to_string(),
                        serde_json::json!({"recovered_at": now}),
                    );
                }
                job.updated_at = now;
                recovered.push(job.clone());
            }
        }
        Ok(recovered)
    }

    async fn purge_terminal(
        &self,
        completed_before: DateTime<Utc>,
        failed_before: DateTime<Utc>,
    ) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let doomed: Vec<Uuid> = inner
            .jobs
            .values()
            .filter(|job| match job.state {
                JobState::Completed => {
                    job.finished_at.map_or(false, |at| at < completed_before)
                }
                JobState::Failed | JobState::Dead => job.updated_at < failed_before,
                _ => false,
            })
            .map(|job| job.id)
            .collect();
        for id in &doomed {
            if let Some(job) = inner.jobs.remove(id) {
                if let Some(key) = job.idempotency_key {
                    inner.by_key.remove(&key);
                }
            }
        }
        Ok(doomed.len() as u64)
    }
}
