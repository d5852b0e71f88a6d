//! Job model for background work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::common::db_id;
use crate::kernel::jobs::retry::RetryPolicy;

// ============================================================================
// Enums
// ============================================================================

/// Discriminator tag determining routing, retry policy, and processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_class", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobClass {
    ExecuteWorkflow,
    PrepareRunner,
    CleanupRunner,
    CreateContainer,
    DestroyContainer,
    HealthCheck,
    ProcessWebhook,
    SyncExternalData,
    CollectMetrics,
    SendAlert,
    UpdateStatus,
    CleanupOldJobs,
    CleanupContainers,
    CleanupLogs,
}

impl JobClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobClass::ExecuteWorkflow => "execute_workflow",
            JobClass::PrepareRunner => "prepare_runner",
            JobClass::CleanupRunner => "cleanup_runner",
            JobClass::CreateContainer => "create_container",
            JobClass::DestroyContainer => "destroy_container",
            JobClass::HealthCheck => "health_check",
            JobClass::ProcessWebhook => "process_webhook",
            JobClass::SyncExternalData => "sync_external_data",
            JobClass::CollectMetrics => "collect_metrics",
            JobClass::SendAlert => "send_alert",
            JobClass::UpdateStatus => "update_status",
            JobClass::CleanupOldJobs => "cleanup_old_jobs",
            JobClass::CleanupContainers => "cleanup_containers",
            JobClass::CleanupLogs => "cleanup_logs",
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default,
)]
#[sqlx(type_name = "job_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Queued,
    Active,
    Delayed,
    Completed,
    Failed,
    Dead,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Dead)
    }

    /// Valid edges of the job state machine. The only backward edge is
    /// delayed → queued.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Active)
                | (Active, Completed)
                | (Active, Failed)
                | (Active, Delayed)
                | (Active, Dead)
                | (Active, Queued) // stalled reservation returned
                | (Failed, Delayed)
                | (Failed, Queued)
                | (Failed, Dead)
                | (Delayed, Queued)
        )
    }
}

/// 1 = critical … 4 = low. Postgres orders by declaration, so `ORDER BY
/// priority` drains critical first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
    Default,
)]
#[sqlx(type_name = "job_priority", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl JobPriority {
    pub fn as_i16(&self) -> i16 {
        match self {
            JobPriority::Critical => 1,
            JobPriority::High => 2,
            JobPriority::Normal => 3,
            JobPriority::Low => 4,
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "queue_name", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    JobExecution,
    ContainerManagement,
    Monitoring,
    WebhookProcessing,
    Cleanup,
    MetricsCollection,
}

impl QueueName {
    pub const ALL: [QueueName; 6] = [
        QueueName::JobExecution,
        QueueName::ContainerManagement,
        QueueName::Monitoring,
        QueueName::WebhookProcessing,
        QueueName::Cleanup,
        QueueName::MetricsCollection,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::JobExecution => "job_execution",
            QueueName::ContainerManagement => "container_management",
            QueueName::Monitoring => "monitoring",
            QueueName::WebhookProcessing => "webhook_processing",
            QueueName::Cleanup => "cleanup",
            QueueName::MetricsCollection => "metrics_collection",
        }
    }
}

impl std::str::FromStr for QueueName {
    type Err = ();

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "job_execution" => Ok(QueueName::JobExecution),
            "container_management" => Ok(QueueName::ContainerManagement),
            "monitoring" => Ok(QueueName::Monitoring),
            "webhook_processing" => Ok(QueueName::WebhookProcessing),
            "cleanup" => Ok(QueueName::Cleanup),
            "metrics_collection" => Ok(QueueName::MetricsCollection),
            _ => Err(()),
        }
    }
}

// ============================================================================
// Job Model
// ============================================================================

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = db_id())]
    pub id: Uuid,

    // Core identity
    pub class: JobClass,
    pub queue: QueueName,
    #[builder(default)]
    pub priority: JobPriority,
    #[builder(default, setter(strip_option))]
    pub source_event_id: Option<String>,

    // Payload (validated at enqueue time)
    pub payload: serde_json::Value,

    // Retry policy snapshot
    pub retry_policy: sqlx::types::Json<RetryPolicy>,
    #[builder(default = 0)]
    pub attempts: i32,

    // State
    #[builder(default)]
    pub state: JobState,
    #[builder(default = 0.0)]
    pub progress: f32,
    #[builder(default = 0)]
    pub stalled_count: i32,

    // Reservation (exactly one worker may hold it)
    #[builder(default, setter(strip_option))]
    pub reservation_token: Option<Uuid>,
    #[builder(default, setter(strip_option))]
    pub lease_expires_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub worker_id: Option<String>,

    // Error tracking
    #[builder(default, setter(strip_option))]
    pub last_error: Option<String>,
    #[builder(default, setter(strip_option))]
    pub error_kind: Option<String>,

    // Enqueue-time dedup (scheduler slots, webhook fan-out)
    #[builder(default, setter(strip_option))]
    pub idempotency_key: Option<String>,

    // Timestamps
    #[builder(default = Utc::now())]
    pub enqueued_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub due_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub finished_at: Option<DateTime<Utc>>,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn max_attempts(&self) -> i32 {
        self.retry_policy.0.max_attempts as i32
    }

    /// A queued or due-delayed job is eligible for claiming.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            JobState::Queued => self.due_at.map_or(true, |due| due <= now),
            JobState::Delayed => self.due_at.map_or(true, |due| due <= now),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::jobs::retry::{RetryPolicy, RetryStrategy};

    fn sample_job() -> Job {
        Job::builder()
            .class(JobClass::HealthCheck)
            .queue(QueueName::ContainerManagement)
            .payload(serde_json::json!({}))
            .retry_policy(sqlx::types::Json(RetryPolicy {
                strategy: RetryStrategy::Fixed {
                    delay_ms: 1_000,
                },
                max_attempts: 1,
                non_retryable: vec![],
                retryable_only: None,
            }))
            .build()
    }

    #[test]
    fn new_job_starts_queued_with_zero_attempts() {
        let job = sample_job();
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.attempts, 0);
    }

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for next in [
            JobState::Queued,
            JobState::Active,
            JobState::Delayed,
            JobState::Failed,
            JobState::Dead,
        ] {
            assert!(!JobState::Completed.can_transition_to(next));
            assert!(!JobState::Dead.can_transition_to(next));
        }
    }

    #[test]
    fn delayed_may_return_to_queued() {
        assert!(JobState::Delayed.can_transition_to(JobState::Queued));
        assert!(!JobState::Queued.can_transition_to(JobState::Delayed));
    }

    #[test]
    fn priority_numbering_matches_contract() {
        assert_eq!(JobPriority::Critical.as_i16(), 1);
        assert_eq!(JobPriority::Low.as_i16(), 4);
        assert!(JobPriority::Critical < JobPriority::High);
    }

    #[test]
    fn delayed_job_is_claimable_only_when_due() {
        let mut job = sample_job();
        job.state = JobState::Delayed;
        job.due_at = Some(Utc::now() + chrono::Duration::seconds(60));
        assert!(!job.is_claimable(Utc::now()));
        job.due_at = Some(Utc::now() - chrono::Duration::seconds(1));
        assert!(job.is_claimable(Utc::now()));
    }
}
