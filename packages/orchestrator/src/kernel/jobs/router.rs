//! Routing table: job class + payload → queue, priority, retry policy.
//!
//! Pure and deterministic; the engine snapshots the returned policy onto the
//! job row so later table changes never affect jobs already enqueued.

use std::time::Duration;

use crate::kernel::jobs::job::{JobPriority, QueueName};
use crate::kernel::jobs::payload::JobPayload;
use crate::kernel::jobs::retry::RetryPolicy;

/// Where and how a job runs.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub queue: QueueName,
    pub priority: JobPriority,
    pub policy: RetryPolicy,
    /// Initial delay before the job becomes claimable.
    pub delay: Option<Duration>,
    /// Cron expression for classes enqueued by the scheduler.
    pub schedule: Option<&'static str>,
    /// Re-enqueue interval for repeating collectors.
    pub repeat_interval: Option<Duration>,
}

impl Route {
    fn new(queue: QueueName, priority: JobPriority, policy: RetryPolicy) -> Self {
        Self {
            queue,
            priority,
            policy,
            delay: None,
            schedule: None,
            repeat_interval: None,
        }
    }

    fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn scheduled(mut self, schedule: &'static str) -> Self {
        self.schedule = Some(schedule);
        self
    }

    fn repeating(mut self, interval: Duration) -> Self {
        self.repeat_interval = Some(interval);
        self
    }
}

fn workflow_priority(workflow: &str, event: &str) -> JobPriority {
    let workflow = workflow.to_ascii_lowercase();
    if workflow.contains("deploy") || workflow.contains("hotfix") {
        JobPriority::Critical
    } else if event == "pull_request" {
        JobPriority::High
    } else if event == "push" {
        JobPriority::Normal
    } else {
        JobPriority::Low
    }
}

fn webhook_priority(event_type: &str) -> JobPriority {
    match event_type {
        "workflow_job" => JobPriority::Critical,
        "workflow_run" | "check_run" => JobPriority::High,
        "pull_request" | "push" => JobPriority::Normal,
        _ => JobPriority::Low,
    }
}

/// Map a validated payload to its route.
pub fn route(payload: &JobPayload) -> Route {
    match payload {
        JobPayload::ExecuteWorkflow {
            workflow, event, ..
        } => Route::new(
            QueueName::JobExecution,
            workflow_priority(workflow, event),
            RetryPolicy::exponential(
                Duration::from_secs(5),
                2.0,
                Duration::from_secs(60),
                3,
            )
            .non_retryable_on(&[
                "invalid_workflow_configuration",
                "authentication_failed",
                "repository_not_found",
            ]),
        ),

        JobPayload::PrepareRunner { .. } => Route::new(
            QueueName::JobExecution,
            JobPriority::High,
            RetryPolicy::fixed(Duration::from_secs(2), 5),
        ),

        JobPayload::CleanupRunner { .. } => Route::new(
            QueueName::JobExecution,
            JobPriority::Low,
            RetryPolicy::fixed(Duration::from_secs(5), 2),
        )
        .delayed(Duration::from_secs(30)),

        JobPayload::CreateContainer { urgent, .. } => Route::new(
            QueueName::ContainerManagement,
            if *urgent {
                JobPriority::High
            } else {
                JobPriority::Normal
            },
            RetryPolicy::exponential(
                Duration::from_secs(3),
                1.5,
                Duration::from_secs(60),
                3,
            ),
        ),

        JobPayload::DestroyContainer { .. } => Route::new(
            QueueName::ContainerManagement,
            JobPriority::Normal,
            RetryPolicy::linear(Duration::from_secs(1), Duration::from_secs(1), 5),
        ),

        JobPayload::HealthCheck { .. } => Route::new(
            QueueName::ContainerManagement,
            JobPriority::Low,
            RetryPolicy::fixed(Duration::from_secs(1), 1),
        ),

        JobPayload::CollectMetrics {} => Route::new(
            QueueName::Monitoring,
            JobPriority::Normal,
            RetryPolicy::fixed(Duration::from_secs(5), 2),
        )
        .repeating(Duration::from_secs(60)),

        JobPayload::SendAlert { severity, .. } => Route::new(
            QueueName::Monitoring,
            severity.priority(),
            RetryPolicy::exponential(
                Duration::from_secs(1),
                2.0,
                Duration::from_secs(30),
                5,
            ),
        ),

        JobPayload::UpdateStatus { .. } => Route::new(
            QueueName::Monitoring,
            JobPriority::High,
            RetryPolicy::fixed(Duration::from_secs(2), 3),
        ),

        JobPayload::ProcessWebhook { event_type, .. } => Route::new(
            QueueName::WebhookProcessing,
            webhook_priority(event_type),
            RetryPolicy::fixed(Duration::from_secs(1), 3)
                .non_retryable_on(&["invalid_signature", "malformed_payload"]),
        ),

        JobPayload::SyncExternalData { .. } => Route::new(
            QueueName::WebhookProcessing,
            JobPriority::Low,
            RetryPolicy::exponential(
                Duration::from_secs(10),
                2.0,
                Duration::from_secs(300),
                5,
            )
            .retryable_only_on(&["rate_limit", "network_error"]),
        ),

        JobPayload::CleanupOldJobs {} => Route::new(
            QueueName::Cleanup,
            JobPriority::Low,
            RetryPolicy::fixed(Duration::from_secs(60), 2),
        )
        .scheduled("0 0 * * * *"),

        JobPayload::CleanupContainers {} => Route::new(
            QueueName::Cleanup,
            JobPriority::Low,
            RetryPolicy::fixed(Duration::from_secs(60), 2),
        )
        .scheduled("0 */30 * * * *"),

        JobPayload::CleanupLogs {} => Route::new(
            QueueName::Cleanup,
            JobPriority::Low,
            RetryPolicy::fixed(Duration::from_secs(60), 2),
        )
        .scheduled("0 15 3 * * *"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::jobs::payload::AlertSeverity;
    use crate::kernel::jobs::retry::RetryStrategy;
    use uuid::Uuid;

    fn workflow(workflow: &str, event: &str) -> JobPayload {
        JobPayload::ExecuteWorkflow {
            repository: "acme/widgets".into(),
            workflow: workflow.into(),
            event: event.into(),
            labels: vec![],
            delivery_id: None,
            forge_job_id: None,
            runner_id: None,
        }
    }

    #[test]
    fn deploy_workflows_are_critical() {
        assert_eq!(
            route(&workflow("deploy-prod", "push")).priority,
            JobPriority::Critical
        );
        assert_eq!(
            route(&workflow("Hotfix-rollout", "push")).priority,
            JobPriority::Critical
        );
    }

    #[test]
    fn workflow_priority_falls_back_by_event() {
        assert_eq!(
            route(&workflow("ci", "pull_request")).priority,
            JobPriority::High
        );
        assert_eq!(route(&workflow("ci", "push")).priority, JobPriority::Normal);
        assert_eq!(
            route(&workflow("ci", "schedule")).priority,
            JobPriority::Low
        );
    }

    #[test]
    fn workflow_route_carries_non_retryable_codes() {
        let route = route(&workflow("ci", "push"));
        assert_eq!(route.queue, QueueName::JobExecution);
        assert!(route
            .policy
            .non_retryable
            .contains(&"authentication_failed".to_string()));
        assert_eq!(route.policy.max_attempts, 3);
    }

    #[test]
    fn cleanup_runner_is_delayed_thirty_seconds() {
        let route = route(&JobPayload::CleanupRunner {
            runner_id: Uuid::new_v4(),
        });
        assert_eq!(route.delay, Some(Duration::from_secs(30)));
        assert_eq!(route.priority, JobPriority::Low);
    }

    #[test]
    fn urgent_container_creation_is_high_priority() {
        let urgent = JobPayload::CreateContainer {
            repository: "acme/widgets".into(),
            labels: vec![],
            urgent: true,
        };
        let normal = JobPayload::CreateContainer {
            repository: "acme/widgets".into(),
            labels: vec![],
            urgent: false,
        };
        assert_eq!(route(&urgent).priority, JobPriority::High);
        assert_eq!(route(&normal).priority, JobPriority::Normal);
    }

    #[test]
    fn alert_priority_mirrors_severity() {
        let alert = |severity| JobPayload::SendAlert {
            severity,
            message: "boom".into(),
            source: "tests".into(),
        };
        assert_eq!(
            route(&alert(AlertSeverity::Critical)).priority,
            JobPriority::Critical
        );
        assert_eq!(route(&alert(AlertSeverity::Info)).priority, JobPriority::Low);
    }

    #[test]
    fn webhook_priority_derives_from_event_type() {
        let payload = |event_type: &str| JobPayload::ProcessWebhook {
            delivery_id: "d-1".into(),
            event_type: event_type.into(),
            repository: "acme/widgets".into(),
        };
        assert_eq!(
            route(&payload("workflow_job")).priority,
            JobPriority::Critical
        );
        assert_eq!(route(&payload("check_run")).priority, JobPriority::High);
        assert_eq!(route(&payload("push")).priority, JobPriority::Normal);
        assert_eq!(route(&payload("release")).priority, JobPriority::Low);
    }

    #[test]
    fn sync_external_data_retries_only_transient_codes() {
        let route = route(&JobPayload::SyncExternalData {
            resource: "runners".into(),
        });
        let allow = route.policy.retryable_only.as_ref().unwrap();
        assert!(allow.contains(&"rate_limit".to_string()));
        assert_eq!(route.queue, QueueName::WebhookProcessing);
        assert!(matches!(
            route.policy.strategy,
            RetryStrategy::Exponential { max_delay_ms: 300_000, .. }
        ));
    }

    #[test]
    fn cleanup_classes_are_cron_scheduled() {
        assert!(route(&JobPayload::CleanupOldJobs {}).schedule.is_some());
        assert!(route(&JobPayload::CleanupContainers {}).schedule.is_some());
        assert!(route(&JobPayload::CleanupLogs {}).schedule.is_some());
    }

    #[test]
    fn collect_metrics_repeats_every_minute() {
        let route = route(&JobPayload::CollectMetrics {});
        assert_eq!(route.repeat_interval, Some(Duration::from_secs(60)));
        assert_eq!(route.queue, QueueName::Monitoring);
    }
}
