//! Typed job payloads.
//!
//! The job class is the discriminator; payloads are validated when a job is
//! enqueued, never at dequeue time. Workers deserialize back into this enum
//! and match on it, so a malformed payload can only enter the system through
//! a schema change.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::{Error, Result};
use crate::kernel::jobs::job::{JobClass, JobPriority};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

impl AlertSeverity {
    pub fn priority(&self) -> JobPriority {
        match self {
            AlertSeverity::Critical => JobPriority::Critical,
            AlertSeverity::High => JobPriority::High,
            AlertSeverity::Medium => JobPriority::Normal,
            AlertSeverity::Low | AlertSeverity::Info => JobPriority::Low,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum JobPayload {
    ExecuteWorkflow {
        repository: String,
        workflow: String,
        /// Triggering webhook event type (`push`, `pull_request`, …).
        event: String,
        #[serde(default)]
        labels: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delivery_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        forge_job_id: Option<i64>,
        /// Proxy runner prepared for this execution; its cleanup is the
        /// compensating action when the job dies.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        runner_id: Option<Uuid>,
    },
    PrepareRunner {
        runner_id: Uuid,
        #[serde(default)]
        labels: Vec<String>,
    },
    CleanupRunner {
        runner_id: Uuid,
    },
    CreateContainer {
        repository: String,
        #[serde(default)]
        labels: Vec<String>,
        #[serde(default)]
        urgent: bool,
    },
    DestroyContainer {
        container_id: Uuid,
    },
    HealthCheck {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        container_id: Option<Uuid>,
    },
    ProcessWebhook {
        delivery_id: String,
        event_type: String,
        repository: String,
    },
    SyncExternalData {
        resource: String,
    },
    CollectMetrics {},
    SendAlert {
        severity: AlertSeverity,
        message: String,
        source: String,
    },
    UpdateStatus {
        job_id: Uuid,
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    CleanupOldJobs {},
    CleanupContainers {},
    CleanupLogs {},
}

impl JobPayload {
    pub fn class(&self) -> JobClass {
        match self {
            JobPayload::ExecuteWorkflow { .. } => JobClass::ExecuteWorkflow,
            JobPayload::PrepareRunner { .. } => JobClass::PrepareRunner,
            JobPayload::CleanupRunner { .. } => JobClass::CleanupRunner,
            JobPayload::CreateContainer { .. } => JobClass::CreateContainer,
            JobPayload::DestroyContainer { .. } => JobClass::DestroyContainer,
            JobPayload::HealthCheck { .. } => JobClass::HealthCheck,
            JobPayload::ProcessWebhook { .. } => JobClass::ProcessWebhook,
            JobPayload::SyncExternalData { .. } => JobClass::SyncExternalData,
            JobPayload::CollectMetrics {} => JobClass::CollectMetrics,
            JobPayload::SendAlert { .. } => JobClass::SendAlert,
            JobPayload::UpdateStatus { .. } => JobClass::UpdateStatus,
            JobPayload::CleanupOldJobs {} => JobClass::CleanupOldJobs,
            JobPayload::CleanupContainers {} => JobClass::CleanupContainers,
            JobPayload::CleanupLogs {} => JobClass::CleanupLogs,
        }
    }

    /// Enqueue-time validation. Size is bounded so a single payload can
    /// never dominate the jobs table.
    pub fn validate(&self) -> Result<serde_json::Value> {
        match self {
            JobPayload::ExecuteWorkflow {
                repository,
                workflow,
                event,
                ..
            } => {
                if repository.is_empty() || workflow.is_empty() || event.is_empty() {
                    return Err(Error::validation(
                        "execute_workflow requires repository, workflow, and event",
                    ));
                }
            }
            JobPayload::ProcessWebhook {
                delivery_id,
                event_type,
                ..
            } => {
                if delivery_id.is_empty() || event_type.is_empty() {
                    return Err(Error::validation(
                        "process_webhook requires delivery_id and event_type",
                    ));
                }
            }
            JobPayload::SendAlert { message, .. } => {
                if message.is_empty() {
                    return Err(Error::validation("send_alert requires a message"));
                }
            }
            JobPayload::SyncExternalData { resource } => {
                if resource.is_empty() {
                    return Err(Error::validation("sync_external_data requires a resource"));
                }
            }
            _ => {}
        }

        let value = serde_json::to_value(self)?;
        let size = value.to_string().len();
        if size > MAX_PAYLOAD_BYTES {
            return Err(Error::validation(format!(
                "payload of {size} bytes exceeds the {MAX_PAYLOAD_BYTES} byte bound"
            )));
        }
        Ok(value)
    }

    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }
}

pub const MAX_PAYLOAD_BYTES: usize = 64 * 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_class_matches_variant() {
        let payload = JobPayload::CleanupRunner {
            runner_id: Uuid::new_v4(),
        };
        assert_eq!(payload.class(), JobClass::CleanupRunner);
    }

    #[test]
    fn empty_workflow_is_rejected_at_enqueue() {
        let payload = JobPayload::ExecuteWorkflow {
            repository: "acme/widgets".into(),
            workflow: String::new(),
            event: "push".into(),
            labels: vec![],
            delivery_id: None,
            forge_job_id: None,
            runner_id: None,
        };
        assert!(payload.validate().is_err());
    }

    #[test]
    fn valid_payload_roundtrips() {
        let payload = JobPayload::ProcessWebhook {
            delivery_id: "d-1".into(),
            event_type: "workflow_job".into(),
            repository: "acme/widgets".into(),
        };
        let value = payload.validate().unwrap();
        assert_eq!(value["class"], "process_webhook");
        assert_eq!(JobPayload::from_value(&value).unwrap(), payload);
    }

    #[test]
    fn alert_severity_maps_to_priority() {
        assert_eq!(AlertSeverity::Critical.priority(), JobPriority::Critical);
        assert_eq!(AlertSeverity::Medium.priority(), JobPriority::Normal);
        assert_eq!(AlertSeverity::Info.priority(), JobPriority::Low);
    }

    #[test]
    fn recovery_stanza_survives_deserialization() {
        // Recovery tags rehydrated payloads with a `_recovery` stanza; the
        // tagged enum must tolerate the extra field.
        let mut value = JobPayload::CollectMetrics {}.validate().unwrap();
        value["_recovery"] = serde_json::json!({"recovered_at": "2026-01-01T00:00:00Z"});
        assert!(JobPayload::from_value(&value).is_ok());
    }
}
