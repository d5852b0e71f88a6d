//! Proxy-runner registry and job delegation.
//!
//! Proxy runners register with the orchestrator, poll for assignments, and
//! report status transitions back. The in-memory table is authoritative;
//! rows in the store mirror it for restarts and audits.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::common::{db_id, Error, Result};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default,
)]
#[sqlx(type_name = "runner_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    #[default]
    Idle,
    Starting,
    Busy,
    Offline,
    Quarantined,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Runner {
    pub id: Uuid,
    pub name: String,
    pub labels: Vec<String>,
    pub capabilities: Vec<String>,
    pub state: RunnerState,
    pub last_heartbeat_at: DateTime<Utc>,
    pub assigned_job: Option<Uuid>,
    pub registered_at: DateTime<Utc>,
}

/// A unit of work handed to a proxy runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub job_id: Uuid,
    pub repository: String,
    pub workflow: String,
    pub labels: Vec<String>,
}

pub struct RunnerRegistry {
    runners: RwLock<HashMap<Uuid, Runner>>,
    /// Assignments waiting for their runner's next poll.
    pending: RwLock<HashMap<Uuid, Assignment>>,
    db: Option<PgPool>,
}

impl RunnerRegistry {
    pub fn new(db: Option<PgPool>) -> Self {
        Self {
            runners: RwLock::new(HashMap::new()),
            pending: RwLock::new(HashMap::new()),
            db,
        }
    }

    pub async fn register(
        &self,
        name: String,
        labels: Vec<String>,
        capabilities: Vec<String>,
    ) -> Result<Runner> {
        let mut runners = self.runners.write().await;
        if runners.values().any(|runner| runner.name == name) {
            return Err(Error::conflict(format!("runner {name} already registered")));
        }

        let runner = Runner {
            id: db_id(),
            name,
            labels,
            capabilities,
            state: RunnerState::Idle,
            last_heartbeat_at: Utc::now(),
            assigned_job: None,
            registered_at: Utc::now(),
        };
        runners.insert(runner.id, runner.clone());
        drop(runners);

        self.persist(&runner).await;
        tracing::info!(runner_id = %runner.id, name = %runner.name, "runner registered");
        Ok(runner)
    }

    pub async fn get(&self, id: Uuid) -> Option<Runner> {
        self.runners.read().await.get(&id).cloned()
    }

    pub async fn list(&self) -> Vec<Runner> {
        let mut runners: Vec<Runner> = self.runners.read().await.values().cloned().collect();
        runners.sort_by(|a, b| a.registered_at.cmp(&b.registered_at));
        runners
    }

    pub async fn heartbeat(&self, id: Uuid) -> Result<()> {
        let mut runners = self.runners.write().await;
        let runner = runners
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("unknown runner"))?;
        runner.last_heartbeat_at = Utc::now();
        if runner.state == RunnerState::Offline {
            runner.state = RunnerState::Idle;
        }
        Ok(())
    }

    pub async fn set_state(&self, id: Uuid, state: RunnerState) -> Result<()> {
        let mut runners = self.runners.write().await;
        let runner = runners
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("unknown runner"))?;
        runner.state = state;
        if state != RunnerState::Busy {
            runner.assigned_job = None;
        }
        let snapshot = runner.clone();
        drop(runners);
        self.persist(&snapshot).await;
        Ok(())
    }

    /// Pick an idle runner whose labels cover the request and hand it the
    /// assignment on its next poll.
    pub async fn assign(&self, assignment: Assignment) -> Result<Runner> {
        let mut runners = self.runners.write().await;
        let candidate = runners
            .values_mut()
            .filter(|runner| {
                runner.state == RunnerState::Idle
                    && assignment
                        .labels
                        .iter()
                        .all(|label| runner.labels.iter().any(|have| have == label))
            })
            .min_by_key(|runner| runner.last_heartbeat_at);

        let Some(runner) = candidate else {
            return Err(Error::new(
                crate::common::Kind::ResourceExhausted,
                "no idle runner matches the requested labels",
            )
            .with_code("resource_exhausted"));
        };

        runner.state = RunnerState::Busy;
        runner.assigned_job = Some(assignment.job_id);
        let snapshot = runner.clone();
        drop(runners);

        self.pending.write().await.insert(snapshot.id, assignment);
        self.persist(&snapshot).await;
        Ok(snapshot)
    }

    /// Poll endpoint: take the pending assignment, if any.
    pub async fn take_assignment(&self, runner_id: Uuid) -> Result<Option<Assignment>> {
        if self.runners.read().await.get(&runner_id).is_none() {
            return Err(Error::not_found("unknown runner"));
        }
        Ok(self.pending.write().await.remove(&runner_id))
    }

    /// Status report from a proxy: the runner finished its job.
    pub async fn complete_assignment(&self, runner_id: Uuid) -> Result<()> {
        self.pending.write().await.remove(&runner_id);
        self.set_state(runner_id, RunnerState::Idle).await
    }

    pub async fn remove(&self, id: Uuid) -> Result<()> {
        let removed = self.runners.write().await.remove(&id);
        self.pending.write().await.remove(&id);
        match removed {
            Some(runner) => {
                tracing::info!(runner_id = %runner.id, name = %runner.name, "runner removed");
                Ok(())
            }
            None => Err(Error::not_found("unknown runner")),
        }
    }

    /// Mark runners silent past `max_age` offline. Returns the ids touched.
    pub async fn sweep_offline(&self, max_age: chrono::Duration) -> Vec<Uuid> {
        let cutoff = Utc::now() - max_age;
        let mut touched = Vec::new();
        let mut runners = self.runners.write().await;
        for runner in runners.values_mut() {
            if runner.last_heartbeat_at < cutoff
                && !matches!(runner.state, RunnerState::Offline | RunnerState::Quarantined)
            {
                runner.state = RunnerState::Offline;
                touched.push(runner.id);
            }
        }
        touched
    }

    async fn persist(&self, runner: &Runner) {
        let Some(db) = &self.db else { return };
        let result = sqlx::query(
            r#"
            INSERT INTO runners (id, name, labels, capabilities, state, last_heartbeat_at, registered_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                state = EXCLUDED.state,
                last_heartbeat_at = EXCLUDED.last_heartbeat_at,
                updated_at = NOW()
            "#,
        )
        .bind(runner.id)
        .bind(&runner.name)
        .bind(serde_json::json!(runner.labels))
        .bind(serde_json::json!(runner.capabilities))
        .bind(runner.state)
        .bind(runner.last_heartbeat_at)
        .bind(runner.registered_at)
        .execute(db)
        .await;
        if let Err(err) = result {
            tracing::warn!(runner_id = %runner.id, error = %err, "runner mirror write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> RunnerRegistry {
        RunnerRegistry::new(None)
    }

    fn assignment(labels: Vec<String>) -> Assignment {
        Assignment {
            job_id: Uuid::new_v4(),
            repository: "acme/widgets".into(),
            workflow: "ci".into(),
            labels,
        }
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let registry = registry();
        registry
            .register("proxy-1".into(), vec![], vec![])
            .await
            .unwrap();
        assert!(registry
            .register("proxy-1".into(), vec![], vec![])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn assignment_goes_to_matching_idle_runner() {
        let registry = registry();
        let runner = registry
            .register("proxy-1".into(), vec!["linux".into(), "x64".into()], vec![])
            .await
            .unwrap();

        let assigned = registry
            .assign(assignment(vec!["linux".into()]))
            .await
            .unwrap();
        assert_eq!(assigned.id, runner.id);
        assert_eq!(assigned.state, RunnerState::Busy);

        // The runner picks the assignment up on its next poll, once.
        let taken = registry.take_assignment(runner.id).await.unwrap();
        assert!(taken.is_some());
        assert!(registry.take_assignment(runner.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn busy_runners_are_skipped() {
        let registry = registry();
        registry
            .register("proxy-1".into(), vec!["linux".into()], vec![])
            .await
            .unwrap();
        registry
            .assign(assignment(vec!["linux".into()]))
            .await
            .unwrap();

        let err = registry
            .assign(assignment(vec!["linux".into()]))
            .await
            .unwrap_err();
        assert_eq!(err.code_str(), "resource_exhausted");
    }

    #[tokio::test]
    async fn completion_returns_runner_to_idle() {
        let registry = registry();
        let runner = registry
            .register("proxy-1".into(), vec![], vec![])
            .await
            .unwrap();
        registry.assign(assignment(vec![])).await.unwrap();

        registry.complete_assignment(runner.id).await.unwrap();
        let runner = registry.get(runner.id).await.unwrap();
        assert_eq!(runner.state, RunnerState::Idle);
        assert!(runner.assigned_job.is_none());
    }

    #[tokio::test]
    async fn silent_runners_go_offline_and_recover_on_heartbeat() {
        let registry = registry();
        let runner = registry
            .register("proxy-1".into(), vec![], vec![])
            .await
            .unwrap();

        // Force the heartbeat into the past.
        {
            let mut runners = registry.runners.write().await;
            runners.get_mut(&runner.id).unwrap().last_heartbeat_at =
                Utc::now() - chrono::Duration::minutes(10);
        }

        let touched = registry.sweep_offline(chrono::Duration::minutes(5)).await;
        assert_eq!(touched, vec![runner.id]);
        assert_eq!(
            registry.get(runner.id).await.unwrap().state,
            RunnerState::Offline
        );

        registry.heartbeat(runner.id).await.unwrap();
        assert_eq!(
            registry.get(runner.id).await.unwrap().state,
            RunnerState::Idle
        );
    }
}
