//! Sandbox lifecycle: the container state machine and engine choreography.
//!
//! ```text
//!  creating ──ok──▶ running ──stop──▶ stopped ──remove──▶ removed
//!      │                │                                    ▲
//!      └──fail──────────┼──quarantine─▶ quarantined ─────────┘
//!                       └──health-fail─▶ stopped
//! ```
//!
//! Every transition is total and logged. Quarantine is an internal flag plus
//! network isolation; the engine's labels are immutable after creation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::common::{db_id, Error, Kind, Result};
use crate::config::{LimitsConfig, PoolConfig};
use crate::kernel::containers::engine::{
    ContainerEngine, ContainerSpec, EngineStats, ExecOutput, LogLine, ResourceLimits,
    SecurityContext,
};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default,
)]
#[sqlx(type_name = "container_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    #[default]
    Creating,
    Running,
    Stopped,
    Removed,
    Quarantined,
}

impl ContainerState {
    pub fn can_transition_to(&self, next: ContainerState) -> bool {
        use ContainerState::*;
        matches!(
            (self, next),
            (Creating, Running)
                | (Creating, Removed) // create failed
                | (Running, Stopped)
                | (Running, Quarantined)
                | (Stopped, Removed)
                | (Quarantined, Removed)
        )
    }
}

/// One managed sandbox. The pool actor owns the authoritative table of
/// these; rows in the store are a durability mirror.
#[derive(Debug, Clone, Serialize)]
pub struct Sandbox {
    pub id: Uuid,
    pub engine_id: String,
    pub runner_id: Option<Uuid>,
    pub image: String,
    pub repository: String,
    pub labels: Vec<String>,
    pub network: String,
    pub state: ContainerState,
    pub security_score: i16,
    /// Whether the root filesystem was mounted read-only at create time;
    /// feeds the risk score on every later assessment.
    pub read_only_rootfs: bool,
    pub created_at: DateTime<Utc>,
    pub last_assessment_at: Option<DateTime<Utc>>,
    /// Job currently holding this sandbox, if busy.
    pub assigned_job: Option<Uuid>,
    pub idle_since: Option<DateTime<Utc>>,
}

/// Bridge name for a repository's sandboxes.
pub fn network_for_repository(repository: &str) -> String {
    format!("runnerhub-{}", repository.replace('/', "-"))
}

pub struct ContainerManager {
    engine: Arc<dyn ContainerEngine>,
    limits: LimitsConfig,
    pool_config: PoolConfig,
    sandbox_image: String,
    /// Hardening template applied to every sandbox at create time.
    security: SecurityContext,
    db: Option<PgPool>,
}

impl ContainerManager {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        limits: LimitsConfig,
        pool_config: PoolConfig,
        sandbox_image: String,
        security: SecurityContext,
        db: Option<PgPool>,
    ) -> Self {
        Self {
            engine,
            limits,
            pool_config,
            sandbox_image,
            security,
            db,
        }
    }

    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    fn transition(&self, sandbox: &mut Sandbox, next: ContainerState) -> Result<()> {
        if !sandbox.state.can_transition_to(next) {
            return Err(Error::new(
                Kind::IntegrityViolation,
                format!(
                    "illegal container transition {:?} -> {:?} for {}",
                    sandbox.state, next, sandbox.id
                ),
            ));
        }
        tracing::info!(
            container_id = %sandbox.id,
            from = ?sandbox.state,
            to = ?next,
            "container transition"
        );
        sandbox.state = next;
        Ok(())
    }

    fn spec_for(&self, repository: &str, labels: &[String]) -> ContainerSpec {
        let mut label_map: HashMap<String, String> = labels
            .iter()
            .map(|label| (format!("orchestrator.label.{label}"), "true".to_string()))
            .collect();
        label_map.insert("orchestrator.repository".to_string(), repository.to_string());

        ContainerSpec {
            name: format!("runnerhub-sandbox-{}", db_id().simple()),
            image: self.sandbox_image.clone(),
            labels: label_map,
            env: vec![format!("RUNNER_REPOSITORY={repository}")],
            network: Some(network_for_repository(repository)),
            limits: ResourceLimits {
                cpus: self.limits.runner_cpus,
                memory_mb: self.limits.runner_memory_mb,
                swap_mb: self.limits.runner_swap_mb,
                pids: self.limits.runner_pids,
                fds: self.limits.runner_fds,
            },
            security: self.security.clone(),
        }
    }

    /// Create and start a sandbox. A failed create lands in `removed` with
    /// the engine-side remains cleaned up best-effort.
    pub async fn create_sandbox(&self, repository: &str, labels: Vec<String>) -> Result<Sandbox> {
        let spec = self.spec_for(repository, &labels);
        let mut sandbox = Sandbox {
            id: db_id(),
            engine_id: String::new(),
            runner_id: None,
            image: spec.image.clone(),
            repository: repository.to_string(),
            labels,
            network: spec.network.clone().unwrap_or_default(),
            state: ContainerState::Creating,
            security_score: 0,
            read_only_rootfs: spec.security.read_only_rootfs,
            created_at: Utc::now(),
            last_assessment_at: None,
            assigned_job: None,
            idle_since: Some(Utc::now()),
        };

        let startup = self.pool_config.startup_timeout;
        let created = tokio::time::timeout(startup, self.engine.create(&spec))
            .await
            .map_err(|_| Error::new(Kind::DependencyTimeout, "container create timed out"))?;

        let engine_id = match created {
            Ok(engine_id) => engine_id,
            Err(err) => {
                self.transition(&mut sandbox, ContainerState::Removed)?;
                self.persist(&sandbox).await;
                return Err(err);
            }
        };
        sandbox.engine_id = engine_id;

        if let Err(err) = self.engine.start(&sandbox.engine_id).await {
            self.transition(&mut sandbox, ContainerState::Removed)?;
            let _ = self.engine.remove(&sandbox.engine_id, true).await;
            self.persist(&sandbox).await;
            return Err(err);
        }

        self.transition(&mut sandbox, ContainerState::Running)?;
        self.persist(&sandbox).await;
        Ok(sandbox)
    }

    pub async fn stop_sandbox(&self, sandbox: &mut Sandbox, timeout: Duration) -> Result<()> {
        self.engine.stop(&sandbox.engine_id, timeout).await?;
        self.transition(sandbox, ContainerState::Stopped)?;
        self.persist(sandbox).await;
        Ok(())
    }

    pub async fn remove_sandbox(&self, sandbox: &mut Sandbox, force: bool) -> Result<()> {
        if sandbox.state == ContainerState::Running {
            // stop first so the transition stays on the chart
            self.engine
                .stop(&sandbox.engine_id, Duration::from_secs(10))
                .await
                .ok();
            self.transition(sandbox, ContainerState::Stopped)?;
        }
        self.engine.remove(&sandbox.engine_id, force).await?;
        self.transition(sandbox, ContainerState::Removed)?;
        self.persist(sandbox).await;
        Ok(())
    }

    /// Quarantine: mark internally and cut the sandbox off its bridge.
    pub async fn quarantine_sandbox(&self, sandbox: &mut Sandbox) -> Result<()> {
        self.transition(sandbox, ContainerState::Quarantined)?;
        if let Err(err) = self
            .engine
            .disconnect_network(&sandbox.engine_id, &sandbox.network)
            .await
        {
            tracing::warn!(
                container_id = %sandbox.id,
                error = %err,
                "network isolation failed during quarantine"
            );
        }
        self.persist(sandbox).await;
        Ok(())
    }

    pub async fn exec(
        &self,
        sandbox: &Sandbox,
        cmd: Vec<String>,
        env: Vec<String>,
        user: Option<String>,
        cwd: Option<String>,
    ) -> Result<ExecOutput> {
        if sandbox.state != ContainerState::Running {
            return Err(Error::conflict("sandbox is not running"));
        }
        self.engine
            .exec(&sandbox.engine_id, cmd, env, user, cwd)
            .await
    }

    pub async fn stats(&self, sandbox: &Sandbox) -> Result<EngineStats> {
        self.engine.stats(&sandbox.engine_id).await
    }

    pub async fn logs(
        &self,
        sandbox: &Sandbox,
        tail: Option<i64>,
        since: Option<i64>,
    ) -> Result<Vec<LogLine>> {
        self.engine.logs(&sandbox.engine_id, tail, since).await
    }

    /// Durability mirror; the in-memory table stays authoritative.
    async fn persist(&self, sandbox: &Sandbox) {
        let Some(db) = &self.db else { return };
        let result = sqlx::query(
            r#"
            INSERT INTO containers (
                id, engine_id, runner_id, image, repository, labels, network,
                state, security_score, created_at, last_assessment_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE SET
                state = EXCLUDED.state,
                runner_id = EXCLUDED.runner_id,
                security_score = EXCLUDED.security_score,
                last_assessment_at = EXCLUDED.last_assessment_at,
                updated_at = NOW()
            "#,
        )
        .bind(sandbox.id)
        .bind(&sandbox.engine_id)
        .bind(sandbox.runner_id)
        .bind(&sandbox.image)
        .bind(&sandbox.repository)
        .bind(serde_json::json!(sandbox.labels))
        .bind(&sandbox.network)
        .bind(sandbox.state)
        .bind(sandbox.security_score)
        .bind(sandbox.created_at)
        .bind(sandbox.last_assessment_at)
        .execute(db)
        .await;
        if let Err(err) = result {
            tracing::warn!(container_id = %sandbox.id, error = %err, "container mirror write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::containers::engine::FakeEngine;

    fn manager_with_security(engine: FakeEngine, security: SecurityContext) -> ContainerManager {
        ContainerManager::new(
            Arc::new(engine),
            LimitsConfig {
                runner_cpus: 2.0,
                runner_memory_mb: 2048,
                runner_swap_mb: 0,
                runner_pids: 512,
                runner_fds: 1024,
                runner_disk_gb: 10,
            },
            PoolConfig {
                min_size: 2,
                max_size: 20,
                scale_up_threshold: 0.8,
                scale_down_threshold: 0.2,
                idle_timeout: Duration::from_secs(300),
                startup_timeout: Duration::from_secs(5),
            },
            "runnerhub/sandbox:latest".to_string(),
            security,
            None,
        )
    }

    fn manager(engine: FakeEngine) -> ContainerManager {
        manager_with_security(engine, SecurityContext::default())
    }

    #[tokio::test]
    async fn create_lands_running_with_repository_network() {
        let engine = FakeEngine::new();
        let manager = manager(engine.clone());
        let sandbox = manager
            .create_sandbox("acme/widgets", vec!["linux".into(), "x64".into()])
            .await
            .unwrap();

        assert_eq!(sandbox.state, ContainerState::Running);
        assert_eq!(sandbox.network, "runnerhub-acme-widgets");
        assert_eq!(engine.running_count().await, 1);
    }

    #[tokio::test]
    async fn configured_read_only_rootfs_reaches_the_sandbox() {
        let engine = FakeEngine::new();
        let ro_manager = manager_with_security(
            engine,
            SecurityContext {
                read_only_rootfs: true,
                ..SecurityContext::default()
            },
        );
        let sandbox = ro_manager.create_sandbox("acme/widgets", vec![]).await.unwrap();
        assert!(sandbox.read_only_rootfs);

        let default_engine = FakeEngine::new();
        let default_manager = manager(default_engine);
        let sandbox = default_manager
            .create_sandbox("acme/widgets", vec![])
            .await
            .unwrap();
        assert!(!sandbox.read_only_rootfs);
    }

    #[tokio::test]
    async fn failed_create_transitions_to_removed() {
        let engine = FakeEngine::new();
        engine.fail_next_create().await;
        let manager = manager(engine.clone());

        let result = manager.create_sandbox("acme/widgets", vec![]).await;
        assert!(result.is_err());
        assert_eq!(engine.running_count().await, 0);
    }

    #[tokio::test]
    async fn full_lifecycle_reaches_removed() {
        let engine = FakeEngine::new();
        let manager = manager(engine.clone());
        let mut sandbox = manager.create_sandbox("acme/widgets", vec![]).await.unwrap();

        manager
            .stop_sandbox(&mut sandbox, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(sandbox.state, ContainerState::Stopped);

        manager.remove_sandbox(&mut sandbox, false).await.unwrap();
        assert_eq!(sandbox.state, ContainerState::Removed);
    }

    #[tokio::test]
    async fn quarantine_isolates_network() {
        let engine = FakeEngine::new();
        let manager = manager(engine.clone());
        let mut sandbox = manager.create_sandbox("acme/widgets", vec![]).await.unwrap();

        manager.quarantine_sandbox(&mut sandbox).await.unwrap();
        assert_eq!(sandbox.state, ContainerState::Quarantined);

        // Quarantined sandboxes refuse exec.
        let err = manager
            .exec(&sandbox, vec!["id".into()], vec![], None, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, Kind::Conflict);

        // And can only go to removed.
        manager.remove_sandbox(&mut sandbox, true).await.unwrap();
        assert_eq!(sandbox.state, ContainerState::Removed);
    }

    #[test]
    fn transition_chart_is_enforced() {
        assert!(ContainerState::Creating.can_transition_to(ContainerState::Running));
        assert!(!ContainerState::Removed.can_transition_to(ContainerState::Running));
        assert!(!ContainerState::Stopped.can_transition_to(ContainerState::Running));
        assert!(ContainerState::Quarantined.can_transition_to(ContainerState::Removed));
    }
}
