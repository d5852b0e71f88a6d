//! Failover orchestration.
//!
//! Store failover: flip the active store to the replica, pause queue
//! draining while reconciling lapsed reservations, then resume. Jobs keep
//! being accepted throughout; only draining pauses. Coordination-store
//! failover: step down locally, let the managed connection re-resolve the
//! new master, and re-enter the election.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::common::Result;
use crate::kernel::ha::leader::LeaderElector;
use crate::kernel::ha::monitor::{FailoverSink, COORD, STORE_PRIMARY};
use crate::kernel::jobs::engine::QueueEngine;
use crate::kernel::jobs::job::{Job, JobState, QueueName};
use crate::kernel::jobs::store::{EnqueueRequest, EnqueueResult, JobStore, QueueCounts};
use crate::kernel::stream_hub::StreamHub;

/// A `JobStore` that routes to the primary until failover promotes the
/// replica. Demotion back to primary is an operator action, not automatic.
pub struct FailoverStore<S: JobStore> {
    primary: S,
    replica: Option<S>,
    use_replica: AtomicBool,
}

impl<S: JobStore> FailoverStore<S> {
    pub fn new(primary: S, replica: Option<S>) -> Self {
        Self {
            primary,
            replica,
            use_replica: AtomicBool::new(false),
        }
    }

    /// Returns false when no replica is configured.
    pub fn promote_replica(&self) -> bool {
        if self.replica.is_none() {
            return false;
        }
        self.use_replica.store(true, Ordering::SeqCst);
        true
    }

    pub fn on_replica(&self) -> bool {
        self.use_replica.load(Ordering::SeqCst)
    }

    fn active(&self) -> &S {
        if self.on_replica() {
            self.replica.as_ref().unwrap_or(&self.primary)
        } else {
            &self.primary
        }
    }
}

#[async_trait]
impl<S: JobStore> JobStore for FailoverStore<S> {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<EnqueueResult> {
        self.active().enqueue(request).await
    }

    async fn claim(
        &self,
        queue: QueueName,
        worker_id: &str,
        limit: i64,
        visibility: Duration,
    ) -> Result<Vec<Job>> {
        self.active().claim(queue, worker_id, limit, visibility).await
    }

    async fn heartbeat(&self, id: Uuid, token: Uuid, visibility: Duration) -> Result<bool> {
        self.active().heartbeat(id, token, visibility).await
    }

    async fn complete(&self, id: Uuid, token: Uuid) -> Result<()> {
        self.active().complete(id, token).await
    }

    async fn fail(&self, id: Uuid, token: Uuid, error: &str, code: &str) -> Result<i32> {
        self.active().fail(id, token, error, code).await
    }

    async fn schedule_retry(&self, id: Uuid, due_at: DateTime<Utc>) -> Result<()> {
        self.active().schedule_retry(id, due_at).await
    }

    async fn mark_dead(&self, id: Uuid, reason: &str) -> Result<()> {
        self.active().mark_dead(id, reason).await
    }

    async fn release_stalled(&self) -> Result<Vec<Job>> {
        self.active().release_stalled().await
    }

    async fn update_progress(&self, id: Uuid, progress: f32) -> Result<()> {
        self.active().update_progress(id, progress).await
    }

    async fn find(&self, id: Uuid) -> Result<Option<Job>> {
        self.active().find(id).await
    }

    async fn list(
        &self,
        queue: Option<QueueName>,
        state: Option<JobState>,
        limit: i64,
    ) -> Result<Vec<Job>> {
        self.active().list(queue, state, limit).await
    }

    async fn depth(&self, queue: QueueName) -> Result<i64> {
        self.active().depth(queue).await
    }

    async fn counts(&self, queue: QueueName) -> Result<QueueCounts> {
        self.active().counts(queue).await
    }

    async fn requeue_dead(&self, id: Uuid) -> Result<bool> {
        self.active().requeue_dead(id).await
    }

    async fn delete_failed(&self, queue: QueueName) -> Result<u64> {
        self.active().delete_failed(queue).await
    }

    async fn recover(&self, max_age: Duration) -> Result<Vec<Job>> {
        self.active().recover(max_age).await
    }

    async fn purge_terminal(
        &self,
        completed_before: DateTime<Utc>,
        failed_before: DateTime<Utc>,
    ) -> Result<u64> {
        self.active()
            .purge_terminal(completed_before, failed_before)
            .await
    }
}

/// Reacts to health-monitor trips.
pub struct FailoverCoordinator {
    engine: Arc<QueueEngine>,
    elector: Arc<LeaderElector>,
    hub: StreamHub,
    store_failover_enabled: bool,
    coord_failover_enabled: bool,
    promote: Box<dyn Fn() -> bool + Send + Sync>,
}

impl FailoverCoordinator {
    pub fn new(
        engine: Arc<QueueEngine>,
        elector: Arc<LeaderElector>,
        hub: StreamHub,
        store_failover_enabled: bool,
        coord_failover_enabled: bool,
        promote: Box<dyn Fn() -> bool + Send + Sync>,
    ) -> Self {
        Self {
            engine,
            elector,
            hub,
            store_failover_enabled,
            coord_failover_enabled,
            promote,
        }
    }

    async fn store_failover(&self) {
        if !self.store_failover_enabled {
            warn!("store primary unhealthy but store failover is disabled");
            return;
        }
        // Only the leader orchestrates; others observe the promoted store
        // through their own health rounds.
        if !self.elector.is_leader() {
            info!("store primary unhealthy; deferring to the leader");
            return;
        }

        info!("store failover: pausing queue draining");
        self.engine.pause_all().await;

        if !(self.promote)() {
            error!("store failover aborted: no replica configured");
            self.engine.resume_all().await;
            return;
        }

        // Reconcile: return lapsed reservations before workers drain again.
        match self.engine.store().release_stalled().await {
            Ok(released) => {
                info!(count = released.len(), "reconciled stalled reservations on replica");
            }
            Err(err) => {
                error!(error = %err, "reconciliation failed after promote");
            }
        }

        self.engine.resume_all().await;
        self.hub
            .publish(
                "ha",
                serde_json::json!({
                    "event": "store_failover",
                    "promoted": true,
                }),
            )
            .await;
        info!("store failover complete, draining resumed");
    }

    async fn coord_failover(&self) {
        if !self.coord_failover_enabled {
            warn!("coordination store unhealthy but coord failover is disabled");
            return;
        }
        // Drop any leadership claim we cannot renew and let the election
        // loop re-race once the new master answers.
        self.elector.step_down().await;
        self.hub
            .publish(
                "ha",
                serde_json::json!({
                    "event": "coord_failover",
                }),
            )
            .await;
        info!("stepped down pending coordination store recovery");
    }
}

#[async_trait]
impl FailoverSink for FailoverCoordinator {
    async fn component_unhealthy(&self, component: &str) {
        match component {
            STORE_PRIMARY => self.store_failover().await,
            COORD => self.coord_failover().await,
            other => {
                warn!(component = other, "component unhealthy, no automated failover");
            }
        }
    }

    async fn component_recovered(&self, component: &str) {
        info!(component, "component recovered");
        self.hub
            .publish(
                "ha",
                serde_json::json!({
                    "event": "component_recovered",
                    "component": component,
                }),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::kernel::coord::{CoordStore, MemoryCoordStore};
    use crate::kernel::jobs::store::MemoryJobStore;
    use crate::kernel::metrics::MemoryMetricsSink;

    fn queue_config() -> QueueConfig {
        QueueConfig {
            job_execution_concurrency: 1,
            container_management_concurrency: 1,
            monitoring_concurrency: 1,
            webhook_processing_concurrency: 1,
            cleanup_concurrency: 1,
            metrics_collection_concurrency: 1,
            visibility_timeout: Duration::from_secs(60),
            admission_capacity: 100,
            completed_retention: Duration::from_secs(3600),
            failed_retention: Duration::from_secs(3600),
        }
    }

    fn coordinator(
        promoted: Arc<AtomicBool>,
        leader: bool,
    ) -> (FailoverCoordinator, Arc<QueueEngine>) {
        let engine = Arc::new(QueueEngine::new(
            Arc::new(MemoryJobStore::new()),
            StreamHub::new(),
            Arc::new(MemoryMetricsSink::new()),
            queue_config(),
        ));
        let elector = Arc::new(LeaderElector::new(
            Arc::new(MemoryCoordStore::new()) as Arc<dyn CoordStore>,
            StreamHub::new(),
            "node-a".into(),
            Duration::from_secs(30),
            Duration::from_secs(10),
        ));
        if leader {
            elector.leader_flag().store(true, Ordering::SeqCst);
        }
        let flag = promoted.clone();
        let coordinator = FailoverCoordinator::new(
            engine.clone(),
            elector,
            StreamHub::new(),
            true,
            true,
            Box::new(move || {
                flag.store(true, Ordering::SeqCst);
                true
            }),
        );
        (coordinator, engine)
    }

    #[tokio::test]
    async fn failover_store_routes_to_replica_after_promote() {
        let primary = MemoryJobStore::new();
        let replica = MemoryJobStore::new();
        let store = FailoverStore::new(primary, Some(replica.clone()));

        assert!(!store.on_replica());
        assert!(store.promote_replica());
        assert!(store.on_replica());

        // Writes now land on the replica.
        store
            .enqueue(EnqueueRequest {
                class: crate::kernel::jobs::job::JobClass::HealthCheck,
                queue: QueueName::ContainerManagement,
                priority: crate::kernel::jobs::job::JobPriority::Normal,
                payload: serde_json::json!({"class": "health_check"}),
                policy: crate::kernel::jobs::retry::RetryPolicy::fixed(
                    Duration::from_secs(1),
                    1,
                ),
                delay: None,
                idempotency_key: None,
                source_event_id: None,
            })
            .await
            .unwrap();
        assert_eq!(
            replica.depth(QueueName::ContainerManagement).await.unwrap(),
            1
        );
    }

    #[test]
    fn promote_without_replica_is_refused() {
        let store = FailoverStore::new(MemoryJobStore::new(), None);
        assert!(!store.promote_replica());
        assert!(!store.on_replica());
    }

    #[tokio::test]
    async fn leader_runs_store_failover_and_resumes_draining() {
        let promoted = Arc::new(AtomicBool::new(false));
        let (coordinator, engine) = coordinator(promoted.clone(), true);

        coordinator.component_unhealthy(STORE_PRIMARY).await;

        assert!(promoted.load(Ordering::SeqCst));
        // Draining resumed after reconciliation.
        assert!(!engine.is_paused(QueueName::JobExecution).await);
    }

    #[tokio::test]
    async fn non_leader_defers_store_failover() {
        let promoted = Arc::new(AtomicBool::new(false));
        let (coordinator, engine) = coordinator(promoted.clone(), false);

        coordinator.component_unhealthy(STORE_PRIMARY).await;

        assert!(!promoted.load(Ordering::SeqCst));
        assert!(!engine.is_paused(QueueName::JobExecution).await);
    }
}
