//! Sandbox pool: pre-warm, allocate, release, resize, evict.
//!
//! The pool table has a single writer: an actor task consuming commands
//! from a channel. Reads go through the same channel and see a consistent
//! snapshot. Container creation and removal are slow engine calls, so the
//! actor spawns them and ingests the result as another command instead of
//! blocking the loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::common::{Error, Kind, Result};
use crate::config::PoolConfig;
use crate::kernel::containers::lifecycle::{ContainerManager, ContainerState, Sandbox};
use crate::kernel::jobs::job::JobPriority;

const TICK_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStatus {
    pub total: usize,
    pub ready: usize,
    pub busy: usize,
    pub quarantined: usize,
    pub pending_creates: usize,
    pub waiters: usize,
    pub utilization: f64,
}

struct Waiter {
    labels: Vec<String>,
    repository: String,
    priority: JobPriority,
    job_id: Uuid,
    requested_at: chrono::DateTime<Utc>,
    reply: oneshot::Sender<Result<Sandbox>>,
}

enum Command {
    Acquire {
        labels: Vec<String>,
        repository: String,
        priority: JobPriority,
        job_id: Uuid,
        reply: oneshot::Sender<Result<Sandbox>>,
    },
    Release {
        id: Uuid,
    },
    Quarantine {
        id: Uuid,
        reply: oneshot::Sender<Result<()>>,
    },
    Created {
        result: Result<Sandbox>,
    },
    Status {
        reply: oneshot::Sender<PoolStatus>,
    },
    /// Warm one sandbox for a profile without assigning it.
    Prewarm {
        repository: String,
        labels: Vec<String>,
    },
    /// Remove a sandbox from the pool and the engine.
    Evict {
        id: Uuid,
        force: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    List {
        reply: oneshot::Sender<Vec<Sandbox>>,
    },
    Tick,
}

/// Cloneable handle to the pool actor.
#[derive(Clone)]
pub struct PoolHandle {
    tx: mpsc::Sender<Command>,
}

impl PoolHandle {
    /// Request an exclusive sandbox whose labels are a superset of `labels`.
    /// Blocks until a slot frees or `timeout` lapses.
    pub async fn acquire(
        &self,
        labels: Vec<String>,
        repository: String,
        priority: JobPriority,
        job_id: Uuid,
        timeout: Duration,
    ) -> Result<Sandbox> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Acquire {
                labels,
                repository,
                priority,
                job_id,
                reply,
            })
            .await
            .map_err(|_| Error::new(Kind::Shutdown, "pool is shut down"))?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::new(Kind::Shutdown, "pool dropped the request")),
            Err(_) => Err(Error::new(
                Kind::ResourceExhausted,
                "timed out waiting for a sandbox",
            )
            .with_code("resource_exhausted")),
        }
    }

    pub async fn release(&self, id: Uuid) {
        let _ = self.tx.send(Command::Release { id }).await;
    }

    pub async fn quarantine(&self, id: Uuid) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Quarantine { id, reply })
            .await
            .map_err(|_| Error::new(Kind::Shutdown, "pool is shut down"))?;
        rx.await
            .map_err(|_| Error::new(Kind::Shutdown, "pool dropped the request"))?
    }

    pub async fn status(&self) -> Result<PoolStatus> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Status { reply })
            .await
            .map_err(|_| Error::new(Kind::Shutdown, "pool is shut down"))?;
        rx.await
            .map_err(|_| Error::new(Kind::Shutdown, "pool dropped the request"))
    }

    /// Warm one sandbox for a profile without waiting for it.
    pub async fn prewarm(&self, repository: String, labels: Vec<String>) {
        let _ = self.tx.send(Command::Prewarm { repository, labels }).await;
    }

    pub async fn evict(&self, id: Uuid, force: bool) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Evict { id, force, reply })
            .await
            .map_err(|_| Error::new(Kind::Shutdown, "pool is shut down"))?;
        rx.await
            .map_err(|_| Error::new(Kind::Shutdown, "pool dropped the request"))?
    }

    /// Snapshot of every sandbox in the table.
    pub async fn list(&self) -> Result<Vec<Sandbox>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::List { reply })
            .await
            .map_err(|_| Error::new(Kind::Shutdown, "pool is shut down"))?;
        rx.await
            .map_err(|_| Error::new(Kind::Shutdown, "pool dropped the request"))
    }

    /// Force a maintenance pass (tests; the actor also ticks itself).
    pub async fn tick(&self) {
        let _ = self.tx.send(Command::Tick).await;
    }
}

pub struct ContainerPool {
    manager: Arc<ContainerManager>,
    config: PoolConfig,
    table: HashMap<Uuid, Sandbox>,
    waiters: Vec<Waiter>,
    pending_creates: usize,
    tx: mpsc::Sender<Command>,
    rx: mpsc::Receiver<Command>,
}

impl ContainerPool {
    pub fn new(manager: Arc<ContainerManager>, config: PoolConfig) -> (Self, PoolHandle) {
        let (tx, rx) = mpsc::channel(256);
        let handle = PoolHandle { tx: tx.clone() };
        (
            Self {
                manager,
                config,
                table: HashMap::new(),
                waiters: Vec::new(),
                pending_creates: 0,
                tx,
                rx,
            },
            handle,
        )
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            min = self.config.min_size,
            max = self.config.max_size,
            "container pool starting"
        );
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => self.handle(Command::Tick).await,
                command = self.rx.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
            }
        }
        info!("container pool stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Acquire {
                labels,
                repository,
                priority,
                job_id,
                reply,
            } => self.handle_acquire(labels, repository, priority, job_id, reply),
            Command::Release { id } => self.handle_release(id),
            Command::Quarantine { id, reply } => {
                let _ = reply.send(self.handle_quarantine(id).await);
            }
            Command::Created { result } => self.handle_created(result),
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::Prewarm { repository, labels } => {
                if self.capacity_used() < self.config.max_size {
                    self.spawn_create(repository, labels);
                }
            }
            Command::Evict { id, force, reply } => {
                let _ = reply.send(self.handle_evict(id, force));
            }
            Command::List { reply } => {
                let _ = reply.send(self.table.values().cloned().collect());
            }
            Command::Tick => self.handle_tick(),
        }
    }

    fn status(&self) -> PoolStatus {
        let total = self
            .table
            .values()
            .filter(|sandbox| sandbox.state == ContainerState::Running)
            .count();
        let busy = self
            .table
            .values()
            .filter(|sandbox| sandbox.assigned_job.is_some())
            .count();
        let quarantined = self
            .table
            .values()
            .filter(|sandbox| sandbox.state == ContainerState::Quarantined)
            .count();
        PoolStatus {
            total,
            ready: total.saturating_sub(busy),
            busy,
            quarantined,
            pending_creates: self.pending_creates,
            waiters: self.waiters.len(),
            utilization: if total == 0 {
                0.0
            } else {
                busy as f64 / total as f64
            },
        }
    }

    fn find_ready(&self, labels: &[String], repository: &str) -> Option<Uuid> {
        self.table
            .values()
            .filter(|sandbox| {
                sandbox.state == ContainerState::Running
                    && sandbox.assigned_job.is_none()
                    && sandbox.repository == repository
                    && labels
                        .iter()
                        .all(|label| sandbox.labels.iter().any(|have| have == label))
            })
            .min_by_key(|sandbox| sandbox.created_at)
            .map(|sandbox| sandbox.id)
    }

    fn handle_acquire(
        &mut self,
        labels: Vec<String>,
        repository: String,
        priority: JobPriority,
        job_id: Uuid,
        reply: oneshot::Sender<Result<Sandbox>>,
    ) {
        if let Some(id) = self.find_ready(&labels, &repository) {
            if let Some(sandbox) = self.table.get_mut(&id) {
                sandbox.assigned_job = Some(job_id);
                sandbox.idle_since = None;
                let _ = reply.send(Ok(sandbox.clone()));
                return;
            }
        }

        // Nothing ready: queue the waiter and grow if the bound allows.
        self.waiters.push(Waiter {
            labels,
            repository: repository.clone(),
            priority,
            job_id,
            requested_at: Utc::now(),
            reply,
        });
        self.waiters
            .sort_by_key(|waiter| (waiter.priority, waiter.requested_at));

        if self.capacity_used() < self.config.max_size {
            self.spawn_create(repository, self.waiter_labels_for_next());
        }
    }

    fn waiter_labels_for_next(&self) -> Vec<String> {
        self.waiters
            .first()
            .map(|waiter| waiter.labels.clone())
            .unwrap_or_default()
    }

    fn capacity_used(&self) -> usize {
        self.table
            .values()
            .filter(|sandbox| {
                matches!(
                    sandbox.state,
                    ContainerState::Creating | ContainerState::Running
                )
            })
            .count()
            + self.pending_creates
    }

    fn spawn_create(&mut self, repository: String, labels: Vec<String>) {
        self.pending_creates += 1;
        let manager = self.manager.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = manager.create_sandbox(&repository, labels).await;
            let _ = tx.send(Command::Created { result }).await;
        });
    }

    fn handle_created(&mut self, result: Result<Sandbox>) {
        self.pending_creates = self.pending_creates.saturating_sub(1);
        let mut sandbox = match result {
            Ok(sandbox) => sandbox,
            Err(err) => {
                warn!(error = %err, "sandbox create failed");
                // Waiters keep waiting for a later create or their timeout.
                return;
            }
        };

        // Hand directly to the oldest matching waiter, highest priority first.
        let position = self.waiters.iter().position(|waiter| {
            !waiter.reply.is_closed()
                && waiter.repository == sandbox.repository
                && waiter
                    .labels
                    .iter()
                    .all(|label| sandbox.labels.iter().any(|have| have == label))
        });

        if let Some(position) = position {
            let waiter = self.waiters.remove(position);
            sandbox.assigned_job = Some(waiter.job_id);
            sandbox.idle_since = None;
            let id = sandbox.id;
            if waiter.reply.send(Ok(sandbox.clone())).is_err() {
                // Caller timed out between create and delivery.
                sandbox.assigned_job = None;
                sandbox.idle_since = Some(Utc::now());
                debug!(container_id = %id, "waiter gone, sandbox returns to pool");
            }
        }
        self.table.insert(sandbox.id, sandbox);
        self.prune_dead_waiters();
    }

    fn handle_release(&mut self, id: Uuid) {
        let Some(sandbox) = self.table.get_mut(&id) else {
            return;
        };
        sandbox.assigned_job = None;
        sandbox.idle_since = Some(Utc::now());
        debug!(container_id = %id, "sandbox released");

        // Serve the best waiting request with the freed sandbox.
        self.prune_dead_waiters();
        let Some(sandbox) = self.table.get(&id).cloned() else {
            return;
        };
        let position = self.waiters.iter().position(|waiter| {
            waiter.repository == sandbox.repository
                && waiter
                    .labels
                    .iter()
                    .all(|label| sandbox.labels.iter().any(|have| have == label))
        });
        if let Some(position) = position {
            let waiter = self.waiters.remove(position);
            if let Some(entry) = self.table.get_mut(&id) {
                entry.assigned_job = Some(waiter.job_id);
                entry.idle_since = None;
                if waiter.reply.send(Ok(entry.clone())).is_err() {
                    entry.assigned_job = None;
                    entry.idle_since = Some(Utc::now());
                }
            }
        }
    }

    async fn handle_quarantine(&mut self, id: Uuid) -> Result<()> {
        let Some(sandbox) = self.table.get_mut(&id) else {
            return Err(Error::not_found("sandbox not in pool"));
        };
        self.manager.quarantine_sandbox(sandbox).await?;

        // Quarantined sandboxes are evicted asynchronously.
        let mut doomed = sandbox.clone();
        let manager = self.manager.clone();
        tokio::spawn(async move {
            if let Err(err) = manager.remove_sandbox(&mut doomed, true).await {
                error!(container_id = %doomed.id, error = %err, "quarantine eviction failed");
            }
        });
        self.table.remove(&id);
        Ok(())
    }

    fn handle_evict(&mut self, id: Uuid, force: bool) -> Result<()> {
        let Some(mut sandbox) = self.table.remove(&id) else {
            return Err(Error::not_found("sandbox not in pool"));
        };
        if sandbox.assigned_job.is_some() && !force {
            self.table.insert(id, sandbox);
            return Err(Error::conflict("sandbox is busy"));
        }
        let manager = self.manager.clone();
        tokio::spawn(async move {
            if let Err(err) = manager.remove_sandbox(&mut sandbox, force).await {
                error!(container_id = %sandbox.id, error = %err, "eviction failed");
            }
        });
        Ok(())
    }

    fn prune_dead_waiters(&mut self) {
        self.waiters.retain(|waiter| !waiter.reply.is_closed());
    }

    /// Maintenance: pre-warm up to `min`, scale on utilization, evict idle.
    fn handle_tick(&mut self) {
        self.prune_dead_waiters();
        let status = self.status();

        // Pre-warm to the floor using the most recent demand profile.
        if self.capacity_used() < self.config.min_size {
            let deficit = self.config.min_size - self.capacity_used();
            let profile = self
                .table
                .values()
                .max_by_key(|sandbox| sandbox.created_at)
                .map(|sandbox| (sandbox.repository.clone(), sandbox.labels.clone()));
            if let Some((repository, labels)) = profile {
                for _ in 0..deficit {
                    self.spawn_create(repository.clone(), labels.clone());
                }
            }
        }

        // Scale up under sustained pressure.
        if status.utilization > self.config.scale_up_threshold
            && self.capacity_used() < self.config.max_size
        {
            if let Some(profile) = self
                .table
                .values()
                .filter(|sandbox| sandbox.assigned_job.is_some())
                .max_by_key(|sandbox| sandbox.created_at)
                .map(|sandbox| (sandbox.repository.clone(), sandbox.labels.clone()))
            {
                self.spawn_create(profile.0, profile.1);
            }
        }

        // Evict idle sandboxes beyond the floor.
        let now = Utc::now();
        let idle_cutoff =
            chrono::Duration::from_std(self.config.idle_timeout).unwrap_or_default();
        let evictable: Vec<Uuid> = self
            .table
            .values()
            .filter(|sandbox| {
                sandbox.state == ContainerState::Running
                    && sandbox.assigned_job.is_none()
                    && sandbox
                        .idle_since
                        .map_or(false, |since| now - since > idle_cutoff)
            })
            .map(|sandbox| sandbox.id)
            .collect();

        let floor = self.config.min_size;
        let mut remaining = self.capacity_used();
        for id in evictable {
            if remaining <= floor || status.utilization > self.config.scale_down_threshold {
                break;
            }
            if let Some(mut sandbox) = self.table.remove(&id) {
                remaining -= 1;
                let manager = self.manager.clone();
                tokio::spawn(async move {
                    if let Err(err) = manager.remove_sandbox(&mut sandbox, false).await {
                        error!(container_id = %sandbox.id, error = %err, "idle eviction failed");
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitsConfig;
    use crate::kernel::containers::engine::FakeEngine;

    fn pool_config(min: usize, max: usize) -> PoolConfig {
        PoolConfig {
            min_size: min,
            max_size: max,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.2,
            idle_timeout: Duration::from_secs(300),
            startup_timeout: Duration::from_secs(5),
        }
    }

    fn manager(engine: FakeEngine) -> Arc<ContainerManager> {
        Arc::new(ContainerManager::new(
            Arc::new(engine),
            LimitsConfig {
                runner_cpus: 1.0,
                runner_memory_mb: 512,
                runner_swap_mb: 0,
                runner_pids: 128,
                runner_fds: 256,
                runner_disk_gb: 10,
            },
            pool_config(0, 4),
            "runnerhub/sandbox:latest".to_string(),
            crate::kernel::containers::engine::SecurityContext::default(),
            None,
        ))
    }

    fn start_pool(engine: FakeEngine, min: usize, max: usize) -> (PoolHandle, CancellationToken) {
        let (pool, handle) = ContainerPool::new(manager(engine), pool_config(min, max));
        let token = CancellationToken::new();
        let run_token = token.clone();
        tokio::spawn(async move { pool.run(run_token).await });
        (handle, token)
    }

    #[tokio::test]
    async fn acquire_creates_on_demand_and_is_exclusive() {
        let engine = FakeEngine::new();
        let (handle, token) = start_pool(engine, 0, 4);

        let sandbox = handle
            .acquire(
                vec!["linux".into()],
                "acme/widgets".into(),
                JobPriority::Normal,
                Uuid::new_v4(),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(sandbox.repository, "acme/widgets");

        let status = handle.status().await.unwrap();
        assert_eq!(status.busy, 1);
        assert_eq!(status.ready, 0);
        token.cancel();
    }

    #[tokio::test]
    async fn released_sandbox_is_reused() {
        let engine = FakeEngine::new();
        let (handle, token) = start_pool(engine, 0, 4);

        let first = handle
            .acquire(
                vec![],
                "acme/widgets".into(),
                JobPriority::Normal,
                Uuid::new_v4(),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        handle.release(first.id).await;

        let second = handle
            .acquire(
                vec![],
                "acme/widgets".into(),
                JobPriority::Normal,
                Uuid::new_v4(),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(first.id, second.id);

        let status = handle.status().await.unwrap();
        assert_eq!(status.total, 1);
        token.cancel();
    }

    #[tokio::test]
    async fn exhausted_pool_times_out_the_waiter() {
        let engine = FakeEngine::new();
        let (handle, token) = start_pool(engine, 0, 1);

        let _held = handle
            .acquire(
                vec![],
                "acme/widgets".into(),
                JobPriority::Normal,
                Uuid::new_v4(),
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        let err = handle
            .acquire(
                vec![],
                "acme/widgets".into(),
                JobPriority::Normal,
                Uuid::new_v4(),
                Duration::from_millis(200),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, Kind::ResourceExhausted);
        assert_eq!(err.code_str(), "resource_exhausted");
        token.cancel();
    }

    #[tokio::test]
    async fn release_hands_sandbox_to_waiter() {
        let engine = FakeEngine::new();
        let (handle, token) = start_pool(engine, 0, 1);

        let held = handle
            .acquire(
                vec![],
                "acme/widgets".into(),
                JobPriority::Normal,
                Uuid::new_v4(),
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        let waiter_handle = handle.clone();
        let waiter = tokio::spawn(async move {
            waiter_handle
                .acquire(
                    vec![],
                    "acme/widgets".into(),
                    JobPriority::Critical,
                    Uuid::new_v4(),
                    Duration::from_secs(5),
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.release(held.id).await;

        let reused = waiter.await.unwrap().unwrap();
        assert_eq!(reused.id, held.id);
        token.cancel();
    }

    #[tokio::test]
    async fn quarantine_removes_from_pool() {
        let engine = FakeEngine::new();
        let (handle, token) = start_pool(engine, 0, 2);

        let sandbox = handle
            .acquire(
                vec![],
                "acme/widgets".into(),
                JobPriority::Normal,
                Uuid::new_v4(),
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        handle.quarantine(sandbox.id).await.unwrap();
        let status = handle.status().await.unwrap();
        assert_eq!(status.total, 0);
        token.cancel();
    }

    #[tokio::test]
    async fn label_superset_matching() {
        let engine = FakeEngine::new();
        let (handle, token) = start_pool(engine, 0, 4);

        // Create a sandbox with both labels, release it.
        let both = handle
            .acquire(
                vec!["linux".into(), "gpu".into()],
                "acme/widgets".into(),
                JobPriority::Normal,
                Uuid::new_v4(),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        handle.release(both.id).await;

        // A request for a subset of labels reuses it.
        let reused = handle
            .acquire(
                vec!["linux".into()],
                "acme/widgets".into(),
                JobPriority::Normal,
                Uuid::new_v4(),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(reused.id, both.id);
        token.cancel();
    }
}
