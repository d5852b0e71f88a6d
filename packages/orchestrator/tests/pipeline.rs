//! End-to-end pipeline scenarios over in-memory capabilities: webhook
//! ingress through routing, queue draining, sandbox execution, and the
//! leader-gated scheduler.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use orchestrator_core::config::{LimitsConfig, PoolConfig, QueueConfig, WebhookConfig};
use orchestrator_core::kernel::containers::engine::{ContainerEngine, FakeEngine, SecurityContext};
use orchestrator_core::kernel::containers::health::{HealthProber, ProbeConfig};
use orchestrator_core::kernel::containers::lifecycle::ContainerManager;
use orchestrator_core::kernel::containers::pool::{ContainerPool, PoolHandle};
use orchestrator_core::kernel::coord::{CoordStore, MemoryCoordStore};
use orchestrator_core::kernel::ha::leader::LeaderElector;
use orchestrator_core::kernel::jobs::processors::{register_processors, ProcessorDeps};
use orchestrator_core::kernel::jobs::scheduler::Scheduler;
use orchestrator_core::kernel::jobs::store::JobStore;
use orchestrator_core::kernel::jobs::{
    JobClass, JobPayload, JobRegistry, JobState, MemoryJobStore, QueueEngine, QueueName,
    WorkerPool,
};
use orchestrator_core::kernel::metrics::MemoryMetricsSink;
use orchestrator_core::kernel::runners::RunnerRegistry;
use orchestrator_core::kernel::security::evaluator::Evaluator;
use orchestrator_core::kernel::security::service::SecurityService;
use orchestrator_core::kernel::stream_hub::StreamHub;
use orchestrator_core::kernel::webhooks::event::MemoryWebhookEventStore;
use orchestrator_core::kernel::webhooks::ingress::{DeliveryHeaders, IngressOutcome, WebhookIngress};
use orchestrator_core::kernel::webhooks::signature;

fn queue_config() -> QueueConfig {
    QueueConfig {
        job_execution_concurrency: 1,
        container_management_concurrency: 2,
        monitoring_concurrency: 1,
        webhook_processing_concurrency: 2,
        cleanup_concurrency: 1,
        metrics_collection_concurrency: 1,
        visibility_timeout: Duration::from_secs(60),
        admission_capacity: 1000,
        completed_retention: Duration::from_secs(3600),
        failed_retention: Duration::from_secs(3600),
    }
}

fn pool_config() -> PoolConfig {
    PoolConfig {
        min_size: 0,
        max_size: 4,
        scale_up_threshold: 0.8,
        scale_down_threshold: 0.2,
        idle_timeout: Duration::from_secs(300),
        startup_timeout: Duration::from_secs(5),
    }
}

struct Harness {
    store: MemoryJobStore,
    engine: Arc<QueueEngine>,
    ingress: WebhookIngress,
    events: MemoryWebhookEventStore,
    hub: StreamHub,
    pool: PoolHandle,
    workers: Arc<WorkerPool>,
    shutdown: CancellationToken,
}

fn harness(secret: Option<&str>) -> Harness {
    let fake = FakeEngine::new();
    let container_engine: Arc<dyn ContainerEngine> = Arc::new(fake);
    let manager = Arc::new(ContainerManager::new(
        container_engine.clone(),
        LimitsConfig {
            runner_cpus: 1.0,
            runner_memory_mb: 512,
            runner_swap_mb: 0,
            runner_pids: 128,
            runner_fds: 256,
            runner_disk_gb: 10,
        },
        pool_config(),
        "runnerhub/sandbox:latest".to_string(),
        SecurityContext::default(),
        None,
    ));
    let (pool, pool_handle) = ContainerPool::new(manager, pool_config());
    let shutdown = CancellationToken::new();
    let pool_token = shutdown.clone();
    tokio::spawn(async move { pool.run(pool_token).await });

    let store = MemoryJobStore::new();
    let hub = StreamHub::new();
    let engine = Arc::new(QueueEngine::new(
        Arc::new(store.clone()),
        hub.clone(),
        Arc::new(MemoryMetricsSink::new()),
        queue_config(),
    ));

    let events = MemoryWebhookEventStore::new();
    let ingress = WebhookIngress::new(
        WebhookConfig {
            secret: secret.map(str::to_string),
            max_body_bytes: 25 * 1024 * 1024,
        },
        Arc::new(events.clone()),
        engine.clone(),
    );

    let mut registry = JobRegistry::new();
    register_processors(
        &mut registry,
        Arc::new(ProcessorDeps {
            queue: engine.clone(),
            pool: pool_handle.clone(),
            container_engine: container_engine.clone(),
            security: Arc::new(SecurityService::new(
                Evaluator::new(vec![]),
                hub.clone(),
                None,
            )),
            runners: Arc::new(RunnerRegistry::new(None)),
            prober: Arc::new(Mutex::new(HealthProber::new(
                container_engine,
                ProbeConfig::default(),
            ))),
            webhook_events: Arc::new(events.clone()),
            hub: hub.clone(),
            metrics: Arc::new(MemoryMetricsSink::new()),
            forge: None,
            db: None,
            queue_config: queue_config(),
        }),
    );

    let workers = Arc::new(WorkerPool::new(
        engine.clone(),
        Arc::new(registry),
        hub.clone(),
        "it-node".to_string(),
    ));

    Harness {
        store,
        engine,
        ingress,
        events,
        hub,
        pool: pool_handle,
        workers,
        shutdown,
    }
}

fn workflow_job_body(repo: &str, workflow: &str) -> Vec<u8> {
    serde_json::json!({
        "action": "queued",
        "repository": {"full_name": repo},
        "workflow_job": {"id": 42, "name": workflow, "labels": []}
    })
    .to_string()
    .into_bytes()
}

async fn wait_for<F, Fut>(mut check: F, timeout: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn duplicate_delivery_produces_one_workflow_execution() {
    let harness = harness(Some("shhh"));
    let body = workflow_job_body("acme/widgets", "build");
    let sig = signature::sign("shhh", &body);
    let headers = DeliveryHeaders {
        delivery_id: "d-1".to_string(),
        event_type: "workflow_job".to_string(),
        signature: Some(sig),
    };

    // Two identical deliveries.
    assert_eq!(
        harness.ingress.handle(&headers, &body).await.unwrap(),
        IngressOutcome::Accepted
    );
    assert_eq!(
        harness.ingress.handle(&headers, &body).await.unwrap(),
        IngressOutcome::Duplicate
    );
    assert_eq!(harness.events.len().await, 1);

    // Drain: the webhook job fans out into exactly one execution, which
    // runs to completion in a sandbox.
    let handles = harness.workers.clone().spawn(harness.shutdown.clone());

    let store = harness.store.clone();
    let completed = wait_for(
        || {
            let store = store.clone();
            async move {
                let executions = store
                    .list(Some(QueueName::JobExecution), None, 50)
                    .await
                    .unwrap();
                executions.len() == 1 && executions[0].state == JobState::Completed
            }
        },
        Duration::from_secs(10),
    )
    .await;
    assert!(completed, "workflow execution did not complete");

    let executions = harness
        .store
        .list(Some(QueueName::JobExecution), None, 50)
        .await
        .unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].class, JobClass::ExecuteWorkflow);

    harness.shutdown.cancel();
    for handle in handles {
        let _ = handle.await;
    }
}

#[tokio::test]
async fn completion_order_honors_priority() {
    let harness = harness(None);

    // J1: deploy workflow (critical), J2: push workflow (normal),
    // J3: runner cleanup (low, normally delayed 30 s).
    let j1 = harness
        .engine
        .enqueue(JobPayload::ExecuteWorkflow {
            repository: "acme/widgets".into(),
            workflow: "deploy-prod".into(),
            event: "push".into(),
            labels: vec![],
            delivery_id: None,
            forge_job_id: None,
            runner_id: None,
        })
        .await
        .unwrap()
        .job_id();
    let j2 = harness
        .engine
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
    let j3 = harness
        .engine
        .enqueue(JobPayload::CleanupRunner {
            runner_id: uuid::Uuid::new_v4(),
        })
        .await
        .unwrap()
        .job_id();
    harness.store.force_due(j3).await;

    let mut events = harness.hub.subscribe("jobs").await;
    let handles = harness.workers.clone().spawn(harness.shutdown.clone());

    // Collect completion order off the event stream.
    let mut order = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    while order.len() < 3 && tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Ok(event)) => {
                if event["event"] == "job_completed" {
                    let id: uuid::Uuid =
                        serde_json::from_value(event["job_id"].clone()).unwrap();
                    if [j1, j2, j3].contains(&id) {
                        order.push(id);
                    }
                }
            }
            _ => break,
        }
    }

    assert_eq!(order, vec![j1, j2, j3]);

    harness.shutdown.cancel();
    for handle in handles {
        let _ = handle.await;
    }
}

#[tokio::test]
async fn workflow_sandboxes_are_recycled_after_completion() {
    let harness = harness(None);
    harness
        .engine
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
        .unwrap();

    let handles = harness.workers.clone().spawn(harness.shutdown.clone());

    // The execution completes, then the recycle job destroys the sandbox.
    let pool = harness.pool.clone();
    let store = harness.store.clone();
    let recycled = wait_for(
        || {
            let pool = pool.clone();
            let store = store.clone();
            async move {
                let destroys = store
                    .list(Some(QueueName::ContainerManagement), None, 50)
                    .await
                    .unwrap()
                    .into_iter()
                    .filter(|job| {
                        job.class == JobClass::DestroyContainer
                            && job.state == JobState::Completed
                    })
                    .count();
                destroys == 1 && pool.status().await.map(|s| s.total).unwrap_or(99) == 0
            }
        },
        Duration::from_secs(10),
    )
    .await;
    assert!(recycled, "sandbox was not recycled");

    harness.shutdown.cancel();
    for handle in handles {
        let _ = handle.await;
    }
}

#[tokio::test]
async fn scheduler_covers_a_minute_exactly_once_across_failover() {
    let coord = Arc::new(MemoryCoordStore::new());
    let coord_dyn: Arc<dyn CoordStore> = coord.clone();
    let hub = StreamHub::new();

    let elector_a = Arc::new(LeaderElector::new(
        coord_dyn.clone(),
        hub.clone(),
        "node-a".to_string(),
        Duration::from_millis(400),
        Duration::from_millis(120),
    ));
    let elector_b = Arc::new(LeaderElector::new(
        coord_dyn,
        hub,
        "node-b".to_string(),
        Duration::from_millis(400),
        Duration::from_millis(120),
    ));

    let shutdown_a = CancellationToken::new();
    let shutdown_b = CancellationToken::new();
    {
        let elector = elector_a.clone();
        let token = shutdown_a.clone();
        tokio::spawn(async move { elector.run(token).await });
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    {
        let elector = elector_b.clone();
        let token = shutdown_b.clone();
        tokio::spawn(async move { elector.run(token).await });
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(elector_a.is_leader());
    assert!(!elector_b.is_leader());

    // Shared store: both replicas schedule into the same queue.
    let store = MemoryJobStore::new();
    let engine = Arc::new(QueueEngine::new(
        Arc::new(store.clone()),
        StreamHub::new(),
        Arc::new(MemoryMetricsSink::new()),
        queue_config(),
    ));
    let scheduler_a = Scheduler::new(engine.clone(), elector_a.leader_flag());
    let scheduler_b = Scheduler::new(engine.clone(), elector_b.leader_flag());

    let slot = chrono::Utc::now();
    scheduler_a.tick(slot).await;

    // Kill the leader mid-minute; B takes over and re-ticks the same slot.
    shutdown_a.cancel();
    let took_over = {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            if elector_b.is_leader() {
                break true;
            }
            if tokio::time::Instant::now() > deadline {
                break false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    };
    assert!(took_over, "node-b never took leadership");
    assert!(elector_b.generation() >= 2);

    scheduler_b.tick(slot).await;

    // The covered minute executed at most once per scheduled class.
    let jobs = store.list(None, None, 100).await.unwrap();
    let metrics_jobs = jobs
        .iter()
        .filter(|job| job.class == JobClass::CollectMetrics)
        .count();
    assert!(metrics_jobs <= 1);

    shutdown_b.cancel();
}
