//! Component health monitoring.
//!
//! Probes the durable store (primary and replica), the coordination store,
//! the container engine, and the local API on a fixed interval. A component
//! that stays unhealthy for the configured number of consecutive rounds
//! triggers its failover hook exactly once per outage.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::common::Result;
use crate::kernel::containers::engine::ContainerEngine;
use crate::kernel::coord::CoordStore;

pub const STORE_PRIMARY: &str = "store-primary";
pub const STORE_REPLICA: &str = "store-replica";
pub const COORD: &str = "coord";
pub const CONTAINER_ENGINE: &str = "container-engine";
pub const LOCAL_API: &str = "local-api";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub component: String,
    pub state: HealthState,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    fn name(&self) -> &'static str;
    async fn probe(&self) -> Result<()>;
}

/// Invoked when a component crosses the unhealthy threshold.
#[async_trait]
pub trait FailoverSink: Send + Sync {
    async fn component_unhealthy(&self, component: &str);
    async fn component_recovered(&self, component: &str);
}

pub struct StoreProbe {
    name: &'static str,
    db: PgPool,
}

impl StoreProbe {
    pub fn primary(db: PgPool) -> Self {
        Self {
            name: STORE_PRIMARY,
            db,
        }
    }

    pub fn replica(db: PgPool) -> Self {
        Self {
            name: STORE_REPLICA,
            db,
        }
    }
}

#[async_trait]
impl HealthProbe for StoreProbe {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn probe(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.db).await?;
        Ok(())
    }
}

pub struct CoordProbe {
    coord: Arc<dyn CoordStore>,
}

impl CoordProbe {
    pub fn new(coord: Arc<dyn CoordStore>) -> Self {
        Self { coord }
    }
}

#[async_trait]
impl HealthProbe for CoordProbe {
    fn name(&self) -> &'static str {
        COORD
    }

    async fn probe(&self) -> Result<()> {
        self.coord.holder("healthcheck").await?;
        Ok(())
    }
}

pub struct EngineProbe {
    engine: Arc<dyn ContainerEngine>,
}

impl EngineProbe {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl HealthProbe for EngineProbe {
    fn name(&self) -> &'static str {
        CONTAINER_ENGINE
    }

    async fn probe(&self) -> Result<()> {
        self.engine.ping().await
    }
}

pub struct ApiProbe {
    url: String,
    client: reqwest::Client,
}

impl ApiProbe {
    pub fn new(port: u16) -> Self {
        Self {
            url: format!("http://127.0.0.1:{port}/health"),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl HealthProbe for ApiProbe {
    fn name(&self) -> &'static str {
        LOCAL_API
    }

    async fn probe(&self) -> Result<()> {
        let response = self
            .client
            .get(&self.url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|err| crate::common::Error::dependency(err.to_string()))?;
        if !response.status().is_success() {
            return Err(crate::common::Error::dependency(format!(
                "health endpoint returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

pub struct HealthMonitor {
    probes: Vec<Arc<dyn HealthProbe>>,
    sink: Arc<dyn FailoverSink>,
    interval: Duration,
    /// Probe latency above this is degraded even when it succeeds.
    degraded_after: Duration,
    /// Consecutive unhealthy rounds before the failover hook fires.
    unhealthy_threshold: u32,
    statuses: Arc<RwLock<HashMap<String, ComponentHealth>>>,
    failures: tokio::sync::Mutex<HashMap<String, u32>>,
    tripped: tokio::sync::Mutex<HashMap<String, bool>>,
}

impl HealthMonitor {
    pub fn new(
        probes: Vec<Arc<dyn HealthProbe>>,
        sink: Arc<dyn FailoverSink>,
        interval: Duration,
    ) -> Self {
        Self {
            probes,
            sink,
            interval,
            degraded_after: Duration::from_millis(500),
            unhealthy_threshold: 3,
            statuses: Arc::new(RwLock::new(HashMap::new())),
            failures: tokio::sync::Mutex::new(HashMap::new()),
            tripped: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Snapshot handle for the dashboard endpoint.
    pub fn statuses(&self) -> Arc<RwLock<HashMap<String, ComponentHealth>>> {
        self.statuses.clone()
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        info!(probes = self.probes.len(), "health monitor starting");
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            self.round().await;
        }
        info!("health monitor stopped");
    }

    /// One probe round across all components.
    pub async fn round(&self) {
        for probe in &self.probes {
            let name = probe.name();
            let started = Instant::now();
            let outcome = probe.probe().await;
            let latency = started.elapsed();

            let (state, error) = match outcome {
                Ok(()) if latency > self.degraded_after => (HealthState::Degraded, None),
                Ok(()) => (HealthState::Healthy, None),
                Err(err) => (HealthState::Unhealthy, Some(err.to_string())),
            };

            self.statuses.write().await.insert(
                name.to_string(),
                ComponentHealth {
                    component: name.to_string(),
                    state,
                    latency_ms: latency.as_millis() as u64,
                    error,
                    checked_at: Utc::now(),
                },
            );

            let mut failures = self.failures.lock().await;
            let mut tripped = self.tripped.lock().await;
            match state {
                HealthState::Unhealthy => {
                    let count = failures.entry(name.to_string()).or_insert(0);
                    *count += 1;
                    if *count >= self.unhealthy_threshold
                        && !tripped.get(name).copied().unwrap_or(false)
                    {
                        warn!(component = name, rounds = *count, "component unhealthy, triggering failover");
                        tripped.insert(name.to_string(), true);
                        drop(failures);
                        drop(tripped);
                        self.sink.component_unhealthy(name).await;
                    }
                }
                _ => {
                    failures.remove(name);
                    if tripped.remove(name).unwrap_or(false) {
                        drop(failures);
                        drop(tripped);
                        self.sink.component_recovered(name).await;
                    }
                }
            }
        }
    }
}
