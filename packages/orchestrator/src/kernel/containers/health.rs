//! Sandbox health probing.
//!
//! Four probe classes: basic liveness, network, filesystem, resources. A
//! sandbox is healthy iff every enabled probe passes within its threshold.
//! Three consecutive unhealthy rounds quarantine the sandbox.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::common::Result;
use crate::kernel::containers::engine::ContainerEngine;
use crate::kernel::containers::lifecycle::Sandbox;

pub const QUARANTINE_AFTER_FAILURES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeClass {
    Liveness,
    Network,
    Filesystem,
    Resources,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub class: ProbeClass,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub container_id: Uuid,
    pub healthy: bool,
    pub probes: Vec<ProbeResult>,
    pub checked_at: DateTime<Utc>,
}

/// Which probes run and their resource thresholds.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub liveness: bool,
    pub network: bool,
    pub filesystem: bool,
    pub resources: bool,
    pub max_cpu_percent: f64,
    pub max_memory_fraction: f64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            liveness: true,
            network: true,
            filesystem: true,
            resources: true,
            max_cpu_percent: 95.0,
            max_memory_fraction: 0.9,
        }
    }
}

pub struct HealthProber {
    engine: Arc<dyn ContainerEngine>,
    config: ProbeConfig,
    /// Consecutive unhealthy rounds per sandbox.
    strikes: HashMap<Uuid, u32>,
}

impl HealthProber {
    pub fn new(engine: Arc<dyn ContainerEngine>, config: ProbeConfig) -> Self {
        Self {
            engine,
            config,
            strikes: HashMap::new(),
        }
    }

    pub async fn probe(&self, sandbox: &Sandbox) -> Result<HealthReport> {
        let mut probes = Vec::new();

        if self.config.liveness {
            let result = match self.engine.inspect(&sandbox.engine_id).await {
                Ok(info) if info.running => ProbeResult {
                    class: ProbeClass::Liveness,
                    passed: true,
                    detail: "running".to_string(),
                },
                Ok(_) => ProbeResult {
                    class: ProbeClass::Liveness,
                    passed: false,
                    detail: "not running".to_string(),
                },
                Err(err) => ProbeResult {
                    class: ProbeClass::Liveness,
                    passed: false,
                    detail: err.to_string(),
                },
            };
            probes.push(result);
        }

        if self.config.network {
            probes.push(self.exec_probe(
                sandbox,
                ProbeClass::Network,
                vec!["getent".into(), "hosts".into(), "localhost".into()],
            )
            .await);
        }

        if self.config.filesystem {
            probes.push(self.exec_probe(
                sandbox,
                ProbeClass::Filesystem,
                vec!["touch".into(), "/tmp/.healthcheck".into()],
            )
            .await);
        }

        if self.config.resources {
            let result = match self.engine.stats(&sandbox.engine_id).await {
                Ok(stats) => {
                    let memory_fraction = if stats.memory_limit == 0 {
                        0.0
                    } else {
                        stats.memory_bytes as f64 / stats.memory_limit as f64
                    };
                    let within = stats.cpu_percent <= self.config.max_cpu_percent
                        && memory_fraction <= self.config.max_memory_fraction;
                    ProbeResult {
                        class: ProbeClass::Resources,
                        passed: within,
                        detail: format!(
                            "cpu {:.1}% mem {:.0}%",
                            stats.cpu_percent,
                            memory_fraction * 100.0
                        ),
                    }
                }
                Err(err) => ProbeResult {
                    class: ProbeClass::Resources,
                    passed: false,
                    detail: err.to_string(),
                },
            };
            probes.push(result);
        }

        Ok(HealthReport {
            container_id: sandbox.id,
            healthy: probes.iter().all(|probe| probe.passed),
            probes,
            checked_at: Utc::now(),
        })
    }

    async fn exec_probe(
        &self,
        sandbox: &Sandbox,
        class: ProbeClass,
        cmd: Vec<String>,
    ) -> ProbeResult {
        match self
            .engine
            .exec(&sandbox.engine_id, cmd, vec![], None, None)
            .await
        {
            Ok(output) if output.exit_code == 0 => ProbeResult {
                class,
                passed: true,
                detail: "ok".to_string(),
            },
            Ok(output) => ProbeResult {
                class,
                passed: false,
                detail: format!("exit {}", output.exit_code),
            },
            Err(err) => ProbeResult {
                class,
                passed: false,
                detail: err.to_string(),
            },
        }
    }

    /// Record a round's outcome. Returns true when the sandbox crossed the
    /// quarantine threshold.
    pub fn record(&mut self, report: &HealthReport) -> bool {
        if report.healthy {
            self.strikes.remove(&report.container_id);
            return false;
        }
        let strikes = self.strikes.entry(report.container_id).or_insert(0);
        *strikes += 1;
        if *strikes >= QUARANTINE_AFTER_FAILURES {
            self.strikes.remove(&report.container_id);
            true
        } else {
            false
        }
    }

    pub fn strikes(&self, container_id: Uuid) -> u32 {
        self.strikes.get(&container_id).copied().unwrap_or(0)
    }
}
