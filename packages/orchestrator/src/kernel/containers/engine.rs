//! Container engine capability.
//!
//! Drives an existing local engine (Docker via bollard); never implements
//! one. Mutating operations on a given container id are serialized through a
//! per-id lock, matching the engine socket's tolerance; create/stats/logs
//! parallelize freely.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StatsOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{HostConfig, ResourcesUlimits};
use bollard::Docker;
use futures::StreamExt;
use tokio::sync::Mutex;

use crate::common::{Error, Kind, Result};
use crate::kernel::containers::stats::{cpu_percent, CpuSample, LogFrameParser, StreamKind};

pub const MANAGED_LABEL: &str = "orchestrator.managed";

/// Resource caps applied at create time.
#[derive(Debug, Clone)]
pub struct ResourceLimits {
    pub cpus: f64,
    pub memory_mb: i64,
    pub swap_mb: i64,
    pub pids: i64,
    pub fds: i64,
}

/// Hardening applied to every sandbox.
#[derive(Debug, Clone)]
pub struct SecurityContext {
    pub run_as_non_root: bool,
    pub user: String,
    pub read_only_rootfs: bool,
    pub drop_capabilities: Vec<String>,
    pub seccomp_profile: Option<String>,
    pub dns: Vec<String>,
}

impl Default for SecurityContext {
    fn default() -> Self {
        Self {
            run_as_non_root: true,
            user: "1000:1000".to_string(),
            read_only_rootfs: false,
            drop_capabilities: vec!["ALL".to_string()],
            seccomp_profile: None,
            dns: vec![],
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub labels: HashMap<String, String>,
    pub env: Vec<String>,
    /// Per-repository or per-job bridge the sandbox attaches to.
    pub network: Option<String>,
    pub limits: ResourceLimits,
    pub security: SecurityContext,
}

#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub memory_limit: u64,
    pub net_rx_bytes: u64,
    pub net_tx_bytes: u64,
    pub block_read_bytes: u64,
    pub block_write_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct EngineContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub running: bool,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub stream: StreamKind,
    pub message: String,
}

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;
    async fn start(&self, id: &str) -> Result<()>;
    async fn stop(&self, id: &str, timeout: Duration) -> Result<()>;
    async fn remove(&self, id: &str, force: bool) -> Result<()>;
    async fn exec(
        &self,
        id: &str,
        cmd: Vec<String>,
        env: Vec<String>,
        user: Option<String>,
        cwd: Option<String>,
    ) -> Result<ExecOutput>;
    async fn inspect(&self, id: &str) -> Result<EngineContainer>;
    async fn stats(&self, id: &str) -> Result<EngineStats>;
    /// Log lines, optionally bounded by `tail` and a unix-seconds `since`.
    /// Live following is served by the event hub, not this call.
    async fn logs(&self, id: &str, tail: Option<i64>, since: Option<i64>)
        -> Result<Vec<LogLine>>;
    /// Quarantine support: detach the container from its network.
    async fn disconnect_network(&self, id: &str, network: &str) -> Result<()>;
    async fn list_managed(&self) -> Result<Vec<EngineContainer>>;
    /// Liveness of the engine itself.
    async fn ping(&self) -> Result<()>;
}

// ============================================================================
// Docker (bollard) implementation
// ============================================================================

pub struct DockerEngine {
    docker: Docker,
    /// Serializes start/stop/remove per container id.
    op_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DockerEngine {
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|err| Error::new(Kind::DependencyUnavailable, err.to_string()))?;
        Ok(Self {
            docker,
            op_locks: Mutex::new(HashMap::new()),
        })
    }

    async fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.op_locks.lock().await;
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn engine_err(err: bollard::errors::Error) -> Error {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404, message,
            } => Error::new(Kind::NotFound, message),
            other => Error::new(Kind::DependencyUnavailable, other.to_string()),
        }
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let mut labels = spec.labels.clone();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());

        let mut security_opt = Vec::new();
        if let Some(profile) = &spec.security.seccomp_profile {
            security_opt.push(format!("seccomp={profile}"));
        }

        let host_config = HostConfig {
            memory: Some(spec.limits.memory_mb * 1024 * 1024),
            memory_swap: Some((spec.limits.memory_mb + spec.limits.swap_mb) * 1024 * 1024),
            nano_cpus: Some((spec.limits.cpus * 1e9) as i64),
            pids_limit: Some(spec.limits.pids),
            ulimits: Some(vec![ResourcesUlimits {
                name: Some("nofile".to_string()),
                soft: Some(spec.limits.fds),
                hard: Some(spec.limits.fds),
            }]),
            readonly_rootfs: Some(spec.security.read_only_rootfs),
            cap_drop: Some(spec.security.drop_capabilities.clone()),
            security_opt: if security_opt.is_empty() {
                None
            } else {
                Some(security_opt)
            },
            dns: if spec.security.dns.is_empty() {
                None
            } else {
                Some(spec.security.dns.clone())
            },
            network_mode: spec.network.clone(),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            labels: Some(labels),
            user: spec
                .security
                .run_as_non_root
                .then(|| spec.security.user.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(Self::engine_err)?;
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(Self::engine_err)
    }

    async fn stop(&self, id: &str, timeout: Duration) -> Result<()> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;
        self.docker
            .stop_container(
                id,
                Some(StopContainerOptions {
                    t: timeout.as_secs() as i64,
                }),
            )
            .await
            .map_err(Self::engine_err)
    }

    async fn remove(&self, id: &str, force: bool) -> Result<()> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;
        let result = self
            .docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await
            .map_err(Self::engine_err);
        self.op_locks.lock().await.remove(id);
        result
    }

    async fn exec(
        &self,
        id: &str,
        cmd: Vec<String>,
        env: Vec<String>,
        user: Option<String>,
        cwd: Option<String>,
    ) -> Result<ExecOutput> {
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(cmd),
                    env: Some(env),
                    user,
                    working_dir: cwd,
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(Self::engine_err)?;

        let mut output = ExecOutput::default();
        if let StartExecResults::Attached { output: mut stream, .. } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(Self::engine_err)?
        {
            while let Some(chunk) = stream.next().await {
                match chunk.map_err(Self::engine_err)? {
                    bollard::container::LogOutput::StdOut { message } => {
                        output.stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    bollard::container::LogOutput::StdErr { message } => {
                        output.stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    _ => {}
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(Self::engine_err)?;
        output.exit_code = inspect.exit_code.unwrap_or(-1);
        Ok(output)
    }

    async fn inspect(&self, id: &str) -> Result<EngineContainer> {
        let details = self
            .docker
            .inspect_container(id, None)
            .await
            .map_err(Self::engine_err)?;

        let state = details.state.as_ref();
        Ok(EngineContainer {
            id: details.id.clone().unwrap_or_else(|| id.to_string()),
            name: details.name.clone().unwrap_or_default(),
            image: details.image.clone().unwrap_or_default(),
            running: state.and_then(|s| s.running).unwrap_or(false),
            labels: details
                .config
                .and_then(|config| config.labels)
                .unwrap_or_default(),
        })
    }

    async fn stats(&self, id: &str) -> Result<EngineStats> {
        let mut stream = self.docker.stats(
            id,
            Some(StatsOptions {
                stream: false,
                one_shot: false,
            }),
        );
        let raw = stream
            .next()
            .await
            .ok_or_else(|| Error::new(Kind::DependencyUnavailable, "no stats sample"))?
            .map_err(Self::engine_err)?;

        let sample = CpuSample {
            container_total: raw.cpu_stats.cpu_usage.total_usage,
            container_prev: raw.precpu_stats.cpu_usage.total_usage,
            system_total: raw.cpu_stats.system_cpu_usage.unwrap_or(0),
            system_prev: raw.precpu_stats.system_cpu_usage.unwrap_or(0),
            online_cpus: raw.cpu_stats.online_cpus.unwrap_or(1),
        };

        let (net_rx, net_tx) = raw
            .networks
            .as_ref()
            .map(|networks| {
                networks.values().fold((0u64, 0u64), |(rx, tx), network| {
                    (rx + network.rx_bytes, tx + network.tx_bytes)
                })
            })
            .unwrap_or((0, 0));

        let (block_read, block_write) = raw
            .blkio_stats
            .io_service_bytes_recursive
            .as_ref()
            .map(|entries| {
                entries.iter().fold((0u64, 0u64), |(read, write), entry| {
                    match entry.op.as_str() {
                        "read" | "Read" => (read + entry.value, write),
                        "write" | "Write" => (read, write + entry.value),
                        _ => (read, write),
                    }
                })
            })
            .unwrap_or((0, 0));

        Ok(EngineStats {
            cpu_percent: cpu_percent(&sample),
            memory_bytes: raw.memory_stats.usage.unwrap_or(0),
            memory_limit: raw.memory_stats.limit.unwrap_or(0),
            net_rx_bytes: net_rx,
            net_tx_bytes: net_tx,
            block_read_bytes: block_read,
            block_write_bytes: block_write,
        })
    }

    async fn logs(
        &self,
        id: &str,
        tail: Option<i64>,
        since: Option<i64>,
    ) -> Result<Vec<LogLine>> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.map_or_else(|| "all".to_string(), |n| n.to_string()),
            since: since.unwrap_or(0),
            ..Default::default()
        };

        let mut stream = self.docker.logs(id, Some(options));
        let mut lines = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk.map_err(Self::engine_err)? {
                bollard::container::LogOutput::StdOut { message } => lines.push(LogLine {
                    stream: StreamKind::Stdout,
                    message: String::from_utf8_lossy(&message).into_owned(),
                }),
                bollard::container::LogOutput::StdErr { message } => lines.push(LogLine {
                    stream: StreamKind::Stderr,
                    message: String::from_utf8_lossy(&message).into_owned(),
                }),
                _ => {}
            }
        }
        Ok(lines)
    }

    async fn disconnect_network(&self, id: &str, network: &str) -> Result<()> {
        self.docker
            .disconnect_network(
                network,
                bollard::network::DisconnectNetworkOptions {
                    container: id.to_string(),
                    force: true,
                },
            )
            .await
            .map_err(Self::engine_err)
    }

    async fn list_managed(&self) -> Result<Vec<EngineContainer>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{MANAGED_LABEL}=true")],
        );

        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(Self::engine_err)?;

        Ok(summaries
            .into_iter()
            .map(|summary| EngineContainer {
                id: summary.id.unwrap_or_default(),
                name: summary
                    .names
                    .unwrap_or_default()
                    .into_iter()
                    .next()
                    .unwrap_or_default(),
                image: summary.image.unwrap_or_default(),
                running: summary.state.as_deref() == Some("running"),
                labels: summary.labels.unwrap_or_default(),
            })
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        self.docker.ping().await.map_err(Self::engine_err)?;
        Ok(())
    }
}

// ============================================================================
// Fake engine (tests, development without a local engine)
// ============================================================================

#[derive(Debug, Clone)]
struct FakeContainer {
    spec: ContainerSpec,
    running: bool,
    networks: Vec<String>,
    /// Raw multiplexed log bytes, exactly as an engine socket frames them.
    log_bytes: Vec<u8>,
}

#[derive(Default)]
struct FakeState {
    containers: HashMap<String, FakeContainer>,
    counter: u64,
    fail_next_create: bool,
}

/// In-memory `ContainerEngine` with engine-faithful log framing.
#[derive(Default, Clone)]
pub struct FakeEngine {
    state: Arc<Mutex<FakeState>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_next_create(&self) {
        self.state.lock().await.fail_next_create = true;
    }

    /// Seed multiplexed log bytes for a container.
    pub async fn push_log(&self, id: &str, stream: StreamKind, message: &str) {
        let mut state = self.state.lock().await;
        if let Some(container) = state.containers.get_mut(id) {
            let payload = message.as_bytes();
            let mut frame = Vec::with_capacity(8 + payload.len());
            frame.push(match stream {
                StreamKind::Stdout => 1,
                StreamKind::Stderr => 2,
            });
            frame.extend_from_slice(&[0, 0, 0]);
            frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            frame.extend_from_slice(payload);
            container.log_bytes.extend_from_slice(&frame);
        }
    }

    pub async fn running_count(&self) -> usize {
        self.state
            .lock()
            .await
            .containers
            .values()
            .filter(|container| container.running)
            .count()
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let mut state = self.state.lock().await;
        if state.fail_next_create {
            state.fail_next_create = false;
            return Err(Error::new(Kind::DependencyUnavailable, "engine refused create"));
        }
        state.counter += 1;
        let id = format!("fake-{}", state.counter);
        let networks = spec.network.clone().into_iter().collect();
        state.containers.insert(
            id.clone(),
            FakeContainer {
                spec: spec.clone(),
                running: false,
                networks,
                log_bytes: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| Error::not_found("no such container"))?;
        container.running = true;
        Ok(())
    }

    async fn stop(&self, id: &str, _timeout: Duration) -> Result<()> {
        let mut state = self.state.lock().await;
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| Error::not_found("no such container"))?;
        container.running = false;
        Ok(())
    }

    async fn remove(&self, id: &str, force: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.containers.get(id) {
            Some(container) if container.running && !force => Err(Error::conflict(
                "container is running; use force to remove",
            )),
            Some(_) => {
                state.containers.remove(id);
                Ok(())
            }
            None => Err(Error::not_found("no such container")),
        }
    }

    async fn exec(
        &self,
        id: &str,
        cmd: Vec<String>,
        _env: Vec<String>,
        _user: Option<String>,
        _cwd: Option<String>,
    ) -> Result<ExecOutput> {
        let state = self.state.lock().await;
        let container = state
            .containers
            .get(id)
            .ok_or_else(|| Error::not_found("no such container"))?;
        if !container.running {
            return Err(Error::conflict("container is not running"));
        }
        Ok(ExecOutput {
            stdout: format!("{}\n", cmd.join(" ")),
            stderr: String::new(),
            exit_code: 0,
        })
    }

    async fn inspect(&self, id: &str) -> Result<EngineContainer> {
        let state = self.state.lock().await;
        let container = state
            .containers
            .get(id)
            .ok_or_else(|| Error::not_found("no such container"))?;
        let mut labels = container.spec.labels.clone();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        Ok(EngineContainer {
            id: id.to_string(),
            name: container.spec.name.clone(),
            image: container.spec.image.clone(),
            running: container.running,
            labels,
        })
    }

    async fn stats(&self, id: &str) -> Result<EngineStats> {
        let state = self.state.lock().await;
        if !state.containers.contains_key(id) {
            return Err(Error::not_found("no such container"));
        }
        Ok(EngineStats {
            cpu_percent: 1.0,
            memory_bytes: 64 * 1024 * 1024,
            memory_limit: 2048 * 1024 * 1024,
            ..Default::default()
        })
    }

    async fn logs(
        &self,
        id: &str,
        tail: Option<i64>,
        _since: Option<i64>,
    ) -> Result<Vec<LogLine>> {
        let state = self.state.lock().await;
        let container = state
            .containers
            .get(id)
            .ok_or_else(|| Error::not_found("no such container"))?;

        let mut parser = LogFrameParser::new();
        let mut lines: Vec<LogLine> = parser
            .feed(&container.log_bytes)
            .into_iter()
            .map(|frame| LogLine {
                stream: frame.stream,
                message: String::from_utf8_lossy(&frame.payload).into_owned(),
            })
            .collect();
        if let Some(tail) = tail {
            let keep = tail.max(0) as usize;
            if lines.len() > keep {
                lines.drain(..lines.len() - keep);
            }
        }
        Ok(lines)
    }

    async fn disconnect_network(&self, id: &str, network: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| Error::not_found("no such container"))?;
        container.networks.retain(|attached| attached != network);
        Ok(())
    }

    async fn list_managed(&self) -> Result<Vec<EngineContainer>> {
        let state = self.state.lock().await;
        Ok(state
            .containers
            .iter()
            .map(|(id, container)| EngineContainer {
                id: id.clone(),
                name: container.spec.name.clone(),
                image: container.spec.image.clone(),
                running: container.running,
                labels: container.spec.labels.clone(),
            })
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            image: "runnerhub/sandbox:latest".to_string(),
            labels: HashMap::new(),
            env: vec![],
            network: Some("runnerhub-acme-widgets".to_string()),
            limits: ResourceLimits {
                cpus: 2.0,
                memory_mb: 2048,
                swap_mb: 0,
                pids: 512,
                fds: 1024,
            },
            security: SecurityContext::default(),
        }
    }

    #[tokio::test]
    async fn fake_engine_lifecycle_roundtrip() {
        let engine = FakeEngine::new();
        let id = engine.create(&spec("sandbox-1")).await.unwrap();
        engine.start(&id).await.unwrap();
        assert!(engine.inspect(&id).await.unwrap().running);

        engine.stop(&id, Duration::from_secs(10)).await.unwrap();
        engine.remove(&id, false).await.unwrap();
        assert!(engine.inspect(&id).await.is_err());
    }

    #[tokio::test]
    async fn running_container_requires_force_remove() {
        let engine = FakeEngine::new();
        let id = engine.create(&spec("sandbox-1")).await.unwrap();
        engine.start(&id).await.unwrap();
        assert!(engine.remove(&id, false).await.is_err());
        engine.remove(&id, true).await.unwrap();
    }

    #[tokio::test]
    async fn logs_decode_multiplexed_frames_not_newlines() {
        let engine = FakeEngine::new();
        let id = engine.create(&spec("sandbox-1")).await.unwrap();
        // One frame containing embedded newlines must stay one line entry.
        engine
            .push_log(&id, StreamKind::Stdout, "line one\nline two\n")
            .await;
        engine.push_log(&id, StreamKind::Stderr, "oops").await;

        let lines = engine.logs(&id, None, None).await.unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].stream, StreamKind::Stdout);
        assert_eq!(lines[0].message, "line one\nline two\n");
        assert_eq!(lines[1].stream, StreamKind::Stderr);
    }

    #[tokio::test]
    async fn disconnect_network_detaches() {
        let engine = FakeEngine::new();
        let id = engine.create(&spec("sandbox-1")).await.unwrap();
        engine
            .disconnect_network(&id, "runnerhub-acme-widgets")
            .await
            .unwrap();
        let state = engine.state.lock().await;
        assert!(state.containers[&id].networks.is_empty());
    }
}
