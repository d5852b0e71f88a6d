//! Environment-driven configuration.
//!
//! Every tunable the orchestrator recognizes is read once at startup into a
//! typed `Config`. Missing required variables fail fast with exit code 64
//! (see `server/main.rs`); optional variables fall back to the defaults
//! documented here.

use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

/// Node identity and process-level settings.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Unique per replica. Defaults to `hostname-pid`.
    pub node_id: String,
    pub node_role: String,
    pub listen_port: u16,
    pub shutdown_timeout: Duration,
}

/// Durable store (Postgres) settings.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub url: String,
    pub replica_url: Option<String>,
    pub pool_min: u32,
    pub pool_max: u32,
}

/// Coordination store (Redis) settings.
#[derive(Debug, Clone)]
pub struct CoordConfig {
    pub url: String,
    pub sentinel_addrs: Vec<String>,
    pub sentinel_master: Option<String>,
    pub key_prefix: String,
    pub connect_timeout: Duration,
}

/// Per-queue worker concurrency and retention.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub job_execution_concurrency: usize,
    pub container_management_concurrency: usize,
    pub monitoring_concurrency: usize,
    pub webhook_processing_concurrency: usize,
    pub cleanup_concurrency: usize,
    pub metrics_collection_concurrency: usize,
    /// Exclusive reservation TTL while a worker holds a job.
    pub visibility_timeout: Duration,
    /// Bounded admission per queue; overflow is a retryable rejection.
    pub admission_capacity: i64,
    pub completed_retention: Duration,
    pub failed_retention: Duration,
}

/// Sandbox container pool settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_size: usize,
    pub max_size: usize,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub idle_timeout: Duration,
    pub startup_timeout: Duration,
}

/// Security evaluator settings.
#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub level: String,
    pub scan_enabled: bool,
    pub block_on_critical: u32,
    pub block_on_high: u32,
    /// Mount every sandbox with a read-only root filesystem.
    pub read_only_rootfs: bool,
    pub policy_ids: Vec<String>,
}

/// High-availability controller settings.
#[derive(Debug, Clone)]
pub struct HaConfig {
    pub enabled: bool,
    pub lease_ttl: Duration,
    pub renew_interval: Duration,
    pub health_check_interval: Duration,
    pub store_failover_enabled: bool,
    pub coord_failover_enabled: bool,
}

/// Fixed-window rate limiting.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub window: Duration,
    /// Requests per window per bearer token on data endpoints.
    pub limit: u32,
    /// Stricter per-IP limit on authentication routes.
    pub auth_limit: u32,
}

/// Per-container resource caps applied at create time.
#[derive(Debug, Clone)]
pub struct LimitsConfig {
    pub runner_cpus: f64,
    pub runner_memory_mb: i64,
    pub runner_swap_mb: i64,
    pub runner_pids: i64,
    pub runner_fds: i64,
    pub runner_disk_gb: i64,
}

/// Webhook ingress settings.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// HMAC-SHA256 secret. When unset, signature verification is skipped.
    pub secret: Option<String>,
    pub max_body_bytes: usize,
}

/// Forge (code-hosting service) API settings.
#[derive(Debug, Clone)]
pub struct ForgeConfig {
    pub base_url: String,
    pub token: String,
    pub repository: String,
}

/// Bearer-token auth settings.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub admin_user: String,
    pub admin_password: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub core: CoreConfig,
    pub store: StoreConfig,
    pub coord: CoordConfig,
    pub queues: QueueConfig,
    pub pool: PoolConfig,
    pub security: SecurityConfig,
    pub ha: HaConfig,
    pub rate_limit: RateLimitConfig,
    pub limits: LimitsConfig,
    pub webhook: WebhookConfig,
    pub forge: ForgeConfig,
    pub auth: AuthConfig,
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("{name} must be a valid {}", std::any::type_name::<T>())),
        Err(_) => Ok(default),
    }
}

fn secs_or(name: &str, default_secs: u64) -> Result<Duration> {
    Ok(Duration::from_secs(parse_or(name, default_secs)?))
}

fn default_node_id() -> String {
    let host = env::var("HOSTNAME").unwrap_or_else(|_| "orchestrator".to_string());
    format!("{host}-{}", std::process::id())
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let lease_ttl = secs_or("HA_LEASE_TTL_SECS", 30)?;
        let renew_default = (lease_ttl / 3).max(Duration::from_secs(1));
        let renew_interval = match env::var("HA_RENEW_INTERVAL_SECS") {
            Ok(raw) => Duration::from_secs(
                raw.parse()
                    .context("HA_RENEW_INTERVAL_SECS must be a valid number")?,
            ),
            Err(_) => renew_default,
        };

        let config = Self {
            core: CoreConfig {
                node_id: var_or("NODE_ID", &default_node_id()),
                node_role: var_or("NODE_ROLE", "worker"),
                listen_port: parse_or("PORT", 8300u16)?,
                shutdown_timeout: secs_or("SHUTDOWN_TIMEOUT_SECS", 30)?,
            },
            store: StoreConfig {
                url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
                replica_url: env::var("DATABASE_REPLICA_URL").ok(),
                pool_min: parse_or("DATABASE_POOL_MIN", 2u32)?,
                pool_max: parse_or("DATABASE_POOL_MAX", 10u32)?,
            },
            coord: CoordConfig {
                url: var_or("REDIS_URL", "redis://localhost:6379"),
                sentinel_addrs: env::var("REDIS_SENTINEL_ADDRS")
                    .map(|raw| {
                        raw.split(',')
                            .filter(|part| !part.is_empty())
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
                sentinel_master: env::var("REDIS_SENTINEL_MASTER").ok(),
                key_prefix: var_or("REDIS_KEY_PREFIX", "orchestrator"),
                connect_timeout: secs_or("REDIS_CONNECT_TIMEOUT_SECS", 5)?,
            },
            queues: QueueConfig {
                job_execution_concurrency: parse_or("QUEUE_JOB_EXECUTION_CONCURRENCY", 5usize)?,
                container_management_concurrency: parse_or(
                    "QUEUE_CONTAINER_MANAGEMENT_CONCURRENCY",
                    10usize,
                )?,
                monitoring_concurrency: parse_or("QUEUE_MONITORING_CONCURRENCY", 3usize)?,
                webhook_processing_concurrency: parse_or(
                    "QUEUE_WEBHOOK_PROCESSING_CONCURRENCY",
                    20usize,
                )?,
                cleanup_concurrency: parse_or("QUEUE_CLEANUP_CONCURRENCY", 1usize)?,
                metrics_collection_concurrency: parse_or(
                    "QUEUE_METRICS_COLLECTION_CONCURRENCY",
                    2usize,
                )?,
                visibility_timeout: secs_or("QUEUE_VISIBILITY_TIMEOUT_SECS", 60)?,
                admission_capacity: parse_or("QUEUE_ADMISSION_CAPACITY", 10_000i64)?,
                completed_retention: secs_or("QUEUE_COMPLETED_RETENTION_SECS", 24 * 3600)?,
                failed_retention: secs_or("QUEUE_FAILED_RETENTION_SECS", 7 * 24 * 3600)?,
            },
            pool: PoolConfig {
                min_size: parse_or("POOL_MIN", 2usize)?,
                max_size: parse_or("POOL_MAX", 20usize)?,
                scale_up_threshold: parse_or("POOL_SCALE_UP_THRESHOLD", 0.8f64)?,
                scale_down_threshold: parse_or("POOL_SCALE_DOWN_THRESHOLD", 0.2f64)?,
                idle_timeout: secs_or("POOL_IDLE_TIMEOUT_SECS", 300)?,
                startup_timeout: secs_or("POOL_STARTUP_TIMEOUT_SECS", 120)?,
            },
            security: SecurityConfig {
                level: var_or("SECURITY_LEVEL", "enforcement"),
                scan_enabled: parse_or("SECURITY_SCAN_ENABLED", true)?,
                block_on_critical: parse_or("SECURITY_BLOCK_ON_CRITICAL", 1u32)?,
                block_on_high: parse_or("SECURITY_BLOCK_ON_HIGH", 3u32)?,
                read_only_rootfs: parse_or("SECURITY_READ_ONLY_ROOTFS", false)?,
                policy_ids: env::var("SECURITY_POLICY_IDS")
                    .map(|raw| {
                        raw.split(',')
                            .filter(|part| !part.is_empty())
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
            },
            ha: HaConfig {
                enabled: parse_or("HA_ENABLED", true)?,
                lease_ttl,
                renew_interval,
                health_check_interval: secs_or("HA_HEALTH_CHECK_INTERVAL_SECS", 10)?,
                store_failover_enabled: parse_or("HA_STORE_FAILOVER_ENABLED", true)?,
                coord_failover_enabled: parse_or("HA_COORD_FAILOVER_ENABLED", true)?,
            },
            rate_limit: RateLimitConfig {
                window: secs_or("RATE_LIMIT_WINDOW_SECS", 3600)?,
                limit: parse_or("RATE_LIMIT_MAX", 1000u32)?,
                auth_limit: parse_or("RATE_LIMIT_AUTH_MAX", 100u32)?,
            },
            limits: LimitsConfig {
                runner_cpus: parse_or("LIMIT_RUNNER_CPUS", 2.0f64)?,
                runner_memory_mb: parse_or("LIMIT_RUNNER_MEMORY_MB", 2048i64)?,
                runner_swap_mb: parse_or("LIMIT_RUNNER_SWAP_MB", 0i64)?,
                runner_pids: parse_or("LIMIT_RUNNER_PIDS", 512i64)?,
                runner_fds: parse_or("LIMIT_RUNNER_FDS", 1024i64)?,
                runner_disk_gb: parse_or("LIMIT_RUNNER_DISK_GB", 10i64)?,
            },
            webhook: WebhookConfig {
                secret: env::var("WEBHOOK_SECRET").ok(),
                max_body_bytes: parse_or("WEBHOOK_MAX_BODY_BYTES", 25 * 1024 * 1024usize)?,
            },
            forge: ForgeConfig {
                base_url: var_or("FORGE_API_URL", "https://api.github.com"),
                token: var_or("FORGE_TOKEN", ""),
                repository: var_or("FORGE_REPOSITORY", ""),
            },
            auth: AuthConfig {
                jwt_secret: env::var("JWT_SECRET").context("JWT_SECRET must be set")?,
                jwt_issuer: var_or("JWT_ISSUER", "runnerhub"),
                admin_user: var_or("ADMIN_USER", "admin"),
                admin_password: env::var("ADMIN_PASSWORD").context("ADMIN_PASSWORD must be set")?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.pool.min_size > self.pool.max_size {
            anyhow::bail!("POOL_MIN must not exceed POOL_MAX");
        }
        if self.queues.visibility_timeout < Duration::from_secs(60) {
            anyhow::bail!("QUEUE_VISIBILITY_TIMEOUT_SECS must be at least 60");
        }
        if self.ha.renew_interval >= self.ha.lease_ttl {
            anyhow::bail!("HA_RENEW_INTERVAL_SECS must be shorter than HA_LEASE_TTL_SECS");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_node_id_includes_pid() {
        let id = default_node_id();
        assert!(id.ends_with(&std::process::id().to_string()));
    }

    #[test]
    fn renew_interval_must_stay_under_lease_ttl() {
        let mut config = test_config();
        config.ha.renew_interval = Duration::from_secs(40);
        assert!(config.validate().is_err());
    }

    #[test]
    fn pool_bounds_are_checked() {
        let mut config = test_config();
        config.pool.min_size = 30;
        assert!(config.validate().is_err());
    }

    fn test_config() -> Config {
        Config {
            core: CoreConfig {
                node_id: "test-1".into(),
                node_role: "worker".into(),
                listen_port: 0,
                shutdown_timeout: Duration::from_secs(30),
            },
            store: StoreConfig {
                url: "postgres://localhost/test".into(),
                replica_url: None,
                pool_min: 1,
                pool_max: 2,
            },
            coord: CoordConfig {
                url: "redis://localhost".into(),
                sentinel_addrs: vec![],
                sentinel_master: None,
                key_prefix: "test".into(),
                connect_timeout: Duration::from_secs(1),
            },
            queues: QueueConfig {
                job_execution_concurrency: 5,
                container_management_concurrency: 10,
                monitoring_concurrency: 3,
                webhook_processing_concurrency: 20,
                cleanup_concurrency: 1,
                metrics_collection_concurrency: 2,
                visibility_timeout: Duration::from_secs(60),
                admission_capacity: 100,
                completed_retention: Duration::from_secs(3600),
                failed_retention: Duration::from_secs(3600),
            },
            pool: PoolConfig {
                min_size: 2,
                max_size: 20,
                scale_up_threshold: 0.8,
                scale_down_threshold: 0.2,
                idle_timeout: Duration::from_secs(300),
                startup_timeout: Duration::from_secs(120),
            },
            security: SecurityConfig {
                level: "enforcement".into(),
                scan_enabled: true,
                block_on_critical: 1,
                block_on_high: 3,
                read_only_rootfs: false,
                policy_ids: vec![],
            },
            ha: HaConfig {
                enabled: true,
                lease_ttl: Duration::from_secs(30),
                renew_interval: Duration::from_secs(10),
                health_check_interval: Duration::from_secs(10),
                store_failover_enabled: true,
                coord_failover_enabled: true,
            },
            rate_limit: RateLimitConfig {
                window: Duration::from_secs(3600),
                limit: 1000,
                auth_limit: 100,
            },
            limits: LimitsConfig {
                runner_cpus: 2.0,
                runner_memory_mb: 2048,
                runner_swap_mb: 0,
                runner_pids: 512,
                runner_fds: 1024,
                runner_disk_gb: 10,
            },
            webhook: WebhookConfig {
                secret: Some("shhh".into()),
                max_body_bytes: 25 * 1024 * 1024,
            },
            forge: ForgeConfig {
                base_url: "https://api.github.com".into(),
                token: String::new(),
                repository: "acme/widgets".into(),
            },
            auth: AuthConfig {
                jwt_secret: "secret".into(),
                jwt_issuer: "runnerhub".into(),
                admin_user: "admin".into(),
                admin_password: "password".into(),
            },
        }
    }
}
