//! Coordination store: distributed TTL leases and pub/sub channels.
//!
//! Lease writes are compare-and-set only; a holder can never renew or
//! release a lease another node has taken over. Generations increase
//! monotonically across acquisitions so observers can order leadership
//! epochs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::{broadcast, Mutex};

use crate::common::{Error, Result};

/// A successfully acquired lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: String,
    pub holder: String,
    pub generation: u64,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait CoordStore: Send + Sync {
    /// SET-if-absent with TTL. Returns the new lease on success, `None` when
    /// another holder owns the key.
    async fn acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<Option<Lease>>;

    /// Extend the TTL iff `holder` still owns the key.
    async fn renew(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// Delete the key iff `holder` owns it. Publishes a release notification
    /// on the key's channel so waiting candidates race immediately.
    async fn release(&self, key: &str, holder: &str) -> Result<bool>;

    /// Current holder, if any.
    async fn holder(&self, key: &str) -> Result<Option<String>>;

    /// Fire-and-forget publish on a named channel.
    async fn publish(&self, channel: &str, message: &str) -> Result<()>;

    /// Subscribe to a named channel.
    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>>;
}

// ============================================================================
// Redis implementation
// ============================================================================

const RENEW_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
  return 0
end"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  redis.call('DEL', KEYS[1])
  redis.call('PUBLISH', KEYS[2], ARGV[1])
  return 1
else
  return 0
end"#;

pub struct RedisCoordStore {
    client: redis::Client,
    manager: redis::aio::ConnectionManager,
    key_prefix: String,
    subscriptions: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl RedisCoordStore {
    pub async fn connect(url: &str, key_prefix: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(Error::from)?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(Error::from)?;
        Ok(Self {
            client,
            manager,
            key_prefix: key_prefix.to_string(),
            subscriptions: Mutex::new(HashMap::new()),
        })
    }

    fn prefixed(&self, name: &str) -> String {
        format!("{}:{}", self.key_prefix, name)
    }

    fn release_channel(&self, key: &str) -> String {
        format!("{}:released", self.prefixed(key))
    }
}

#[async_trait]
impl CoordStore for RedisCoordStore {
    async fn acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<Option<Lease>> {
        let mut conn = self.manager.clone();
        let full_key = self.prefixed(key);
        let set: Option<String> = redis::cmd("SET")
            .arg(&full_key)
            .arg(holder)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(Error::from)?;

        if set.is_none() {
            return Ok(None);
        }

        let generation: u64 = redis::cmd("INCR")
            .arg(format!("{full_key}:generation"))
            .query_async(&mut conn)
            .await
            .map_err(Error::from)?;

        Ok(Some(Lease {
            key: key.to_string(),
            holder: holder.to_string(),
            generation,
            expires_at: Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default(),
        }))
    }

    async fn renew(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.manager.clone();
        let renewed: i64 = redis::Script::new(RENEW_SCRIPT)
            .key(self.prefixed(key))
            .arg(holder)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(Error::from)?;
        Ok(renewed == 1)
    }

    async fn release(&self, key: &str, holder: &str) -> Result<bool> {
        let mut conn = self.manager.clone();
        let released: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(self.prefixed(key))
            .key(self.release_channel(key))
            .arg(holder)
            .invoke_async(&mut conn)
            .await
            .map_err(Error::from)?;
        Ok(released == 1)
    }

    async fn holder(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        let holder: Option<String> = redis::cmd("GET")
            .arg(self.prefixed(key))
            .query_async(&mut conn)
            .await
            .map_err(Error::from)?;
        Ok(holder)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: i64 = redis::cmd("PUBLISH")
            .arg(self.prefixed(channel))
            .arg(message)
            .query_async(&mut conn)
            .await
            .map_err(Error::from)?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>> {
        let full_channel = self.prefixed(channel);
        let mut subscriptions = self.subscriptions.lock().await;
        if let Some(tx) = subscriptions.get(&full_channel) {
            return Ok(tx.subscribe());
        }

        let (tx, rx) = broadcast::channel(64);
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(Error::from)?;
        pubsub
            .subscribe(&full_channel)
            .await
            .map_err(Error::from)?;

        let forward_tx = tx.clone();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = msg.get_payload().unwrap_or_default();
                if forward_tx.send(payload).is_err() {
                    break;
                }
            }
        });

        subscriptions.insert(full_channel, tx);
        Ok(rx)
    }
}

// ============================================================================
// In-memory implementation (tests, single-node development)
// ============================================================================

#[derive(Default)]
struct MemoryLease {
    holder: String,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct MemoryInner {
    leases: HashMap<String, MemoryLease>,
    generations: HashMap<String, u64>,
    channels: HashMap<String, broadcast::Sender<String>>,
}

/// Single-process `CoordStore`. Semantics match the Redis implementation,
/// including expiry-on-read so a lapsed lease is acquirable immediately.
#[derive(Default)]
pub struct MemoryCoordStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryCoordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn expire_if_lapsed(inner: &mut MemoryInner, key: &str) {
        if let Some(lease) = inner.leases.get(key) {
            if lease.expires_at <= Utc::now() {
                inner.leases.remove(key);
            }
        }
    }

    fn sender<'a>(
        inner: &'a mut MemoryInner,
        channel: &str,
    ) -> &'a broadcast::Sender<String> {
        inner
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(64).0)
    }
}

#[async_trait]
impl CoordStore for MemoryCoordStore {
    async fn acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<Option<Lease>> {
        let mut inner = self.inner.lock().await;
        Self::expire_if_lapsed(&mut inner, key);
        if inner.leases.contains_key(key) {
            return Ok(None);
        }

        let expires_at = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();
        inner.leases.insert(
            key.to_string(),
            MemoryLease {
                holder: holder.to_string(),
                expires_at,
            },
        );
        let generation = inner
            .generations
            .entry(key.to_string())
            .and_modify(|g| *g += 1)
            .or_insert(1);

        Ok(Some(Lease {
            key: key.to_string(),
            holder: holder.to_string(),
            generation: *generation,
            expires_at,
        }))
    }

    async fn renew(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        Self::expire_if_lapsed(&mut inner, key);
        match inner.leases.get_mut(key) {
            Some(lease) if lease.holder == holder => {
                lease.expires_at =
                    Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str, holder: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let owned = matches!(inner.leases.get(key), Some(lease) if lease.holder == holder);
        if !owned {
            return Ok(false);
        }
        inner.leases.remove(key);
        let channel = format!("{key}:released");
        let _ = Self::sender(&mut inner, &channel).send(holder.to_string());
        Ok(true)
    }

    async fn holder(&self, key: &str) -> Result<Option<String>> {
        let mut inner = self.inner.lock().await;
        Self::expire_if_lapsed(&mut inner, key);
        Ok(inner.leases.get(key).map(|lease| lease.holder.clone()))
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let _ = Self::sender(&mut inner, channel).send(message.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>> {
        let mut inner = self.inner.lock().await;
        Ok(Self::sender(&mut inner, channel).subscribe())
    }
}
