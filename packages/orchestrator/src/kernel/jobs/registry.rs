//! Processor registry: job class → processor.
//!
//! Processors receive the deserialized payload and a context carrying the
//! cancellation signal and a throttled progress sink. They report failure by
//! returning an error whose code the retry policy understands.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::common::Result;
use crate::kernel::jobs::job::JobClass;
use crate::kernel::jobs::payload::JobPayload;
use crate::kernel::jobs::store::JobStore;

/// Persists processor progress, at most once per 500 ms.
#[derive(Clone)]
pub struct ProgressSink {
    store: Arc<dyn JobStore>,
    job_id: Uuid,
    last_persist: Arc<Mutex<Option<tokio::time::Instant>>>,
    min_interval: Duration,
}

impl ProgressSink {
    pub fn new(store: Arc<dyn JobStore>, job_id: Uuid) -> Self {
        Self {
            store,
            job_id,
            last_persist: Arc::new(Mutex::new(None)),
            min_interval: Duration::from_millis(500),
        }
    }

    /// Report progress in `[0.0, 1.0]`. Calls inside the throttle window are
    /// dropped; the terminal transition records 1.0 regardless.
    pub async fn report(&self, progress: f32, step: Option<&str>) {
        let mut last = self.last_persist.lock().await;
        let now = tokio::time::Instant::now();
        if let Some(at) = *last {
            if now.duration_since(at) < self.min_interval {
                return;
            }
        }
        *last = Some(now);
        drop(last);

        if let Some(step) = step {
            tracing::debug!(job_id = %self.job_id, progress, step, "job progress");
        }
        if let Err(err) = self.store.update_progress(self.job_id, progress).await {
            tracing::warn!(job_id = %self.job_id, error = %err, "failed to persist progress");
        }
    }
}

/// Per-invocation context handed to processors.
pub struct ProcessContext {
    pub job_id: Uuid,
    /// 1-based attempt about to run.
    pub attempt: i32,
    pub cancel: CancellationToken,
    pub progress: ProgressSink,
}

#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, ctx: &ProcessContext, payload: JobPayload) -> Result<()>;

    /// Delay for the `custom` retry strategy. Classes using a named
    /// strategy ignore this.
    fn custom_backoff(&self, _attempt: u32) -> Option<Duration> {
        None
    }
}

/// Maps job classes to their processors.
#[derive(Default)]
pub struct JobRegistry {
    processors: HashMap<JobClass, Arc<dyn JobProcessor>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, class: JobClass, processor: Arc<dyn JobProcessor>) {
        self.processors.insert(class, processor);
    }

    pub fn get(&self, class: JobClass) -> Option<Arc<dyn JobProcessor>> {
        self.processors.get(&class).cloned()
    }

    pub fn registered_classes(&self) -> Vec<JobClass> {
        self.processors.keys().copied().collect()
    }
}
