//! Minute-tick scheduler for cron and repeating job classes.
//!
//! Every minute the leader evaluates each schedule against the current slot
//! and enqueues due classes with idempotency key `(class, slot_start)`.
//! Replicas that tick the same minute concurrently dedup in the store, so a
//! covered minute never executes twice even across a failover.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, DurationRound, Utc};
use cron::Schedule;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::kernel::jobs::engine::{EnqueueOptions, QueueEngine};
use crate::kernel::jobs::payload::JobPayload;
use crate::kernel::jobs::router;

/// One schedulable class.
struct Entry {
    payload: JobPayload,
    cadence: Cadence,
}

enum Cadence {
    Cron(Schedule),
    Every(Duration),
}

pub struct Scheduler {
    engine: Arc<QueueEngine>,
    is_leader: Arc<AtomicBool>,
    entries: Vec<Entry>,
}

impl Scheduler {
    pub fn new(engine: Arc<QueueEngine>, is_leader: Arc<AtomicBool>) -> Self {
        let mut entries = Vec::new();
        for payload in [
            JobPayload::CleanupOldJobs {},
            JobPayload::CleanupContainers {},
            JobPayload::CleanupLogs {},
            JobPayload::CollectMetrics {},
        ] {
            let route = router::route(&payload);
            let cadence = if let Some(expr) = route.schedule {
                match Schedule::from_str(expr) {
                    Ok(schedule) => Cadence::Cron(schedule),
                    Err(err) => {
                        error!(class = payload.class().as_str(), error = %err, "invalid cron expression");
                        continue;
                    }
                }
            } else if let Some(interval) = route.repeat_interval {
                Cadence::Every(interval)
            } else {
                continue;
            };
            entries.push(Entry { payload, cadence });
        }
        Self {
            engine,
            is_leader,
            entries,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        info!(entries = self.entries.len(), "scheduler starting");
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            // Singleton duty: only the leader enqueues scheduled work.
            if !self.is_leader.load(Ordering::SeqCst) {
                continue;
            }

            let slot = match Utc::now().duration_trunc(chrono::Duration::minutes(1)) {
                Ok(slot) => slot,
                Err(_) => continue,
            };
            self.tick(slot).await;
        }
        info!("scheduler stopped");
    }

    /// Evaluate every entry against one minute slot.
    pub async fn tick(&self, slot: DateTime<Utc>) {
        for entry in &self.entries {
            let due = match &entry.cadence {
                Cadence::Cron(schedule) => due_in_slot(schedule, slot),
                Cadence::Every(interval) => {
                    // Minute slots: an interval of N seconds fires on slots
                    // that are multiples of N (60 s granularity).
                    let secs = interval.as_secs().max(60);
                    (slot.timestamp() as u64) % secs < 60
                }
            };
            if !due {
                continue;
            }

            let class = entry.payload.class();
            let key = format!("{}:{}", class.as_str(), slot.format("%Y-%m-%dT%H:%M"));
            match self
                .engine
                .enqueue_with(
                    entry.payload.clone(),
                    EnqueueOptions {
                        idempotency_key: Some(key),
                        source_event_id: None,
                    },
                )
                .await
            {
                Ok(result) if result.is_created() => {
                    debug!(class = class.as_str(), slot = %slot, "scheduled job enqueued");
                }
                Ok(_) => {
                    debug!(class = class.as_str(), slot = %slot, "slot already enqueued elsewhere");
                }
                Err(err) => {
                    error!(class = class.as_str(), error = %err, "scheduled enqueue failed");
                }
            }
        }
    }
}

/// True when `schedule` has an occurrence inside `[slot, slot + 60 s)`.
fn due_in_slot(schedule: &Schedule, slot: DateTime<Utc>) -> bool {
    schedule
        .after(&(slot - chrono::Duration::seconds(1)))
        .next()
        .map_or(false, |next| next < slot + chrono::Duration::seconds(60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::kernel::jobs::job::JobClass;
    use crate::kernel::jobs::store::{JobStore, MemoryJobStore};
    use crate::kernel::metrics::MemoryMetricsSink;
    use crate::kernel::stream_hub::StreamHub;
    use chrono::TimeZone;

    fn engine() -> Arc<QueueEngine> {
        Arc::new(QueueEngine::new(
            Arc::new(MemoryJobStore::new()),
            StreamHub::new(),
            Arc::new(MemoryMetricsSink::new()),
            QueueConfig {
                job_execution_concurrency: 1,
                container_management_concurrency: 1,
                monitoring_concurrency: 1,
                webhook_processing_concurrency: 1,
                cleanup_concurrency: 1,
                metrics_collection_concurrency: 1,
                visibility_timeout: Duration::from_secs(60),
                admission_capacity: 1000,
                completed_retention: Duration::from_secs(3600),
                failed_retention: Duration::from_secs(3600),
            },
        ))
    }

    #[test]
    fn hourly_cron_fires_on_the_hour_slot() {
        let schedule = Schedule::from_str("0 0 * * * *").unwrap();
        let on_hour = Utc.with_ymd_and_hms(2026, 8, 1, 10, 0, 0).unwrap();
        let off_hour = Utc.with_ymd_and_hms(2026, 8, 1, 10, 30, 0).unwrap();
        assert!(due_in_slot(&schedule, on_hour));
        assert!(!due_in_slot(&schedule, off_hour));
    }

    #[tokio::test]
    async fn same_slot_enqueues_exactly_once_across_replicas() {
        let engine = engine();
        let leader = Arc::new(AtomicBool::new(true));
        let replica_a = Scheduler::new(engine.clone(), leader.clone());
        let replica_b = Scheduler::new(engine.clone(), leader);

        let slot = Utc.with_ymd_and_hms(2026, 8, 1, 10, 0, 0).unwrap();
        replica_a.tick(slot).await;
        replica_b.tick(slot).await;

        let cleanup = engine
            .store()
            .list(None, None, 100)
            .await
            .unwrap()
            .into_iter()
            .filter(|job| job.class == JobClass::CleanupOldJobs)
            .count();
        assert_eq!(cleanup, 1);
    }

    #[tokio::test]
    async fn collect_metrics_fires_every_minute_slot() {
        let engine = engine();
        let scheduler = Scheduler::new(engine.clone(), Arc::new(AtomicBool::new(true)));

        let first = Utc.with_ymd_and_hms(2026, 8, 1, 10, 1, 0).unwrap();
        let second = Utc.with_ymd_and_hms(2026, 8, 1, 10, 2, 0).unwrap();
        scheduler.tick(first).await;
        scheduler.tick(second).await;

        let metrics = engine
            .store()
            .list(None, None, 100)
            .await
            .unwrap()
            .into_iter()
            .filter(|job| job.class == JobClass::CollectMetrics)
            .count();
        assert_eq!(metrics, 2);
    }
}
