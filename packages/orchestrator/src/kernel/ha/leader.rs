//! Leader election over the coordination store.
//!
//! One lease key, TTL L, renewed at L/3 by the holder. Candidates race
//! SET-if-absent; losers watch the release channel and re-race on deletion
//! or after half a TTL, whichever comes first. The lease TTL alone bounds
//! how long a partitioned ex-leader can keep acting: renewals fail once the
//! key expires, and the flag drops immediately.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::kernel::coord::CoordStore;
use crate::kernel::stream_hub::StreamHub;

pub const LEADER_KEY: &str = "leader";

pub struct LeaderElector {
    coord: Arc<dyn CoordStore>,
    hub: StreamHub,
    node_id: String,
    ttl: Duration,
    renew_interval: Duration,
    is_leader: Arc<AtomicBool>,
    generation: Arc<AtomicU64>,
}

impl LeaderElector {
    pub fn new(
        coord: Arc<dyn CoordStore>,
        hub: StreamHub,
        node_id: String,
        ttl: Duration,
        renew_interval: Duration,
    ) -> Self {
        Self {
            coord,
            hub,
            node_id,
            ttl,
            renew_interval,
            is_leader: Arc::new(AtomicBool::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Shared flag for leader-gated duties (scheduler, pool scaling,
    /// cleanup sweeps, failover orchestration).
    pub fn leader_flag(&self) -> Arc<AtomicBool> {
        self.is_leader.clone()
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Drop leadership locally without waiting for the lease to lapse.
    /// Used by failover when the coordination store itself churns.
    pub async fn step_down(&self) {
        if self.is_leader.swap(false, Ordering::SeqCst) {
            let _ = self.coord.release(LEADER_KEY, &self.node_id).await;
            info!(node_id = %self.node_id, "stepped down from leadership");
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        info!(node_id = %self.node_id, "leader elector starting");
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self
                .coord
                .acquire(LEADER_KEY, &self.node_id, self.ttl)
                .await
            {
                Ok(Some(lease)) => {
                    self.generation.store(lease.generation, Ordering::SeqCst);
                    self.is_leader.store(true, Ordering::SeqCst);
                    info!(
                        node_id = %self.node_id,
                        generation = lease.generation,
                        "acquired leadership"
                    );
                    self.hub
                        .publish(
                            "ha",
                            serde_json::json!({
                                "event": "leader_elected",
                                "node_id": self.node_id,
                                "generation": lease.generation,
                            }),
                        )
                        .await;

                    self.hold(&shutdown).await;

                    self.is_leader.store(false, Ordering::SeqCst);
                    if shutdown.is_cancelled() {
                        let _ = self.coord.release(LEADER_KEY, &self.node_id).await;
                        break;
                    }
                }
                Ok(None) => {
                    self.wait_for_opening(&shutdown).await;
                }
                Err(err) => {
                    warn!(error = %err, "leader acquire failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.renew_interval) => {}
                    }
                }
            }
        }
        info!(node_id = %self.node_id, "leader elector stopped");
    }

    /// Renew until renewal fails or shutdown.
    async fn hold(&self, shutdown: &CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.renew_interval) => {}
            }

            match self
                .coord
                .renew(LEADER_KEY, &self.node_id, self.ttl)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    warn!(node_id = %self.node_id, "lost leadership lease");
                    self.hub
                        .publish(
                            "ha",
                            serde_json::json!({
                                "event": "leader_lost",
                                "node_id": self.node_id,
                            }),
                        )
                        .await;
                    return;
                }
                Err(err) => {
                    // A single failed renewal is survivable inside the TTL;
                    // a second consecutive failure ends the term.
                    warn!(error = %err, "lease renewal errored, retrying once");
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(self.renew_interval / 2) => {}
                    }
                    match self
                        .coord
                        .renew(LEADER_KEY, &self.node_id, self.ttl)
                        .await
                    {
                        Ok(true) => {}
                        _ => return,
                    }
                }
            }
        }
    }

    /// Block until the key is released or half a TTL elapses.
    async fn wait_for_opening(&self, shutdown: &CancellationToken) {
        let channel = format!("{LEADER_KEY}:released");
        let mut release_rx = match self.coord.subscribe(&channel).await {
            Ok(rx) => rx,
            Err(err) => {
                warn!(error = %err, "release watch unavailable, polling");
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(self.ttl / 2) => {}
                }
                return;
            }
        };

        // Jitter keeps a fleet of candidates from racing in lockstep.
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = release_rx.recv() => {
                tokio::time::sleep(jitter).await;
            }
            _ = tokio::time::sleep(self.ttl / 2 + jitter) => {}
        }
    }
}
