//! Gossip — periodic push protocol over the same TLS transport used for RPC
//! (SPEC_FULL §4.2). The tick loop follows the same shape as the teacher's
//! `start_discovery_loop` / `start_health_check_loop` background tasks in
//! `server/bootstrap.rs`: a `tokio::spawn`'d loop selecting over a
//! `tokio::time::interval` tick and a shutdown `Notify`.

mod wire;

pub use wire::{encode_frame, decode_frame, Digest, NodeInfoWire};

use crate::directory::{now_millis, NodeDirectory, NodeId};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

const SEND_DEADLINE: Duration = Duration::from_secs(5);

/// Sends a gossip frame to a peer. Implemented over `ConnectionPool` in
/// production; swappable in tests for in-process delivery.
#[async_trait]
pub trait GossipTransport: Send + Sync {
    async fn send_gossip(&self, target: &NodeId, address: &str, port: u16, frame: Vec<u8>)
        -> Result<(), crate::error::ClusterError>;
}

/// Tracks messages/sec over a trailing 60s window to drive the adaptive tick
/// interval (spec §4.2 "A load estimator tracks messages-per-second over the
/// last 60 s").
struct LoadEstimator {
    samples: Mutex<VecDeque<u64>>,
}

impl LoadEstimator {
    fn new() -> Self {
        Self {
            samples: Mutex::new(VecDeque::new()),
        }
    }

    async fn record(&self) {
        let mut s = self.samples.lock().await;
        s.push_back(now_millis());
        let cutoff = now_millis().saturating_sub(60_000);
        while matches!(s.front(), Some(&t) if t < cutoff) {
            s.pop_front();
        }
    }

    async fn rate_per_sec(&self) -> f64 {
        let s = self.samples.lock().await;
        s.len() as f64 / 60.0
    }
}

pub struct Gossip {
    directory: NodeDirectory,
    transport: Arc<dyn GossipTransport>,
    compression_threshold: usize,
    digest_cap: usize,
    max_targets: usize,
    interval_min: Duration,
    interval_max: Duration,
    load: LoadEstimator,
    current_interval_ms: AtomicU64,
    shutdown: Arc<Notify>,
    sweep_interval: Duration,
}

impl Gossip {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        directory: NodeDirectory,
        transport: Arc<dyn GossipTransport>,
        compression_threshold: usize,
        interval_min_seconds: u64,
        interval_max_seconds: u64,
        max_targets: usize,
        digest_entry_cap: usize,
    ) -> Self {
        let interval_min = Duration::from_secs(interval_min_seconds);
        let interval_max = Duration::from_secs(interval_max_seconds);
        Self {
            directory,
            transport,
            compression_threshold,
            digest_cap: digest_entry_cap,
            max_targets,
            interval_min,
            interval_max,
            load: LoadEstimator::new(),
            current_interval_ms: AtomicU64::new(interval_min.as_millis() as u64),
            shutdown: Arc::new(Notify::new()),
            sweep_interval: interval_min,
        }
    }

    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// READY → BUILD_DIGEST → PICK_TARGETS → SEND (parallel) → READY, driven
    /// by an adaptive interval tick, plus a separate sweep loop for failure
    /// detection. Runs until shutdown is notified.
    pub async fn run(self: Arc<Self>) {
        let sweep_self = self.clone();
        let sweep_shutdown = self.shutdown.clone();
        let sweep_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_self.sweep_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => sweep_self.directory.sweep(now_millis()),
                    _ = sweep_shutdown.notified() => return,
                }
            }
        });

        loop {
            let interval_ms = self.current_interval_ms.load(Ordering::Relaxed);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(interval_ms)) => {}
                _ = self.shutdown.notified() => break,
            }

            let tick_deadline = tokio::time::Instant::now() + SEND_DEADLINE;
            let _ = tokio::time::timeout_at(tick_deadline, self.tick()).await;

            self.adapt_interval().await;
        }

        let _ = sweep_task.await;
    }

    async fn tick(&self) {
        let digest = self.build_digest();
        let targets = self.pick_targets();
        let mut sends = Vec::with_capacity(targets.len());
        for target_id in targets {
            let Some(target) = self.directory.lookup(&target_id) else {
                continue;
            };
            let frame = encode_frame(
                self.directory.self_id(),
                &digest,
                self.compression_threshold,
            );
            let transport = self.transport.clone();
            let directory = self.directory.clone();
            sends.push(tokio::spawn(async move {
                match transport
                    .send_gossip(&target.node_id, &target.address, target.port, frame)
                    .await
                {
                    Ok(()) => directory.record_send_success(&target.node_id),
                    Err(e) => {
                        tracing::debug!(node_id = %target.node_id, error = %e, "gossip: send failed");
                        directory.record_send_failure(&target.node_id);
                    }
                }
            }));
        }
        for s in sends {
            let _ = s.await;
        }
        self.load.record().await;
    }

    /// Newest-versions-first, self first (authoritative), capped at
    /// `digest_cap`. Dead peers are excluded — they stay in the directory
    /// until T_evict but are not gossiped about once declared dead.
    fn build_digest(&self) -> Digest {
        let mut peers = self.directory.all_peers();
        peers.retain(|p| p.status != crate::directory::Status::Dead);
        peers.sort_by(|a, b| b.version.cmp(&a.version));
        peers.truncate(self.digest_cap.saturating_sub(1));
        let mut entries = vec![NodeInfoWire::from(&self.directory.self_info())];
        entries.extend(peers.iter().map(NodeInfoWire::from));
        Digest { entries }
    }

    /// Up to `max_targets` alive peers uniformly at random, biased to
    /// include long-silent peers and at least one coordinator when self
    /// isn't one.
    fn pick_targets(&self) -> Vec<NodeId> {
        let k = self.max_targets;
        let now = now_millis();
        let mut peers = self.directory.all_peers();
        peers.retain(|p| p.status == crate::directory::Status::Alive);

        let mut chosen: Vec<NodeId> = Vec::new();

        let stale_threshold_ms = (self.interval_min.as_millis() as u64) * 3;
        for p in &peers {
            if now.saturating_sub(p.last_seen) > stale_threshold_ms {
                chosen.push(p.node_id.clone());
            }
        }

        let self_is_coordinator =
            self.directory.self_info().role == crate::config::NodeRole::Coordinator;
        if !self_is_coordinator && !chosen.iter().any(|id| {
            peers
                .iter()
                .find(|p| &p.node_id == id)
                .map(|p| p.role == crate::config::NodeRole::Coordinator)
                .unwrap_or(false)
        }) {
            if let Some(coord) = peers
                .iter()
                .find(|p| p.role == crate::config::NodeRole::Coordinator)
            {
                chosen.push(coord.node_id.clone());
            }
        }

        let mut rng = rand::thread_rng();
        let mut remaining: Vec<NodeId> = peers
            .iter()
            .map(|p| p.node_id.clone())
            .filter(|id| !chosen.contains(id))
            .collect();
        remaining.shuffle(&mut rng);

        for id in remaining {
            if chosen.len() >= k {
                break;
            }
            chosen.push(id);
        }
        chosen.truncate(k.max(chosen.len().min(k)));
        chosen
    }

    /// Linear interpolation between interval_min (<=1 msg/s) and
    /// interval_max (>=5 msg/s), clamped to +/-20% per step to avoid
    /// oscillation.
    async fn adapt_interval(&self) {
        let rate = self.load.rate_per_sec().await;
        let clamped_rate = rate.clamp(1.0, 5.0);
        let frac = (clamped_rate - 1.0) / 4.0;
        let interval_min_ms = self.interval_min.as_millis() as f64;
        let interval_max_ms = self.interval_max.as_millis() as f64;
        let target_ms = interval_min_ms + frac * (interval_max_ms - interval_min_ms);

        let current = self.current_interval_ms.load(Ordering::Relaxed) as f64;
        let max_step = current * 0.2;
        let delta = (target_ms - current).clamp(-max_step, max_step);
        let next = (current + delta).clamp(interval_min_ms, interval_max_ms) as u64;
        self.current_interval_ms.store(next, Ordering::Relaxed);
    }

    /// Apply an inbound digest: upsert every entry, mark_seen for the sender
    /// regardless of whether any entry advanced.
    pub fn receive(&self, from: &str, digest: Digest) {
        for wire in &digest.entries {
            self.directory.upsert(wire.to_node_info());
        }
        self.directory.mark_seen(from, now_millis());
    }
}

/// `GossipTransport` over the shared `ConnectionPool`, posting to
/// `/internal/gossip` on the same mTLS listener the RpcDispatcher serves
/// `/rpc` on.
pub struct PooledGossipTransport {
    pool: Arc<crate::pool::ConnectionPool>,
    deadline: Duration,
}

impl PooledGossipTransport {
    pub fn new(pool: Arc<crate::pool::ConnectionPool>, deadline: Duration) -> Self {
        Self { pool, deadline }
    }
}

#[async_trait]
impl GossipTransport for PooledGossipTransport {
    async fn send_gossip(
        &self,
        target: &NodeId,
        address: &str,
        port: u16,
        frame: Vec<u8>,
    ) -> Result<(), crate::error::ClusterError> {
        self.pool
            .post_bytes(target, address, port, "/internal/gossip", frame, self.deadline)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeRole;
    use crate::directory::NodeInfo;

    struct NoopTransport;
    #[async_trait]
    impl GossipTransport for NoopTransport {
        async fn send_gossip(
            &self,
            _target: &NodeId,
            _address: &str,
            _port: u16,
            _frame: Vec<u8>,
        ) -> Result<(), crate::error::ClusterError> {
            Ok(())
        }
    }

    fn directory() -> NodeDirectory {
        let self_info =
            NodeInfo::new_self("c1".into(), "10.0.0.1".into(), 9443, NodeRole::Coordinator);
        NodeDirectory::new(
            self_info,
            Duration::from_secs(30),
            Duration::from_secs(90),
            Duration::from_secs(600),
        )
    }

    #[test]
    fn single_node_digest_contains_only_self() {
        let dir = directory();
        let gossip = Gossip::new(dir, Arc::new(NoopTransport), 1024, 5, 30, 5, 50);
        let digest = gossip.build_digest();
        assert_eq!(digest.entries.len(), 1);
        assert_eq!(digest.entries[0].node_id, "c1");
    }

    #[test]
    fn single_node_has_no_targets() {
        let dir = directory();
        let gossip = Gossip::new(dir, Arc::new(NoopTransport), 1024, 5, 30, 5, 50);
        assert!(gossip.pick_targets().is_empty());
    }

    #[test]
    fn receive_applies_duplicate_digest_as_noop() {
        let dir = directory();
        let gossip = Gossip::new(dir.clone(), Arc::new(NoopTransport), 1024, 5, 30, 5, 50);
        let peer = NodeInfo::new_self("w1".into(), "10.0.0.2".into(), 9443, NodeRole::Worker);
        let digest = Digest {
            entries: vec![NodeInfoWire::from(&peer)],
        };
        gossip.receive("w1", digest.clone());
        let v1 = dir.lookup("w1").unwrap().version;
        gossip.receive("w1", digest);
        let v2 = dir.lookup("w1").unwrap().version;
        assert_eq!(v1, v2);
    }
}
