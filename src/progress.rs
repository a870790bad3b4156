//! # Progress Tracker
//!
//! Polls the Peer Manager at a fixed cadence and publishes immutable,
//! aggregated snapshots of every in-flight transfer. Polling rather than
//! pushing is deliberate: it bounds notification volume no matter how
//! many tasks exist or how fast they move, decoupling transfer
//! throughput from the consumer's update rate.

use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use uuid::Uuid;

use crate::peer::PeerManager;
use crate::transfer::Direction;

pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Progress of one transfer task, as sampled from a session.
#[derive(Debug, Clone)]
pub struct TaskProgress {
    pub task_id: Uuid,
    pub profile_id: Uuid,
    pub device_id: String,
    pub path: String,
    pub direction: Direction,
    pub total_bytes: u64,
    pub completed_bytes: u64,
}

/// Aggregate for one profile-share (one profile with one device).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShareProgress {
    pub profile_id: Uuid,
    pub device_id: String,
    pub task_count: usize,
    pub total_bytes: u64,
    pub completed_bytes: u64,
}

/// Point-in-time aggregate across every session.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProgressSnapshot {
    pub taken_at: Option<chrono::DateTime<chrono::Utc>>,
    pub shares: Vec<ShareProgress>,
    pub total_bytes: u64,
    pub completed_bytes: u64,
}

impl ProgressSnapshot {
    pub fn is_idle(&self) -> bool {
        self.shares.is_empty()
    }

    pub fn percent_complete(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        (self.completed_bytes as f64 / self.total_bytes as f64) * 100.0
    }
}

/// Fold the raw task list into per-share and overall aggregates.
pub fn aggregate(tasks: &[TaskProgress]) -> ProgressSnapshot {
    let mut shares: BTreeMap<(Uuid, String), ShareProgress> = BTreeMap::new();
    for task in tasks {
        let entry = shares
            .entry((task.profile_id, task.device_id.clone()))
            .or_insert_with(|| ShareProgress {
                profile_id: task.profile_id,
                device_id: task.device_id.clone(),
                task_count: 0,
                total_bytes: 0,
                completed_bytes: 0,
            });
        entry.task_count += 1;
        entry.total_bytes += task.total_bytes;
        entry.completed_bytes += task.completed_bytes.min(task.total_bytes);
    }

    let shares: Vec<ShareProgress> = shares.into_values().collect();
    let total_bytes = shares.iter().map(|s| s.total_bytes).sum();
    let completed_bytes = shares.iter().map(|s| s.completed_bytes).sum();
    ProgressSnapshot {
        taken_at: Some(chrono::Utc::now()),
        shares,
        total_bytes,
        completed_bytes,
    }
}

pub struct ProgressTracker {
    task: JoinHandle<()>,
}

impl ProgressTracker {
    /// Start polling; snapshots arrive on the returned watch channel.
    pub fn start(peer: PeerManager) -> (Self, watch::Receiver<ProgressSnapshot>) {
        let (tx, rx) = watch::channel(ProgressSnapshot::default());
        let task = tokio::spawn(async move {
            let mut ticker = interval(POLL_INTERVAL);
            loop {
                ticker.tick().await;
                let snapshot = aggregate(&peer.transfer_snapshot());
                if tx.send(snapshot).is_err() {
                    // No subscribers left
                    return;
                }
            }
        });
        (Self { task }, rx)
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for ProgressTracker {
    fn drop(&mut self) {
        self.task.abort();
    }
}
