use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::node::state::{Liveness, NodeRecord};
use crate::scheduler::JobId;
use crate::timer::{schedule, Clock, TimerHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownReason {
    /// No heartbeat within the offline timeout.
    HeartbeatLost,
    /// Heartbeats resumed under a new incarnation, so the old process is gone.
    Restarted,
}

/// Notification that a node can no longer be trusted with in-flight work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDown {
    pub node: String,
    pub at: DateTime<Utc>,
    pub reason: DownReason,
}

#[derive(Debug)]
struct NodeEntry {
    record: NodeRecord,
    heartbeat_seq: u64,
    /// True while the offline timer armed by the last heartbeat is pending.
    heartbeat_alive: bool,
    offline_timer: Option<TimerHandle>,
    rehab_timer: Option<TimerHandle>,
}

impl NodeEntry {
    fn new(name: &str, at: DateTime<Utc>) -> Self {
        Self {
            record: NodeRecord::new(name, at),
            heartbeat_seq: 0,
            heartbeat_alive: false,
            offline_timer: None,
            rehab_timer: None,
        }
    }
}

/// Liveness state of every known node.
///
/// All mutation happens under one lock, so concurrent heartbeats, expiries and
/// rehab transitions for a node are applied one at a time. Nodes going down
/// are reported on the channel returned by [`NodeRegistry::new`] instead of
/// calling into job controllers while the lock is held.
#[derive(Debug, Clone)]
pub struct NodeRegistry {
    nodes: Arc<Mutex<HashMap<String, NodeEntry>>>,
    clock: Clock,
    offline_after: Duration,
    down_tx: mpsc::UnboundedSender<NodeDown>,
}

impl NodeRegistry {
    pub fn new(clock: Clock, offline_after: Duration) -> (Self, mpsc::UnboundedReceiver<NodeDown>) {
        let (down_tx, down_rx) = mpsc::unbounded_channel();
        let registry = Self {
            nodes: Arc::new(Mutex::new(HashMap::new())),
            clock,
            offline_after,
            down_tx,
        };
        (registry, down_rx)
    }

    /// Make a node known without marking it online.
    pub async fn register(&self, node: &str) {
        let mut nodes = self.nodes.lock().await;
        if !nodes.contains_key(node) {
            nodes.insert(node.to_string(), NodeEntry::new(node, self.clock.now()));
            tracing::info!(node, "Node registered");
        }
    }

    /// Record a heartbeat sent at `at` and re-arm the offline timer.
    pub async fn record_heartbeat(&self, node: &str, at: DateTime<Utc>, incarnation: Option<Uuid>) {
        let now = self.clock.now();
        let mut nodes = self.nodes.lock().await;
        let entry = nodes
            .entry(node.to_string())
            .or_insert_with(|| NodeEntry::new(node, now));

        let restarted = matches!(
            (entry.record.incarnation, incarnation),
            (Some(old), Some(new)) if old != new
        );
        if incarnation.is_some() {
            entry.record.incarnation = incarnation;
        }
        if entry.record.last_heartbeat_at.map_or(true, |last| at > last) {
            entry.record.last_heartbeat_at = Some(at);
        }

        entry.heartbeat_seq += 1;
        entry.heartbeat_alive = true;
        let seq = entry.heartbeat_seq;
        let registry = self.clone();
        let name = node.to_string();
        entry.offline_timer = Some(schedule(self.offline_after, move || async move {
            registry.heartbeat_expired(&name, seq).await;
        }));

        if matches!(entry.record.liveness, Liveness::New | Liveness::Offline)
            && entry.record.transition(Liveness::Online, now)
        {
            tracing::info!(node, "Node online");
        }

        if restarted {
            tracing::warn!(node, "Node restarted with a new incarnation");
            self.notify_down(node, now, DownReason::Restarted);
        }
    }

    async fn heartbeat_expired(&self, node: &str, seq: u64) {
        let now = self.clock.now();
        let mut nodes = self.nodes.lock().await;
        let Some(entry) = nodes.get_mut(node) else {
            return;
        };
        if entry.heartbeat_seq != seq || !entry.heartbeat_alive {
            return;
        }
        entry.heartbeat_alive = false;
        entry.offline_timer = None;

        // A node in rehab stays there until the rehab timer decides.
        if entry.record.liveness != Liveness::Rehab {
            entry.record.transition(Liveness::Offline, now);
        }
        tracing::info!(
            node,
            timeout_ms = self.offline_after.as_millis() as u64,
            "Node heartbeat lost"
        );
        self.notify_down(node, now, DownReason::HeartbeatLost);
    }

    /// Quarantine `node` until `at + duration`, whatever its current state.
    pub async fn enter_rehab(
        &self,
        node: &str,
        at: DateTime<Utc>,
        duration: Duration,
        job: Option<JobId>,
    ) {
        let now = self.clock.now();
        let until =
            at + chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
        let mut nodes = self.nodes.lock().await;
        let entry = nodes
            .entry(node.to_string())
            .or_insert_with(|| NodeEntry::new(node, now));

        entry.record.transition(Liveness::Rehab, now);
        entry.record.rehab_until = Some(until);
        entry.record.rehab_job = job;

        let registry = self.clone();
        let name = node.to_string();
        entry.rehab_timer = Some(schedule(self.clock.until(until), move || async move {
            registry.leave_rehab(&name, until).await;
        }));

        tracing::info!(node, until = %until, job_id = ?job, "Node entered rehab");
    }

    async fn leave_rehab(&self, node: &str, until: DateTime<Utc>) {
        let now = self.clock.now();
        let mut nodes = self.nodes.lock().await;
        let Some(entry) = nodes.get_mut(node) else {
            return;
        };
        // A later enter_rehab replaced this one.
        if entry.record.rehab_until != Some(until) {
            return;
        }
        entry.record.rehab_until = None;
        entry.record.rehab_job = None;
        entry.rehab_timer = None;

        let next = if entry.heartbeat_alive {
            Liveness::Online
        } else {
            Liveness::Offline
        };
        entry.record.transition(next, now);
        tracing::info!(node, status = %next, "Node left rehab");
    }

    fn notify_down(&self, node: &str, at: DateTime<Utc>, reason: DownReason) {
        let down = NodeDown {
            node: node.to_string(),
            at,
            reason,
        };
        if self.down_tx.send(down).is_err() {
            tracing::debug!(node, "No listener for node-down notifications");
        }
    }

    pub async fn status(&self, node: &str) -> Option<NodeRecord> {
        self.nodes.lock().await.get(node).map(|e| e.record.clone())
    }

    pub async fn is_available(&self, node: &str) -> bool {
        self.nodes
            .lock()
            .await
            .get(node)
            .is_some_and(|e| e.record.is_available())
    }

    /// All nodes, sorted by name.
    pub async fn all(&self) -> Vec<NodeRecord> {
        let nodes = self.nodes.lock().await;
        let mut records: Vec<NodeRecord> = nodes.values().map(|e| e.record.clone()).collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    /// Nodes that are currently heartbeating.
    pub async fn online_count(&self) -> usize {
        self.nodes
            .lock()
            .await
            .values()
            .filter(|e| matches!(e.record.liveness, Liveness::Online | Liveness::Rehab))
            .count()
    }
}
