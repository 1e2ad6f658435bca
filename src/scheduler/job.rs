use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type JobId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Voting,
    Running,
    QuorumFailed,
    Complete,
    TimedOut,
    Crashed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Voting | JobStatus::Running)
    }

    fn rank(&self) -> u8 {
        match self {
            JobStatus::Voting => 0,
            JobStatus::Running => 1,
            _ => 2,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Voting => write!(f, "voting"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::QuorumFailed => write!(f, "quorum_failed"),
            JobStatus::Complete => write!(f, "complete"),
            JobStatus::TimedOut => write!(f, "timed_out"),
            JobStatus::Crashed => write!(f, "crashed"),
        }
    }
}

/// Classification of one node's participation in one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeOutcome {
    /// Commit requested, no reply yet.
    New,
    /// Acked the commit; waiting for the quorum decision.
    Ready,
    /// Acked, but the job failed to reach quorum.
    WasReady,
    Nacked,
    Unavailable,
    Running,
    Succeeded,
    Failed,
    Crashed,
    TimedOut,
}

impl NodeOutcome {
    /// Outcomes that can still change.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            NodeOutcome::New | NodeOutcome::Ready | NodeOutcome::Running
        )
    }
}

impl std::fmt::Display for NodeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NodeOutcome::New => "new",
            NodeOutcome::Ready => "ready",
            NodeOutcome::WasReady => "was_ready",
            NodeOutcome::Nacked => "nacked",
            NodeOutcome::Unavailable => "unavailable",
            NodeOutcome::Running => "running",
            NodeOutcome::Succeeded => "succeeded",
            NodeOutcome::Failed => "failed",
            NodeOutcome::Crashed => "crashed",
            NodeOutcome::TimedOut => "timed_out",
        };
        f.write_str(name)
    }
}

/// Per-job overrides supplied at creation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobOptions {
    /// Acks required to run. Defaults to every requested node.
    pub quorum: Option<usize>,
    /// Run timeout in seconds.
    pub run_timeout: Option<u64>,
    /// Requesting user, reported in the `start` event.
    pub user: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub command: String,
    pub run_timeout: Duration,
    pub quorum: usize,
    pub user: Option<String>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    node_outcomes: BTreeMap<String, NodeOutcome>,
}

impl Job {
    /// Build a job in `voting` with every node at `new`.
    ///
    /// Callers validate the inputs; `nodes` must be non-empty and `quorum`
    /// within `1..=nodes.len()`.
    pub fn new(
        command: String,
        nodes: impl IntoIterator<Item = String>,
        quorum: usize,
        run_timeout: Duration,
        user: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            command,
            run_timeout,
            quorum,
            user,
            status: JobStatus::Voting,
            created_at,
            updated_at: created_at,
            node_outcomes: nodes
                .into_iter()
                .map(|node| (node, NodeOutcome::New))
                .collect(),
        }
    }

    pub fn node_outcomes(&self) -> &BTreeMap<String, NodeOutcome> {
        &self.node_outcomes
    }

    pub fn outcome(&self, node: &str) -> Option<NodeOutcome> {
        self.node_outcomes.get(node).copied()
    }

    pub fn node_count(&self) -> usize {
        self.node_outcomes.len()
    }

    /// Set the outcome of a requested node. Unknown nodes are left alone so
    /// the roster never changes after creation.
    pub fn set_outcome(&mut self, node: &str, outcome: NodeOutcome, at: DateTime<Utc>) -> bool {
        match self.node_outcomes.get_mut(node) {
            Some(current) => {
                *current = outcome;
                self.touch(at);
                true
            }
            None => false,
        }
    }

    /// Move to `status`. Transitions only go forward; a terminal job never
    /// changes again.
    pub fn set_status(&mut self, status: JobStatus, at: DateTime<Utc>) -> bool {
        if self.status.is_terminal() || status.rank() <= self.status.rank() {
            return false;
        }
        self.status = status;
        self.touch(at);
        true
    }

    pub fn nodes_with(&self, outcome: NodeOutcome) -> Vec<String> {
        self.node_outcomes
            .iter()
            .filter(|(_, o)| **o == outcome)
            .map(|(node, _)| node.clone())
            .collect()
    }

    pub fn count(&self, outcome: NodeOutcome) -> usize {
        self.node_outcomes.values().filter(|o| **o == outcome).count()
    }

    /// Node names grouped by outcome, keyed by the outcome's wire name.
    pub fn nodes_by_outcome(&self) -> BTreeMap<String, Vec<String>> {
        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (node, outcome) in &self.node_outcomes {
            grouped
                .entry(outcome.to_string())
                .or_default()
                .push(node.clone());
        }
        grouped
    }

    pub fn view(&self) -> JobView {
        JobView {
            id: self.id.simple().to_string(),
            command: self.command.clone(),
            run_timeout: self.run_timeout.as_secs(),
            quorum: self.quorum,
            status: self.status,
            nodes: self.nodes_by_outcome(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        if at > self.updated_at {
            self.updated_at = at;
        }
    }
}

/// Externally visible representation of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobView {
    pub id: String,
    pub command: String,
    pub run_timeout: u64,
    pub quorum: usize,
    pub status: JobStatus,
    pub nodes: BTreeMap<String, Vec<String>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
