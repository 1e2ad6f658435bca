use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::node::registry::NodeRegistry;
use crate::scheduler::{JobId, JobRegistry};
use crate::timer::Clock;
use crate::transport::{NodeTransport, ServerCommand};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunResult {
    Succeeded,
    Failed,
}

/// Protocol message body sent by a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageKind {
    Heartbeat {
        #[serde(default)]
        incarnation: Option<Uuid>,
    },
    AckCommit {
        job_id: JobId,
    },
    NackCommit {
        job_id: JobId,
    },
    /// The node has started running the job.
    Ready {
        job_id: JobId,
    },
    RunComplete {
        job_id: JobId,
        result: RunResult,
    },
    Aborted {
        job_id: JobId,
    },
}

impl MessageKind {
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            MessageKind::Heartbeat { .. } => None,
            MessageKind::AckCommit { job_id }
            | MessageKind::NackCommit { job_id }
            | MessageKind::Ready { job_id }
            | MessageKind::RunComplete { job_id, .. }
            | MessageKind::Aborted { job_id } => Some(*job_id),
        }
    }
}

/// A protocol message from `node`, stamped with the node's send time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeMessage {
    pub node: String,
    pub sent_at: DateTime<Utc>,
    pub kind: MessageKind,
}

impl NodeMessage {
    pub fn new(node: impl Into<String>, sent_at: DateTime<Utc>, kind: MessageKind) -> Self {
        Self {
            node: node.into(),
            sent_at,
            kind,
        }
    }
}

/// Validated node input handed to a job controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeReport {
    Ack,
    Nack,
    Started,
    Completed(RunResult),
    Aborted,
    /// Well-formed message that does not fit the node's sub-state for the job.
    Violation,
}

/// What happened to an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Accepted,
    /// Forwarded to the job as a protocol violation.
    Violation,
    /// Timestamp outside the acceptance window; dropped.
    Stale,
    /// Job is not assigned to the sending node; dropped.
    Unrelated,
    /// Node is in rehab for a different job; dropped.
    Ignored,
}

/// Where a node stands in one job, from the server's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assignment {
    AwaitingCommit,
    Committed,
    Running { started: bool },
}

enum Classified {
    Expected(NodeReport),
    Violation,
    Unrelated,
}

/// Per-node logical connections.
///
/// Outbound commands pass through here so each node's assignment table
/// always reflects what it has been told; inbound messages are checked
/// against that table before they reach a job controller.
pub struct NodeSessions {
    assignments: Mutex<HashMap<String, HashMap<JobId, Assignment>>>,
    transport: Arc<dyn NodeTransport>,
    clock: Clock,
    window: chrono::Duration,
}

impl NodeSessions {
    pub fn new(transport: Arc<dyn NodeTransport>, clock: Clock, window: Duration) -> Self {
        Self {
            assignments: Mutex::new(HashMap::new()),
            transport,
            clock,
            window: chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::MAX),
        }
    }

    /// Send `command` to `node` and record the sub-state it implies.
    pub async fn send(&self, node: &str, command: ServerCommand) {
        {
            let mut assignments = self.assignments.lock().await;
            let jobs = assignments.entry(node.to_string()).or_default();
            match &command {
                ServerCommand::Commit { job_id, .. } => {
                    jobs.insert(*job_id, Assignment::AwaitingCommit);
                }
                ServerCommand::Run { job_id, .. } => {
                    jobs.insert(*job_id, Assignment::Running { started: false });
                }
                ServerCommand::Abort { job_id: Some(job_id) } => {
                    jobs.remove(job_id);
                }
                ServerCommand::Abort { job_id: None } => {}
            }
        }
        tracing::debug!(node, ?command, "Sending command to node");
        self.transport.deliver(node, command);
    }

    /// Forget `node`'s part in `job_id` without telling the node.
    pub async fn release(&self, node: &str, job_id: JobId) {
        let mut assignments = self.assignments.lock().await;
        if let Some(jobs) = assignments.get_mut(node) {
            jobs.remove(&job_id);
        }
    }

    pub async fn assignment(&self, node: &str, job_id: JobId) -> Option<Assignment> {
        self.assignments
            .lock()
            .await
            .get(node)
            .and_then(|jobs| jobs.get(&job_id))
            .copied()
    }

    pub async fn assigned_jobs(&self, node: &str) -> Vec<JobId> {
        self.assignments
            .lock()
            .await
            .get(node)
            .map(|jobs| jobs.keys().copied().collect())
            .unwrap_or_default()
    }

    fn is_stale(&self, sent_at: DateTime<Utc>) -> bool {
        (self.clock.now() - sent_at).abs() > self.window
    }

    /// Check `kind` against the node's sub-state for the job and advance it.
    async fn classify(&self, node: &str, job_id: JobId, kind: &MessageKind) -> Classified {
        let mut assignments = self.assignments.lock().await;
        let Some(jobs) = assignments.get_mut(node) else {
            return Classified::Unrelated;
        };
        let Some(current) = jobs.get(&job_id).copied() else {
            return Classified::Unrelated;
        };

        match (current, kind) {
            (_, MessageKind::Aborted { .. }) => {
                jobs.remove(&job_id);
                Classified::Expected(NodeReport::Aborted)
            }
            (Assignment::AwaitingCommit, MessageKind::AckCommit { .. }) => {
                jobs.insert(job_id, Assignment::Committed);
                Classified::Expected(NodeReport::Ack)
            }
            (Assignment::AwaitingCommit, MessageKind::NackCommit { .. }) => {
                jobs.remove(&job_id);
                Classified::Expected(NodeReport::Nack)
            }
            (Assignment::Running { started: false }, MessageKind::Ready { .. }) => {
                jobs.insert(job_id, Assignment::Running { started: true });
                Classified::Expected(NodeReport::Started)
            }
            (Assignment::Running { .. }, MessageKind::RunComplete { result, .. }) => {
                jobs.remove(&job_id);
                Classified::Expected(NodeReport::Completed(*result))
            }
            _ => {
                jobs.remove(&job_id);
                Classified::Violation
            }
        }
    }

    /// Validate an inbound message and route it to the node registry or the
    /// job it belongs to.
    pub async fn dispatch(
        &self,
        message: NodeMessage,
        nodes: &NodeRegistry,
        jobs: &JobRegistry,
    ) -> Disposition {
        let NodeMessage {
            node,
            sent_at,
            kind,
        } = message;

        if self.is_stale(sent_at) {
            tracing::debug!(node = %node, sent_at = %sent_at, ?kind, "Dropping stale message");
            return Disposition::Stale;
        }

        let job_id = match kind {
            MessageKind::Heartbeat { incarnation } => {
                nodes.record_heartbeat(&node, sent_at, incarnation).await;
                return Disposition::Accepted;
            }
            ref other => match other.job_id() {
                Some(job_id) => job_id,
                None => return Disposition::Unrelated,
            },
        };

        if let Some(record) = nodes.status(&node).await {
            if record.in_rehab() && record.rehab_job != Some(job_id) {
                tracing::debug!(node = %node, job_id = %job_id, "Node in rehab, ignoring message");
                return Disposition::Ignored;
            }
        }

        match self.classify(&node, job_id, &kind).await {
            Classified::Unrelated => {
                tracing::debug!(node = %node, job_id = %job_id, ?kind, "Message for unassigned job ignored");
                Disposition::Unrelated
            }
            Classified::Expected(report) => {
                if jobs.deliver(job_id, &node, report, sent_at).await {
                    Disposition::Accepted
                } else {
                    Disposition::Unrelated
                }
            }
            Classified::Violation => {
                tracing::warn!(node = %node, job_id = %job_id, ?kind, "Protocol violation");
                jobs.deliver(job_id, &node, NodeReport::Violation, sent_at).await;
                Disposition::Violation
            }
        }
    }
}
