use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scheduler::{JobStatus, NodeOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventName {
    Start,
    QuorumVote,
    QuorumSucceeded,
    RunStart,
    RunComplete,
    Rehab,
    JobComplete,
    Summary,
}

impl std::fmt::Display for EventName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EventName::Start => "start",
            EventName::QuorumVote => "quorum_vote",
            EventName::QuorumSucceeded => "quorum_succeeded",
            EventName::RunStart => "run_start",
            EventName::RunComplete => "run_complete",
            EventName::Rehab => "rehab",
            EventName::JobComplete => "job_complete",
            EventName::Summary => "summary",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteStatus {
    Ack,
    Nack,
}

/// Event-specific fields. Serialized inline next to the common event fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventPayload {
    Start {
        command: String,
        run_timeout: u64,
        quorum: usize,
        node_count: usize,
        user: Option<String>,
    },
    QuorumVote {
        node: String,
        status: VoteStatus,
    },
    QuorumSucceeded {},
    RunStart {
        node: String,
    },
    RunComplete {
        node: String,
        status: NodeOutcome,
    },
    Rehab {
        node: String,
    },
    JobComplete {
        status: JobStatus,
    },
    Summary {
        command: String,
        status: JobStatus,
        run_timeout: u64,
        quorum: usize,
        nodes: BTreeMap<String, Vec<String>>,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    },
}

impl EventPayload {
    pub fn name(&self) -> EventName {
        match self {
            EventPayload::Start { .. } => EventName::Start,
            EventPayload::QuorumVote { .. } => EventName::QuorumVote,
            EventPayload::QuorumSucceeded {} => EventName::QuorumSucceeded,
            EventPayload::RunStart { .. } => EventName::RunStart,
            EventPayload::RunComplete { .. } => EventName::RunComplete,
            EventPayload::Rehab { .. } => EventName::Rehab,
            EventPayload::JobComplete { .. } => EventName::JobComplete,
            EventPayload::Summary { .. } => EventName::Summary,
        }
    }

    /// Node the event is about, if any.
    pub fn node(&self) -> Option<&str> {
        match self {
            EventPayload::QuorumVote { node, .. }
            | EventPayload::RunStart { node }
            | EventPayload::RunComplete { node, .. }
            | EventPayload::Rehab { node } => Some(node),
            _ => None,
        }
    }
}

/// One entry in a job's event stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    /// Server-wide, strictly increasing. Clients resume with it.
    pub id: u64,
    #[serde(rename = "event")]
    pub name: EventName,
    pub job: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}
