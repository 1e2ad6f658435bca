use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::scheduler::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    /// Registered but no heartbeat seen yet.
    New,
    Online,
    Offline,
    /// Quarantined after a protocol violation.
    Rehab,
}

impl std::fmt::Display for Liveness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Liveness::New => write!(f, "new"),
            Liveness::Online => write!(f, "online"),
            Liveness::Offline => write!(f, "offline"),
            Liveness::Rehab => write!(f, "rehab"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Available,
    Unavailable,
}

/// Liveness record for one node. Nodes are never removed, only marked offline.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRecord {
    pub name: String,
    pub liveness: Liveness,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub rehab_until: Option<DateTime<Utc>>,
    /// Job whose violation put the node in rehab.
    pub rehab_job: Option<JobId>,
    /// Process incarnation reported by the node's heartbeats.
    pub incarnation: Option<Uuid>,
    /// When `liveness` last changed.
    pub changed_at: DateTime<Utc>,
}

impl NodeRecord {
    pub fn new(name: &str, at: DateTime<Utc>) -> Self {
        Self {
            name: name.to_string(),
            liveness: Liveness::New,
            last_heartbeat_at: None,
            rehab_until: None,
            rehab_job: None,
            incarnation: None,
            changed_at: at,
        }
    }

    /// Only online nodes are sent new commits.
    pub fn is_available(&self) -> bool {
        self.liveness == Liveness::Online
    }

    pub fn in_rehab(&self) -> bool {
        self.liveness == Liveness::Rehab
    }

    pub(crate) fn transition(&mut self, liveness: Liveness, at: DateTime<Utc>) -> bool {
        if self.liveness == liveness {
            return false;
        }
        self.liveness = liveness;
        self.changed_at = at;
        true
    }

    pub fn view(&self) -> NodeView {
        NodeView {
            node_name: self.name.clone(),
            status: self.liveness,
            availability: if self.is_available() {
                Availability::Available
            } else {
                Availability::Unavailable
            },
            last_heartbeat_at: self.last_heartbeat_at,
            rehab_until: self.rehab_until,
            changed_at: self.changed_at,
        }
    }
}

/// Externally visible node state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeView {
    pub node_name: String,
    pub status: Liveness,
    pub availability: Availability,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub rehab_until: Option<DateTime<Utc>>,
    pub changed_at: DateTime<Utc>,
}
