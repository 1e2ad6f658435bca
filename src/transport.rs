//! Server-to-node delivery.
//!
//! The orchestration core only needs a way to hand a [`ServerCommand`] to a
//! named node. [`ChannelTransport`] keeps one unbounded channel per connected
//! node; the HTTP layer streams a node's channel to it and the test harness
//! reads it directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::scheduler::JobId;

/// Instruction pushed to a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerCommand {
    /// Ask the node to accept a pending job.
    Commit { job_id: JobId, command: String },
    /// Start a committed job.
    Run { job_id: JobId, command: String },
    /// Stop work on `job_id`, or on whatever the node is doing when `None`.
    Abort { job_id: Option<JobId> },
}

impl ServerCommand {
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            ServerCommand::Commit { job_id, .. } | ServerCommand::Run { job_id, .. } => {
                Some(*job_id)
            }
            ServerCommand::Abort { job_id } => *job_id,
        }
    }
}

pub trait NodeTransport: Send + Sync {
    /// Hand `command` to `node`. Delivery is best effort; nodes that are not
    /// connected are detected through heartbeat loss.
    fn deliver(&self, node: &str, command: ServerCommand);
}

/// In-process transport with one channel per connected node.
#[derive(Debug, Default)]
pub struct ChannelTransport {
    nodes: Mutex<HashMap<String, mpsc::UnboundedSender<ServerCommand>>>,
    closed: AtomicBool,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `node`, replacing any previous connection. After
    /// [`close_all`](Self::close_all) the returned stream is already ended.
    pub fn connect(&self, node: &str) -> mpsc::UnboundedReceiver<ServerCommand> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        if self.closed.load(Ordering::SeqCst) {
            return rx;
        }
        if nodes.insert(node.to_string(), tx).is_some() {
            tracing::info!(node, "Node reconnected, previous command stream replaced");
        }
        rx
    }

    /// End every node's command stream and refuse new connections.
    pub fn close_all(&self) {
        let mut nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        self.closed.store(true, Ordering::SeqCst);
        let dropped = nodes.len();
        nodes.clear();
        tracing::info!(dropped, "Closed node command streams");
    }

    pub fn is_connected(&self, node: &str) -> bool {
        let nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        nodes.get(node).is_some_and(|tx| !tx.is_closed())
    }
}

impl NodeTransport for ChannelTransport {
    fn deliver(&self, node: &str, command: ServerCommand) {
        let mut nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = nodes.get(node) else {
            tracing::warn!(node, ?command, "Node not connected, command dropped");
            return;
        };
        if tx.send(command).is_err() {
            tracing::warn!(node, "Node command stream closed, dropping connection");
            nodes.remove(node);
        }
    }
}
