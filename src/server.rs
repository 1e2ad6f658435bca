use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::api::{run_api, ApiState};
use crate::config::ServerConfig;
use crate::error::{PushyError, Result};
use crate::events::{EventPublisher, Subscription};
use crate::node::session::{Disposition, MessageKind, NodeMessage, NodeSessions, RunResult};
use crate::node::{NodeRecord, NodeRegistry};
use crate::scheduler::controller::ControllerContext;
use crate::scheduler::{Job, JobId, JobOptions, JobRegistry, Whitelist};
use crate::timer::Clock;
use crate::transport::ChannelTransport;

/// Push job server: owns the node registry, node sessions, job registry and
/// event publisher, and exposes the operations collaborators call.
pub struct PushServer {
    config: ServerConfig,
    clock: Clock,
    nodes: NodeRegistry,
    sessions: Arc<NodeSessions>,
    jobs: Arc<JobRegistry>,
    transport: Arc<ChannelTransport>,
}

impl PushServer {
    /// Build the server. Must be called inside a Tokio runtime: node loss
    /// notifications are forwarded to jobs by a background task.
    pub fn new(config: ServerConfig, whitelist: Arc<dyn Whitelist>) -> Result<Self> {
        config.validate()?;

        let clock = Clock::new();
        let transport = Arc::new(ChannelTransport::new());
        let (nodes, mut node_down_rx) = NodeRegistry::new(clock, config.offline_timeout());
        let sessions = Arc::new(NodeSessions::new(
            transport.clone(),
            clock,
            config.message_window(),
        ));
        let events = Arc::new(EventPublisher::new(clock));
        let ctx = ControllerContext {
            nodes: nodes.clone(),
            sessions: sessions.clone(),
            whitelist,
            clock,
            voting_timeout: config.voting_timeout(),
            rehab_duration: config.rehab_duration(),
        };
        let jobs = Arc::new(JobRegistry::new(ctx, events, config.default_run_timeout()));

        let down_jobs = jobs.clone();
        tokio::spawn(async move {
            while let Some(down) = node_down_rx.recv().await {
                down_jobs.node_down(&down).await;
            }
        });

        Ok(Self {
            config,
            clock,
            nodes,
            sessions,
            jobs,
            transport,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn clock(&self) -> Clock {
        self.clock
    }

    /// The in-process transport nodes attach to.
    pub fn transport(&self) -> Arc<ChannelTransport> {
        self.transport.clone()
    }

    pub async fn create_job(
        &self,
        command: &str,
        nodes: Vec<String>,
        options: JobOptions,
    ) -> Result<JobId> {
        self.jobs.create_job(command, nodes, options).await
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<Job> {
        self.jobs.get_job(job_id).await
    }

    pub async fn list_jobs(&self) -> Vec<Job> {
        self.jobs.list_jobs().await
    }

    /// Make a node known before it has sent a heartbeat.
    pub async fn register_node(&self, node: &str) {
        self.nodes.register(node).await;
    }

    pub async fn get_node_state(&self, node: &str) -> Result<NodeRecord> {
        self.nodes
            .status(node)
            .await
            .ok_or_else(|| PushyError::NodeNotFound(node.to_string()))
    }

    pub async fn list_node_states(&self) -> Vec<NodeRecord> {
        self.nodes.all().await
    }

    pub async fn online_node_count(&self) -> usize {
        self.nodes.online_count().await
    }

    pub fn subscribe_job_events(
        &self,
        job_id: JobId,
        last_event_id: Option<u64>,
    ) -> Result<Subscription> {
        self.jobs.subscribe(job_id, last_event_id)
    }

    /// Entry point for every protocol message a node sends.
    pub async fn receive(&self, message: NodeMessage) -> Disposition {
        self.sessions
            .dispatch(message, &self.nodes, &self.jobs)
            .await
    }

    async fn receive_now(&self, node: &str, kind: MessageKind) -> Disposition {
        self.receive(NodeMessage::new(node, self.clock.now(), kind))
            .await
    }

    pub async fn heartbeat(&self, node: &str, incarnation: Option<Uuid>) -> Disposition {
        self.receive_now(node, MessageKind::Heartbeat { incarnation })
            .await
    }

    pub async fn ack_commit(&self, job_id: JobId, node: &str) -> Disposition {
        self.receive_now(node, MessageKind::AckCommit { job_id }).await
    }

    pub async fn nack_commit(&self, job_id: JobId, node: &str) -> Disposition {
        self.receive_now(node, MessageKind::NackCommit { job_id }).await
    }

    pub async fn ready(&self, job_id: JobId, node: &str) -> Disposition {
        self.receive_now(node, MessageKind::Ready { job_id }).await
    }

    pub async fn run_complete(&self, job_id: JobId, node: &str, result: RunResult) -> Disposition {
        self.receive_now(node, MessageKind::RunComplete { job_id, result })
            .await
    }

    pub async fn aborted(&self, job_id: JobId, node: &str) -> Disposition {
        self.receive_now(node, MessageKind::Aborted { job_id }).await
    }

    /// Move every unfinished job to `crashed`.
    pub async fn crash_in_flight(&self) -> usize {
        let crashed = self.jobs.crash_in_flight().await;
        if crashed > 0 {
            tracing::warn!(crashed, "Marked in-flight jobs crashed");
        }
        crashed
    }

    /// Serve the HTTP API until `shutdown` is cancelled.
    ///
    /// In-flight jobs are crashed and node command streams closed as soon as
    /// the token fires, so the open event feeds and command streams end and
    /// the API can drain its connections.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let addr = self.config.listen_addr;
        tracing::info!(
            addr = %addr,
            offline_timeout_ms = self.config.offline_timeout_ms,
            voting_timeout_ms = self.config.voting_timeout_ms,
            "Starting push job server"
        );

        let drained = CancellationToken::new();
        let drain = tokio::spawn({
            let server = self.clone();
            let drained = drained.clone();
            async move {
                shutdown.cancelled().await;
                tracing::info!("Shutting down, crashing in-flight jobs");
                server.crash_in_flight().await;
                server.transport.close_all();
                drained.cancel();
            }
        });

        let state = ApiState {
            server: self.clone(),
        };
        let served = run_api(addr, state, drained).await;
        drain.abort();
        served
    }
}
