use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::events::{EventLog, EventPayload, VoteStatus};
use crate::node::registry::NodeDown;
use crate::node::session::{NodeReport, NodeSessions, RunResult};
use crate::node::NodeRegistry;
use crate::scheduler::job::{Job, JobStatus, NodeOutcome};
use crate::scheduler::whitelist::Whitelist;
use crate::timer::{schedule, Clock, TimerHandle};
use crate::transport::ServerCommand;

/// Shared services every job controller talks to.
#[derive(Clone)]
pub(crate) struct ControllerContext {
    pub nodes: NodeRegistry,
    pub sessions: Arc<NodeSessions>,
    pub whitelist: Arc<dyn Whitelist>,
    pub clock: Clock,
    pub voting_timeout: Duration,
    pub rehab_duration: Duration,
}

pub(crate) type SharedController = Arc<Mutex<JobController>>;

impl From<RunResult> for NodeOutcome {
    fn from(result: RunResult) -> Self {
        match result {
            RunResult::Succeeded => NodeOutcome::Succeeded,
            RunResult::Failed => NodeOutcome::Failed,
        }
    }
}

/// Drives one job through voting, running and completion.
///
/// All input (node reports, node loss, timer expiry) arrives through the
/// controller's mutex, so handlers run one at a time and see a consistent job.
pub struct JobController {
    job: Job,
    /// Command line nodes are told to run, after whitelist resolution.
    run_command: Option<String>,
    events: Arc<EventLog>,
    ctx: ControllerContext,
    this: Weak<Mutex<JobController>>,
    voting_timer: Option<TimerHandle>,
    run_timer: Option<TimerHandle>,
}

impl JobController {
    pub(crate) fn launch(
        job: Job,
        events: Arc<EventLog>,
        ctx: ControllerContext,
    ) -> SharedController {
        Arc::new_cyclic(|this| {
            Mutex::new(Self {
                job,
                run_command: None,
                events,
                ctx,
                this: this.clone(),
                voting_timer: None,
                run_timer: None,
            })
        })
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    fn now(&self) -> DateTime<Utc> {
        self.ctx.clock.now()
    }

    fn publish(&self, payload: EventPayload) {
        self.events.publish(payload);
    }

    fn node_names(&self) -> Vec<String> {
        self.job.node_outcomes().keys().cloned().collect()
    }

    /// Announce the job and send commits to every available node.
    pub(crate) async fn start(&mut self) {
        let job_id = self.job.id;
        self.publish(EventPayload::Start {
            command: self.job.command.clone(),
            run_timeout: self.job.run_timeout.as_secs(),
            quorum: self.job.quorum,
            node_count: self.job.node_count(),
            user: self.job.user.clone(),
        });
        tracing::info!(
            job_id = %job_id,
            command = %self.job.command,
            nodes = self.job.node_count(),
            quorum = self.job.quorum,
            "Job started"
        );

        let Some(command) = self.ctx.whitelist.resolve(&self.job.command) else {
            tracing::warn!(job_id = %job_id, command = %self.job.command, "Command not whitelisted, refusing job");
            let now = self.now();
            for node in self.node_names() {
                self.job.set_outcome(&node, NodeOutcome::Nacked, now);
            }
            self.job.set_status(JobStatus::QuorumFailed, now);
            self.finish().await;
            return;
        };
        self.run_command = Some(command.clone());

        for node in self.node_names() {
            if self.ctx.nodes.is_available(&node).await {
                self.ctx
                    .sessions
                    .send(
                        &node,
                        ServerCommand::Commit {
                            job_id,
                            command: command.clone(),
                        },
                    )
                    .await;
            } else {
                tracing::debug!(job_id = %job_id, node = %node, "Node unavailable for commit");
                let now = self.now();
                self.job.set_outcome(&node, NodeOutcome::Unavailable, now);
            }
        }

        if self.voting_complete() {
            self.decide_quorum().await;
            return;
        }

        let this = self.this.clone();
        self.voting_timer = Some(schedule(self.ctx.voting_timeout, move || async move {
            if let Some(controller) = this.upgrade() {
                controller.lock().await.on_voting_deadline().await;
            }
        }));
    }

    /// Apply a validated report from `node`.
    pub(crate) async fn handle(&mut self, node: &str, report: NodeReport, at: DateTime<Utc>) {
        let Some(outcome) = self.job.outcome(node) else {
            tracing::debug!(job_id = %self.job.id, node, "Report from node outside job");
            return;
        };
        tracing::debug!(job_id = %self.job.id, node, ?report, sent_at = %at, "Node report");
        match self.job.status {
            JobStatus::Voting => self.handle_vote(node, outcome, report).await,
            JobStatus::Running => self.handle_run(node, outcome, report).await,
            status => {
                tracing::debug!(job_id = %self.job.id, node, %status, "Report for finished job ignored");
            }
        }
    }

    async fn handle_vote(&mut self, node: &str, outcome: NodeOutcome, report: NodeReport) {
        if !matches!(outcome, NodeOutcome::New | NodeOutcome::Ready) {
            return;
        }
        let now = self.now();
        match (outcome, report) {
            (NodeOutcome::New, NodeReport::Ack) => {
                self.job.set_outcome(node, NodeOutcome::Ready, now);
                self.publish(EventPayload::QuorumVote {
                    node: node.to_string(),
                    status: VoteStatus::Ack,
                });
            }
            (NodeOutcome::New, NodeReport::Nack) => {
                self.job.set_outcome(node, NodeOutcome::Nacked, now);
                self.publish(EventPayload::QuorumVote {
                    node: node.to_string(),
                    status: VoteStatus::Nack,
                });
            }
            (_, NodeReport::Aborted) => {
                self.job.set_outcome(node, NodeOutcome::Nacked, now);
            }
            (_, NodeReport::Violation) => {
                self.job.set_outcome(node, NodeOutcome::Nacked, now);
                self.rehab(node).await;
            }
            (outcome, report) => {
                tracing::debug!(job_id = %self.job.id, node, %outcome, ?report, "Report does not apply while voting");
                return;
            }
        }
        if self.voting_complete() {
            self.decide_quorum().await;
        }
    }

    async fn handle_run(&mut self, node: &str, outcome: NodeOutcome, report: NodeReport) {
        if outcome != NodeOutcome::Running {
            return;
        }
        let now = self.now();
        let finished = match report {
            NodeReport::Started => {
                tracing::debug!(job_id = %self.job.id, node, "Node began running");
                return;
            }
            NodeReport::Completed(result) => result.into(),
            NodeReport::Aborted => NodeOutcome::Crashed,
            NodeReport::Violation => NodeOutcome::Crashed,
            NodeReport::Ack | NodeReport::Nack => {
                tracing::debug!(job_id = %self.job.id, node, ?report, "Report does not apply while running");
                return;
            }
        };

        self.job.set_outcome(node, finished, now);
        self.publish(EventPayload::RunComplete {
            node: node.to_string(),
            status: finished,
        });
        if report == NodeReport::Violation {
            self.rehab(node).await;
        }
        self.check_completion().await;
    }

    /// React to a node going offline or restarting.
    pub(crate) async fn node_down(&mut self, down: &NodeDown) {
        let Some(outcome) = self.job.outcome(&down.node) else {
            return;
        };
        let job_id = self.job.id;
        // Forwarded asynchronously, so it can describe a node state that
        // predates this job. Commits already went to the node as it is now.
        if down.at <= self.job.created_at {
            tracing::debug!(
                job_id = %job_id,
                node = %down.node,
                reason = ?down.reason,
                "Ignoring node loss from before the job started"
            );
            return;
        }
        let now = self.now();
        match (self.job.status, outcome) {
            (JobStatus::Voting, NodeOutcome::New | NodeOutcome::Ready) => {
                tracing::info!(job_id = %job_id, node = %down.node, reason = ?down.reason, "Node lost during voting");
                self.job.set_outcome(&down.node, NodeOutcome::Unavailable, now);
                self.ctx.sessions.release(&down.node, job_id).await;
                if self.voting_complete() {
                    self.decide_quorum().await;
                }
            }
            (JobStatus::Running, NodeOutcome::Running) => {
                tracing::info!(job_id = %job_id, node = %down.node, reason = ?down.reason, "Node lost while running");
                self.job.set_outcome(&down.node, NodeOutcome::Crashed, now);
                self.ctx.sessions.release(&down.node, job_id).await;
                self.publish(EventPayload::RunComplete {
                    node: down.node.clone(),
                    status: NodeOutcome::Crashed,
                });
                self.check_completion().await;
            }
            _ => {}
        }
    }

    fn voting_complete(&self) -> bool {
        self.job.count(NodeOutcome::New) == 0
    }

    async fn on_voting_deadline(&mut self) {
        if self.job.status != JobStatus::Voting {
            return;
        }
        tracing::info!(
            job_id = %self.job.id,
            waiting = self.job.count(NodeOutcome::New),
            "Voting deadline reached"
        );
        self.decide_quorum().await;
    }

    async fn decide_quorum(&mut self) {
        if self.job.status != JobStatus::Voting {
            return;
        }
        self.voting_timer = None;
        let job_id = self.job.id;
        let now = self.now();

        for node in self.job.nodes_with(NodeOutcome::New) {
            self.job.set_outcome(&node, NodeOutcome::Unavailable, now);
            self.ctx.sessions.release(&node, job_id).await;
        }

        let acked = self.job.count(NodeOutcome::Ready);
        if acked >= self.job.quorum {
            tracing::info!(job_id = %job_id, acked, quorum = self.job.quorum, "Quorum succeeded");
            self.job.set_status(JobStatus::Running, now);
            self.publish(EventPayload::QuorumSucceeded {});

            let command = self
                .run_command
                .clone()
                .unwrap_or_else(|| self.job.command.clone());
            for node in self.job.nodes_with(NodeOutcome::Ready) {
                self.job.set_outcome(&node, NodeOutcome::Running, now);
                self.ctx
                    .sessions
                    .send(
                        &node,
                        ServerCommand::Run {
                            job_id,
                            command: command.clone(),
                        },
                    )
                    .await;
                self.publish(EventPayload::RunStart { node });
            }

            let this = self.this.clone();
            self.run_timer = Some(schedule(self.job.run_timeout, move || async move {
                if let Some(controller) = this.upgrade() {
                    controller.lock().await.on_run_timeout().await;
                }
            }));
        } else {
            tracing::info!(job_id = %job_id, acked, quorum = self.job.quorum, "Quorum failed");
            for node in self.job.nodes_with(NodeOutcome::Ready) {
                self.job.set_outcome(&node, NodeOutcome::WasReady, now);
                self.ctx
                    .sessions
                    .send(&node, ServerCommand::Abort { job_id: Some(job_id) })
                    .await;
            }
            self.job.set_status(JobStatus::QuorumFailed, now);
            self.finish().await;
        }
    }

    async fn on_run_timeout(&mut self) {
        if self.job.status != JobStatus::Running {
            return;
        }
        let job_id = self.job.id;
        let now = self.now();
        tracing::warn!(
            job_id = %job_id,
            running = self.job.count(NodeOutcome::Running),
            "Run timeout reached"
        );
        for node in self.job.nodes_with(NodeOutcome::Running) {
            self.job.set_outcome(&node, NodeOutcome::TimedOut, now);
            self.ctx
                .sessions
                .send(&node, ServerCommand::Abort { job_id: Some(job_id) })
                .await;
            self.publish(EventPayload::RunComplete {
                node,
                status: NodeOutcome::TimedOut,
            });
        }
        self.job.set_status(JobStatus::TimedOut, now);
        self.finish().await;
    }

    async fn check_completion(&mut self) {
        if self.job.status == JobStatus::Running && self.job.count(NodeOutcome::Running) == 0 {
            let now = self.now();
            self.job.set_status(JobStatus::Complete, now);
            self.finish().await;
        }
    }

    /// Quarantine `node` after a protocol violation on this job.
    async fn rehab(&mut self, node: &str) {
        let job_id = self.job.id;
        let now = self.now();
        self.ctx
            .nodes
            .enter_rehab(node, now, self.ctx.rehab_duration, Some(job_id))
            .await;
        self.ctx
            .sessions
            .send(node, ServerCommand::Abort { job_id: Some(job_id) })
            .await;
        self.publish(EventPayload::Rehab {
            node: node.to_string(),
        });
    }

    /// Abandon an unfinished job, e.g. on shutdown.
    pub(crate) async fn crash(&mut self) {
        if self.job.status.is_terminal() {
            return;
        }
        let job_id = self.job.id;
        let now = self.now();
        for (node, outcome) in self.job.node_outcomes().clone() {
            match outcome {
                NodeOutcome::New => {
                    self.job.set_outcome(&node, NodeOutcome::Unavailable, now);
                }
                NodeOutcome::Ready | NodeOutcome::Running => {
                    self.job.set_outcome(&node, NodeOutcome::Crashed, now);
                    self.ctx
                        .sessions
                        .send(&node, ServerCommand::Abort { job_id: Some(job_id) })
                        .await;
                }
                _ => {}
            }
        }
        self.job.set_status(JobStatus::Crashed, now);
        self.finish().await;
    }

    async fn finish(&mut self) {
        self.voting_timer = None;
        self.run_timer = None;
        let job_id = self.job.id;
        for node in self.node_names() {
            self.ctx.sessions.release(&node, job_id).await;
        }

        self.publish(EventPayload::JobComplete {
            status: self.job.status,
        });
        self.publish(EventPayload::Summary {
            command: self.job.command.clone(),
            status: self.job.status,
            run_timeout: self.job.run_timeout.as_secs(),
            quorum: self.job.quorum,
            nodes: self.job.nodes_by_outcome(),
            created_at: self.job.created_at,
            updated_at: self.job.updated_at,
        });
        self.events.close();

        tracing::info!(
            job_id = %job_id,
            status = %self.job.status,
            nodes = ?self.job.nodes_by_outcome(),
            "Job finished"
        );
    }
}
