use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::{PushyError, Result};
use crate::events::{EventPublisher, Subscription};
use crate::node::registry::NodeDown;
use crate::node::session::NodeReport;
use crate::scheduler::controller::{ControllerContext, JobController, SharedController};
use crate::scheduler::job::{Job, JobId, JobOptions};

/// Every job the server has created, keyed by id.
///
/// Jobs are kept after they finish so their state and events stay readable.
pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, SharedController>>,
    ctx: ControllerContext,
    events: Arc<EventPublisher>,
    default_run_timeout: Duration,
}

impl JobRegistry {
    pub(crate) fn new(
        ctx: ControllerContext,
        events: Arc<EventPublisher>,
        default_run_timeout: Duration,
    ) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            ctx,
            events,
            default_run_timeout,
        }
    }

    /// Validate the request, register the job and start voting.
    pub async fn create_job(
        &self,
        command: &str,
        nodes: Vec<String>,
        options: JobOptions,
    ) -> Result<JobId> {
        if command.trim().is_empty() {
            return Err(PushyError::Validation("command must not be empty".to_string()));
        }
        if nodes.iter().any(|n| n.trim().is_empty()) {
            return Err(PushyError::Validation("node names must not be empty".to_string()));
        }
        let nodes: BTreeSet<String> = nodes.into_iter().collect();
        if nodes.is_empty() {
            return Err(PushyError::Validation("at least one node is required".to_string()));
        }

        let quorum = options.quorum.unwrap_or(nodes.len());
        if quorum == 0 || quorum > nodes.len() {
            return Err(PushyError::Validation(format!(
                "quorum must be between 1 and {}, got {}",
                nodes.len(),
                quorum
            )));
        }
        let run_timeout = options
            .run_timeout
            .map(Duration::from_secs)
            .unwrap_or(self.default_run_timeout);
        if run_timeout.is_zero() {
            return Err(PushyError::Validation("run_timeout must be positive".to_string()));
        }

        let job = Job::new(
            command.to_string(),
            nodes,
            quorum,
            run_timeout,
            options.user,
            self.ctx.clock.now(),
        );
        let job_id = job.id;
        let log = self.events.open(job_id);
        let controller = JobController::launch(job, log, self.ctx.clone());

        // Hold the controller while it is published so nothing reaches it
        // before commits have gone out.
        let mut starting = controller.lock().await;
        self.jobs.write().await.insert(job_id, controller.clone());
        starting.start().await;

        Ok(job_id)
    }

    async fn controller(&self, job_id: JobId) -> Option<SharedController> {
        self.jobs.read().await.get(&job_id).cloned()
    }

    async fn controllers(&self) -> Vec<SharedController> {
        self.jobs.read().await.values().cloned().collect()
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<Job> {
        let controller = self
            .controller(job_id)
            .await
            .ok_or(PushyError::JobNotFound(job_id))?;
        let job = controller.lock().await.job().clone();
        Ok(job)
    }

    /// All jobs, oldest first.
    pub async fn list_jobs(&self) -> Vec<Job> {
        let mut jobs = Vec::new();
        for controller in self.controllers().await {
            jobs.push(controller.lock().await.job().clone());
        }
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    /// Hand a validated report to its job. Returns `false` for unknown jobs.
    pub async fn deliver(
        &self,
        job_id: JobId,
        node: &str,
        report: NodeReport,
        at: DateTime<Utc>,
    ) -> bool {
        let Some(controller) = self.controller(job_id).await else {
            tracing::debug!(job_id = %job_id, node, ?report, "Report for unknown job");
            return false;
        };
        controller.lock().await.handle(node, report, at).await;
        true
    }

    /// Tell every unfinished job that includes the node that it went away.
    pub async fn node_down(&self, down: &NodeDown) {
        for controller in self.controllers().await {
            let mut controller = controller.lock().await;
            if controller.job().status.is_terminal() {
                continue;
            }
            let pending = controller
                .job()
                .outcome(&down.node)
                .is_some_and(|o| o.is_pending());
            if pending {
                controller.node_down(down).await;
            }
        }
    }

    /// Mark every unfinished job crashed. Returns how many were affected.
    pub async fn crash_in_flight(&self) -> usize {
        let mut crashed = 0;
        for controller in self.controllers().await {
            let mut controller = controller.lock().await;
            if !controller.job().status.is_terminal() {
                controller.crash().await;
                crashed += 1;
            }
        }
        crashed
    }

    pub fn subscribe(&self, job_id: JobId, last_event_id: Option<u64>) -> Result<Subscription> {
        self.events.subscribe(job_id, last_event_id)
    }
}
