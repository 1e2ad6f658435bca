//! Job lifecycle: records, the per-job controller and the registry of jobs.

pub mod controller;
pub mod job;
pub mod registry;
pub mod whitelist;

pub use controller::JobController;
pub use job::{Job, JobId, JobOptions, JobStatus, JobView, NodeOutcome};
pub use registry::JobRegistry;
pub use whitelist::{AllowAll, CommandWhitelist, Whitelist};
