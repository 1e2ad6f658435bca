use thiserror::Error;

use crate::scheduler::JobId;

#[derive(Error, Debug)]
pub enum PushyError {
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Invalid job request: {0}")]
    Validation(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PushyError>;
