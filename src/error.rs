use thiserror::Error;
use uuid::Uuid;

use crate::scheduler::JobStatus;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Host not available for job {0}")]
    HostNotAvailable(Uuid),

    #[error("Unknown host group: {0}")]
    UnknownHostGroup(String),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Task definition not found: {0}")]
    TaskNotFound(String),

    #[error("Job {job} cannot move from {from} to {to}")]
    InvalidTransition {
        job: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Job store error: {0}")]
    Store(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, DispatchError>;
