use thiserror::Error;

use crate::model::RunId;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("a pipeline run is already in progress")]
    AlreadyRunning,

    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    #[error("run not found: {0}")]
    RunNotFound(RunId),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
