pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{Run, RunCompletion, RunId, RunStatus, SchedulerConfigRecord, TriggerType};

/// Durable storage for run records. The orchestrator is the sole writer for
/// the run it owns; readers may query concurrently.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Inserts a new `RUNNING` run and returns it with its assigned id.
    async fn create_run(&self, trigger: TriggerType, started_at: DateTime<Utc>) -> Result<Run>;

    /// Updates the in-flight status (`ENRICHING`, `PROCESSING`).
    async fn update_status(&self, id: RunId, status: RunStatus) -> Result<()>;

    /// Applies the terminal mutation: final status, completion time, error
    /// message, cumulative output, and parsed counters.
    async fn complete_run(&self, id: RunId, completion: RunCompletion) -> Result<()>;

    async fn run(&self, id: RunId) -> Result<Option<Run>>;

    /// Most recent runs first.
    async fn recent_runs(&self, limit: i64) -> Result<Vec<Run>>;

    async fn count_runs(&self) -> Result<i64>;
}

/// Storage for the singleton scheduler configuration row.
#[async_trait]
pub trait SchedulerConfigStore: Send + Sync {
    /// Reads the singleton record, creating the disabled twice-daily default
    /// on first access.
    async fn scheduler_config(&self) -> Result<SchedulerConfigRecord>;

    async fn save_scheduler_config(&self, record: &SchedulerConfigRecord) -> Result<()>;
}

/// Everything the pipeline needs from persistence.
pub trait PipelineStore: RunStore + SchedulerConfigStore {}

impl<T: RunStore + SchedulerConfigStore + ?Sized> PipelineStore for T {}
