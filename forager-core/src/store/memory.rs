use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{PipelineError, Result};
use crate::model::{Run, RunCompletion, RunId, RunStatus, SchedulerConfigRecord, TriggerType};
use crate::store::{RunStore, SchedulerConfigStore};

/// In-memory store used by tests and by hosts running without a database.
/// Run ids are assigned from a monotonically increasing counter.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: i64,
    runs: Vec<Run>,
    scheduler: Option<SchedulerConfigRecord>,
}

impl InMemoryStore {
    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl RunStore for InMemoryStore {
    async fn create_run(&self, trigger: TriggerType, started_at: DateTime<Utc>) -> Result<Run> {
        let mut inner = self.lock();
        inner.next_id += 1;
        let run = Run {
            id: RunId(inner.next_id),
            status: RunStatus::Running,
            trigger,
            started_at,
            completed_at: None,
            output: String::new(),
            error_message: None,
            sellers_processed: 0,
            products_scraped: 0,
        };
        inner.runs.push(run.clone());
        Ok(run)
    }

    async fn update_status(&self, id: RunId, status: RunStatus) -> Result<()> {
        let mut inner = self.lock();
        let run = inner
            .runs
            .iter_mut()
            .find(|run| run.id == id)
            .ok_or(PipelineError::RunNotFound(id))?;
        run.status = status;
        Ok(())
    }

    async fn complete_run(&self, id: RunId, completion: RunCompletion) -> Result<()> {
        let mut inner = self.lock();
        let run = inner
            .runs
            .iter_mut()
            .find(|run| run.id == id)
            .ok_or(PipelineError::RunNotFound(id))?;
        run.status = completion.status;
        run.completed_at = Some(completion.completed_at);
        run.error_message = completion.error_message;
        run.output = completion.output;
        run.sellers_processed = completion.stats.sellers_processed;
        run.products_scraped = completion.stats.products_scraped;
        Ok(())
    }

    async fn run(&self, id: RunId) -> Result<Option<Run>> {
        Ok(self.lock().runs.iter().find(|run| run.id == id).cloned())
    }

    async fn recent_runs(&self, limit: i64) -> Result<Vec<Run>> {
        let inner = self.lock();
        Ok(inner
            .runs
            .iter()
            .rev()
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn count_runs(&self) -> Result<i64> {
        Ok(self.lock().runs.len() as i64)
    }
}

#[async_trait]
impl SchedulerConfigStore for InMemoryStore {
    async fn scheduler_config(&self) -> Result<SchedulerConfigRecord> {
        let mut inner = self.lock();
        Ok(inner
            .scheduler
            .get_or_insert_with(SchedulerConfigRecord::disabled_default)
            .clone())
    }

    async fn save_scheduler_config(&self, record: &SchedulerConfigRecord) -> Result<()> {
        self.lock().scheduler = Some(record.clone());
        Ok(())
    }
}
