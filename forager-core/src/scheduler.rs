//! Recurring trigger for the pipeline: validates cron expressions, installs
//! and tears down the timer, and persists the singleton configuration row.
//! A tick that lands during an active run is a silent no-op.

use std::fmt;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::model::{SchedulerConfigRecord, TriggerType};
use crate::orchestrator::PipelineOrchestrator;
use crate::store::PipelineStore;

/// Default recurrence: twice daily at 06:00 and 18:00 (seconds-resolution
/// cron, as `tokio-cron-scheduler` expects).
pub const DEFAULT_CRON_EXPR: &str = "0 0 6,18 * * *";

impl SchedulerConfigRecord {
    /// The record seeded on first access: disabled, twice daily.
    pub fn disabled_default() -> Self {
        Self {
            enabled: false,
            cron_expr: DEFAULT_CRON_EXPR.to_string(),
        }
    }
}

/// Checks that an expression parses without installing anything.
pub fn validate_cron(expr: &str) -> Result<()> {
    Job::new_async(expr, |_id, _scheduler| Box::pin(async {}))
        .map(|_| ())
        .map_err(|err| PipelineError::InvalidCron(format!("{expr}: {err}")))
}

pub struct PipelineScheduler {
    store: Arc<dyn PipelineStore>,
    orchestrator: PipelineOrchestrator,
    runtime: Mutex<SchedulerRuntime>,
}

#[derive(Default)]
struct SchedulerRuntime {
    scheduler: Option<JobScheduler>,
    job_id: Option<Uuid>,
}

impl PipelineScheduler {
    pub fn new(store: Arc<dyn PipelineStore>, orchestrator: PipelineOrchestrator) -> Self {
        Self {
            store,
            orchestrator,
            runtime: Mutex::new(SchedulerRuntime::default()),
        }
    }

    /// Startup initialization: read (or seed) the persisted configuration
    /// and install the timer when enabled. Storage being unavailable this
    /// early is a logged soft no-op, never fatal.
    pub async fn init(&self) -> Result<()> {
        let record = match self.store.scheduler_config().await {
            Ok(record) => record,
            Err(err) => {
                warn!(error = %err, "scheduler config unavailable at startup; scheduling stays off until configured");
                return Ok(());
            }
        };
        if record.enabled {
            match self.install(&record.cron_expr).await {
                Ok(()) => info!(cron = %record.cron_expr, "scheduler installed from persisted config"),
                Err(err) => {
                    warn!(error = %err, "persisted cron expression failed to install")
                }
            }
        }
        Ok(())
    }

    /// Updates the persisted configuration and (re)installs the timer.
    ///
    /// The record is persisted exactly as requested before validation, so an
    /// invalid expression can leave `enabled = true` stored alongside no
    /// installed timer; the error tells the caller. The previous timer is
    /// always torn down first, so nothing fires from a rejected expression.
    pub async fn configure(
        &self,
        enabled: bool,
        cron_expr: &str,
    ) -> Result<SchedulerConfigRecord> {
        let record = SchedulerConfigRecord {
            enabled,
            cron_expr: cron_expr.to_string(),
        };
        self.store.save_scheduler_config(&record).await?;
        self.uninstall().await?;

        if enabled {
            self.install(cron_expr).await?;
            info!(cron = cron_expr, "scheduler installed");
        } else {
            info!("scheduler disabled");
        }
        Ok(record)
    }

    /// The persisted configuration, seeded with the default on first access.
    pub async fn config(&self) -> Result<SchedulerConfigRecord> {
        self.store.scheduler_config().await
    }

    /// Whether a timer is currently installed. May differ from the persisted
    /// `enabled` flag after a rejected expression.
    pub async fn is_installed(&self) -> bool {
        self.runtime.lock().await.job_id.is_some()
    }

    /// Tears down the timer and the underlying job scheduler. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        runtime.job_id = None;
        if let Some(mut scheduler) = runtime.scheduler.take() {
            scheduler
                .shutdown()
                .await
                .map_err(|err| PipelineError::Internal(format!("scheduler shutdown failed: {err}")))?;
        }
        Ok(())
    }

    async fn install(&self, cron_expr: &str) -> Result<()> {
        let orchestrator = self.orchestrator.clone();
        let job = Job::new_async(cron_expr, move |_job_id, _scheduler| {
            let orchestrator = orchestrator.clone();
            Box::pin(async move {
                match orchestrator.start(TriggerType::Scheduled).await {
                    Ok(run_id) => info!(%run_id, "scheduled pipeline run started"),
                    Err(PipelineError::AlreadyRunning) => {
                        debug!("scheduled tick skipped; a run is already active")
                    }
                    Err(err) => warn!(error = %err, "scheduled pipeline run failed to start"),
                }
            })
        })
        .map_err(|err| PipelineError::InvalidCron(format!("{cron_expr}: {err}")))?;

        let mut runtime = self.runtime.lock().await;
        let scheduler = match &runtime.scheduler {
            Some(scheduler) => scheduler.clone(),
            None => {
                let scheduler = JobScheduler::new().await.map_err(|err| {
                    PipelineError::Internal(format!("failed to create job scheduler: {err}"))
                })?;
                scheduler.start().await.map_err(|err| {
                    PipelineError::Internal(format!("failed to start job scheduler: {err}"))
                })?;
                runtime.scheduler = Some(scheduler.clone());
                scheduler
            }
        };

        let job_id = scheduler
            .add(job)
            .await
            .map_err(|err| PipelineError::Internal(format!("failed to add scheduled job: {err}")))?;
        runtime.job_id = Some(job_id);
        Ok(())
    }

    async fn uninstall(&self) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        let job_id = runtime.job_id.take();
        if let (Some(scheduler), Some(job_id)) = (&runtime.scheduler, job_id) {
            scheduler.remove(&job_id).await.map_err(|err| {
                PipelineError::Internal(format!("failed to remove scheduled job: {err}"))
            })?;
        }
        Ok(())
    }
}

impl fmt::Debug for PipelineScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineScheduler").finish_non_exhaustive()
    }
}
