//! The surface a host (CLI, HTTP layer, UI bridge) talks to: one object
//! owning the orchestrator and the scheduler, with an explicit lifecycle
//! instead of module-load side effects.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::broadcast::OutputBroadcaster;
use crate::config::ForagerConfig;
use crate::error::Result;
use crate::events::PipelineEvent;
use crate::model::{PipelineStep, Run, RunId, SchedulerConfigRecord, TriggerType};
use crate::orchestrator::PipelineOrchestrator;
use crate::process::ProcessRunner;
use crate::scheduler::PipelineScheduler;
use crate::store::PipelineStore;

/// Snapshot of the in-memory pipeline state.
#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStatus {
    pub is_running: bool,
    pub current_step: PipelineStep,
    pub current_run_id: Option<RunId>,
}

pub struct PipelineService {
    orchestrator: PipelineOrchestrator,
    scheduler: PipelineScheduler,
    store: Arc<dyn PipelineStore>,
}

impl PipelineService {
    /// Wires the orchestrator and scheduler together and runs the startup
    /// scheduler initialization (seeding the config row, installing the
    /// timer when enabled).
    pub async fn new(
        store: Arc<dyn PipelineStore>,
        runner: Arc<dyn ProcessRunner>,
        config: &ForagerConfig,
    ) -> Result<Self> {
        let broadcaster = OutputBroadcaster::new(config.broadcast_capacity);
        let orchestrator = PipelineOrchestrator::new(
            Arc::clone(&store),
            runner,
            broadcaster,
            config.stages.clone(),
            config.auth_marker.clone(),
        );
        let scheduler = PipelineScheduler::new(Arc::clone(&store), orchestrator.clone());
        scheduler.init().await?;
        Ok(Self {
            orchestrator,
            scheduler,
            store,
        })
    }

    pub async fn start_run(&self, trigger: TriggerType) -> Result<RunId> {
        self.orchestrator.start(trigger).await
    }

    pub fn stop_run(&self) -> bool {
        self.orchestrator.stop()
    }

    pub fn subscribe_output(&self) -> broadcast::Receiver<PipelineEvent> {
        self.orchestrator.broadcaster().subscribe()
    }

    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            is_running: self.orchestrator.is_running(),
            current_step: self.orchestrator.current_step(),
            current_run_id: self.orchestrator.current_run_id(),
        }
    }

    pub async fn scheduler_config(&self) -> Result<SchedulerConfigRecord> {
        self.scheduler.config().await
    }

    pub async fn set_scheduler_config(
        &self,
        enabled: bool,
        cron_expr: &str,
    ) -> Result<SchedulerConfigRecord> {
        self.scheduler.configure(enabled, cron_expr).await
    }

    pub async fn run(&self, id: RunId) -> Result<Option<Run>> {
        self.store.run(id).await
    }

    pub async fn recent_runs(&self, limit: i64) -> Result<Vec<Run>> {
        self.store.recent_runs(limit).await
    }

    /// Tears down the scheduler timer. Any active run keeps driving to its
    /// terminal state; call [`Self::stop_run`] first for a cooperative halt.
    pub async fn shutdown(&self) -> Result<()> {
        self.scheduler.shutdown().await
    }
}

impl fmt::Debug for PipelineService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineService")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
