//! The pipeline state machine: sequences scrape → enrich → database-sync
//! exactly once at a time, streams output to the broadcaster, and records
//! the outcome. Every exit branch (success, each failure kind, abort, and
//! unexpected internal errors) converges on a single finalization path that
//! persists the run and resets the in-memory state to idle.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tracing::{error, info, warn};

use crate::broadcast::OutputBroadcaster;
use crate::config::StageCommands;
use crate::error::{PipelineError, Result};
use crate::events::PipelineEvent;
use crate::model::{PipelineStep, RunCompletion, RunId, RunStatus, TriggerType};
use crate::process::ProcessRunner;
use crate::stats;
use crate::store::PipelineStore;

const ABORT_MESSAGE: &str = "run aborted by user request";

/// Cheaply cloneable handle; all clones share one state machine.
#[derive(Clone)]
pub struct PipelineOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn PipelineStore>,
    runner: Arc<dyn ProcessRunner>,
    broadcaster: OutputBroadcaster,
    stages: StageCommands,
    auth_marker: String,
    state: Mutex<RunState>,
    abort_requested: AtomicBool,
}

#[derive(Clone, Copy, Debug, Default)]
struct RunState {
    step: PipelineStep,
    current_run: Option<RunId>,
}

/// Where a drive ended up; consumed by finalization.
struct RunOutcome {
    status: RunStatus,
    error_message: Option<String>,
}

impl RunOutcome {
    fn completed() -> Self {
        Self {
            status: RunStatus::Completed,
            error_message: None,
        }
    }

    fn failed(status: RunStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            error_message: Some(message.into()),
        }
    }
}

impl PipelineOrchestrator {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        runner: Arc<dyn ProcessRunner>,
        broadcaster: OutputBroadcaster,
        stages: StageCommands,
        auth_marker: String,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                runner,
                broadcaster,
                stages,
                auth_marker,
                state: Mutex::new(RunState::default()),
                abort_requested: AtomicBool::new(false),
            }),
        }
    }

    /// Accepts a new run if none is active, creates its record, and drives
    /// the stages on a spawned task. Returns the run id immediately.
    ///
    /// A manual start and a scheduled tick racing for the same instant
    /// serialize on the state lock: exactly one observes `Idle` and claims
    /// the slot, the other gets `AlreadyRunning`.
    pub async fn start(&self, trigger: TriggerType) -> Result<RunId> {
        {
            let mut state = self.inner.lock_state();
            if state.step != PipelineStep::Idle {
                return Err(PipelineError::AlreadyRunning);
            }
            // Claim the slot before the first await so no second start can
            // slip in while the record is being created.
            state.step = PipelineStep::Scraping;
            state.current_run = None;
            self.inner.abort_requested.store(false, Ordering::SeqCst);
        }

        let run = match self.inner.store.create_run(trigger, Utc::now()).await {
            Ok(run) => run,
            Err(err) => {
                let mut state = self.inner.lock_state();
                *state = RunState::default();
                self.inner.abort_requested.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };
        self.inner.lock_state().current_run = Some(run.id);
        info!(run_id = %run.id, trigger = %trigger, "pipeline run accepted");

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.drive(run.id).await;
        });
        Ok(run.id)
    }

    /// Requests a cooperative abort. The in-flight stage is allowed to
    /// finish; the flag is checked at the next stage boundary. Returns
    /// `false` when no run is active.
    pub fn stop(&self) -> bool {
        {
            // Check and set under one guard so a run finalizing concurrently
            // cannot leave a stale abort flag behind while idle.
            let state = self.inner.lock_state();
            if state.step == PipelineStep::Idle {
                return false;
            }
            self.inner.abort_requested.store(true, Ordering::SeqCst);
        }
        warn!("pipeline abort requested");
        self.inner.broadcaster.publish(PipelineEvent::status(
            "abort requested; the pipeline stops after the current stage completes",
        ));
        true
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock_state().step != PipelineStep::Idle
    }

    pub fn current_step(&self) -> PipelineStep {
        self.inner.lock_state().step
    }

    pub fn current_run_id(&self) -> Option<RunId> {
        self.inner.lock_state().current_run
    }

    pub fn broadcaster(&self) -> &OutputBroadcaster {
        &self.inner.broadcaster
    }
}

impl fmt::Debug for PipelineOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock_state();
        f.debug_struct("PipelineOrchestrator")
            .field("step", &state.step)
            .field("current_run", &state.current_run)
            .finish()
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_step(&self, step: PipelineStep) {
        self.lock_state().step = step;
    }

    fn abort_pending(&self) -> bool {
        self.abort_requested.load(Ordering::SeqCst)
    }

    async fn drive(self: Arc<Self>, run_id: RunId) {
        let mut transcript = String::new();
        let outcome = match self.run_stages(run_id, &mut transcript).await {
            Ok(outcome) => outcome,
            // Store failures and other surprises mid-run become a generic
            // failure and still flow through finalization.
            Err(err) => {
                error!(run_id = %run_id, error = %err, "pipeline run hit an internal error");
                RunOutcome::failed(RunStatus::Failed, format!("internal error: {err}"))
            }
        };
        self.finalize(run_id, outcome, transcript).await;
    }

    async fn run_stages(&self, run_id: RunId, transcript: &mut String) -> Result<RunOutcome> {
        self.broadcaster.publish(PipelineEvent::status(format!(
            "Stage 1/3: scraping seller listings ({})",
            self.stages.scrape.display_line()
        )));
        let scrape = self.runner.run(&self.stages.scrape, &self.broadcaster).await;
        transcript.push_str(&scrape.combined_output);

        // The auth marker outranks the exit code: a scraper that bails out
        // asking for interactive login may still exit zero.
        if scrape.combined_output.contains(&self.auth_marker) {
            return Ok(RunOutcome::failed(
                RunStatus::AuthRequired,
                "scraper requires interactive authentication",
            ));
        }
        if !scrape.success() {
            return Ok(RunOutcome::failed(
                RunStatus::Failed,
                format!("scrape stage exited with code {}", scrape.exit_code),
            ));
        }
        if self.abort_pending() {
            return Ok(RunOutcome::failed(RunStatus::Failed, ABORT_MESSAGE));
        }

        self.set_step(PipelineStep::Enriching);
        self.store.update_status(run_id, RunStatus::Enriching).await?;
        self.broadcaster.publish(PipelineEvent::status(format!(
            "Stage 2/3: enriching product data ({})",
            self.stages.enrich.display_line()
        )));
        let enrich = self.runner.run(&self.stages.enrich, &self.broadcaster).await;
        transcript.push_str(&enrich.combined_output);

        if !enrich.success() {
            return Ok(RunOutcome::failed(
                RunStatus::EnrichmentFailed,
                format!("enrichment stage exited with code {}", enrich.exit_code),
            ));
        }
        if self.abort_pending() {
            return Ok(RunOutcome::failed(RunStatus::Failed, ABORT_MESSAGE));
        }

        self.set_step(PipelineStep::Processing);
        self.store.update_status(run_id, RunStatus::Processing).await?;
        self.broadcaster.publish(PipelineEvent::status(format!(
            "Stage 3/3: syncing products to the database ({})",
            self.stages.sync.display_line()
        )));
        let sync = self.runner.run(&self.stages.sync, &self.broadcaster).await;
        transcript.push_str(&sync.combined_output);

        if !sync.success() {
            return Ok(RunOutcome::failed(
                RunStatus::ProcessingFailed,
                format!("database sync stage exited with code {}", sync.exit_code),
            ));
        }

        Ok(RunOutcome::completed())
    }

    /// The single terminal path: persist, announce, reset. A store failure
    /// here is logged and never blocks the in-memory reset.
    async fn finalize(&self, run_id: RunId, outcome: RunOutcome, transcript: String) {
        let parsed = stats::extract_run_stats(&transcript);
        let completion = RunCompletion {
            status: outcome.status,
            completed_at: Utc::now(),
            error_message: outcome.error_message.clone(),
            output: transcript,
            stats: parsed,
        };
        if let Err(err) = self.store.complete_run(run_id, completion).await {
            error!(run_id = %run_id, error = %err, "failed to persist final run record");
        }

        let summary = match &outcome.error_message {
            Some(message) => format!(
                "Run {run_id} finished with status {}: {message}",
                outcome.status.as_str()
            ),
            None => format!(
                "Run {run_id} finished with status {} ({} sellers processed, {} products saved)",
                outcome.status.as_str(),
                parsed.sellers_processed,
                parsed.products_scraped
            ),
        };
        self.broadcaster.publish(PipelineEvent::status(summary));
        self.broadcaster
            .publish(PipelineEvent::complete(outcome.status.as_str()));

        {
            let mut state = self.lock_state();
            *state = RunState::default();
            self.abort_requested.store(false, Ordering::SeqCst);
        }
        info!(run_id = %run_id, status = outcome.status.as_str(), "pipeline run finalized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use tokio::sync::Notify;
    use tokio::time::{sleep, timeout};

    use crate::events::EventKind;
    use crate::model::{Run, SchedulerConfigRecord};
    use crate::process::{CommandSpec, StageOutput};
    use crate::store::memory::InMemoryStore;
    use crate::store::{RunStore, SchedulerConfigStore};

    /// Returns canned stage results in order and records which programs ran.
    /// With a gate, the Nth invoked stage blocks until the test releases it.
    struct ScriptedRunner {
        outputs: StdMutex<VecDeque<StageOutput>>,
        calls: StdMutex<Vec<String>>,
        gate: Option<(usize, Arc<Notify>)>,
    }

    impl ScriptedRunner {
        fn new(outputs: Vec<StageOutput>) -> Self {
            Self {
                outputs: StdMutex::new(outputs.into()),
                calls: StdMutex::new(Vec::new()),
                gate: None,
            }
        }

        fn gated(outputs: Vec<StageOutput>, gate: Arc<Notify>) -> Self {
            Self::gated_at(outputs, 1, gate)
        }

        fn gated_at(outputs: Vec<StageOutput>, stage: usize, gate: Arc<Notify>) -> Self {
            Self {
                gate: Some((stage, gate)),
                ..Self::new(outputs)
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ProcessRunner for ScriptedRunner {
        async fn run(&self, spec: &CommandSpec, output: &OutputBroadcaster) -> StageOutput {
            let call_index = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(spec.program.clone());
                calls.len()
            };
            if let Some((stage, gate)) = &self.gate {
                if call_index == *stage {
                    gate.notified().await;
                }
            }
            let result = self
                .outputs
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(StageOutput {
                    exit_code: 0,
                    combined_output: String::new(),
                });
            for line in result.combined_output.lines() {
                output.publish(PipelineEvent::stdout(line));
            }
            result
        }
    }

    fn ok_stage(text: &str) -> StageOutput {
        StageOutput {
            exit_code: 0,
            combined_output: text.to_string(),
        }
    }

    fn failed_stage(code: i32) -> StageOutput {
        StageOutput {
            exit_code: code,
            combined_output: String::new(),
        }
    }

    fn stages() -> StageCommands {
        StageCommands {
            scrape: CommandSpec::new("scrape", Vec::<String>::new(), "."),
            enrich: CommandSpec::new("enrich", Vec::<String>::new(), "."),
            sync: CommandSpec::new("sync-db", Vec::<String>::new(), "."),
        }
    }

    fn orchestrator_with(
        store: Arc<dyn PipelineStore>,
        runner: Arc<ScriptedRunner>,
    ) -> PipelineOrchestrator {
        PipelineOrchestrator::new(
            store,
            runner,
            OutputBroadcaster::new(256),
            stages(),
            "AUTH REQUIRED".into(),
        )
    }

    fn fixture(
        outputs: Vec<StageOutput>,
    ) -> (PipelineOrchestrator, Arc<InMemoryStore>, Arc<ScriptedRunner>) {
        let store = Arc::new(InMemoryStore::default());
        let runner = Arc::new(ScriptedRunner::new(outputs));
        let orchestrator = orchestrator_with(store.clone(), runner.clone());
        (orchestrator, store, runner)
    }

    async fn wait_for_complete(
        rx: &mut tokio::sync::broadcast::Receiver<PipelineEvent>,
    ) -> PipelineEvent {
        timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Ok(event) if event.kind == EventKind::Complete => return event,
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(err) => panic!("broadcast closed before complete: {err}"),
                }
            }
        })
        .await
        .expect("run did not complete in time")
    }

    async fn wait_until_idle(orchestrator: &PipelineOrchestrator) {
        timeout(Duration::from_secs(5), async {
            while orchestrator.is_running() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("orchestrator did not return to idle");
    }

    async fn stored_run(store: &InMemoryStore, id: RunId) -> Run {
        store.run(id).await.expect("store read").expect("run exists")
    }

    #[tokio::test]
    async fn successful_run_completes_and_parses_stats() {
        let (orchestrator, store, runner) = fixture(vec![
            ok_stage("Visited 7 seller(s)\n"),
            ok_stage("enrichment done\n"),
            ok_stage("Saved 42 products\n"),
        ]);
        let mut events = orchestrator.broadcaster().subscribe();

        let run_id = orchestrator
            .start(TriggerType::Manual)
            .await
            .expect("start accepted");
        let complete = wait_for_complete(&mut events).await;
        wait_until_idle(&orchestrator).await;

        assert_eq!(complete.text, "COMPLETED");
        assert_eq!(runner.calls(), vec!["scrape", "enrich", "sync-db"]);

        let run = stored_run(&store, run_id).await;
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.trigger, TriggerType::Manual);
        assert!(run.completed_at.is_some());
        assert!(run.error_message.is_none());
        assert_eq!(run.sellers_processed, 7);
        assert_eq!(run.products_scraped, 42);
        assert!(run.output.contains("Visited 7 seller(s)"));
        assert!(run.output.contains("Saved 42 products"));

        assert!(orchestrator.current_run_id().is_none());
        assert_eq!(orchestrator.current_step(), PipelineStep::Idle);

        // Exactly one terminal event per run.
        let mut extra_completes = 0;
        while let Ok(event) = events.try_recv() {
            if event.kind == EventKind::Complete {
                extra_completes += 1;
            }
        }
        assert_eq!(extra_completes, 0);
    }

    #[tokio::test]
    async fn second_start_is_rejected_while_active() {
        let gate = Arc::new(Notify::new());
        let store = Arc::new(InMemoryStore::default());
        let runner = Arc::new(ScriptedRunner::gated(
            vec![ok_stage(""), ok_stage(""), ok_stage("")],
            gate.clone(),
        ));
        let orchestrator = orchestrator_with(store.clone(), runner.clone());
        let mut events = orchestrator.broadcaster().subscribe();

        orchestrator
            .start(TriggerType::Manual)
            .await
            .expect("first start accepted");
        let rejection = orchestrator.start(TriggerType::Scheduled).await;
        assert!(matches!(rejection, Err(PipelineError::AlreadyRunning)));
        // The rejected start must not have created a second record.
        assert_eq!(store.count_runs().await.expect("count"), 1);

        gate.notify_one();
        wait_for_complete(&mut events).await;
        wait_until_idle(&orchestrator).await;
    }

    #[tokio::test]
    async fn concurrent_starts_admit_exactly_one() {
        let gate = Arc::new(Notify::new());
        let store = Arc::new(InMemoryStore::default());
        let runner = Arc::new(ScriptedRunner::gated(
            vec![ok_stage(""), ok_stage(""), ok_stage("")],
            gate.clone(),
        ));
        let orchestrator = orchestrator_with(store.clone(), runner);
        let mut events = orchestrator.broadcaster().subscribe();

        let (a, b) = tokio::join!(
            orchestrator.start(TriggerType::Manual),
            orchestrator.start(TriggerType::Scheduled),
        );
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
        assert_eq!(store.count_runs().await.expect("count"), 1);

        gate.notify_one();
        wait_for_complete(&mut events).await;
        wait_until_idle(&orchestrator).await;
    }

    #[tokio::test]
    async fn auth_marker_halts_before_enrichment() {
        let (orchestrator, store, runner) = fixture(vec![ok_stage(
            "login page detected: AUTH REQUIRED, aborting\n",
        )]);
        let mut events = orchestrator.broadcaster().subscribe();

        let run_id = orchestrator
            .start(TriggerType::Manual)
            .await
            .expect("start accepted");
        let complete = wait_for_complete(&mut events).await;
        wait_until_idle(&orchestrator).await;

        assert_eq!(complete.text, "AUTH_REQUIRED");
        // Stages 2 and 3 never spawned.
        assert_eq!(runner.calls(), vec!["scrape"]);

        let run = stored_run(&store, run_id).await;
        assert_eq!(run.status, RunStatus::AuthRequired);
        assert!(run.completed_at.is_some());
        assert!(run
            .error_message
            .as_deref()
            .is_some_and(|m| m.contains("authentication")));
    }

    #[tokio::test]
    async fn scrape_failure_records_exit_code() {
        let (orchestrator, store, runner) = fixture(vec![failed_stage(4)]);
        let mut events = orchestrator.broadcaster().subscribe();

        let run_id = orchestrator
            .start(TriggerType::Manual)
            .await
            .expect("start accepted");
        let complete = wait_for_complete(&mut events).await;
        wait_until_idle(&orchestrator).await;

        assert_eq!(complete.text, "FAILED");
        assert_eq!(runner.calls().len(), 1);
        let run = stored_run(&store, run_id).await;
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run
            .error_message
            .as_deref()
            .is_some_and(|m| m.contains("code 4")));
    }

    #[tokio::test]
    async fn enrichment_failure_skips_sync_stage() {
        let (orchestrator, store, runner) =
            fixture(vec![ok_stage("3 sellers\n"), failed_stage(2)]);
        let mut events = orchestrator.broadcaster().subscribe();

        let run_id = orchestrator
            .start(TriggerType::Scheduled)
            .await
            .expect("start accepted");
        let complete = wait_for_complete(&mut events).await;
        wait_until_idle(&orchestrator).await;

        assert_eq!(complete.text, "ENRICHMENT_FAILED");
        assert_eq!(runner.calls(), vec!["scrape", "enrich"]);
        let run = stored_run(&store, run_id).await;
        assert_eq!(run.status, RunStatus::EnrichmentFailed);
        assert!(run.completed_at.is_some());
        assert_eq!(run.trigger, TriggerType::Scheduled);
        // Stats still parse from the cumulative output of the stages that ran.
        assert_eq!(run.sellers_processed, 3);
    }

    #[tokio::test]
    async fn sync_failure_records_processing_failed() {
        let (orchestrator, store, runner) = fixture(vec![
            ok_stage(""),
            ok_stage(""),
            failed_stage(5),
        ]);
        let mut events = orchestrator.broadcaster().subscribe();

        let run_id = orchestrator
            .start(TriggerType::Manual)
            .await
            .expect("start accepted");
        let complete = wait_for_complete(&mut events).await;
        wait_until_idle(&orchestrator).await;

        assert_eq!(complete.text, "PROCESSING_FAILED");
        assert_eq!(runner.calls().len(), 3);
        let run = stored_run(&store, run_id).await;
        assert_eq!(run.status, RunStatus::ProcessingFailed);
    }

    #[tokio::test]
    async fn stop_during_scrape_aborts_at_the_stage_boundary() {
        let gate = Arc::new(Notify::new());
        let store = Arc::new(InMemoryStore::default());
        let runner = Arc::new(ScriptedRunner::gated(vec![ok_stage("clean exit\n")], gate.clone()));
        let orchestrator = orchestrator_with(store.clone(), runner.clone());
        let mut events = orchestrator.broadcaster().subscribe();

        let run_id = orchestrator
            .start(TriggerType::Manual)
            .await
            .expect("start accepted");

        // Let the scrape stage begin before requesting the abort.
        timeout(Duration::from_secs(5), async {
            while runner.calls().is_empty() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("scrape stage never started");

        assert!(orchestrator.stop());
        gate.notify_one();

        let complete = wait_for_complete(&mut events).await;
        wait_until_idle(&orchestrator).await;

        // Stage 1 exited zero, but the abort wins at the boundary.
        assert_eq!(complete.text, "FAILED");
        assert_eq!(runner.calls(), vec!["scrape"]);
        let run = stored_run(&store, run_id).await;
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run
            .error_message
            .as_deref()
            .is_some_and(|m| m.contains("aborted")));
    }

    #[tokio::test]
    async fn stop_during_enrichment_skips_the_sync_stage() {
        let gate = Arc::new(Notify::new());
        let store = Arc::new(InMemoryStore::default());
        let runner = Arc::new(ScriptedRunner::gated_at(
            vec![ok_stage("2 sellers\n"), ok_stage("enriched\n")],
            2,
            gate.clone(),
        ));
        let orchestrator = orchestrator_with(store.clone(), runner.clone());
        let mut events = orchestrator.broadcaster().subscribe();

        let run_id = orchestrator
            .start(TriggerType::Manual)
            .await
            .expect("start accepted");

        // Let the enrichment stage begin before requesting the abort.
        timeout(Duration::from_secs(5), async {
            while runner.calls().len() < 2 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("enrichment stage never started");
        assert_eq!(orchestrator.current_step(), PipelineStep::Enriching);

        assert!(orchestrator.stop());
        gate.notify_one();

        let complete = wait_for_complete(&mut events).await;
        wait_until_idle(&orchestrator).await;

        // Stage 2 exited zero; the abort is honored before stage 3 spawns.
        assert_eq!(complete.text, "FAILED");
        assert_eq!(runner.calls(), vec!["scrape", "enrich"]);
        let run = stored_run(&store, run_id).await;
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run
            .error_message
            .as_deref()
            .is_some_and(|m| m.contains("aborted")));
    }

    #[tokio::test]
    async fn stop_after_a_finished_run_is_refused_and_leaves_no_stale_abort() {
        let (orchestrator, store, _runner) = fixture(vec![
            ok_stage(""),
            ok_stage(""),
            ok_stage(""),
        ]);
        let mut events = orchestrator.broadcaster().subscribe();

        orchestrator
            .start(TriggerType::Manual)
            .await
            .expect("start accepted");
        wait_for_complete(&mut events).await;
        wait_until_idle(&orchestrator).await;

        assert!(!orchestrator.stop());

        // Had a stale abort flag survived, this run would halt at the first
        // stage boundary instead of completing.
        orchestrator
            .start(TriggerType::Manual)
            .await
            .expect("second start accepted");
        let complete = wait_for_complete(&mut events).await;
        wait_until_idle(&orchestrator).await;
        assert_eq!(complete.text, "COMPLETED");
        assert_eq!(store.count_runs().await.expect("count"), 2);
    }

    #[tokio::test]
    async fn stop_while_idle_returns_false() {
        let (orchestrator, _store, _runner) = fixture(vec![]);
        assert!(!orchestrator.stop());
        assert!(!orchestrator.is_running());
        assert_eq!(orchestrator.current_step(), PipelineStep::Idle);
    }

    /// Store whose mid-run status updates fail, simulating an unexpected
    /// internal error between stages.
    struct FlakyStore {
        inner: InMemoryStore,
    }

    #[async_trait]
    impl RunStore for FlakyStore {
        async fn create_run(
            &self,
            trigger: TriggerType,
            started_at: DateTime<Utc>,
        ) -> crate::Result<Run> {
            self.inner.create_run(trigger, started_at).await
        }

        async fn update_status(&self, _id: RunId, _status: RunStatus) -> crate::Result<()> {
            Err(PipelineError::Storage("connection reset".into()))
        }

        async fn complete_run(&self, id: RunId, completion: RunCompletion) -> crate::Result<()> {
            self.inner.complete_run(id, completion).await
        }

        async fn run(&self, id: RunId) -> crate::Result<Option<Run>> {
            self.inner.run(id).await
        }

        async fn recent_runs(&self, limit: i64) -> crate::Result<Vec<Run>> {
            self.inner.recent_runs(limit).await
        }

        async fn count_runs(&self) -> crate::Result<i64> {
            self.inner.count_runs().await
        }
    }

    #[async_trait]
    impl SchedulerConfigStore for FlakyStore {
        async fn scheduler_config(&self) -> crate::Result<SchedulerConfigRecord> {
            self.inner.scheduler_config().await
        }

        async fn save_scheduler_config(
            &self,
            record: &SchedulerConfigRecord,
        ) -> crate::Result<()> {
            self.inner.save_scheduler_config(record).await
        }
    }

    #[tokio::test]
    async fn internal_error_still_reaches_finalization() {
        let store = Arc::new(FlakyStore {
            inner: InMemoryStore::default(),
        });
        let runner = Arc::new(ScriptedRunner::new(vec![ok_stage("fine\n")]));
        let orchestrator = orchestrator_with(store.clone(), runner);
        let mut events = orchestrator.broadcaster().subscribe();

        let run_id = orchestrator
            .start(TriggerType::Manual)
            .await
            .expect("start accepted");
        let complete = wait_for_complete(&mut events).await;
        wait_until_idle(&orchestrator).await;

        assert_eq!(complete.text, "FAILED");
        assert!(!orchestrator.is_running());
        assert!(orchestrator.current_run_id().is_none());

        let run = store.run(run_id).await.expect("read").expect("exists");
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run
            .error_message
            .as_deref()
            .is_some_and(|m| m.contains("internal error")));
    }
}
