//! # Forager Core
//!
//! Orchestration library for the Forager acquisition pipeline: three
//! external commands (scrape → enrich → database-sync) sequenced exactly
//! once at a time, with live output streaming, durable run records, a cron
//! scheduler, and cooperative mid-run cancellation.
//!
//! The entry point for hosts is [`service::PipelineService`]; the pieces it
//! composes (the [`orchestrator`] state machine, the [`process`] runner
//! seam, the [`broadcast`] fan-out, and the [`store`] ports) are public so
//! they can be wired differently or faked in tests.

pub mod broadcast;
pub mod config;
pub mod error;
pub mod events;
pub mod model;
pub mod orchestrator;
pub mod process;
pub mod scheduler;
pub mod service;
pub mod stats;
pub mod store;

pub use broadcast::OutputBroadcaster;
pub use config::{ForagerConfig, StageCommands, DEFAULT_AUTH_MARKER};
pub use error::{PipelineError, Result};
pub use events::{EventKind, PipelineEvent};
pub use model::{
    PipelineStep, Run, RunCompletion, RunId, RunStats, RunStatus, SchedulerConfigRecord,
    TriggerType,
};
pub use orchestrator::PipelineOrchestrator;
pub use process::{CommandSpec, ProcessRunner, StageOutput, TokioProcessRunner};
pub use scheduler::{validate_cron, PipelineScheduler, DEFAULT_CRON_EXPR};
pub use service::{PipelineService, PipelineStatus};
pub use store::{
    memory::InMemoryStore, postgres::PostgresStore, PipelineStore, RunStore,
    SchedulerConfigStore,
};

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
