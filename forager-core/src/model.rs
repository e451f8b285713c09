use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Monotonically assigned identifier for a pipeline run. Allocated by the
/// store (BIGSERIAL in Postgres, a counter in memory).
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
pub struct RunId(pub i64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Persisted status of a run. The SCREAMING_SNAKE wire strings are what land
/// in the database and in terminal `Complete` events.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Enriching,
    Processing,
    Completed,
    Failed,
    AuthRequired,
    EnrichmentFailed,
    ProcessingFailed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Enriching => "ENRICHING",
            RunStatus::Processing => "PROCESSING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
            RunStatus::AuthRequired => "AUTH_REQUIRED",
            RunStatus::EnrichmentFailed => "ENRICHMENT_FAILED",
            RunStatus::ProcessingFailed => "PROCESSING_FAILED",
        }
    }

    /// A run in a terminal status is never touched again.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            RunStatus::Running | RunStatus::Enriching | RunStatus::Processing
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "RUNNING" => Ok(RunStatus::Running),
            "ENRICHING" => Ok(RunStatus::Enriching),
            "PROCESSING" => Ok(RunStatus::Processing),
            "COMPLETED" => Ok(RunStatus::Completed),
            "FAILED" => Ok(RunStatus::Failed),
            "AUTH_REQUIRED" => Ok(RunStatus::AuthRequired),
            "ENRICHMENT_FAILED" => Ok(RunStatus::EnrichmentFailed),
            "PROCESSING_FAILED" => Ok(RunStatus::ProcessingFailed),
            other => Err(PipelineError::Storage(format!(
                "unrecognized run status: {other}"
            ))),
        }
    }
}

/// How a run was triggered.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerType {
    Manual,
    Scheduled,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Manual => "MANUAL",
            TriggerType::Scheduled => "SCHEDULED",
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerType {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "MANUAL" => Ok(TriggerType::Manual),
            "SCHEDULED" => Ok(TriggerType::Scheduled),
            other => Err(PipelineError::Storage(format!(
                "unrecognized trigger type: {other}"
            ))),
        }
    }
}

/// In-memory progress marker; never persisted. Drives the single-flight
/// guard: any value other than `Idle` rejects a new start.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStep {
    #[default]
    Idle,
    Scraping,
    Enriching,
    Processing,
}

impl PipelineStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStep::Idle => "IDLE",
            PipelineStep::Scraping => "SCRAPING",
            PipelineStep::Enriching => "ENRICHING",
            PipelineStep::Processing => "PROCESSING",
        }
    }
}

impl fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate counters parsed from the cumulative run output. Best effort:
/// anything unparseable stays at zero.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub struct RunStats {
    pub sellers_processed: i32,
    pub products_scraped: i32,
}

/// One row per pipeline execution.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: RunId,
    pub status: RunStatus,
    pub trigger: TriggerType,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output: String,
    pub error_message: Option<String>,
    pub sellers_processed: i32,
    pub products_scraped: i32,
}

/// Final mutation applied to a run by the orchestrator's finalization step.
#[derive(Clone, Debug)]
pub struct RunCompletion {
    pub status: RunStatus,
    pub completed_at: DateTime<Utc>,
    pub error_message: Option<String>,
    pub output: String,
    pub stats: RunStats,
}

/// Singleton scheduler configuration (conceptually row `1`).
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerConfigRecord {
    pub enabled: bool,
    pub cron_expr: String,
}
