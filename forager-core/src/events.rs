use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Classifies an event on the output stream.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Stdout,
    Stderr,
    Status,
    Complete,
}

/// One event fanned out to live subscribers: a captured output line, an
/// orchestrator status announcement, or the terminal completion marker whose
/// text is the run's final status string.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub kind: EventKind,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl PipelineEvent {
    pub fn new(kind: EventKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn stdout(text: impl Into<String>) -> Self {
        Self::new(EventKind::Stdout, text)
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self::new(EventKind::Stderr, text)
    }

    pub fn status(text: impl Into<String>) -> Self {
        Self::new(EventKind::Status, text)
    }

    pub fn complete(final_status: impl Into<String>) -> Self {
        Self::new(EventKind::Complete, final_status)
    }
}
