use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::broadcast::OutputBroadcaster;
use crate::events::{EventKind, PipelineEvent};

/// One external stage command: a program, its arguments, and the directory
/// it runs in. The command inherits the caller's environment.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

impl CommandSpec {
    pub fn new(
        program: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            working_dir: working_dir.into(),
        }
    }

    /// Splits a whitespace-separated command line into program + args.
    /// Returns `None` for an empty line.
    pub fn parse_line(line: &str, working_dir: impl Into<PathBuf>) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let program = parts.next()?;
        Some(Self::new(program, parts, working_dir))
    }

    /// Human-readable command line for logs and status events.
    pub fn display_line(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// What a finished stage resolves to. Failure is carried solely in the exit
/// code; running a stage never produces an `Err`.
#[derive(Clone, Debug)]
pub struct StageOutput {
    pub exit_code: i32,
    pub combined_output: String,
}

impl StageOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Injectable seam around process spawning so the orchestrator's state
/// machine is testable with scripted exit codes and output.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Runs the command to completion, publishing each captured stdout/stderr
    /// line to `output` as it arrives and returning the exit code plus the
    /// full combined text. Spawn failure is reported as exit code 1 with a
    /// synthetic stderr line, never as an error.
    async fn run(&self, spec: &CommandSpec, output: &OutputBroadcaster) -> StageOutput;
}

/// Production runner on `tokio::process`. No timeout of its own: it waits
/// until the child exits.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioProcessRunner;

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, spec: &CommandSpec, output: &OutputBroadcaster) -> StageOutput {
        debug!(command = %spec.display_line(), dir = %spec.working_dir.display(), "spawning stage command");

        let mut child = match Command::new(&spec.program)
            .args(&spec.args)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                let message = format!("failed to spawn {}: {err}", spec.program);
                warn!("{message}");
                output.publish(PipelineEvent::stderr(message.clone()));
                return StageOutput {
                    exit_code: 1,
                    combined_output: format!("{message}\n"),
                };
            }
        };

        let (tx, mut rx) = mpsc::channel::<(EventKind, String)>(64);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, EventKind::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, EventKind::Stderr, tx.clone()));
        }
        drop(tx);

        // Both reader tasks close their sender at pipe EOF, which ends this
        // loop; only then is the child reaped.
        let mut combined = String::new();
        while let Some((kind, line)) = rx.recv().await {
            combined.push_str(&line);
            combined.push('\n');
            output.publish(PipelineEvent::new(kind, line));
        }

        let exit_code = match child.wait().await {
            // A signal-killed child has no code; -1 keeps non-zero = failure.
            Ok(status) => status.code().unwrap_or(-1),
            Err(err) => {
                let message = format!("failed to wait on {}: {err}", spec.program);
                warn!("{message}");
                output.publish(PipelineEvent::stderr(message.clone()));
                combined.push_str(&message);
                combined.push('\n');
                1
            }
        };

        debug!(command = %spec.display_line(), exit_code, "stage command exited");
        StageOutput {
            exit_code,
            combined_output: combined,
        }
    }
}

async fn forward_lines<R>(reader: R, kind: EventKind, tx: mpsc::Sender<(EventKind, String)>)
where
    R: AsyncRead + Unpin + Send,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send((kind, line)).await.is_err() {
            break;
        }
    }
}
