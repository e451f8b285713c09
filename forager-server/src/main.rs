//! Host binary for the Forager pipeline: wires a store and process runner
//! into the core service, mirrors live output onto the log, and keeps the
//! scheduler alive until shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use forager_core::{
    EventKind, ForagerConfig, InMemoryStore, PipelineService, PipelineStore, PostgresStore,
    ProcessRunner, TokioProcessRunner, TriggerType,
};

#[derive(Parser)]
#[command(name = "forager-server", version, about = "Forager pipeline host")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler loop until interrupted (the default).
    Serve,
    /// Execute one full pipeline run, then exit with its outcome.
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = ForagerConfig::from_env();

    let store = build_store(&config).await?;
    let runner: Arc<dyn ProcessRunner> = Arc::new(TokioProcessRunner);
    let service = Arc::new(
        PipelineService::new(store, runner, &config)
            .await
            .context("failed to initialize pipeline service")?,
    );

    mirror_output(&service);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(service, &config).await,
        Command::Run => run_once(service).await,
    }
}

async fn build_store(config: &ForagerConfig) -> anyhow::Result<Arc<dyn PipelineStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PostgresStore::connect(url)
                .await
                .context("failed to connect to database")?;
            store.migrate().await.context("migration failed")?;
            info!("using postgres run store");
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; run history will not survive restarts");
            Ok(Arc::new(InMemoryStore::default()))
        }
    }
}

/// Mirrors the broadcast stream onto the log so a headless deployment still
/// has the stage output somewhere.
fn mirror_output(service: &Arc<PipelineService>) {
    let mut events = service.subscribe_output();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match event.kind {
                    EventKind::Stdout => info!(target: "pipeline", "{}", event.text.trim_end()),
                    EventKind::Stderr => warn!(target: "pipeline", "{}", event.text.trim_end()),
                    EventKind::Status => info!(target: "pipeline", "{}", event.text),
                    EventKind::Complete => {
                        info!(target: "pipeline", status = %event.text, "run finished")
                    }
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "output mirror fell behind the broadcast")
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

async fn serve(service: Arc<PipelineService>, config: &ForagerConfig) -> anyhow::Result<()> {
    let sched = service.scheduler_config().await?;
    if sched.enabled {
        info!(cron = %sched.cron_expr, "scheduler enabled");
    } else {
        info!("scheduler disabled; runs start on demand only");
    }

    if config.run_on_start {
        match service.start_run(TriggerType::Manual).await {
            Ok(run_id) => info!(%run_id, "startup run triggered"),
            Err(err) => error!(%err, "startup run rejected"),
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    if service.stop_run() {
        info!("waiting for the active run to stop at a stage boundary");
        let drained = tokio::time::timeout(Duration::from_secs(60), async {
            while service.status().is_running {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!("active run did not stop within 60s; exiting anyway");
        }
    }

    service.shutdown().await?;
    Ok(())
}

async fn run_once(service: Arc<PipelineService>) -> anyhow::Result<()> {
    let mut events = service.subscribe_output();
    let run_id = service
        .start_run(TriggerType::Manual)
        .await
        .context("failed to start run")?;
    info!(%run_id, "run started");

    let final_status = loop {
        match events.recv().await {
            Ok(event) if event.kind == EventKind::Complete => break event.text,
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "dropped output while waiting for completion")
            }
            Err(RecvError::Closed) => anyhow::bail!("output stream closed before the run ended"),
        }
    };

    service.shutdown().await?;
    if final_status == "COMPLETED" {
        Ok(())
    } else {
        anyhow::bail!("run {run_id} ended with status {final_status}")
    }
}
