use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::{PipelineError, Result};
use crate::model::{Run, RunCompletion, RunId, RunStatus, SchedulerConfigRecord, TriggerType};
use crate::store::{RunStore, SchedulerConfigStore};

/// The scheduler configuration is a singleton row with this fixed key.
const SCHEDULER_CONFIG_ID: i32 = 1;

/// Postgres-backed store. Queries are runtime-checked so the crate builds
/// without a live database.
#[derive(Clone, Debug)]
pub struct PostgresStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct RunRow {
    id: i64,
    status: String,
    trigger_type: String,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    output: String,
    error_message: Option<String>,
    sellers_processed: i32,
    products_scraped: i32,
}

impl RunRow {
    fn into_run(self) -> Result<Run> {
        Ok(Run {
            id: RunId(self.id),
            status: self.status.parse()?,
            trigger: self.trigger_type.parse()?,
            started_at: self.started_at,
            completed_at: self.completed_at,
            output: self.output,
            error_message: self.error_message,
            sellers_processed: self.sellers_processed,
            products_scraped: self.products_scraped,
        })
    }
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPool::connect(url)
            .await
            .map_err(|e| PipelineError::Storage(format!("failed to connect to postgres: {e}")))?;
        Ok(Self::new(pool))
    }

    /// Applies the embedded migrations (run + scheduler tables).
    pub async fn migrate(&self) -> Result<()> {
        crate::MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| PipelineError::Storage(format!("migration failed: {e}")))
    }

    fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl RunStore for PostgresStore {
    async fn create_run(&self, trigger: TriggerType, started_at: DateTime<Utc>) -> Result<Run> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO pipeline_runs (status, trigger_type, started_at, output)
            VALUES ($1, $2, $3, '')
            RETURNING id
            "#,
        )
        .bind(RunStatus::Running.as_str())
        .bind(trigger.as_str())
        .bind(started_at)
        .fetch_one(self.pool())
        .await
        .map_err(|e| PipelineError::Storage(format!("failed to create run: {e}")))?;

        Ok(Run {
            id: RunId(id),
            status: RunStatus::Running,
            trigger,
            started_at,
            completed_at: None,
            output: String::new(),
            error_message: None,
            sellers_processed: 0,
            products_scraped: 0,
        })
    }

    async fn update_status(&self, id: RunId, status: RunStatus) -> Result<()> {
        let result = sqlx::query("UPDATE pipeline_runs SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(id.0)
            .execute(self.pool())
            .await
            .map_err(|e| PipelineError::Storage(format!("failed to update run {id}: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::RunNotFound(id));
        }
        Ok(())
    }

    async fn complete_run(&self, id: RunId, completion: RunCompletion) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE pipeline_runs
            SET status = $1,
                completed_at = $2,
                error_message = $3,
                output = $4,
                sellers_processed = $5,
                products_scraped = $6
            WHERE id = $7
            "#,
        )
        .bind(completion.status.as_str())
        .bind(completion.completed_at)
        .bind(completion.error_message)
        .bind(completion.output)
        .bind(completion.stats.sellers_processed)
        .bind(completion.stats.products_scraped)
        .bind(id.0)
        .execute(self.pool())
        .await
        .map_err(|e| PipelineError::Storage(format!("failed to complete run {id}: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::RunNotFound(id));
        }
        Ok(())
    }

    async fn run(&self, id: RunId) -> Result<Option<Run>> {
        let row = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT id, status, trigger_type, started_at, completed_at,
                   output, error_message, sellers_processed, products_scraped
            FROM pipeline_runs
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| PipelineError::Storage(format!("failed to fetch run {id}: {e}")))?;

        row.map(RunRow::into_run).transpose()
    }

    async fn recent_runs(&self, limit: i64) -> Result<Vec<Run>> {
        let rows = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT id, status, trigger_type, started_at, completed_at,
                   output, error_message, sellers_processed, products_scraped
            FROM pipeline_runs
            ORDER BY id DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .map_err(|e| PipelineError::Storage(format!("failed to list runs: {e}")))?;

        rows.into_iter().map(RunRow::into_run).collect()
    }

    async fn count_runs(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM pipeline_runs")
            .fetch_one(self.pool())
            .await
            .map_err(|e| PipelineError::Storage(format!("failed to count runs: {e}")))
    }
}

#[async_trait]
impl SchedulerConfigStore for PostgresStore {
    async fn scheduler_config(&self) -> Result<SchedulerConfigRecord> {
        let existing = sqlx::query_as::<_, (bool, String)>(
            "SELECT enabled, cron_expr FROM scheduler_config WHERE id = $1",
        )
        .bind(SCHEDULER_CONFIG_ID)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| PipelineError::Storage(format!("failed to read scheduler config: {e}")))?;

        if let Some((enabled, cron_expr)) = existing {
            return Ok(SchedulerConfigRecord { enabled, cron_expr });
        }

        let default = SchedulerConfigRecord::disabled_default();
        sqlx::query(
            r#"
            INSERT INTO scheduler_config (id, enabled, cron_expr)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(SCHEDULER_CONFIG_ID)
        .bind(default.enabled)
        .bind(&default.cron_expr)
        .execute(self.pool())
        .await
        .map_err(|e| {
            PipelineError::Storage(format!("failed to seed scheduler config: {e}"))
        })?;

        Ok(default)
    }

    async fn save_scheduler_config(&self, record: &SchedulerConfigRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scheduler_config (id, enabled, cron_expr)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE
            SET enabled = EXCLUDED.enabled, cron_expr = EXCLUDED.cron_expr
            "#,
        )
        .bind(SCHEDULER_CONFIG_ID)
        .bind(record.enabled)
        .bind(&record.cron_expr)
        .execute(self.pool())
        .await
        .map_err(|e| PipelineError::Storage(format!("failed to save scheduler config: {e}")))?;
        Ok(())
    }
}
