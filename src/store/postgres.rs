//! PostgreSQL-backed catalog and run/schedule store.
//!
//! Destination results are kept as a JSON text column; the structured
//! [`DestinationResults`] map only exists on the Rust side of this adapter.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, FromRow, PgPool};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, instrument};

use super::{BackupStore, Catalog};
use crate::errors::{AppError, Result};
use crate::models::{
    BackupRun, DatabaseInfo, Destination, DestinationResults, RunStatus, Schedule,
};

const SCHEMA_SQL: &str = include_str!("../../migrations/001_schema.sql");

pub struct PgStore {
    pool: PgPool,
}

#[derive(Debug, FromRow)]
struct DatabaseRow {
    id: i64,
    name: String,
    db_type: String,
    host: String,
    port: i32,
    username: Option<String>,
    password_encrypted: Option<String>,
    database_name: Option<String>,
    project_name: Option<String>,
}

#[derive(Debug, FromRow)]
struct DestinationRow {
    id: i64,
    database_id: i64,
    path: String,
    enabled: bool,
}

#[derive(Debug, FromRow)]
struct ScheduleRow {
    id: i64,
    name: String,
    database_id: i64,
    cron_expression: Option<String>,
    retention_days: Option<i64>,
    max_backups: Option<i64>,
    is_active: bool,
    last_run_at: Option<DateTime<Utc>>,
    next_run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, FromRow)]
struct BackupRow {
    id: i64,
    name: String,
    database_id: i64,
    schedule_id: Option<i64>,
    status: String,
    destination_results: Option<String>,
    file_size: Option<i64>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    duration_seconds: Option<i64>,
}

impl From<DestinationRow> for Destination {
    fn from(row: DestinationRow) -> Self {
        Destination {
            id: row.id,
            database_id: row.database_id,
            path: PathBuf::from(row.path),
            enabled: row.enabled,
        }
    }
}

impl From<ScheduleRow> for Schedule {
    fn from(row: ScheduleRow) -> Self {
        Schedule {
            id: row.id,
            name: row.name,
            database_id: row.database_id,
            cron_expression: row.cron_expression,
            is_active: row.is_active,
            retention_days: row.retention_days,
            max_backups: row.max_backups,
            last_run_at: row.last_run_at,
            next_run_at: row.next_run_at,
        }
    }
}

impl TryFrom<BackupRow> for BackupRun {
    type Error = AppError;

    fn try_from(row: BackupRow) -> Result<Self> {
        Ok(BackupRun {
            id: row.id,
            name: row.name,
            database_id: row.database_id,
            schedule_id: row.schedule_id,
            status: row.status.parse()?,
            destination_results: decode_results(row.destination_results.as_deref())?,
            file_size: row.file_size.map(|s| s.max(0) as u64),
            error_message: row.error_message,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            duration_seconds: row.duration_seconds,
        })
    }
}

fn decode_results(raw: Option<&str>) -> Result<DestinationResults> {
    match raw.map(str::trim) {
        None | Some("") => Ok(DestinationResults::new()),
        Some(text) => Ok(serde_json::from_str(text)?),
    }
}

fn encode_results(results: &DestinationResults) -> Result<Option<String>> {
    if results.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::to_string(results)?))
}

/// Stored statuses an `UPDATE` to `next` may overwrite.
fn predecessor_names(next: RunStatus) -> Vec<String> {
    RunStatus::predecessors_of(next)
        .into_iter()
        .map(|s| s.as_str().to_string())
        .collect()
}

const BACKUP_COLUMNS: &str = "id, name, database_id, schedule_id, status, destination_results, \
     file_size, error_message, created_at, started_at, completed_at, duration_seconds";

const SCHEDULE_COLUMNS: &str = "id, name, database_id, cron_expression, retention_days, \
     max_backups, is_active, last_run_at, next_run_at";

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await?;
        info!(url = %redact_url(database_url), "Connected to backup store");
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the store's tables when they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<()> {
        self.pool.execute(SCHEMA_SQL).await?;
        Ok(())
    }
}

/// Strips the password from a connection URL before it is logged.
pub fn redact_url(database_url: &str) -> String {
    match url::Url::parse(database_url) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            parsed.to_string()
        }
        Err(_) => "<unparseable url>".to_string(),
    }
}

#[async_trait]
impl Catalog for PgStore {
    #[instrument(skip(self), fields(db.system = "postgresql", db.sql.table = "databases"))]
    async fn get_database(&self, database_id: i64) -> Result<DatabaseInfo> {
        let row = sqlx::query_as::<_, DatabaseRow>(
            r#"
            SELECT d.id, d.name, d.db_type, d.host, d.port, d.username, d.password_encrypted,
                   d.database_name, g.name AS project_name
            FROM databases d
            LEFT JOIN groups g ON g.id = d.group_id
            WHERE d.id = $1
            "#,
        )
        .bind(database_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::not_found(format!("Database {}", database_id)))?;

        // Decryption at rest belongs to the API layer; the column holds the
        // credential the dump tools receive.
        let password = row.password_encrypted.filter(|stored| !stored.is_empty());
        let port = u16::try_from(row.port)
            .map_err(|_| AppError::Config(format!("Database {} has invalid port {}", row.id, row.port)))?;

        Ok(DatabaseInfo {
            id: row.id,
            database_name: row.database_name.unwrap_or_else(|| row.name.clone()),
            name: row.name,
            engine: row.db_type.parse()?,
            host: row.host,
            port,
            username: row.username,
            password,
            project_name: row.project_name.unwrap_or_else(|| "default".to_string()),
        })
    }

    async fn list_destinations(&self, database_id: i64) -> Result<Vec<Destination>> {
        let rows = sqlx::query_as::<_, DestinationRow>(
            "SELECT id, database_id, path, enabled FROM database_destinations \
             WHERE database_id = $1 ORDER BY id",
        )
        .bind(database_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Destination::from).collect())
    }
}

#[async_trait]
impl BackupStore for PgStore {
    async fn list_active_schedules(&self) -> Result<Vec<Schedule>> {
        let rows = sqlx::query_as::<_, ScheduleRow>(&format!(
            "SELECT {} FROM schedules \
             WHERE is_active = TRUE AND cron_expression IS NOT NULL ORDER BY id",
            SCHEDULE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Schedule::from).collect())
    }

    async fn get_schedule(&self, schedule_id: i64) -> Result<Schedule> {
        sqlx::query_as::<_, ScheduleRow>(&format!(
            "SELECT {} FROM schedules WHERE id = $1",
            SCHEDULE_COLUMNS
        ))
        .bind(schedule_id)
        .fetch_optional(&self.pool)
        .await?
        .map(Schedule::from)
        .ok_or_else(|| AppError::not_found(format!("Schedule {}", schedule_id)))
    }

    #[instrument(skip(self), fields(db.system = "postgresql", db.operation = "UPDATE", db.sql.table = "schedules"))]
    async fn update_schedule_times(
        &self,
        schedule_id: i64,
        last_run_at: Option<DateTime<Utc>>,
        next_run_at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE schedules SET last_run_at = COALESCE($2, last_run_at), next_run_at = $3 \
             WHERE id = $1",
        )
        .bind(schedule_id)
        .bind(last_run_at)
        .bind(next_run_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::not_found(format!("Schedule {}", schedule_id)));
        }
        Ok(())
    }

    #[instrument(skip(self, run), fields(db.system = "postgresql", db.operation = "INSERT", db.sql.table = "backups", run_name = %run.name))]
    async fn create_run(&self, run: BackupRun) -> Result<BackupRun> {
        let row = sqlx::query_as::<_, BackupRow>(&format!(
            r#"
            INSERT INTO backups (
                name, database_id, schedule_id, status, destination_results, file_size,
                error_message, created_at, started_at, completed_at, duration_seconds
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING {}
            "#,
            BACKUP_COLUMNS
        ))
        .bind(&run.name)
        .bind(run.database_id)
        .bind(run.schedule_id)
        .bind(run.status.as_str())
        .bind(encode_results(&run.destination_results)?)
        .bind(run.file_size.map(|s| s as i64))
        .bind(&run.error_message)
        .bind(run.created_at)
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(run.duration_seconds)
        .fetch_one(&self.pool)
        .await?;
        BackupRun::try_from(row)
    }

    async fn get_run(&self, run_id: i64) -> Result<BackupRun> {
        let row = sqlx::query_as::<_, BackupRow>(&format!(
            "SELECT {} FROM backups WHERE id = $1",
            BACKUP_COLUMNS
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::not_found(format!("Backup run {}", run_id)))?;
        BackupRun::try_from(row)
    }

    #[instrument(skip(self, run), fields(db.system = "postgresql", db.operation = "UPDATE", db.sql.table = "backups", run_id = run.id, status = %run.status))]
    async fn update_run(&self, run: &BackupRun) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE backups
            SET status = $2, destination_results = $3, file_size = $4, error_message = $5,
                started_at = $6, completed_at = $7, duration_seconds = $8
            WHERE id = $1 AND status = ANY($9)
            "#,
        )
        .bind(run.id)
        .bind(run.status.as_str())
        .bind(encode_results(&run.destination_results)?)
        .bind(run.file_size.map(|s| s as i64))
        .bind(&run.error_message)
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(run.duration_seconds)
        .bind(predecessor_names(run.status))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let stored = self.get_run(run.id).await?;
            return Err(AppError::InvalidTransition {
                run_id: run.id,
                from: stored.status,
                to: run.status,
            });
        }
        Ok(())
    }

    async fn delete_run(&self, run_id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM backups WHERE id = $1")
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::not_found(format!("Backup run {}", run_id)));
        }
        Ok(())
    }

    async fn list_completed_runs_for_schedule(&self, schedule_id: i64) -> Result<Vec<BackupRun>> {
        let rows = sqlx::query_as::<_, BackupRow>(&format!(
            "SELECT {} FROM backups WHERE schedule_id = $1 AND status = $2 \
             ORDER BY created_at DESC, id DESC",
            BACKUP_COLUMNS
        ))
        .bind(schedule_id)
        .bind(RunStatus::Completed.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(BackupRun::try_from).collect()
    }

    async fn list_runs_for_database(&self, database_id: i64) -> Result<Vec<BackupRun>> {
        let rows = sqlx::query_as::<_, BackupRow>(&format!(
            "SELECT {} FROM backups WHERE database_id = $1 ORDER BY created_at DESC, id DESC",
            BACKUP_COLUMNS
        ))
        .bind(database_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(BackupRun::try_from).collect()
    }
}
