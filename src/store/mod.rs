//! Read/write contracts the orchestration core needs from the catalog and the
//! run/schedule store. Every write is a single-record commit.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::Result;
use crate::models::{BackupRun, DatabaseInfo, Destination, Schedule};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Database and destination lookups owned by the API layer.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn get_database(&self, database_id: i64) -> Result<DatabaseInfo>;

    /// All destinations of a database, enabled or not, in configured order.
    async fn list_destinations(&self, database_id: i64) -> Result<Vec<Destination>>;

    async fn list_enabled_destinations(&self, database_id: i64) -> Result<Vec<Destination>> {
        let destinations = self.list_destinations(database_id).await?;
        Ok(destinations.into_iter().filter(|d| d.enabled).collect())
    }
}

#[async_trait]
pub trait BackupStore: Send + Sync {
    /// Active schedules that carry a trigger expression.
    async fn list_active_schedules(&self) -> Result<Vec<Schedule>>;

    async fn get_schedule(&self, schedule_id: i64) -> Result<Schedule>;

    /// Persists fire timestamps. `last_run_at: None` leaves the stored value untouched.
    async fn update_schedule_times(
        &self,
        schedule_id: i64,
        last_run_at: Option<DateTime<Utc>>,
        next_run_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Inserts a run and returns it with its assigned id.
    async fn create_run(&self, run: BackupRun) -> Result<BackupRun>;

    async fn get_run(&self, run_id: i64) -> Result<BackupRun>;

    /// Replaces the stored record. Refuses to touch a record that is already terminal.
    async fn update_run(&self, run: &BackupRun) -> Result<()>;

    async fn delete_run(&self, run_id: i64) -> Result<()>;

    /// COMPLETED runs of one schedule, newest first.
    async fn list_completed_runs_for_schedule(&self, schedule_id: i64) -> Result<Vec<BackupRun>>;

    /// All runs of one database, newest first.
    async fn list_runs_for_database(&self, database_id: i64) -> Result<Vec<BackupRun>>;
}
