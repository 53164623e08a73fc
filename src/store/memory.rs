// backupscheduler/src/store/memory.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

use super::{BackupStore, Catalog};
use crate::config::CatalogSeed;
use crate::errors::{AppError, Result};
use crate::models::{BackupRun, DatabaseInfo, Destination, Schedule};

#[derive(Debug, Default)]
struct Tables {
    databases: HashMap<i64, DatabaseInfo>,
    destinations: Vec<Destination>,
    schedules: HashMap<i64, Schedule>,
    runs: HashMap<i64, BackupRun>,
    next_run_id: i64,
}

/// Process-local store. Each method holds the lock for one whole record
/// operation, so readers never observe a half-applied transition.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: CatalogSeed) -> Self {
        let store = Self::new();
        for database in seed.databases {
            store.insert_database(database);
        }
        for destination in seed.destinations {
            store.insert_destination(destination);
        }
        for schedule in seed.schedules {
            store.insert_schedule(schedule);
        }
        store
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        // A panic while holding the lock cannot leave a record half-written.
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert_database(&self, database: DatabaseInfo) {
        self.lock().databases.insert(database.id, database);
    }

    pub fn insert_destination(&self, destination: Destination) {
        self.lock().destinations.push(destination);
    }

    pub fn insert_schedule(&self, schedule: Schedule) {
        self.lock().schedules.insert(schedule.id, schedule);
    }

    /// Stores a run verbatim, keeping its id and timestamps.
    pub fn insert_run(&self, run: BackupRun) -> BackupRun {
        let mut tables = self.lock();
        tables.next_run_id = tables.next_run_id.max(run.id);
        tables.runs.insert(run.id, run.clone());
        run
    }

    pub fn all_runs(&self) -> Vec<BackupRun> {
        let mut runs: Vec<BackupRun> = self.lock().runs.values().cloned().collect();
        runs.sort_by_key(|r| r.id);
        runs
    }
}

fn newest_first(runs: &mut [BackupRun]) {
    runs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
}

#[async_trait]
impl Catalog for MemoryStore {
    async fn get_database(&self, database_id: i64) -> Result<DatabaseInfo> {
        self.lock()
            .databases
            .get(&database_id)
            .cloned()
            .ok_or_else(|| AppError::not_found(format!("Database {}", database_id)))
    }

    async fn list_destinations(&self, database_id: i64) -> Result<Vec<Destination>> {
        Ok(self
            .lock()
            .destinations
            .iter()
            .filter(|d| d.database_id == database_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl BackupStore for MemoryStore {
    async fn list_active_schedules(&self) -> Result<Vec<Schedule>> {
        let mut schedules: Vec<Schedule> = self
            .lock()
            .schedules
            .values()
            .filter(|s| s.is_active && s.cron_expression.is_some())
            .cloned()
            .collect();
        schedules.sort_by_key(|s| s.id);
        Ok(schedules)
    }

    async fn get_schedule(&self, schedule_id: i64) -> Result<Schedule> {
        self.lock()
            .schedules
            .get(&schedule_id)
            .cloned()
            .ok_or_else(|| AppError::not_found(format!("Schedule {}", schedule_id)))
    }

    async fn update_schedule_times(
        &self,
        schedule_id: i64,
        last_run_at: Option<DateTime<Utc>>,
        next_run_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tables = self.lock();
        let schedule = tables
            .schedules
            .get_mut(&schedule_id)
            .ok_or_else(|| AppError::not_found(format!("Schedule {}", schedule_id)))?;
        if last_run_at.is_some() {
            schedule.last_run_at = last_run_at;
        }
        schedule.next_run_at = Some(next_run_at);
        Ok(())
    }

    async fn create_run(&self, mut run: BackupRun) -> Result<BackupRun> {
        let mut tables = self.lock();
        tables.next_run_id += 1;
        run.id = tables.next_run_id;
        tables.runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn get_run(&self, run_id: i64) -> Result<BackupRun> {
        self.lock()
            .runs
            .get(&run_id)
            .cloned()
            .ok_or_else(|| AppError::not_found(format!("Backup run {}", run_id)))
    }

    async fn update_run(&self, run: &BackupRun) -> Result<()> {
        let mut tables = self.lock();
        let stored = tables
            .runs
            .get_mut(&run.id)
            .ok_or_else(|| AppError::not_found(format!("Backup run {}", run.id)))?;
        if !stored.status.accepts_update_to(run.status) {
            return Err(AppError::InvalidTransition {
                run_id: run.id,
                from: stored.status,
                to: run.status,
            });
        }
        *stored = run.clone();
        Ok(())
    }

    async fn delete_run(&self, run_id: i64) -> Result<()> {
        self.lock()
            .runs
            .remove(&run_id)
            .map(|_| ())
            .ok_or_else(|| AppError::not_found(format!("Backup run {}", run_id)))
    }

    async fn list_completed_runs_for_schedule(&self, schedule_id: i64) -> Result<Vec<BackupRun>> {
        let mut runs: Vec<BackupRun> = self
            .lock()
            .runs
            .values()
            .filter(|r| {
                r.schedule_id == Some(schedule_id)
                    && r.status == crate::models::RunStatus::Completed
            })
            .cloned()
            .collect();
        newest_first(&mut runs);
        Ok(runs)
    }

    async fn list_runs_for_database(&self, database_id: i64) -> Result<Vec<BackupRun>> {
        let mut runs: Vec<BackupRun> = self
            .lock()
            .runs
            .values()
            .filter(|r| r.database_id == database_id)
            .cloned()
            .collect();
        newest_first(&mut runs);
        Ok(runs)
    }
}
