// backupscheduler/src/retention/mod.rs
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::backup::logic::remove_run_files;
use crate::errors::Result;
use crate::models::{BackupRun, Schedule};
use crate::store::BackupStore;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub schedule_id: i64,
    pub runs_deleted: Vec<i64>,
    pub files_removed: usize,
    pub errors: Vec<String>,
}

/// Ids of runs to prune from `runs_newest_first`, which must hold only the
/// COMPLETED runs of one schedule. A run is selected when it is older than
/// `retention_days` or sits at index `max_backups` or later. A limit that is
/// absent or not positive is not applied.
pub fn select_for_deletion(
    runs_newest_first: &[BackupRun],
    retention_days: Option<i64>,
    max_backups: Option<i64>,
    now: DateTime<Utc>,
) -> Vec<i64> {
    let cutoff = retention_days
        .filter(|days| *days > 0)
        .map(|days| now - Duration::days(days));
    let keep = max_backups
        .filter(|max| *max > 0)
        .and_then(|max| usize::try_from(max).ok());

    let mut seen = BTreeSet::new();
    runs_newest_first
        .iter()
        .enumerate()
        .filter(|(index, run)| {
            let too_old = cutoff.is_some_and(|c| run.created_at < c);
            let over_count = keep.is_some_and(|k| *index >= k);
            too_old || over_count
        })
        .map(|(_, run)| run.id)
        .filter(|id| seen.insert(*id))
        .collect()
}

/// Prunes old backups of a schedule from the store and from disk.
#[derive(Clone)]
pub struct RetentionEngine {
    store: Arc<dyn BackupStore>,
}

impl RetentionEngine {
    pub fn new(store: Arc<dyn BackupStore>) -> Self {
        Self { store }
    }

    /// Operator entry point: applies the stored policy of one schedule now.
    pub async fn run_for_schedule(&self, schedule_id: i64) -> Result<RetentionReport> {
        let schedule = self.store.get_schedule(schedule_id).await?;
        self.apply(&schedule, Utc::now()).await
    }

    /// File removal failures are reported, never raised; the record is
    /// deleted either way.
    #[instrument(skip(self, schedule), fields(schedule_id = schedule.id))]
    pub async fn apply(&self, schedule: &Schedule, now: DateTime<Utc>) -> Result<RetentionReport> {
        let mut report = RetentionReport {
            schedule_id: schedule.id,
            ..RetentionReport::default()
        };
        if schedule.retention_days.is_none() && schedule.max_backups.is_none() {
            return Ok(report);
        }

        let runs = self.store.list_completed_runs_for_schedule(schedule.id).await?;
        let doomed = select_for_deletion(&runs, schedule.retention_days, schedule.max_backups, now);
        if doomed.is_empty() {
            return Ok(report);
        }

        for run in runs.iter().filter(|r| doomed.contains(&r.id)) {
            let removed = remove_run_files(run).await;
            report.files_removed += removed.files_removed;
            report.errors.extend(removed.file_errors);

            match self.store.delete_run(run.id).await {
                Ok(()) => report.runs_deleted.push(run.id),
                Err(e) => {
                    warn!(run_id = run.id, error = %e, "Failed to delete backup record");
                    report.errors.push(format!("run {}: {}", run.id, e));
                }
            }
        }

        info!(
            deleted = report.runs_deleted.len(),
            files_removed = report.files_removed,
            errors = report.errors.len(),
            "Retention applied"
        );
        Ok(report)
    }
}
