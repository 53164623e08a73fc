// backupscheduler/src/backup/logic.rs
use chrono::{DateTime, Utc};
use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{Instrument, debug, error, info, instrument, warn};

use super::db_dump::{DumpArtifact, DumpProducer};
use super::replicate::{Replicator, aggregate_status};
use crate::config::BackupConfig;
use crate::errors::{AppError, Result};
use crate::models::{BackupRun, DestinationResults, RunStatus, Schedule, run_name};
use crate::store::{BackupStore, Catalog};
use crate::utils::format_file_size;

/// Drives single backup runs through PENDING -> IN_PROGRESS -> terminal.
#[derive(Clone)]
pub struct BackupExecutor {
    catalog: Arc<dyn Catalog>,
    store: Arc<dyn BackupStore>,
    dumper: Arc<dyn DumpProducer>,
    replicator: Replicator,
}

/// Existence and size check of one recorded copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileCheck {
    pub destination: String,
    pub file_path: PathBuf,
    pub actual_size: Option<u64>,
    pub ok: bool,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationReport {
    pub run_id: i64,
    pub checks: Vec<FileCheck>,
}

impl VerificationReport {
    pub fn all_ok(&self) -> bool {
        self.checks.iter().all(|c| c.ok)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletionReport {
    pub files_removed: usize,
    pub file_errors: Vec<String>,
}

/// Removes every successfully copied file of a run. Failures are collected,
/// never raised.
pub(crate) async fn remove_run_files(run: &BackupRun) -> DeletionReport {
    let mut report = DeletionReport::default();
    for (destination, result) in &run.destination_results {
        if !result.success {
            continue;
        }
        let Some(path) = result.file_path.as_deref() else {
            continue;
        };
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                debug!(run_id = run.id, file = %path.display(), "Removed backup file");
                report.files_removed += 1;
            }
            Err(e) => {
                let msg = format!("{}: {}: {}", destination, path.display(), e);
                error!(run_id = run.id, error = %msg, "Failed to remove backup file");
                report.file_errors.push(msg);
            }
        }
    }
    report
}

async fn check_copy(destination: &str, path: PathBuf, expected: Option<u64>) -> FileCheck {
    let (actual_size, detail) = match tokio::fs::metadata(&path).await {
        Err(_) => (None, Some("File does not exist".to_string())),
        Ok(meta) => match expected {
            Some(size) if size != meta.len() => (
                Some(meta.len()),
                Some(format!(
                    "Size mismatch: expected {} bytes, found {}",
                    size,
                    meta.len()
                )),
            ),
            _ => (Some(meta.len()), None),
        },
    };
    FileCheck {
        destination: destination.to_string(),
        file_path: path,
        actual_size,
        ok: detail.is_none(),
        detail,
    }
}

fn finish(run: &mut BackupRun, status: RunStatus, now: DateTime<Utc>) {
    run.status = status;
    run.completed_at = Some(now);
    run.duration_seconds = run.started_at.map(|started| (now - started).num_seconds());
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn failure_summary(results: &DestinationResults) -> String {
    let reasons: Vec<String> = results
        .iter()
        .filter_map(|(dest, r)| r.error.as_ref().map(|e| format!("{}: {}", dest, e)))
        .collect();
    format!("All destinations failed: {}", reasons.join("; "))
}

impl BackupExecutor {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        store: Arc<dyn BackupStore>,
        dumper: Arc<dyn DumpProducer>,
        config: &BackupConfig,
    ) -> Self {
        Self {
            catalog,
            store,
            dumper,
            replicator: Replicator::new(config.space_headroom),
        }
    }

    pub fn store(&self) -> &Arc<dyn BackupStore> {
        &self.store
    }

    /// Creates a PENDING manual run. Rejected up front when the database has
    /// no enabled destination.
    #[instrument(skip(self))]
    pub async fn trigger_manual_backup(&self, database_id: i64) -> Result<BackupRun> {
        let database = self.catalog.get_database(database_id).await?;
        let destinations = self.catalog.list_enabled_destinations(database_id).await?;
        if destinations.is_empty() {
            return Err(AppError::NoDestinations(database_id));
        }

        let run = BackupRun::pending(run_name(&database.name, Utc::now()), database_id, None);
        let run = self.store.create_run(run).await?;
        let targets: Vec<String> = destinations.iter().map(|d| d.key()).collect();
        info!(run_id = run.id, name = %run.name, destinations = ?targets, "Manual backup queued");
        Ok(run)
    }

    /// Creates the PENDING run for one firing of `schedule`.
    #[instrument(skip(self, schedule), fields(schedule_id = schedule.id))]
    pub async fn create_scheduled_run(
        &self,
        schedule: &Schedule,
        now: DateTime<Utc>,
    ) -> Result<BackupRun> {
        let database = self.catalog.get_database(schedule.database_id).await?;
        let run = BackupRun::pending(
            run_name(&database.name, now),
            schedule.database_id,
            Some(schedule.id),
        );
        let run = self.store.create_run(run).await?;
        info!(run_id = run.id, name = %run.name, "Scheduled backup queued");
        Ok(run)
    }

    /// Executes a PENDING run to a terminal status and returns the final
    /// record. A run that fails is still `Ok`; only store failures while
    /// recording the outcome are `Err`. The run is driven on its own task so
    /// a panic is recorded as FAILED instead of leaving it IN_PROGRESS.
    #[instrument(skip(self))]
    pub async fn execute_run(&self, run_id: i64) -> Result<BackupRun> {
        let run = self.store.get_run(run_id).await?;
        if run.status != RunStatus::Pending {
            return Err(AppError::InvalidTransition {
                run_id,
                from: run.status,
                to: RunStatus::InProgress,
            });
        }

        let this = self.clone();
        let driven = tokio::spawn(
            async move {
                let mut run = run;
                let outcome = this.drive(&mut run).await;
                outcome.map(|()| run)
            }
            .in_current_span(),
        )
        .await;

        let reason = match driven {
            Ok(Ok(run)) => return Ok(run),
            Ok(Err(e)) => e.to_string(),
            Err(join) if join.is_panic() => {
                format!("Backup run panicked: {}", panic_message(join.into_panic()))
            }
            Err(join) => format!("Backup run was cancelled: {}", join),
        };
        error!(run_id, error = %reason, "Backup run aborted");
        self.fail_run(run_id, &reason).await
    }

    async fn drive(&self, run: &mut BackupRun) -> Result<()> {
        let database = self.catalog.get_database(run.database_id).await?;
        let destinations = self.catalog.list_enabled_destinations(run.database_id).await?;
        if destinations.is_empty() {
            let reason = AppError::NoDestinations(run.database_id);
            error!(run_id = run.id, error = %reason, "Backup run not attempted");
            run.error_message = Some(reason.to_string());
            finish(run, RunStatus::Failed, Utc::now());
            return self.store.update_run(run).await;
        }

        run.status = RunStatus::InProgress;
        run.started_at = Some(Utc::now());
        self.store.update_run(run).await?;
        info!(
            run_id = run.id,
            database = %database.name,
            destinations = destinations.len(),
            "Backup run started"
        );

        let artifact = match self.dumper.dump(&database, &run.name).await {
            Ok(artifact) => artifact,
            Err(e) => {
                error!(run_id = run.id, error = %e, "Dump failed");
                run.error_message = Some(e.to_string());
                finish(run, RunStatus::Failed, Utc::now());
                return self.store.update_run(run).await;
            }
        };
        run.file_size = Some(artifact.size_bytes);

        let results = self
            .replicator
            .replicate(&artifact, &destinations, &database.project_name, &database.name)
            .await;
        discard_artifact(&artifact).await;

        let status = aggregate_status(&results);
        if status == RunStatus::Failed {
            run.error_message = Some(failure_summary(&results));
        }
        run.destination_results = results;
        finish(run, status, Utc::now());
        self.store.update_run(run).await?;

        info!(
            run_id = run.id,
            status = %run.status,
            size = %format_file_size(run.file_size),
            duration_seconds = run.duration_seconds.unwrap_or_default(),
            "Backup run finished"
        );
        Ok(())
    }

    /// Marks a run FAILED with `reason` unless it is already terminal. Used
    /// after an unexpected error or panic, whatever state the record reached.
    pub async fn fail_run(&self, run_id: i64, reason: &str) -> Result<BackupRun> {
        let mut run = self.store.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(run);
        }
        run.error_message = Some(reason.to_string());
        finish(&mut run, RunStatus::Failed, Utc::now());
        self.store.update_run(&run).await?;
        Ok(run)
    }

    pub async fn run_status(&self, run_id: i64) -> Result<BackupRun> {
        self.store.get_run(run_id).await
    }

    /// Re-checks that each recorded copy still exists with its recorded size.
    #[instrument(skip(self))]
    pub async fn verify_run(&self, run_id: i64) -> Result<VerificationReport> {
        let run = self.store.get_run(run_id).await?;
        let mut checks = Vec::new();
        for (destination, result) in &run.destination_results {
            if !result.success {
                continue;
            }
            let Some(path) = result.file_path.clone() else {
                continue;
            };
            checks.push(check_copy(destination, path, result.size_bytes).await);
        }
        Ok(VerificationReport { run_id, checks })
    }

    /// Deletes a finished run's record, optionally with its copies. Runs that
    /// are still PENDING or IN_PROGRESS are refused.
    #[instrument(skip(self))]
    pub async fn delete_run(&self, run_id: i64, delete_files: bool) -> Result<DeletionReport> {
        let run = self.store.get_run(run_id).await?;
        if !run.status.is_terminal() {
            return Err(AppError::Generic(format!(
                "Run {} is {} and cannot be deleted",
                run_id, run.status
            )));
        }

        let report = if delete_files {
            remove_run_files(&run).await
        } else {
            DeletionReport::default()
        };
        self.store.delete_run(run_id).await?;
        info!(run_id, files_removed = report.files_removed, "Backup run deleted");
        Ok(report)
    }
}

async fn discard_artifact(artifact: &DumpArtifact) {
    if let Err(e) = tokio::fs::remove_file(&artifact.path).await {
        warn!(path = %artifact.path.display(), error = %e, "Failed to remove temporary dump");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{DatabaseInfo, Destination, EngineKind};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex;

    /// Writes a fixed payload instead of calling a dump tool.
    pub(crate) struct FakeDumper {
        pub dir: PathBuf,
        pub payload: Vec<u8>,
        pub fail_with: Option<String>,
        pub produced: Mutex<Vec<PathBuf>>,
    }

    impl FakeDumper {
        pub fn ok(dir: &Path) -> Self {
            Self {
                dir: dir.to_path_buf(),
                payload: b"fake-dump".to_vec(),
                fail_with: None,
                produced: Mutex::new(Vec::new()),
            }
        }

        pub fn failing(dir: &Path, message: &str) -> Self {
            Self {
                fail_with: Some(message.to_string()),
                ..Self::ok(dir)
            }
        }

        pub fn produced(&self) -> Vec<PathBuf> {
            self.produced.lock().map(|p| p.clone()).unwrap_or_default()
        }
    }

    #[async_trait]
    impl DumpProducer for FakeDumper {
        async fn dump(&self, _database: &DatabaseInfo, backup_name: &str) -> Result<DumpArtifact> {
            if let Some(msg) = &self.fail_with {
                return Err(AppError::dump(msg.clone()));
            }
            let path = self.dir.join(format!("{}_0a1b2c3d.dump", backup_name));
            tokio::fs::write(&path, &self.payload).await?;
            if let Ok(mut produced) = self.produced.lock() {
                produced.push(path.clone());
            }
            Ok(DumpArtifact {
                path,
                size_bytes: self.payload.len() as u64,
            })
        }
    }

    /// Panics mid-dump, standing in for a bug anywhere in a run.
    pub(crate) struct PanickingDumper;

    #[async_trait]
    impl DumpProducer for PanickingDumper {
        async fn dump(&self, _database: &DatabaseInfo, _backup_name: &str) -> Result<DumpArtifact> {
            panic!("dump tool wrapper blew up");
        }
    }

    pub(crate) fn database(id: i64) -> DatabaseInfo {
        DatabaseInfo {
            id,
            name: "orders_db".into(),
            engine: EngineKind::PostgreSql,
            host: "localhost".into(),
            port: 5432,
            username: Some("backup".into()),
            password: None,
            database_name: "orders".into(),
            project_name: "shop".into(),
        }
    }

    fn executor(store: &Arc<MemoryStore>, dumper: Arc<dyn DumpProducer>) -> BackupExecutor {
        BackupExecutor::new(
            store.clone(),
            store.clone(),
            dumper,
            &BackupConfig::default(),
        )
    }

    fn destination(id: i64, path: PathBuf) -> Destination {
        Destination {
            id,
            database_id: 1,
            path,
            enabled: true,
        }
    }

    #[tokio::test]
    async fn test_dump_failure_marks_run_failed_without_results() -> anyhow::Result<()> {
        let work = tempfile::tempdir()?;
        let store = Arc::new(MemoryStore::new());
        store.insert_database(database(1));
        store.insert_destination(destination(1, work.path().join("a")));

        let exec = executor(&store, Arc::new(FakeDumper::failing(work.path(), "pg_dump: connection refused")));
        let run = exec.trigger_manual_backup(1).await?;
        let done = exec.execute_run(run.id).await?;

        assert_eq!(done.status, RunStatus::Failed);
        assert!(done.destination_results.is_empty());
        assert!(
            done.error_message
                .as_deref()
                .is_some_and(|m| m.contains("connection refused"))
        );
        assert!(done.completed_at.is_some());
        assert!(!work.path().join("a").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_partial_run_records_every_destination() -> anyhow::Result<()> {
        let work = tempfile::tempdir()?;
        let temp = work.path().join("tmp");
        std::fs::create_dir_all(&temp)?;
        let good = work.path().join("a");
        let bad = work.path().join("b");
        std::fs::write(&bad, b"occupied")?;

        let store = Arc::new(MemoryStore::new());
        store.insert_database(database(1));
        store.insert_destination(destination(1, good.clone()));
        store.insert_destination(destination(2, bad.clone()));

        let dumper = Arc::new(FakeDumper::ok(&temp));
        let exec = executor(&store, dumper.clone());
        let run = exec.trigger_manual_backup(1).await?;
        let done = exec.execute_run(run.id).await?;

        assert_eq!(done.status, RunStatus::Partial);
        assert_eq!(done.destination_results.len(), 2);
        assert!(done.destination_results[&good.display().to_string()].success);
        assert!(!done.destination_results[&bad.display().to_string()].success);
        assert_eq!(done.file_size, Some(9));
        assert!(done.duration_seconds.is_some_and(|d| d >= 0));

        let stored = exec.run_status(run.id).await?;
        assert_eq!(stored, done);

        // The transient artifact never outlives the run.
        for path in dumper.produced() {
            assert!(!path.exists(), "{} left behind", path.display());
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_manual_trigger_requires_enabled_destination() -> anyhow::Result<()> {
        let work = tempfile::tempdir()?;
        let store = Arc::new(MemoryStore::new());
        store.insert_database(database(1));
        store.insert_destination(Destination {
            enabled: false,
            ..destination(1, work.path().join("a"))
        });

        let exec = executor(&store, Arc::new(FakeDumper::ok(work.path())));
        let err = exec.trigger_manual_backup(1).await.unwrap_err();
        assert!(matches!(err, AppError::NoDestinations(1)));
        assert!(store.all_runs().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_scheduled_run_without_destinations_is_not_attempted() -> anyhow::Result<()> {
        let work = tempfile::tempdir()?;
        let store = Arc::new(MemoryStore::new());
        store.insert_database(database(1));
        store.insert_destination(Destination {
            enabled: false,
            ..destination(1, work.path().join("a"))
        });
        let schedule = Schedule {
            id: 7,
            name: "nightly".into(),
            database_id: 1,
            cron_expression: Some("0 2 * * *".into()),
            is_active: true,
            retention_days: None,
            max_backups: None,
            last_run_at: None,
            next_run_at: None,
        };

        let dumper = Arc::new(FakeDumper::ok(work.path()));
        let exec = executor(&store, dumper.clone());
        let run = exec.create_scheduled_run(&schedule, Utc::now()).await?;
        assert_eq!(run.schedule_id, Some(7));
        assert!(run.name.starts_with("orders_db_"));

        let done = exec.execute_run(run.id).await?;
        assert_eq!(done.status, RunStatus::Failed);
        assert!(done.destination_results.is_empty());
        assert_eq!(
            done.error_message.as_deref(),
            Some(AppError::NoDestinations(1).to_string().as_str())
        );
        assert_eq!(done.started_at, None);
        assert!(dumper.produced().is_empty(), "dump ran without destinations");
        assert!(!work.path().join("a").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_panicking_run_is_recorded_as_failed() -> anyhow::Result<()> {
        let work = tempfile::tempdir()?;
        let store = Arc::new(MemoryStore::new());
        store.insert_database(database(1));
        store.insert_destination(destination(1, work.path().join("a")));

        let exec = executor(&store, Arc::new(PanickingDumper));
        let run = exec.trigger_manual_backup(1).await?;
        let done = exec.execute_run(run.id).await?;

        assert_eq!(done.status, RunStatus::Failed);
        assert!(
            done.error_message
                .as_deref()
                .is_some_and(|m| m.contains("panicked") && m.contains("blew up"))
        );
        assert!(done.completed_at.is_some());
        assert_eq!(exec.run_status(run.id).await?, done);
        Ok(())
    }

    #[tokio::test]
    async fn test_fail_run_leaves_terminal_runs_alone() -> anyhow::Result<()> {
        let work = tempfile::tempdir()?;
        let store = Arc::new(MemoryStore::new());
        store.insert_database(database(1));
        store.insert_destination(destination(1, work.path().join("a")));

        let exec = executor(&store, Arc::new(FakeDumper::ok(work.path())));
        let pending = exec.trigger_manual_backup(1).await?;
        let failed = exec.fail_run(pending.id, "operator abort").await?;
        assert_eq!(failed.status, RunStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("operator abort"));

        let again = exec.fail_run(pending.id, "second abort").await?;
        assert_eq!(again.error_message.as_deref(), Some("operator abort"));
        Ok(())
    }

    #[tokio::test]
    async fn test_terminal_run_is_not_executed_again() -> anyhow::Result<()> {
        let work = tempfile::tempdir()?;
        let store = Arc::new(MemoryStore::new());
        store.insert_database(database(1));
        store.insert_destination(destination(1, work.path().join("a")));

        let exec = executor(&store, Arc::new(FakeDumper::ok(work.path())));
        let run = exec.trigger_manual_backup(1).await?;
        let done = exec.execute_run(run.id).await?;
        assert_eq!(done.status, RunStatus::Completed);

        let again = exec.execute_run(run.id).await;
        assert!(matches!(again, Err(AppError::InvalidTransition { .. })));
        assert_eq!(exec.run_status(run.id).await?, done);
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_database_forces_failed() -> anyhow::Result<()> {
        let work = tempfile::tempdir()?;
        let store = Arc::new(MemoryStore::new());
        let orphan = store.create_run(BackupRun::pending("ghost_20250101_000000".into(), 99, None)).await?;

        let exec = executor(&store, Arc::new(FakeDumper::ok(work.path())));
        let done = exec.execute_run(orphan.id).await?;
        assert_eq!(done.status, RunStatus::Failed);
        assert!(done.error_message.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_verify_and_delete_run() -> anyhow::Result<()> {
        let work = tempfile::tempdir()?;
        let temp = work.path().join("tmp");
        std::fs::create_dir_all(&temp)?;
        let store = Arc::new(MemoryStore::new());
        store.insert_database(database(1));
        store.insert_destination(destination(1, work.path().join("a")));
        store.insert_destination(destination(2, work.path().join("b")));

        let exec = executor(&store, Arc::new(FakeDumper::ok(&temp)));
        let run = exec.trigger_manual_backup(1).await?;
        let done = exec.execute_run(run.id).await?;
        assert_eq!(done.status, RunStatus::Completed);

        let report = exec.verify_run(run.id).await?;
        assert_eq!(report.checks.len(), 2);
        assert!(report.all_ok());

        let first = done.destination_results.values().next().and_then(|r| r.file_path.clone());
        if let Some(path) = &first {
            std::fs::write(path, b"x")?;
        }
        assert!(!exec.verify_run(run.id).await?.all_ok());

        let deleted = exec.delete_run(run.id, true).await?;
        assert_eq!(deleted.files_removed, 2);
        assert!(deleted.file_errors.is_empty());
        assert!(matches!(exec.run_status(run.id).await, Err(AppError::NotFound(_))));
        for result in done.destination_results.values() {
            assert!(result.file_path.as_ref().is_some_and(|p| !p.exists()));
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_pending_run_cannot_be_deleted() -> anyhow::Result<()> {
        let work = tempfile::tempdir()?;
        let store = Arc::new(MemoryStore::new());
        store.insert_database(database(1));
        store.insert_destination(destination(1, work.path().join("a")));

        let exec = executor(&store, Arc::new(FakeDumper::ok(work.path())));
        let run = exec.trigger_manual_backup(1).await?;
        assert!(exec.delete_run(run.id, false).await.is_err());
        assert_eq!(exec.run_status(run.id).await?.status, RunStatus::Pending);
        Ok(())
    }
}
