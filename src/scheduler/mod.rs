//! Periodic control loop: fires due schedules, dispatches their runs and
//! applies retention.

pub mod cron;

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use crate::backup::BackupExecutor;
use crate::config::SchedulerConfig;
use crate::errors::Result;
use crate::models::Schedule;
use crate::retention::RetentionEngine;
use crate::store::BackupStore;

pub use self::cron::TriggerExpression;

/// `next_run_at` unset, or within `tolerance` of now or already passed.
pub fn should_fire(schedule: &Schedule, now: DateTime<Utc>, tolerance: chrono::Duration) -> bool {
    match schedule.next_run_at {
        None => true,
        Some(next) => now >= next - tolerance,
    }
}

pub struct Scheduler {
    store: Arc<dyn BackupStore>,
    executor: BackupExecutor,
    retention: RetentionEngine,
    config: SchedulerConfig,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl Scheduler {
    pub fn new(executor: BackupExecutor, config: SchedulerConfig) -> Self {
        let store = executor.store().clone();
        let permits = Arc::new(Semaphore::new(config.max_concurrent_runs.max(1)));
        Self {
            retention: RetentionEngine::new(store.clone()),
            store,
            executor,
            config,
            permits,
            tracker: TaskTracker::new(),
        }
    }

    /// Recomputes `next_run_at` from `now` for every active schedule whose
    /// value is unset or already in the past, so a restart does not replay
    /// fires missed while the process was down.
    #[instrument(skip(self))]
    pub async fn initialize_schedules(&self, now: DateTime<Utc>) -> Result<()> {
        for schedule in self.store.list_active_schedules().await? {
            if schedule.next_run_at.is_some_and(|next| next >= now) {
                continue;
            }
            if let Err(e) = self.reschedule(&schedule, now).await {
                error!(schedule_id = schedule.id, error = %e, "Failed to initialize schedule");
            }
        }
        Ok(())
    }

    async fn reschedule(&self, schedule: &Schedule, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let trigger = TriggerExpression::parse(schedule.cron_expression.as_deref().unwrap_or_default())?;
        let next = trigger.next_after(now)?;
        self.store.update_schedule_times(schedule.id, None, next).await?;
        debug!(schedule_id = schedule.id, next_run_at = %next, "Next fire computed");
        Ok(next)
    }

    /// One pass over the active schedules. Returns the ids of runs dispatched.
    /// A failing schedule is logged and never stops the others.
    #[instrument(skip(self))]
    pub async fn tick(&self, now: DateTime<Utc>) -> Vec<i64> {
        let schedules = match self.store.list_active_schedules().await {
            Ok(schedules) => schedules,
            Err(e) => {
                error!(error = %e, "Failed to load active schedules");
                return Vec::new();
            }
        };

        let mut dispatched = Vec::new();
        for schedule in schedules {
            if !should_fire(&schedule, now, self.config.fire_tolerance) {
                continue;
            }
            match self.fire(&schedule, now).await {
                Ok(run_id) => dispatched.push(run_id),
                Err(e) => error!(
                    schedule_id = schedule.id,
                    schedule = %schedule.name,
                    error = %e,
                    "Failed to process schedule"
                ),
            }
        }
        dispatched
    }

    /// Creates and dispatches the run, advances the schedule from `now`, then
    /// applies retention inline.
    async fn fire(&self, schedule: &Schedule, now: DateTime<Utc>) -> Result<i64> {
        // Evaluate the trigger before creating anything so a malformed
        // expression leaves no run behind.
        let trigger = TriggerExpression::parse(schedule.cron_expression.as_deref().unwrap_or_default())?;
        let next = trigger.next_after(now)?;

        let run = self.executor.create_scheduled_run(schedule, now).await?;
        self.dispatch(run.id);

        self.store
            .update_schedule_times(schedule.id, Some(now), next)
            .await?;
        info!(
            schedule_id = schedule.id,
            run_id = run.id,
            next_run_at = %next,
            "Schedule fired"
        );

        if let Err(e) = self.retention.apply(schedule, now).await {
            error!(schedule_id = schedule.id, error = %e, "Retention failed");
        }
        Ok(run.id)
    }

    /// Fire-and-forget. The run stays PENDING until a permit is free; panics
    /// inside the run are recorded as FAILED by `execute_run`.
    fn dispatch(&self, run_id: i64) {
        let executor = self.executor.clone();
        let permits = self.permits.clone();
        self.tracker.spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!(run_id, error = %e, "Run dropped before start");
                    let reason = "Scheduler shut down before the run started";
                    if let Err(e) = executor.fail_run(run_id, reason).await {
                        error!(run_id, error = %e, "Dropped run could not be recorded");
                    }
                    return;
                }
            };
            match executor.execute_run(run_id).await {
                Ok(run) => debug!(run_id, status = %run.status, "Dispatched run finished"),
                Err(e) => error!(run_id, error = %e, "Dispatched run could not be recorded"),
            }
        });
    }

    /// Starts the control loop on the runtime.
    pub async fn start(self) -> Result<SchedulerHandle> {
        self.initialize_schedules(Utc::now()).await?;

        let scheduler = Arc::new(self);
        let cancel = CancellationToken::new();
        let loop_task = tokio::spawn(run_loop(scheduler.clone(), cancel.clone()));
        info!(
            poll_interval_secs = scheduler.config.poll_interval.as_secs(),
            max_concurrent_runs = scheduler.config.max_concurrent_runs,
            "Scheduler started"
        );
        Ok(SchedulerHandle {
            scheduler,
            cancel,
            loop_task,
        })
    }
}

async fn run_loop(scheduler: Arc<Scheduler>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(scheduler.config.poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let dispatched = scheduler.tick(Utc::now()).await;
                if !dispatched.is_empty() {
                    debug!(runs = ?dispatched, "Tick dispatched runs");
                }
            }
        }
    }
    debug!("Scheduler loop exited");
}

/// Owns a running scheduler. Dropping it without `stop` abandons the loop.
pub struct SchedulerHandle {
    scheduler: Arc<Scheduler>,
    cancel: CancellationToken,
    loop_task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Recomputes `next_run_at` from now after an external edit. Inactive
    /// schedules and schedules without an expression are left untouched.
    pub async fn refresh_schedule(&self, schedule_id: i64) -> Result<Option<DateTime<Utc>>> {
        let schedule = self.scheduler.store.get_schedule(schedule_id).await?;
        if !schedule.is_active || schedule.cron_expression.is_none() {
            return Ok(None);
        }
        self.scheduler.reschedule(&schedule, Utc::now()).await.map(Some)
    }

    /// Dispatches a run for `schedule_id` now, outside its trigger. The
    /// schedule's fire timestamps are left as they are.
    pub async fn trigger_schedule(&self, schedule_id: i64) -> Result<i64> {
        let schedule = self.scheduler.store.get_schedule(schedule_id).await?;
        let run = self
            .scheduler
            .executor
            .create_scheduled_run(&schedule, Utc::now())
            .await?;
        self.scheduler.dispatch(run.id);
        Ok(run.id)
    }

    /// Stops ticking, then waits for every dispatched run to reach a
    /// terminal status.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.loop_task.await {
            warn!(error = %e, "Scheduler loop ended abnormally");
        }
        self.scheduler.tracker.close();
        let in_flight = self.scheduler.tracker.len();
        if in_flight > 0 {
            info!(in_flight, "Waiting for in-flight backup runs");
        }
        self.scheduler.tracker.wait().await;
        info!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::logic::tests::{FakeDumper, PanickingDumper, database};
    use crate::errors::AppError;
    use crate::config::BackupConfig;
    use crate::models::{BackupRun, Destination, RunStatus};
    use crate::store::MemoryStore;
    use chrono::{Duration, TimeZone};
    use std::path::Path;

    fn schedule(id: i64, cron: &str) -> Schedule {
        Schedule {
            id,
            name: format!("schedule-{}", id),
            database_id: 1,
            cron_expression: Some(cron.to_string()),
            is_active: true,
            retention_days: None,
            max_backups: None,
            last_run_at: None,
            next_run_at: None,
        }
    }

    fn config(max_concurrent_runs: usize) -> SchedulerConfig {
        SchedulerConfig {
            poll_interval: std::time::Duration::from_millis(20),
            max_concurrent_runs,
            ..SchedulerConfig::default()
        }
    }

    fn scheduler(store: &Arc<MemoryStore>, work: &Path, max: usize) -> Scheduler {
        let executor = BackupExecutor::new(
            store.clone(),
            store.clone(),
            Arc::new(FakeDumper::ok(work)),
            &BackupConfig::default(),
        );
        Scheduler::new(executor, config(max))
    }

    fn seeded(work: &Path) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.insert_database(database(1));
        store.insert_destination(Destination {
            id: 1,
            database_id: 1,
            path: work.join("dest"),
            enabled: true,
        });
        store
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, h, m, s).unwrap()
    }

    #[test]
    fn test_should_fire_tolerance() {
        let tolerance = Duration::seconds(30);
        let mut s = schedule(1, "0 2 * * *");
        assert!(should_fire(&s, at(0, 0, 0), tolerance));

        s.next_run_at = Some(at(2, 0, 0));
        assert!(!should_fire(&s, at(1, 59, 29), tolerance));
        assert!(should_fire(&s, at(1, 59, 30), tolerance));
        assert!(should_fire(&s, at(2, 0, 10), tolerance));
    }

    #[tokio::test]
    async fn test_restart_recomputes_stale_next_fire_without_firing() -> anyhow::Result<()> {
        let work = tempfile::tempdir()?;
        let store = seeded(work.path());
        let mut stale = schedule(1, "0 2 * * *");
        stale.next_run_at = Some(at(1, 0, 0) - Duration::days(1));
        store.insert_schedule(stale);
        let sched = scheduler(&store, work.path(), 4);

        let restart = at(3, 0, 0);
        sched.initialize_schedules(restart).await?;

        let refreshed = store.get_schedule(1).await?;
        assert_eq!(
            refreshed.next_run_at,
            Some(Utc.with_ymd_and_hms(2025, 1, 2, 2, 0, 0).unwrap())
        );
        assert!(sched.tick(restart).await.is_empty());
        assert!(store.all_runs().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_fire_advances_from_now_and_runs_backup() -> anyhow::Result<()> {
        let work = tempfile::tempdir()?;
        let store = seeded(work.path());
        store.insert_schedule(schedule(1, "0 2 * * *"));
        let sched = scheduler(&store, work.path(), 4);

        let now = at(2, 0, 5);
        let dispatched = sched.tick(now).await;
        assert_eq!(dispatched.len(), 1);

        let fired = store.get_schedule(1).await?;
        assert_eq!(fired.last_run_at, Some(now));
        assert_eq!(
            fired.next_run_at,
            Some(Utc.with_ymd_and_hms(2025, 1, 2, 2, 0, 0).unwrap())
        );

        sched.tracker.close();
        sched.tracker.wait().await;
        let run = store.get_run(dispatched[0]).await?;
        assert_eq!(run.schedule_id, Some(1));
        assert_eq!(run.status, RunStatus::Completed);

        // Not due again until tomorrow.
        assert!(sched.tick(at(2, 1, 0)).await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_panicking_run_does_not_stay_in_progress() -> anyhow::Result<()> {
        let work = tempfile::tempdir()?;
        let store = seeded(work.path());
        store.insert_schedule(schedule(1, "0 2 * * *"));
        let executor = BackupExecutor::new(
            store.clone(),
            store.clone(),
            Arc::new(PanickingDumper),
            &BackupConfig::default(),
        );
        let sched = Scheduler::new(executor, config(1));

        let dispatched = sched.tick(at(2, 0, 0)).await;
        assert_eq!(dispatched.len(), 1);
        sched.tracker.close();
        sched.tracker.wait().await;

        let run = store.get_run(dispatched[0]).await?;
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error_message.as_deref().is_some_and(|m| m.contains("panicked")));

        // The permit was released; the next fire still runs.
        assert_eq!(sched.permits.available_permits(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_schedule_without_destinations_never_dumps() -> anyhow::Result<()> {
        let work = tempfile::tempdir()?;
        let store = Arc::new(MemoryStore::new());
        store.insert_database(database(1));
        store.insert_schedule(schedule(1, "0 2 * * *"));
        let dumper = Arc::new(FakeDumper::ok(work.path()));
        let executor = BackupExecutor::new(
            store.clone(),
            store.clone(),
            dumper.clone(),
            &BackupConfig::default(),
        );
        let sched = Scheduler::new(executor, config(4));

        let dispatched = sched.tick(at(2, 0, 0)).await;
        sched.tracker.close();
        sched.tracker.wait().await;

        assert!(dumper.produced().is_empty());
        let run = store.get_run(dispatched[0]).await?;
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(
            run.error_message,
            Some(AppError::NoDestinations(1).to_string())
        );
        // The schedule still advances.
        assert!(store.get_schedule(1).await?.next_run_at.is_some_and(|n| n > at(2, 0, 0)));
        Ok(())
    }

    #[tokio::test]
    async fn test_malformed_expression_does_not_block_other_schedules() -> anyhow::Result<()> {
        let work = tempfile::tempdir()?;
        let store = seeded(work.path());
        store.insert_schedule(schedule(1, "not a cron"));
        store.insert_schedule(schedule(2, "*/5 * * * *"));
        let sched = scheduler(&store, work.path(), 4);

        let dispatched = sched.tick(at(10, 0, 0)).await;
        assert_eq!(dispatched.len(), 1);

        let runs = store.all_runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].schedule_id, Some(2));
        assert!(store.get_schedule(1).await?.last_run_at.is_none());

        sched.tracker.close();
        sched.tracker.wait().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_inactive_schedule_never_fires() -> anyhow::Result<()> {
        let work = tempfile::tempdir()?;
        let store = seeded(work.path());
        store.insert_schedule(Schedule {
            is_active: false,
            ..schedule(1, "* * * * *")
        });
        let sched = scheduler(&store, work.path(), 4);

        assert!(sched.tick(at(10, 0, 0)).await.is_empty());
        assert!(store.all_runs().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_retention_runs_after_dispatch() -> anyhow::Result<()> {
        let work = tempfile::tempdir()?;
        let store = seeded(work.path());
        store.insert_schedule(Schedule {
            retention_days: Some(30),
            ..schedule(1, "0 2 * * *")
        });
        let old = BackupRun {
            id: 500,
            status: RunStatus::Completed,
            created_at: at(0, 0, 0) - Duration::days(60),
            ..BackupRun::pending("orders_db_20241102_020000".into(), 1, Some(1))
        };
        store.insert_run(old);
        let sched = scheduler(&store, work.path(), 4);

        let dispatched = sched.tick(at(2, 0, 0)).await;
        assert_eq!(dispatched.len(), 1);
        assert!(store.get_run(500).await.is_err());

        sched.tracker.close();
        sched.tracker.wait().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_handle_refresh_and_stop_waits_for_runs() -> anyhow::Result<()> {
        let work = tempfile::tempdir()?;
        let store = seeded(work.path());
        store.insert_schedule(schedule(1, "* * * * * *"));
        store.insert_schedule(Schedule {
            is_active: false,
            ..schedule(2, "0 2 * * *")
        });

        let handle = scheduler(&store, work.path(), 1).start().await?;
        assert!(handle.refresh_schedule(2).await?.is_none());
        let manual = handle.trigger_schedule(2).await?;
        let next = handle.refresh_schedule(1).await?;
        assert!(next.is_some_and(|n| n > Utc::now() - Duration::seconds(1)));

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        handle.stop().await;

        let runs = store.all_runs();
        assert!(runs.iter().any(|r| r.id == manual && r.schedule_id == Some(2)));
        assert!(runs.iter().any(|r| r.schedule_id == Some(1)));
        assert!(runs.iter().all(|r| r.status.is_terminal()), "{:?}", runs);
        assert!(store.get_schedule(2).await?.last_run_at.is_none());
        Ok(())
    }
}
