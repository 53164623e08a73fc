//! Backup Scheduler
//!
//! CLI entry point: runs the scheduler loop or a single operator command.

// backupscheduler/src/main.rs
use anyhow::{Context, Result};
use backupscheduler::backup::{BackupExecutor, CommandDumper};
use backupscheduler::config::{AppConfig, StoreConfig};
use backupscheduler::errors::AppError;
use backupscheduler::retention::RetentionEngine;
use backupscheduler::scheduler::Scheduler;
use backupscheduler::store::{BackupStore, Catalog, MemoryStore, PgStore};
use backupscheduler::utils::format_file_size;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATH: &str = "config.json";
const PG_MAX_CONNECTIONS: u32 = 5;

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();

    let args: Vec<String> = env::args().skip(1).collect();
    let verbose = args.iter().any(|a| a == "--verbose" || a == "-v");
    setup_logging(verbose);

    match run_app(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<AppError>() {
                Some(app) if app.is_input_error() => error!(error = %app, "Rejected input"),
                _ => error!(error = ?e, "Operation failed"),
            }
            ExitCode::FAILURE
        }
    }
}

/// Logs to stderr in a compact format, or to the file named by
/// `BACKUP_LOG_FILE` in a detailed one. `RUST_LOG` overrides the level.
fn setup_logging(verbose: bool) {
    use tracing_subscriber::{EnvFilter, fmt};

    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let file = env::var("BACKUP_LOG_FILE").ok().and_then(|path| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| eprintln!("Cannot open log file {}: {}", path, e))
            .ok()
    });

    match file {
        Some(file) => fmt()
            .with_env_filter(env_filter)
            .with_writer(file)
            .with_ansi(false)
            .with_target(true)
            .with_thread_names(true)
            .with_line_number(true)
            .init(),
        None => fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .compact()
            .init(),
    }
}

async fn run_app(args: Vec<String>) -> Result<()> {
    let config_path = env::var("BACKUP_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
    let app_config = AppConfig::load_from_json(&config_path).with_context(|| {
        format!(
            "Failed to load application configuration from {}",
            config_path.display()
        )
    })?;

    let delete_files = args.iter().any(|a| a == "--files");
    let mut positional: Vec<String> = args.into_iter().filter(|a| !a.starts_with('-')).collect();
    if positional.is_empty() {
        positional = prompt_choice()?
            .split_whitespace()
            .map(str::to_string)
            .collect();
    }
    let choice = positional.first().cloned().unwrap_or_default();

    let (catalog, store) = open_store(&app_config.store).await?;
    let executor = BackupExecutor::new(
        catalog,
        store.clone(),
        Arc::new(CommandDumper::from_config(&app_config.backup)),
        &app_config.backup,
    );

    match choice.as_str() {
        "1" | "scheduler" => {
            let handle = Scheduler::new(executor, app_config.scheduler.clone())
                .start()
                .await
                .context("Failed to start scheduler")?;
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for shutdown signal")?;
            info!("Shutdown requested");
            handle.stop().await;
        }
        "2" | "backup" => {
            let database_id = id_arg(&positional, "database_id")?;
            let run = executor.trigger_manual_backup(database_id).await?;
            let run = executor
                .execute_run(run.id)
                .await
                .context("Backup run could not be recorded")?;
            println!(
                "Run {} ({}) finished: {}, size {}",
                run.id,
                run.name,
                run.status,
                format_file_size(run.file_size)
            );
            for (destination, result) in &run.destination_results {
                match (&result.file_path, &result.error) {
                    (Some(path), _) if result.success => {
                        println!("  {} -> {}", destination, path.display())
                    }
                    (_, Some(err)) => println!("  {} failed: {}", destination, err),
                    _ => println!("  {} failed", destination),
                }
            }
            if let Some(msg) = &run.error_message {
                println!("  error: {}", msg);
            }
        }
        "3" | "retention" => {
            let schedule_id = id_arg(&positional, "schedule_id")?;
            let report = RetentionEngine::new(store)
                .run_for_schedule(schedule_id)
                .await?;
            println!(
                "Retention for schedule {}: {} run(s) deleted, {} file(s) removed",
                report.schedule_id,
                report.runs_deleted.len(),
                report.files_removed
            );
            for err in &report.errors {
                println!("  {}", err);
            }
        }
        "4" | "status" => {
            let run_id = id_arg(&positional, "run_id")?;
            let run = executor.run_status(run_id).await?;
            println!("{}", serde_json::to_string_pretty(&run)?);
        }
        "5" | "verify" => {
            let run_id = id_arg(&positional, "run_id")?;
            let report = executor.verify_run(run_id).await?;
            for check in &report.checks {
                println!(
                    "  {} {}: {} ({})",
                    if check.ok { "OK  " } else { "FAIL" },
                    check.destination,
                    check.file_path.display(),
                    check
                        .detail
                        .clone()
                        .unwrap_or_else(|| format_file_size(check.actual_size))
                );
            }
            if !report.all_ok() {
                anyhow::bail!("Run {} failed verification", run_id);
            }
        }
        "6" | "delete" => {
            let run_id = id_arg(&positional, "run_id")?;
            let report = executor.delete_run(run_id, delete_files).await?;
            println!(
                "Run {} deleted, {} file(s) removed",
                run_id, report.files_removed
            );
            for err in &report.file_errors {
                warn!(run_id, error = %err, "File left behind");
            }
        }
        "7" | "runs" => {
            let database_id = id_arg(&positional, "database_id")?;
            let runs = store.list_runs_for_database(database_id).await?;
            if runs.is_empty() {
                println!("No runs recorded for database {}", database_id);
            }
            for run in &runs {
                let origin = run
                    .schedule_id
                    .map_or_else(|| "manual".to_string(), |id| format!("schedule {}", id));
                println!(
                    "  {:>6}  {:<12} {:<28} {:>10}  {}  ({})",
                    run.id,
                    run.status.as_str(),
                    run.name,
                    format_file_size(run.file_size),
                    run.created_at.format("%Y-%m-%d %H:%M:%S"),
                    origin
                );
            }
        }
        _ => {
            println!(
                "Invalid choice. Use scheduler, backup <database_id>, retention <schedule_id>, \
                 status <run_id>, verify <run_id>, delete <run_id> [--files] or runs <database_id>."
            );
            anyhow::bail!("Invalid operation choice");
        }
    }
    Ok(())
}

async fn open_store(config: &StoreConfig) -> Result<(Arc<dyn Catalog>, Arc<dyn BackupStore>)> {
    match config {
        StoreConfig::Postgres { database_url } => {
            let store = PgStore::connect(database_url, PG_MAX_CONNECTIONS)
                .await
                .context("Failed to connect to the backup database")?;
            store
                .ensure_schema()
                .await
                .context("Failed to prepare backup tables")?;
            let store = Arc::new(store);
            let catalog: Arc<dyn Catalog> = store.clone();
            let store: Arc<dyn BackupStore> = store;
            Ok((catalog, store))
        }
        StoreConfig::Memory(seed) => {
            warn!("No database_url configured; using the in-memory catalog from config.json");
            let store = Arc::new(MemoryStore::from_seed(seed.clone()));
            let catalog: Arc<dyn Catalog> = store.clone();
            let store: Arc<dyn BackupStore> = store;
            Ok((catalog, store))
        }
    }
}

fn id_arg(positional: &[String], name: &str) -> Result<i64> {
    let raw = positional
        .get(1)
        .with_context(|| format!("Missing <{}> argument", name))?;
    raw.parse::<i64>()
        .with_context(|| format!("<{}> must be an integer, got '{}'", name, raw))
}

/// Prompts for an operation when none was given on the command line.
fn prompt_choice() -> Result<String> {
    use std::io::{Write, stdin, stdout};

    println!("Select an operation:");
    println!("1. Run scheduler (or type 'scheduler')");
    println!("2. Back up a database now (or type 'backup <database_id>')");
    println!("3. Apply retention for a schedule (or type 'retention <schedule_id>')");
    println!("4. Show a run (or type 'status <run_id>')");
    println!("5. Verify a run's files (or type 'verify <run_id>')");
    println!("6. Delete a run (or type 'delete <run_id>')");
    println!("7. List a database's runs, newest first (or type 'runs <database_id>')");
    print!("Enter your choice: ");
    stdout().flush().context("Failed to flush stdout")?;

    let mut input = String::new();
    stdin()
        .read_line(&mut input)
        .context("Failed to read user input")?;
    Ok(input.trim().to_string())
}
