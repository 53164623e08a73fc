// backupscheduler/src/backup/db_dump.rs
use async_trait::async_trait;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::archive::create_tar_gz_archive;
use crate::config::BackupConfig;
use crate::errors::{AppError, Result};
use crate::models::{DatabaseInfo, EngineKind};
use crate::utils::{find_executable, format_file_size};

/// A dump written to local transient storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpArtifact {
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Produces exactly one local artifact per call, or an error. Callers never
/// read a path unless `Ok` was returned.
#[async_trait]
pub trait DumpProducer: Send + Sync {
    async fn dump(&self, database: &DatabaseInfo, backup_name: &str) -> Result<DumpArtifact>;
}

/// Dumps through the engine's own client tool (pg_dump, mysqldump, mongodump).
#[derive(Debug, Clone)]
pub struct CommandDumper {
    temp_root: PathBuf,
    timeout: Duration,
    /// PATH-style list searched for the tools instead of the process PATH.
    tool_search_path: Option<OsString>,
}

/// A fully resolved invocation of an external dump tool.
#[derive(Clone)]
pub struct DumpCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub envs: Vec<(String, String)>,
    /// Where the tool writes; a directory for mongodump, a file otherwise.
    pub output: PathBuf,
}

impl DumpCommand {
    /// Arguments with secrets masked, for logging.
    pub fn redacted_args(&self) -> Vec<String> {
        let mut masked = Vec::with_capacity(self.args.len());
        let mut hide_next = false;
        for arg in &self.args {
            let arg = arg.to_string_lossy();
            if hide_next {
                masked.push("***".to_string());
                hide_next = false;
            } else {
                hide_next = arg == "--password";
                masked.push(arg.into_owned());
            }
        }
        masked
    }
}

impl CommandDumper {
    pub fn new(temp_root: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            temp_root: temp_root.into(),
            timeout,
            tool_search_path: None,
        }
    }

    pub fn with_tool_search_path(mut self, search_path: impl Into<OsString>) -> Self {
        self.tool_search_path = Some(search_path.into());
        self
    }

    pub fn from_config(config: &BackupConfig) -> Self {
        let dumper = Self::new(config.temp_dump_root.clone(), config.dump_timeout);
        match &config.tool_search_path {
            Some(paths) => dumper.with_tool_search_path(paths.clone()),
            None => dumper,
        }
    }

    /// `{backup_name}_{8 hex chars}`, unique per invocation.
    fn unique_stem(backup_name: &str) -> String {
        let id = Uuid::new_v4();
        format!("{}_{}", backup_name, hex::encode(&id.as_bytes()[..4]))
    }
}

/// Resolves the tool and arguments for one engine. Unsupported engines are
/// rejected before anything is looked up on PATH.
pub fn build_dump_command(
    database: &DatabaseInfo,
    temp_root: &Path,
    stem: &str,
    search_path: Option<&OsStr>,
) -> Result<DumpCommand> {
    let username = database.username.clone().unwrap_or_default();
    let password = database.password.clone().unwrap_or_default();

    match database.engine {
        EngineKind::PostgreSql => {
            let output = temp_root.join(format!("{}.dump", stem));
            let mut args: Vec<OsString> = vec![
                "-h".into(),
                database.host.clone().into(),
                "-p".into(),
                database.port.to_string().into(),
            ];
            if !username.is_empty() {
                args.push("-U".into());
                args.push(username.into());
            }
            args.extend([
                "-F".into(), // custom format
                "c".into(),
                "-b".into(), // include blobs
                "-v".into(),
                "-f".into(),
                output.clone().into_os_string(),
                database.database_name.clone().into(),
            ]);
            Ok(DumpCommand {
                program: find_executable("pg_dump", search_path)?,
                args,
                envs: vec![("PGPASSWORD".to_string(), password)],
                output,
            })
        }
        EngineKind::MySql => {
            let output = temp_root.join(format!("{}.dump", stem));
            let mut args: Vec<OsString> = vec![
                "-h".into(),
                database.host.clone().into(),
                "-P".into(),
                database.port.to_string().into(),
            ];
            if !username.is_empty() {
                args.push("-u".into());
                args.push(username.into());
            }
            args.extend([
                "--single-transaction".into(),
                "--routines".into(),
                "--triggers".into(),
                "--events".into(),
                "--result-file".into(),
                output.clone().into_os_string(),
                database.database_name.clone().into(),
            ]);
            Ok(DumpCommand {
                program: find_executable("mysqldump", search_path)?,
                args,
                envs: vec![("MYSQL_PWD".to_string(), password)],
                output,
            })
        }
        EngineKind::MongoDb => {
            let output = temp_root.join(stem);
            let mut args: Vec<OsString> = vec![
                "--host".into(),
                format!("{}:{}", database.host, database.port).into(),
            ];
            if !username.is_empty() {
                args.push("--username".into());
                args.push(username.into());
                args.push("--password".into());
                args.push(password.into());
                args.push("--authenticationDatabase".into());
                args.push("admin".into());
            }
            args.extend([
                "--db".into(),
                database.database_name.clone().into(),
                "--out".into(),
                output.clone().into_os_string(),
            ]);
            Ok(DumpCommand {
                program: find_executable("mongodump", search_path)?,
                args,
                envs: Vec::new(),
                output,
            })
        }
        EngineKind::Redis => Err(AppError::UnsupportedEngine(database.engine.to_string())),
    }
}

/// Runs a dump tool under a hard wall-clock limit. The child is killed when
/// the limit elapses.
pub async fn run_dump_command(command: &DumpCommand, limit: Duration) -> Result<()> {
    debug!(
        program = %command.program.display(),
        args = ?command.redacted_args(),
        "Running dump tool"
    );

    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .envs(command.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match timeout(limit, cmd.output()).await {
        Ok(result) => result.map_err(|e| {
            AppError::dump(format!(
                "Failed to execute {}: {}",
                command.program.display(),
                e
            ))
        })?,
        Err(_) => return Err(AppError::DumpTimeout(limit.as_secs())),
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let tool = command
            .program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "dump tool".to_string());
        return Err(AppError::dump(if stderr.is_empty() {
            format!("{} failed with status: {}", tool, output.status)
        } else {
            stderr
        }));
    }
    Ok(())
}

async fn remove_partial_output(path: &Path) {
    let result = if path.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    match result {
        Ok(()) => debug!(path = %path.display(), "Removed partial dump output"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove partial dump output"),
    }
}

#[async_trait]
impl DumpProducer for CommandDumper {
    async fn dump(&self, database: &DatabaseInfo, backup_name: &str) -> Result<DumpArtifact> {
        tokio::fs::create_dir_all(&self.temp_root).await?;

        let stem = Self::unique_stem(backup_name);
        let command = build_dump_command(
            database,
            &self.temp_root,
            &stem,
            self.tool_search_path.as_deref(),
        )?;
        info!(
            database = %database.name,
            engine = %database.engine,
            output = %command.output.display(),
            "Starting database dump"
        );

        if let Err(e) = run_dump_command(&command, self.timeout).await {
            remove_partial_output(&command.output).await;
            return Err(e);
        }

        let artifact_path = if database.engine == EngineKind::MongoDb {
            let dump_dir = command.output.clone();
            let archive_path = self.temp_root.join(format!("{}.dump.tar.gz", stem));
            let target = archive_path.clone();
            let packed = tokio::task::spawn_blocking(move || create_tar_gz_archive(&dump_dir, &target)).await;
            remove_partial_output(&command.output).await;
            match packed {
                Ok(Ok(path)) => path,
                Ok(Err(e)) => {
                    remove_partial_output(&archive_path).await;
                    return Err(e);
                }
                Err(e) => {
                    remove_partial_output(&archive_path).await;
                    return Err(AppError::Join(e));
                }
            }
        } else {
            command.output.clone()
        };

        let size_bytes = match tokio::fs::metadata(&artifact_path).await {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => {
                return Err(AppError::dump(format!(
                    "Dump tool reported success but produced no artifact at {}",
                    artifact_path.display()
                )));
            }
        };

        info!(
            database = %database.name,
            artifact = %artifact_path.display(),
            size = %format_file_size(Some(size_bytes)),
            "Database dump finished"
        );
        Ok(DumpArtifact {
            path: artifact_path,
            size_bytes,
        })
    }
}
