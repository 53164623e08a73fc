// backupscheduler/src/models.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::errors::AppError;

fn default_true() -> bool {
    true
}

/// Database engines the catalog can describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    #[serde(rename = "postgresql")]
    PostgreSql,
    #[serde(rename = "mysql")]
    MySql,
    #[serde(rename = "mongodb")]
    MongoDb,
    Redis,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::PostgreSql => "postgresql",
            EngineKind::MySql => "mysql",
            EngineKind::MongoDb => "mongodb",
            EngineKind::Redis => "redis",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgresql" | "postgres" => Ok(EngineKind::PostgreSql),
            "mysql" | "mariadb" => Ok(EngineKind::MySql),
            "mongodb" | "mongo" => Ok(EngineKind::MongoDb),
            "redis" => Ok(EngineKind::Redis),
            other => Err(AppError::UnsupportedEngine(other.to_string())),
        }
    }
}

/// Connection details for one catalogued database. Credentials are already decrypted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub id: i64,
    /// Display name, used for run names and destination sub-directories.
    pub name: String,
    pub engine: EngineKind,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Logical database name on the server.
    pub database_name: String,
    /// Owning project/group; first path component under each destination root.
    pub project_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub id: i64,
    pub database_id: i64,
    pub path: PathBuf,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Destination {
    /// Key under which this destination's outcome is recorded on a run.
    pub fn key(&self) -> String {
        self.path.display().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: i64,
    pub name: String,
    pub database_id: i64,
    pub cron_expression: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub retention_days: Option<i64>,
    pub max_backups: Option<i64>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Partial,
}

impl RunStatus {
    pub const ALL: [RunStatus; 5] = [
        RunStatus::Pending,
        RunStatus::InProgress,
        RunStatus::Completed,
        RunStatus::Failed,
        RunStatus::Partial,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::InProgress => "in_progress",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Partial => "partial",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Partial
        )
    }

    /// PENDING -> IN_PROGRESS -> terminal. A pending run may also fail before it starts.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        match (self, next) {
            (RunStatus::Pending, RunStatus::InProgress) => true,
            (RunStatus::Pending, RunStatus::Failed) => true,
            (RunStatus::InProgress, s) => s.is_terminal(),
            _ => false,
        }
    }

    /// Whether a stored record in this status may be overwritten with one in
    /// `next`. A non-terminal record may be rewritten without a status change.
    pub fn accepts_update_to(&self, next: RunStatus) -> bool {
        (*self == next && !self.is_terminal()) || self.can_transition_to(next)
    }

    /// Stored statuses from which an update to `next` is accepted.
    pub fn predecessors_of(next: RunStatus) -> Vec<RunStatus> {
        RunStatus::ALL
            .into_iter()
            .filter(|from| from.accepts_update_to(next))
            .collect()
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "in_progress" => Ok(RunStatus::InProgress),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "partial" => Ok(RunStatus::Partial),
            other => Err(AppError::Generic(format!("unknown run status: {}", other))),
        }
    }
}

/// Outcome of copying one artifact to one destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationResult {
    pub success: bool,
    pub file_path: Option<PathBuf>,
    pub size_bytes: Option<u64>,
    pub error: Option<String>,
}

impl DestinationResult {
    pub fn succeeded(file_path: PathBuf, size_bytes: u64) -> Self {
        Self {
            success: true,
            file_path: Some(file_path),
            size_bytes: Some(size_bytes),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            file_path: None,
            size_bytes: None,
            error: Some(error.into()),
        }
    }
}

/// Per-destination outcomes keyed by destination path.
pub type DestinationResults = BTreeMap<String, DestinationResult>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRun {
    pub id: i64,
    pub name: String,
    pub database_id: i64,
    /// `None` for manual runs.
    pub schedule_id: Option<i64>,
    pub status: RunStatus,
    pub destination_results: DestinationResults,
    pub file_size: Option<u64>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
}

impl BackupRun {
    /// A fresh PENDING record; the store assigns the id.
    pub fn pending(name: String, database_id: i64, schedule_id: Option<i64>) -> Self {
        Self {
            id: 0,
            name,
            database_id,
            schedule_id,
            status: RunStatus::Pending,
            destination_results: DestinationResults::new(),
            file_size: None,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            duration_seconds: None,
        }
    }
}

/// Run name: `{database_name}_{YYYYMMDD_HHMMSS}`.
pub fn run_name(database_name: &str, at: DateTime<Utc>) -> String {
    format!("{}_{}", database_name, at.format("%Y%m%d_%H%M%S"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn status_is_monotonic() {
        use RunStatus::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(Partial));
        assert!(InProgress.can_transition_to(Failed));
        for terminal in [Completed, Failed, Partial] {
            for next in [Pending, InProgress, Completed, Failed, Partial] {
                assert!(!terminal.can_transition_to(next), "{} -> {}", terminal, next);
            }
        }
        assert!(!InProgress.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Completed));
    }

    #[test]
    fn update_predecessors_follow_transitions() {
        use RunStatus::*;
        assert_eq!(RunStatus::predecessors_of(Pending), vec![Pending]);
        assert_eq!(RunStatus::predecessors_of(InProgress), vec![Pending, InProgress]);
        assert_eq!(RunStatus::predecessors_of(Completed), vec![InProgress]);
        assert_eq!(RunStatus::predecessors_of(Partial), vec![InProgress]);
        assert_eq!(RunStatus::predecessors_of(Failed), vec![Pending, InProgress]);
        assert!(!Completed.accepts_update_to(Completed));
    }

    #[test]
    fn engine_kind_parses_catalog_strings() -> anyhow::Result<()> {
        assert_eq!("PostgreSQL".parse::<EngineKind>()?, EngineKind::PostgreSql);
        assert_eq!("mysql".parse::<EngineKind>()?, EngineKind::MySql);
        assert_eq!("mongodb".parse::<EngineKind>()?, EngineKind::MongoDb);
        assert!(matches!(
            "oracle".parse::<EngineKind>(),
            Err(AppError::UnsupportedEngine(_))
        ));
        Ok(())
    }

    #[test]
    fn status_round_trips_through_storage_strings() -> anyhow::Result<()> {
        let status: RunStatus = "in_progress".parse()?;
        assert_eq!(status, RunStatus::InProgress);
        assert_eq!(serde_json::to_string(&RunStatus::Partial)?, "\"partial\"");
        Ok(())
    }

    #[test]
    fn run_name_uses_utc_timestamp() {
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 2, 0, 0).unwrap();
        assert_eq!(run_name("orders_db", at), "orders_db_20250101_020000");
    }
}
