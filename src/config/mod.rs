// backupscheduler/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::models::{DatabaseInfo, Destination, Schedule};

pub const DEFAULT_TEMP_DUMP_ROOT: &str = "/tmp/backups";
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_FIRE_TOLERANCE_SECS: i64 = 30;
pub const DEFAULT_DUMP_TIMEOUT_SECS: u64 = 3600;
pub const DEFAULT_MAX_CONCURRENT_RUNS: usize = 4;
pub const DEFAULT_SPACE_HEADROOM: f64 = 1.10;

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CatalogSeed {
    #[serde(default)]
    pub databases: Vec<DatabaseInfo>,
    #[serde(default)]
    pub destinations: Vec<Destination>,
    #[serde(default)]
    pub schedules: Vec<Schedule>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub database_url: Option<String>,
    pub temp_dump_root: Option<PathBuf>,
    pub poll_interval_secs: Option<u64>,
    pub fire_tolerance_secs: Option<i64>,
    pub dump_timeout_secs: Option<u64>,
    pub max_concurrent_runs: Option<usize>,
    pub space_headroom: Option<f64>,
    pub dump_tool_path: Option<String>,
    pub catalog: Option<CatalogSeed>,
}

// Application's internal configuration structs
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub fire_tolerance: chrono::Duration,
    pub max_concurrent_runs: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            fire_tolerance: chrono::Duration::seconds(DEFAULT_FIRE_TOLERANCE_SECS),
            max_concurrent_runs: DEFAULT_MAX_CONCURRENT_RUNS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub temp_dump_root: PathBuf,
    pub dump_timeout: Duration,
    /// Free space required at a destination, as a multiple of the artifact size.
    pub space_headroom: f64,
    /// PATH-style directories searched for pg_dump/mysqldump/mongodump.
    /// `None` means the process PATH.
    pub tool_search_path: Option<OsString>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            temp_dump_root: PathBuf::from(DEFAULT_TEMP_DUMP_ROOT),
            dump_timeout: Duration::from_secs(DEFAULT_DUMP_TIMEOUT_SECS),
            space_headroom: DEFAULT_SPACE_HEADROOM,
            tool_search_path: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum StoreConfig {
    Postgres { database_url: String },
    Memory(CatalogSeed),
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub scheduler: SchedulerConfig,
    pub backup: BackupConfig,
    pub store: StoreConfig,
}

impl AppConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let mut raw_json_config: RawJsonConfig = serde_json::from_str(&config_content)
            .with_context(|| {
                format!(
                    "Failed to parse JSON from config file at {}",
                    config_path.display()
                )
            })?;
        apply_env_overrides(&mut raw_json_config)?;
        Self::from_raw(raw_json_config)
    }

    pub fn from_raw(raw: RawJsonConfig) -> Result<Self> {
        let poll_interval_secs = raw.poll_interval_secs.unwrap_or(DEFAULT_POLL_INTERVAL_SECS);
        if poll_interval_secs == 0 {
            anyhow::bail!("poll_interval_secs must be greater than zero");
        }
        let max_concurrent_runs = raw.max_concurrent_runs.unwrap_or(DEFAULT_MAX_CONCURRENT_RUNS);
        if max_concurrent_runs == 0 {
            anyhow::bail!("max_concurrent_runs must be greater than zero");
        }
        let space_headroom = raw.space_headroom.unwrap_or(DEFAULT_SPACE_HEADROOM);
        if !(space_headroom >= 1.0) {
            anyhow::bail!("space_headroom must be at least 1.0, got {}", space_headroom);
        }
        let dump_timeout_secs = raw.dump_timeout_secs.unwrap_or(DEFAULT_DUMP_TIMEOUT_SECS);
        if dump_timeout_secs == 0 {
            anyhow::bail!("dump_timeout_secs must be greater than zero");
        }

        let temp_dump_root = raw
            .temp_dump_root
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_TEMP_DUMP_ROOT));

        let store = match raw.database_url.filter(|url| !url.trim().is_empty()) {
            Some(database_url) => {
                if raw.catalog.is_some() {
                    warn!("Both database_url and catalog are set in config.json; the catalog seed is ignored.");
                }
                StoreConfig::Postgres { database_url }
            }
            None => StoreConfig::Memory(raw.catalog.unwrap_or_default()),
        };

        Ok(AppConfig {
            scheduler: SchedulerConfig {
                poll_interval: Duration::from_secs(poll_interval_secs),
                fire_tolerance: chrono::Duration::seconds(
                    raw.fire_tolerance_secs.unwrap_or(DEFAULT_FIRE_TOLERANCE_SECS).max(0),
                ),
                max_concurrent_runs,
            },
            backup: BackupConfig {
                temp_dump_root,
                dump_timeout: Duration::from_secs(dump_timeout_secs),
                space_headroom,
                tool_search_path: raw
                    .dump_tool_path
                    .filter(|p| !p.trim().is_empty())
                    .map(OsString::from),
            },
            store,
        })
    }
}

/// `DATABASE_URL`, `TEMP_DUMP_ROOT` and `MAX_CONCURRENT_RUNS` take precedence over config.json.
fn apply_env_overrides(raw: &mut RawJsonConfig) -> Result<()> {
    if let Ok(url) = env::var("DATABASE_URL") {
        raw.database_url = Some(url);
    }
    if let Ok(root) = env::var("TEMP_DUMP_ROOT") {
        raw.temp_dump_root = Some(PathBuf::from(root));
    }
    if let Ok(max) = env::var("MAX_CONCURRENT_RUNS") {
        let max = max
            .trim()
            .parse::<usize>()
            .with_context(|| format!("MAX_CONCURRENT_RUNS must be a positive integer, got '{}'", max))?;
        raw.max_concurrent_runs = Some(max);
    }
    Ok(())
}
