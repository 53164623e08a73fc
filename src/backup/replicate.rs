// backupscheduler/src/backup/replicate.rs
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::db_dump::DumpArtifact;
use crate::errors::{AppError, Result};
use crate::models::{Destination, DestinationResult, DestinationResults, RunStatus};
use crate::utils::disk::{available_space, is_writable};
use crate::utils::{format_file_size, sanitize_path_component};

/// Copies one artifact to every destination, each independently.
#[derive(Debug, Clone)]
pub struct Replicator {
    space_headroom: f64,
}

impl Default for Replicator {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_SPACE_HEADROOM)
    }
}

/// `{destination_root}/{project_name}/{database_name}`
pub fn target_dir(destination_root: &Path, project_name: &str, database_name: &str) -> PathBuf {
    destination_root
        .join(sanitize_path_component(project_name))
        .join(sanitize_path_component(database_name))
}

/// Overall run status from per-destination outcomes. Depends only on the
/// success count and total, never on ordering.
pub fn aggregate_status(results: &DestinationResults) -> RunStatus {
    let total = results.len();
    let succeeded = results.values().filter(|r| r.success).count();
    if total == 0 || succeeded == 0 {
        RunStatus::Failed
    } else if succeeded < total {
        RunStatus::Partial
    } else {
        RunStatus::Completed
    }
}

impl Replicator {
    pub fn new(space_headroom: f64) -> Self {
        Self { space_headroom }
    }

    /// Copies `artifact` into each destination in order. A failing destination
    /// is recorded and skipped; nothing already copied is rolled back.
    pub async fn replicate(
        &self,
        artifact: &DumpArtifact,
        destinations: &[Destination],
        project_name: &str,
        database_name: &str,
    ) -> DestinationResults {
        let mut results = DestinationResults::new();
        let mut seen = HashSet::new();

        for destination in destinations {
            let key = destination.key();
            if !seen.insert(key.clone()) {
                warn!(destination = %key, "Duplicate destination path skipped");
                continue;
            }

            let source = artifact.path.clone();
            let source_size = artifact.size_bytes;
            let dir = target_dir(&destination.path, project_name, database_name);
            let root = destination.path.clone();
            let headroom = self.space_headroom;

            let outcome = tokio::task::spawn_blocking(move || {
                copy_to_destination(&source, source_size, &root, &dir, headroom)
            })
            .await
            .map_err(AppError::from)
            .and_then(|r| r);

            let result = match outcome {
                Ok((file_path, size)) => {
                    info!(
                        destination = %key,
                        file = %file_path.display(),
                        size = %format_file_size(Some(size)),
                        "Backup copied to destination"
                    );
                    DestinationResult::succeeded(file_path, size)
                }
                Err(e) => {
                    let reason = match e {
                        AppError::Destination { reason, .. } => reason,
                        other => other.to_string(),
                    };
                    warn!(destination = %key, error = %reason, "Destination failed");
                    DestinationResult::failed(reason)
                }
            };
            results.insert(key, result);
        }

        results
    }
}

/// Writability, free-space, copy, verify. The artifact is written under a
/// `.partial` name and only renamed into place once complete.
fn copy_to_destination(
    source: &Path,
    source_size: u64,
    root: &Path,
    dir: &Path,
    headroom: f64,
) -> Result<(PathBuf, u64)> {
    let root_label = root.display().to_string();
    let file_name = source
        .file_name()
        .ok_or_else(|| AppError::destination(&root_label, "Artifact has no file name"))?;

    if let Err(e) = fs::create_dir_all(dir) {
        let reason = if e.kind() == std::io::ErrorKind::PermissionDenied {
            format!("Destination not writable: {}", root_label)
        } else {
            format!("Failed to create directory {}: {}", dir.display(), e)
        };
        return Err(AppError::destination(&root_label, reason));
    }

    if !is_writable(dir) {
        return Err(AppError::destination(
            &root_label,
            format!("Destination not writable: {}", root_label),
        ));
    }

    let required = (source_size as f64 * headroom).ceil();
    let available = available_space(dir).map_err(|e| {
        AppError::destination(&root_label, format!("Failed to read free space: {}", e))
    })?;
    if (available as f64) < required {
        return Err(AppError::destination(
            &root_label,
            format!(
                "Insufficient space at {}: need {}, available {}",
                root_label,
                format_file_size(Some(required as u64)),
                format_file_size(Some(available))
            ),
        ));
    }

    let target = dir.join(file_name);
    let mut partial_name = file_name.to_os_string();
    partial_name.push(".partial");
    let partial = dir.join(partial_name);

    let copied = fs::copy(source, &partial).and_then(|_| fs::rename(&partial, &target));
    if let Err(e) = copied {
        let _ = fs::remove_file(&partial);
        return Err(AppError::destination(&root_label, format!("Copy failed: {}", e)));
    }

    match fs::metadata(&target) {
        Ok(meta) if meta.len() == source_size => Ok((target, meta.len())),
        Ok(meta) => {
            let _ = fs::remove_file(&target);
            Err(AppError::destination(
                &root_label,
                format!(
                    "File copy verification failed: expected {} bytes, found {}",
                    source_size,
                    meta.len()
                ),
            ))
        }
        Err(_) => Err(AppError::destination(&root_label, "File copy verification failed")),
    }
}
