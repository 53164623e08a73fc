// backupscheduler/src/backup/archive.rs
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs::File;
use std::path::{Path, PathBuf};
use tar::Builder;
use tracing::debug;
use walkdir::WalkDir;

use crate::errors::{AppError, Result};

/// Packs a directory-shaped dump (e.g. mongodump output) into one `.tar.gz`
/// artifact. Paths inside the archive are relative to `source_dir`.
///
/// On error the partially written archive is left for the caller to remove.
pub fn create_tar_gz_archive(source_dir: &Path, archive_dest_path: &Path) -> Result<PathBuf> {
    if !source_dir.is_dir() {
        return Err(AppError::dump(format!(
            "Source for archival is not a directory: {}",
            source_dir.display()
        )));
    }
    if let Some(parent) = archive_dest_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    debug!(
        source = %source_dir.display(),
        archive = %archive_dest_path.display(),
        "Packing dump directory"
    );

    let archive_file = File::create(archive_dest_path)?;
    let enc = GzEncoder::new(archive_file, Compression::default());
    let mut tar_builder = Builder::new(enc);

    for entry in WalkDir::new(source_dir).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            AppError::dump(format!(
                "Failed to walk directory {}: {}",
                source_dir.display(),
                e
            ))
        })?;
        let path = entry.path();
        let name = path
            .strip_prefix(source_dir)
            .map_err(|e| AppError::Generic(e.to_string()))?;

        if name.as_os_str().is_empty() {
            continue;
        }

        if entry.file_type().is_dir() {
            tar_builder.append_dir(name, path)?;
        } else if entry.file_type().is_file() {
            tar_builder.append_path_with_name(path, name)?;
        }
    }

    let encoder = tar_builder.into_inner()?;
    encoder.finish()?;

    Ok(archive_dest_path.to_path_buf())
}
