pub mod disk;

use std::ffi::OsStr;
use std::path::PathBuf;

use crate::errors::{AppError, Result};

/// Finds a dump tool in `search_path` (a PATH-style list) or, when that is
/// `None`, in the system PATH.
pub fn find_executable(name: &str, search_path: Option<&OsStr>) -> Result<PathBuf> {
    let found = match search_path {
        Some(paths) => which::which_in(name, Some(paths), std::env::current_dir()?),
        None => which::which(name),
    };
    found.map_err(|_| {
        AppError::dump(format!(
            "{} executable not found in PATH. Please ensure the database client tools are installed and in your PATH.",
            name
        ))
    })
}

/// Makes a catalog name safe to use as a single path component.
pub fn sanitize_path_component(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "default".to_string(),
        other => other.to_string(),
    }
}

/// Human-readable size, e.g. "1.50 MB".
pub fn format_file_size(size_bytes: Option<u64>) -> String {
    let Some(size_bytes) = size_bytes else {
        return "Unknown".to_string();
    };
    if size_bytes == 0 {
        return "0 B".to_string();
    }

    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = size_bytes as f64;
    let mut unit_index = 0;
    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", size_bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}
