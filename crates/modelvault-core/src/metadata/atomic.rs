//! Crash-safe file replacement.
//!
//! Content is staged in a sibling temp file, synced, and renamed over the target.
//! Readers see either the old file or the new one.

use crate::{Result, VaultError};
use serde::{de::DeserializeOwned, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::debug;

/// Parse the JSON document at `path`, or `None` when there is no such file.
pub fn atomic_read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let text = match fs::read_to_string(path) {
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        other => other.map_err(|e| VaultError::io_with_path(e, path))?,
    };
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|e| VaultError::Json {
            message: format!("{} is not valid JSON: {}", path.display(), e),
            source: Some(e),
        })
}

/// Replace `path` with `data` rendered as JSON, indented when `pretty` is set.
pub fn atomic_write_json<T: Serialize>(path: &Path, data: &T, pretty: bool) -> Result<()> {
    atomic_write_with(path, |writer| {
        let rendered = if pretty {
            serde_json::to_writer_pretty(writer, data)
        } else {
            serde_json::to_writer(writer, data)
        };
        rendered.map_err(|e| VaultError::Json {
            message: format!("cannot serialize {}: {}", path.display(), e),
            source: Some(e),
        })
    })
}

/// Stage whatever `write` produces and move it over `path`.
///
/// When `write` fails, the staged file is discarded and `path` keeps its old content.
pub fn atomic_write_with<T, F>(path: &Path, write: F) -> Result<T>
where
    F: FnOnce(&mut BufWriter<&File>) -> Result<T>,
{
    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    fs::create_dir_all(dir).map_err(|e| VaultError::io_with_path(e, dir))?;

    let staged = NamedTempFile::new_in(dir).map_err(|e| VaultError::io_with_path(e, dir))?;
    let output = {
        let mut writer = BufWriter::new(staged.as_file());
        let output = write(&mut writer)?;
        writer
            .flush()
            .and_then(|_| staged.as_file().sync_all())
            .map_err(|e| VaultError::io_with_path(e, staged.path()))?;
        output
    };
    staged
        .persist(path)
        .map_err(|e| VaultError::io_with_path(e.error, path))?;

    debug!("Replaced {}", path.display());
    Ok(output)
}
