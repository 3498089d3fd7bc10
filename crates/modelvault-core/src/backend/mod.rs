//! Storage backends holding model blobs.
//!
//! A backend stores one blob per model under `<type>/<id>.mvlt` and hands out a
//! durable locator for it. The index repository only ever records locators.

mod fs_store;
mod http_store;
mod registry;

pub use fs_store::FsObjectStore;
pub use http_store::HttpObjectStore;
pub use registry::{parse_backend_args, BackendArgs, BackendFactory, BackendRegistry};

use crate::config::ContainerConfig;
use crate::metadata::ModelMeta;
use crate::network::{file_locator_path, is_http_locator, DownloadManager};
use crate::{Result, VaultError};
use std::path::Path;
use tracing::info;

/// Where fetched bytes go.
#[derive(Debug)]
pub enum Destination<'a> {
    Path(&'a Path),
    Buffer(&'a mut Vec<u8>),
}

/// A held backend lock. Dropping it releases the lock.
pub struct BackendLock<'a> {
    release: Option<Box<dyn FnOnce() + 'a>>,
}

impl<'a> BackendLock<'a> {
    pub fn new(release: impl FnOnce() + 'a) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// A lock for backends without mutual exclusion.
    pub fn noop() -> Self {
        Self { release: None }
    }
}

impl Drop for BackendLock<'_> {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for BackendLock<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendLock")
            .field("held", &self.release.is_some())
            .finish()
    }
}

/// Capabilities of a blob store.
///
/// Every operation needing the store fails with [`VaultError::BackendUnavailable`]
/// when the store cannot be reached at all, as opposed to domain failures such as
/// [`VaultError::AlreadyExists`].
pub trait StorageBackend: Send + Sync {
    /// Registry name, e.g. `fs`.
    fn name(&self) -> &'static str;

    /// Prepare an empty namespace. Fails with [`VaultError::AlreadyInitialized`]
    /// if it holds models and `force` is false; with `force` it is wiped.
    fn reset(&self, force: bool) -> Result<()>;

    /// Take the backend lock around uploads. Backends without one return a no-op lock.
    fn lock(&self) -> Result<BackendLock<'_>> {
        Ok(BackendLock::noop())
    }

    /// Upload the model file at `path` and return its public locator.
    ///
    /// Fails with [`VaultError::AlreadyExists`] if the blob exists and `force` is false.
    fn upload_model(&self, path: &Path, meta: &ModelMeta, force: bool) -> Result<String>;

    /// Fetch the blob at `source` into `destination`.
    fn fetch_model(&self, source: &str, destination: Destination<'_>) -> Result<()> {
        fetch_locator(source, destination)
    }

    /// Delete the blob of `meta`. An already deleted blob is logged, not an error.
    fn delete_model(&self, meta: &ModelMeta) -> Result<()>;
}

/// Blob key of a model: `<type>/<id>.mvlt`.
pub fn blob_key(meta: &ModelMeta) -> String {
    format!(
        "{}/{}.{}",
        meta.model_type,
        meta.id,
        ContainerConfig::FILE_EXT
    )
}

/// Fetch a `file://` or `http(s)://` locator.
pub fn fetch_locator(source: &str, destination: Destination<'_>) -> Result<()> {
    if let Some(path) = file_locator_path(source) {
        info!("Fetching {}...", source);
        return match destination {
            Destination::Path(target) => {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| VaultError::io_with_path(e, parent))?;
                }
                std::fs::copy(&path, target)
                    .map(|_| ())
                    .map_err(|e| VaultError::io_with_path(e, &path))
            }
            Destination::Buffer(buffer) => {
                *buffer = std::fs::read(&path).map_err(|e| VaultError::io_with_path(e, &path))?;
                Ok(())
            }
        };
    }
    if is_http_locator(source) {
        info!("Fetching {}...", source);
        let downloader = DownloadManager::new()?;
        return match destination {
            Destination::Path(target) => downloader.download(source, target, None).map(|_| ()),
            Destination::Buffer(buffer) => {
                *buffer = downloader.download_to_vec(source, None)?;
                Ok(())
            }
        };
    }
    Err(VaultError::validation(
        "source",
        format!("unsupported locator {}", source),
    ))
}
