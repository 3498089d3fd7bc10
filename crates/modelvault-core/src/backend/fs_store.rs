//! Directory-backed object store with `file://` locators.

use crate::backend::{blob_key, BackendLock, StorageBackend};
use crate::config::BackendConfig;
use crate::metadata::{atomic_write_with, ModelMeta};
use crate::{Result, VaultError};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Stores blobs as files below a root directory.
///
/// Uploads must happen while the sentinel lock is held. The sentinel is a plain
/// file: writers check it is absent, write their token and read it back. There is
/// no test-and-set, so two writers racing between the check and the write can
/// both believe they hold the lock.
#[derive(Debug)]
pub struct FsObjectStore {
    root: PathBuf,
    lock_timeout: Duration,
    held: Mutex<Option<String>>,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let root = if root.is_absolute() {
            root
        } else {
            std::env::current_dir()
                .map_err(|e| VaultError::io_with_path(e, &root))?
                .join(root)
        };
        if root.exists() && !root.is_dir() {
            return Err(VaultError::BackendUnavailable {
                backend: "fs".to_string(),
                message: format!("{} is not a directory", root.display()),
            });
        }
        Ok(Self {
            root,
            lock_timeout: BackendConfig::LOCK_TIMEOUT,
            held: Mutex::new(None),
        })
    }

    /// How long [`StorageBackend::lock`] waits for a foreign sentinel to disappear.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Public locator of `key`.
    pub fn locator(&self, key: &str) -> Result<String> {
        url::Url::from_file_path(self.root.join(key))
            .map(|url| url.to_string())
            .map_err(|_| VaultError::BackendUnavailable {
                backend: self.name().to_string(),
                message: format!("cannot build a locator below {}", self.root.display()),
            })
    }

    fn store_dir(&self) -> Result<&Path> {
        if self.root.is_dir() {
            Ok(&self.root)
        } else {
            Err(VaultError::BackendUnavailable {
                backend: self.name().to_string(),
                message: format!("{} does not exist, reset the backend first", self.root.display()),
            })
        }
    }

    fn sentinel(&self) -> PathBuf {
        self.root.join(BackendConfig::SENTINEL)
    }

    /// Token of the sentinel this process holds.
    ///
    /// The guarded value is a plain token, so a writer which panicked while holding
    /// it leaves nothing half-updated behind.
    fn held(&self) -> MutexGuard<'_, Option<String>> {
        self.held.lock().unwrap_or_else(|poisoned| {
            warn!("Recovering the lock state of {}", self.root.display());
            PoisonError::into_inner(poisoned)
        })
    }

    fn is_locked(&self) -> bool {
        self.held().is_some()
    }

    fn acquire(&self) -> Result<String> {
        let sentinel = self.sentinel();
        let token = uuid::Uuid::new_v4().simple().to_string();
        let deadline = Instant::now() + self.lock_timeout;
        info!("Locking {}...", self.root.display());
        loop {
            while sentinel.exists() {
                if Instant::now() >= deadline {
                    return Err(VaultError::BackendUnavailable {
                        backend: self.name().to_string(),
                        message: format!(
                            "timed out waiting for {} to be released",
                            sentinel.display()
                        ),
                    });
                }
                warn!("Failed to acquire the lock, waiting...");
                std::thread::sleep(BackendConfig::LOCK_POLL_INTERVAL);
            }
            // Several writers may reach this point together.
            fs::write(&sentinel, &token).map_err(|e| VaultError::io_with_path(e, &sentinel))?;
            match fs::read_to_string(&sentinel) {
                Ok(content) if content == token => break,
                _ => warn!("Failed to acquire the lock, retrying..."),
            }
        }
        *self.held() = Some(token.clone());
        Ok(token)
    }

    fn release(&self, token: &str) {
        let sentinel = self.sentinel();
        match fs::read_to_string(&sentinel) {
            Ok(content) if content == token => {
                if let Err(e) = fs::remove_file(&sentinel) {
                    warn!("Failed to remove {}: {}", sentinel.display(), e);
                }
            }
            Ok(_) => warn!("{} was taken over by another writer", sentinel.display()),
            Err(e) => warn!("Failed to read {}: {}", sentinel.display(), e),
        }
        *self.held() = None;
        debug!("Unlocked {}", self.root.display());
    }
}

impl StorageBackend for FsObjectStore {
    fn name(&self) -> &'static str {
        "fs"
    }

    fn reset(&self, force: bool) -> Result<()> {
        if self.root.is_dir() {
            let entries: Vec<PathBuf> = fs::read_dir(&self.root)
                .map_err(|e| VaultError::io_with_path(e, &self.root))?
                .filter_map(|entry| entry.ok().map(|entry| entry.path()))
                .filter(|path| {
                    path.file_name().and_then(|name| name.to_str()) != Some(BackendConfig::SENTINEL)
                })
                .collect();
            if !entries.is_empty() {
                if !force {
                    return Err(VaultError::AlreadyInitialized {
                        namespace: self.root.display().to_string(),
                    });
                }
                info!("Wiping {}", self.root.display());
                for path in entries {
                    let removed = if path.is_dir() {
                        fs::remove_dir_all(&path)
                    } else {
                        fs::remove_file(&path)
                    };
                    removed.map_err(|e| VaultError::io_with_path(e, &path))?;
                }
            }
        }
        fs::create_dir_all(&self.root).map_err(|e| VaultError::io_with_path(e, &self.root))?;
        Ok(())
    }

    fn lock(&self) -> Result<BackendLock<'_>> {
        self.store_dir()?;
        let token = self.acquire()?;
        Ok(BackendLock::new(move || self.release(&token)))
    }

    fn upload_model(&self, path: &Path, meta: &ModelMeta, force: bool) -> Result<String> {
        let root = self.store_dir()?;
        if !self.is_locked() {
            return Err(VaultError::TransactionRequired {
                operation: "upload_model".to_string(),
            });
        }
        let key = blob_key(meta);
        let target = root.join(&key);
        if target.exists() && !force {
            error!("Model {} already exists, aborted.", meta.id);
            return Err(VaultError::AlreadyExists {
                model_id: meta.id.clone(),
                key,
            });
        }
        info!("Uploading {} from {}...", meta.model_type, path.display());
        let mut source = File::open(path).map_err(|e| VaultError::io_with_path(e, path))?;
        atomic_write_with(&target, |writer| {
            std::io::copy(&mut source, writer)
                .map(|_| ())
                .map_err(|e| VaultError::io_with_path(e, path))
        })?;
        self.locator(&key)
    }

    fn delete_model(&self, meta: &ModelMeta) -> Result<()> {
        let root = self.store_dir()?;
        let target = root.join(blob_key(meta));
        match fs::remove_file(&target) {
            Ok(()) => info!("Deleted {}", target.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Model {} was already deleted", meta.id);
                return Ok(());
            }
            Err(e) => return Err(VaultError::io_with_path(e, &target)),
        }
        if let Some(parent) = target.parent() {
            // Only succeeds once the type directory is empty.
            let _ = fs::remove_dir(parent);
        }
        Ok(())
    }
}
