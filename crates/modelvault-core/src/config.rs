//! Centralized configuration for ModelVault.
//!
//! Constant groups cover the container format, the index repository and the
//! network layer. [`Settings`] holds the process-wide options and is built once
//! from an ordered list of sources, then passed by reference to collaborators.

use crate::metadata::atomic_read_json;
use crate::{Result, VaultError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Model container configuration.
pub struct ContainerConfig;

impl ContainerConfig {
    pub const MAGIC: &'static [u8; 8] = b"MVAULT\0\x01";
    pub const FILE_EXT: &'static str = "mvlt";
    pub const DEFAULT_NAME: &'static str = "default";
    pub const GENERIC_NAME: &'static str = "generic";
    pub const DEFAULT_LICENSE: &'static str = "Proprietary";
    pub const ZSTD_LEVEL: i32 = 3;
    pub const MAX_HEADER_BYTES: u64 = 64 * 1024 * 1024;
}

/// Index repository configuration.
pub struct IndexConfig;

impl IndexConfig {
    pub const INDEX_FILE: &'static str = "index.json";
    pub const README_FILE: &'static str = "README.md";
    pub const PUSH_BRANCH: &'static str = "master";
    pub const SCHEMES: &'static [&'static str] = &["git", "git+ssh", "ssh", "http", "https"];
    pub const DEFAULT_REMOTE: &'static str = "https://github.com/modelvault/models";
    pub const CACHE_DIR_NAME: &'static str = "modelvault";
}

/// Storage backend configuration.
pub struct BackendConfig;

impl BackendConfig {
    /// Sentinel object approximating a lock on the namespace.
    pub const SENTINEL: &'static str = "index.lock";
    /// Marker object written by `reset` on stores which cannot list their keys.
    pub const MARKER: &'static str = ".modelvault";
    pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(250);
    pub const LOCK_TIMEOUT: Duration = Duration::from_secs(60);
}

/// Network-related configuration.
pub struct NetworkConfig;

impl NetworkConfig {
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DOWNLOAD_CHUNK_SIZE: usize = 65536;
    pub const DOWNLOAD_PROGRESS_INTERVAL: Duration = Duration::from_millis(500);
    pub const DOWNLOAD_TEMP_SUFFIX: &'static str = ".part";
    pub const USER_AGENT: &'static str = concat!("modelvault/", env!("CARGO_PKG_VERSION"));
}

/// Environment variable names read by [`Settings::apply_env`].
pub struct EnvVars;

impl EnvVars {
    pub const VENDOR: &'static str = "MODELVAULT_VENDOR";
    pub const BACKEND: &'static str = "MODELVAULT_BACKEND";
    pub const BACKEND_ARGS: &'static str = "MODELVAULT_BACKEND_ARGS";
    pub const INDEX_REPO: &'static str = "MODELVAULT_INDEX_REPO";
    pub const CACHE_DIR: &'static str = "MODELVAULT_CACHE_DIR";
    pub const ALWAYS_SIGNOFF: &'static str = "MODELVAULT_ALWAYS_SIGNOFF";
}

/// A partial layer of settings. Every present key overrides the layers below it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SettingsOverride {
    pub vendor: Option<String>,
    pub backend: Option<String>,
    pub backend_args: Option<String>,
    pub index_repo: Option<String>,
    pub cache_dir: Option<PathBuf>,
    pub always_signoff: Option<bool>,
}

/// One configuration source, applied in order by [`Settings::load`].
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// Process environment (`MODELVAULT_*`).
    Env,
    /// A JSON file containing a [`SettingsOverride`]. Missing files are skipped.
    File(PathBuf),
    /// Caller supplied values, e.g. CLI flags.
    Overrides(SettingsOverride),
}

/// Process-wide settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub vendor: Option<String>,
    pub backend: Option<String>,
    pub backend_args: String,
    pub index_repo: String,
    pub cache_dir: PathBuf,
    pub always_signoff: bool,
}

impl Default for Settings {
    fn default() -> Self {
        let cache_dir = dirs::cache_dir()
            .or_else(|| dirs::home_dir().map(|home| home.join(".cache")))
            .unwrap_or_else(std::env::temp_dir)
            .join(IndexConfig::CACHE_DIR_NAME);
        Self {
            vendor: None,
            backend: None,
            backend_args: String::new(),
            index_repo: IndexConfig::DEFAULT_REMOTE.to_string(),
            cache_dir,
            always_signoff: false,
        }
    }
}

impl Settings {
    /// Build settings from the defaults followed by `sources`, in order.
    pub fn load(sources: &[ConfigSource]) -> Result<Self> {
        let mut settings = Self::default();
        for source in sources {
            match source {
                ConfigSource::Env => settings.apply_env(),
                ConfigSource::File(path) => settings.apply_file(path)?,
                ConfigSource::Overrides(layer) => settings.apply(layer),
            }
        }
        Ok(settings)
    }

    /// Apply one override layer.
    pub fn apply(&mut self, layer: &SettingsOverride) {
        if let Some(vendor) = &layer.vendor {
            self.vendor = Some(vendor.clone());
        }
        if let Some(backend) = &layer.backend {
            self.backend = Some(backend.clone());
        }
        if let Some(args) = &layer.backend_args {
            self.backend_args = args.clone();
        }
        if let Some(repo) = &layer.index_repo {
            self.index_repo = repo.clone();
        }
        if let Some(cache) = &layer.cache_dir {
            self.cache_dir = cache.clone();
        }
        if let Some(signoff) = layer.always_signoff {
            self.always_signoff = signoff;
        }
    }

    /// Apply the `MODELVAULT_*` environment variables.
    pub fn apply_env(&mut self) {
        let layer = Self::env_layer(|key| std::env::var(key).ok());
        self.apply(&layer);
    }

    fn env_layer(get: impl Fn(&str) -> Option<String>) -> SettingsOverride {
        let non_empty = |key: &str| get(key).filter(|value| !value.is_empty());
        SettingsOverride {
            vendor: non_empty(EnvVars::VENDOR),
            backend: non_empty(EnvVars::BACKEND),
            backend_args: non_empty(EnvVars::BACKEND_ARGS),
            index_repo: non_empty(EnvVars::INDEX_REPO),
            cache_dir: non_empty(EnvVars::CACHE_DIR).map(PathBuf::from),
            always_signoff: non_empty(EnvVars::ALWAYS_SIGNOFF)
                .map(|value| matches!(value.to_lowercase().as_str(), "1" | "true" | "yes")),
        }
    }

    /// Apply a JSON override file if it exists.
    pub fn apply_file(&mut self, path: &Path) -> Result<()> {
        match atomic_read_json::<SettingsOverride>(path)? {
            Some(layer) => {
                debug!("Applying settings override {}", path.display());
                self.apply(&layer);
            }
            None => debug!("No settings override at {}", path.display()),
        }
        Ok(())
    }

    /// Directory where downloaded models of a given vendor are cached: `~/.<vendor>`.
    pub fn model_cache_dir(&self) -> Result<PathBuf> {
        let vendor = self.vendor.as_deref().ok_or_else(|| VaultError::Config {
            message: format!(
                "vendor is not configured; set {} or pass an override file",
                EnvVars::VENDOR
            ),
        })?;
        let home = dirs::home_dir().ok_or_else(|| VaultError::Config {
            message: "cannot determine the home directory".to_string(),
        })?;
        Ok(home.join(format!(".{}", vendor)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::atomic_write_json;
    use tempfile::TempDir;

    #[test]
    fn test_later_sources_win() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("modelvault.json");
        atomic_write_json(
            &path,
            &SettingsOverride {
                vendor: Some("file-vendor".into()),
                backend: Some("fs".into()),
                ..Default::default()
            },
            false,
        )
        .unwrap();

        let settings = Settings::load(&[
            ConfigSource::File(path),
            ConfigSource::Overrides(SettingsOverride {
                vendor: Some("cli-vendor".into()),
                ..Default::default()
            }),
        ])
        .unwrap();

        assert_eq!(settings.vendor.as_deref(), Some("cli-vendor"));
        assert_eq!(settings.backend.as_deref(), Some("fs"));
        assert_eq!(settings.index_repo, IndexConfig::DEFAULT_REMOTE);
    }

    #[test]
    fn test_missing_file_is_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let settings =
            Settings::load(&[ConfigSource::File(temp_dir.path().join("absent.json"))]).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_env_layer_parsing() {
        let layer = Settings::env_layer(|key| match key {
            "MODELVAULT_VENDOR" => Some("acme".to_string()),
            "MODELVAULT_BACKEND_ARGS" => Some(String::new()),
            "MODELVAULT_ALWAYS_SIGNOFF" => Some("True".to_string()),
            _ => None,
        });
        assert_eq!(layer.vendor.as_deref(), Some("acme"));
        assert_eq!(layer.backend_args, None);
        assert_eq!(layer.always_signoff, Some(true));
    }

    #[test]
    fn test_model_cache_dir_requires_vendor() {
        let settings = Settings::default();
        assert!(matches!(
            settings.model_cache_dir(),
            Err(VaultError::Config { .. })
        ));
    }
}
