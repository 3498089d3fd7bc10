//! Where a model is loaded from, and how that place is turned into a local file.

use crate::backend::{fetch_locator, Destination, StorageBackend};
use crate::config::{ContainerConfig, Settings};
use crate::index::IndexDocument;
use crate::{Result, VaultError};
use regex::Regex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;
use tempfile::TempDir;
use tracing::{debug, info};

static URL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\w[\w+.-]*://").expect("URL pattern must compile"));

/// What to load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    /// The default model of the type, resolved through the index.
    Default,
    Path(PathBuf),
    Url(String),
    /// A model ID, resolved through the local cache, then the index.
    Id(String),
}

impl ModelSource {
    /// Classify a user supplied string: UUIDs become IDs, `scheme://` strings URLs,
    /// anything else a path.
    pub fn parse(text: &str) -> Self {
        if uuid::Uuid::parse_str(text).is_ok() {
            ModelSource::Id(text.to_string())
        } else if URL_PATTERN.is_match(text) {
            ModelSource::Url(text.to_string())
        } else {
            ModelSource::Path(PathBuf::from(text))
        }
    }
}

impl FromStr for ModelSource {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(ModelSource::parse(s))
    }
}

impl From<&Path> for ModelSource {
    fn from(path: &Path) -> Self {
        ModelSource::Path(path.to_path_buf())
    }
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelSource::Default => f.write_str(ContainerConfig::DEFAULT_NAME),
            ModelSource::Path(path) => write!(f, "{}", path.display()),
            ModelSource::Url(url) => f.write_str(url),
            ModelSource::Id(id) => f.write_str(id),
        }
    }
}

/// Collaborators used while loading.
#[derive(Clone, Copy, Default)]
pub struct LoadOptions<'a> {
    /// Where downloaded models are cached. Defaults to `~/.<vendor>/<type>`; a
    /// type-agnostic load uses a temporary directory removed after the load.
    pub cache_dir: Option<&'a Path>,
    pub backend: Option<&'a dyn StorageBackend>,
    /// Index snapshot used to resolve IDs and the default model.
    pub index: Option<&'a IndexDocument>,
    pub settings: Option<&'a Settings>,
    /// Keep the file open and read arrays on first access.
    pub lazy: bool,
}

impl<'a> LoadOptions<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache_dir(mut self, dir: &'a Path) -> Self {
        self.cache_dir = Some(dir);
        self
    }

    pub fn backend(mut self, backend: &'a dyn StorageBackend) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn index(mut self, index: &'a IndexDocument) -> Self {
        self.index = Some(index);
        self
    }

    pub fn settings(mut self, settings: &'a Settings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }
}

impl fmt::Debug for LoadOptions<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadOptions")
            .field("cache_dir", &self.cache_dir)
            .field("backend", &self.backend.map(|b| b.name()))
            .field("index", &self.index.is_some())
            .field("lazy", &self.lazy)
            .finish()
    }
}

/// A source turned into a local file.
///
/// Owns the temporary cache of a type-agnostic load; dropping it removes the directory.
#[derive(Debug)]
pub(crate) struct ResolvedSource {
    pub path: PathBuf,
    /// What the caller asked for: the URL for remote models, the path otherwise.
    pub label: String,
    _temp: Option<TempDir>,
}

/// Resolve `source` for the model type `type_name`; `None` means any type.
///
/// Order: explicit local file, cached `<id>.mvlt`, index lookup, remote fetch.
pub(crate) fn resolve_source(
    source: &ModelSource,
    type_name: Option<&str>,
    options: &LoadOptions<'_>,
) -> Result<ResolvedSource> {
    if let ModelSource::Path(path) = source {
        if path.is_file() {
            return Ok(ResolvedSource {
                path: path.clone(),
                label: path.display().to_string(),
                _temp: None,
            });
        }
        return Err(VaultError::FileNotFound(path.clone()));
    }

    let mut temp = None;
    let cache_dir = match (options.cache_dir, type_name) {
        (Some(dir), _) => dir.to_path_buf(),
        (None, Some(name)) => {
            let settings = options.settings.ok_or_else(|| VaultError::Config {
                message: "a cache directory or settings are required to load remote models"
                    .to_string(),
            })?;
            settings.model_cache_dir()?.join(name)
        }
        (None, None) => {
            let dir = tempfile::Builder::new()
                .prefix("modelvault-")
                .tempdir()
                .map_err(|e| VaultError::Io {
                    message: format!("Failed to create a temporary cache: {}", e),
                    path: None,
                    source: Some(e),
                })?;
            let path = dir.path().to_path_buf();
            temp = Some(dir);
            path
        }
    };

    let file_name = match source {
        ModelSource::Id(id) => format!("{}.{}", id, ContainerConfig::FILE_EXT),
        ModelSource::Url(url) => url::Url::parse(url)
            .ok()
            .and_then(|parsed| {
                parsed
                    .path_segments()
                    .and_then(|mut segments| segments.next_back().map(str::to_string))
            })
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| {
                format!("{}.{}", ContainerConfig::DEFAULT_NAME, ContainerConfig::FILE_EXT)
            }),
        _ => format!("{}.{}", ContainerConfig::DEFAULT_NAME, ContainerConfig::FILE_EXT),
    };
    let cached = cache_dir.join(file_name);
    if cached.is_file() && !matches!(source, ModelSource::Url(_)) {
        debug!("Using the cached {}", cached.display());
        return Ok(ResolvedSource {
            label: cached.display().to_string(),
            path: cached,
            _temp: temp,
        });
    }

    let url = match source {
        ModelSource::Url(url) => url.clone(),
        _ => lookup_url(source, type_name, options.index)?,
    };

    std::fs::create_dir_all(&cache_dir).map_err(|e| VaultError::io_with_path(e, &cache_dir))?;
    info!("Fetching {} into {}", url, cached.display());
    match options.backend {
        Some(backend) => backend.fetch_model(&url, Destination::Path(&cached))?,
        None => fetch_locator(&url, Destination::Path(&cached))?,
    }
    Ok(ResolvedSource {
        path: cached,
        label: url,
        _temp: temp,
    })
}

fn lookup_url(
    source: &ModelSource,
    type_name: Option<&str>,
    index: Option<&IndexDocument>,
) -> Result<String> {
    let index = index.ok_or_else(|| VaultError::Config {
        message: format!("the index is required to resolve {}", source),
    })?;
    match (source, type_name) {
        (ModelSource::Id(id), Some(name)) => index
            .find(name, id)
            .map(|summary| summary.url.clone())
            .ok_or_else(|| VaultError::ModelNotFound {
                model_id: id.clone(),
            }),
        (ModelSource::Id(id), None) => index
            .find_any(id)
            .map(|(_, summary)| summary.url.clone())
            .ok_or_else(|| VaultError::ModelNotFound {
                model_id: id.clone(),
            }),
        (ModelSource::Default, Some(name)) => {
            let id = index
                .default_id(name)
                .ok_or_else(|| VaultError::ModelNotFound {
                    model_id: format!("{}/{}", name, ContainerConfig::DEFAULT_NAME),
                })?;
            index
                .find(name, id)
                .map(|summary| summary.url.clone())
                .ok_or_else(|| VaultError::ModelNotFound {
                    model_id: id.to_string(),
                })
        }
        (ModelSource::Default, None) => Err(VaultError::validation(
            "source",
            "a file path, URL or ID is needed to load a model of unknown type",
        )),
        (ModelSource::Path(_), _) | (ModelSource::Url(_), _) => Err(VaultError::validation(
            "source",
            format!("{} does not need an index lookup", source),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_source() {
        let id = "f64bacd4-67fb-4c64-8382-399a8e7db52a";
        assert_eq!(ModelSource::parse(id), ModelSource::Id(id.to_string()));
        assert_eq!(
            ModelSource::parse("https://host/x.mvlt"),
            ModelSource::Url("https://host/x.mvlt".to_string())
        );
        assert_eq!(
            ModelSource::parse("file:///tmp/x.mvlt"),
            ModelSource::Url("file:///tmp/x.mvlt".to_string())
        );
        assert_eq!(
            ModelSource::parse("models/x.mvlt"),
            ModelSource::Path(PathBuf::from("models/x.mvlt"))
        );
    }

    #[test]
    fn test_missing_path() {
        let err = resolve_source(
            &ModelSource::Path(PathBuf::from("/definitely/missing.mvlt")),
            Some("docfreq"),
            &LoadOptions::new(),
        )
        .unwrap_err();
        assert!(matches!(err, VaultError::FileNotFound(_)));
    }

    #[test]
    fn test_cached_id_wins() {
        let temp_dir = TempDir::new().unwrap();
        let id = "f64bacd4-67fb-4c64-8382-399a8e7db52a";
        let cached = temp_dir.path().join(format!("{}.mvlt", id));
        std::fs::write(&cached, b"x").unwrap();
        let resolved = resolve_source(
            &ModelSource::Id(id.to_string()),
            Some("docfreq"),
            &LoadOptions::new().cache_dir(temp_dir.path()),
        )
        .unwrap();
        assert_eq!(resolved.path, cached);
    }

    #[test]
    fn test_id_without_index() {
        let temp_dir = TempDir::new().unwrap();
        let err = resolve_source(
            &ModelSource::Id("f64bacd4-67fb-4c64-8382-399a8e7db52a".into()),
            Some("docfreq"),
            &LoadOptions::new().cache_dir(temp_dir.path()),
        )
        .unwrap_err();
        assert!(matches!(err, VaultError::Config { .. }));
    }

    #[test]
    fn test_generic_default_needs_explicit_source() {
        let index = IndexDocument::default();
        let err = resolve_source(
            &ModelSource::Default,
            None,
            &LoadOptions::new().index(&index),
        )
        .unwrap_err();
        assert!(matches!(err, VaultError::Validation { .. }));
    }

    #[test]
    fn test_temporary_cache_is_removed() {
        let source_dir = TempDir::new().unwrap();
        let blob = source_dir.path().join("blob.mvlt");
        std::fs::write(&blob, b"bytes").unwrap();
        let url = url::Url::from_file_path(&blob).unwrap().to_string();

        let resolved = resolve_source(&ModelSource::Url(url.clone()), None, &LoadOptions::new())
            .unwrap();
        let cache = resolved.path.parent().unwrap().to_path_buf();
        assert!(cache.exists());
        assert_eq!(resolved.label, url);
        drop(resolved);
        assert!(!cache.exists());
    }
}
