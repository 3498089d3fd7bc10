//! Backend lookup by name.

use crate::backend::{FsObjectStore, HttpObjectStore, StorageBackend};
use crate::config::Settings;
use crate::{Result, VaultError};
use std::collections::BTreeMap;
use tracing::debug;

/// Parsed `k=v,k2=v2` backend arguments.
pub type BackendArgs = BTreeMap<String, String>;

/// Constructor of one backend kind.
pub type BackendFactory = fn(&BackendArgs) -> Result<Box<dyn StorageBackend>>;

/// Parse `k=v,k2=v2`. An empty string yields no arguments.
pub fn parse_backend_args(args: &str) -> Result<BackendArgs> {
    let mut parsed = BackendArgs::new();
    if args.trim().is_empty() {
        return Ok(parsed);
    }
    for pair in args.split(',') {
        let mut parts = pair.split('=');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(key), Some(value), None) if !key.trim().is_empty() => {
                parsed.insert(key.trim().to_string(), value.trim().to_string());
            }
            _ => return Err(VaultError::InvalidBackendArgs(args.to_string())),
        }
    }
    Ok(parsed)
}

fn required<'a>(args: &'a BackendArgs, key: &str) -> Result<&'a str> {
    args.get(key).map(String::as_str).ok_or_else(|| {
        VaultError::InvalidBackendArgs(format!("missing required argument \"{}\"", key))
    })
}

fn create_fs(args: &BackendArgs) -> Result<Box<dyn StorageBackend>> {
    Ok(Box::new(FsObjectStore::new(required(args, "root")?)?))
}

fn create_http(args: &BackendArgs) -> Result<Box<dyn StorageBackend>> {
    Ok(Box::new(HttpObjectStore::new(required(args, "url")?)?))
}

/// Name to constructor mapping, built once at startup and passed where needed.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    factories: BTreeMap<String, BackendFactory>,
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.names())
            .finish()
    }
}

impl BackendRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in `fs` and `http` backends.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("fs", create_fs);
        registry.register("http", create_http);
        registry
    }

    pub fn register(&mut self, name: &str, factory: BackendFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Create a backend. Missing name or empty args fall back to `settings`.
    pub fn create(
        &self,
        name: Option<&str>,
        args: Option<&str>,
        settings: &Settings,
    ) -> Result<Box<dyn StorageBackend>> {
        let name = name
            .or(settings.backend.as_deref())
            .ok_or_else(|| VaultError::Config {
                message: "no storage backend selected".to_string(),
            })?;
        let args = match args {
            Some(args) if !args.is_empty() => args,
            _ => settings.backend_args.as_str(),
        };
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| VaultError::UnknownBackend {
                name: name.to_string(),
                known: self.names(),
            })?;
        let parsed = parse_backend_args(args)?;
        debug!("Creating backend {} with {:?}", name, parsed.keys());
        factory(&parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_backend_args() {
        assert!(parse_backend_args("").unwrap().is_empty());
        let args = parse_backend_args("root=/tmp/x,mode=fast").unwrap();
        assert_eq!(args.get("root").map(String::as_str), Some("/tmp/x"));
        assert_eq!(args.get("mode").map(String::as_str), Some("fast"));
        for bad in ["root", "a=b=c", "a=b,,c=d", "=x"] {
            assert!(matches!(
                parse_backend_args(bad),
                Err(VaultError::InvalidBackendArgs(_))
            ));
        }
    }

    #[test]
    fn test_create_backend() {
        let temp_dir = TempDir::new().unwrap();
        let registry = BackendRegistry::with_defaults();
        let settings = Settings::default();
        let args = format!("root={}", temp_dir.path().display());
        let backend = registry.create(Some("fs"), Some(&args), &settings).unwrap();
        assert_eq!(backend.name(), "fs");

        assert!(matches!(
            registry.create(Some("gcs"), Some(&args), &settings),
            Err(VaultError::UnknownBackend { .. })
        ));
        assert!(matches!(
            registry.create(Some("fs"), Some("path"), &settings),
            Err(VaultError::InvalidBackendArgs(_))
        ));
        assert!(matches!(
            registry.create(Some("fs"), None, &settings),
            Err(VaultError::InvalidBackendArgs(_))
        ));
        assert!(matches!(
            registry.create(None, None, &settings),
            Err(VaultError::Config { .. })
        ));
    }

    #[test]
    fn test_settings_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let settings = Settings {
            backend: Some("fs".into()),
            backend_args: format!("root={}", temp_dir.path().display()),
            ..Settings::default()
        };
        let backend = BackendRegistry::with_defaults()
            .create(None, Some(""), &settings)
            .unwrap();
        assert_eq!(backend.name(), "fs");
    }
}
