//! REST object store: blobs are `PUT`, probed with `HEAD`, fetched with `GET`
//! and removed with `DELETE` below a base URL.

use crate::backend::{blob_key, StorageBackend};
use crate::config::BackendConfig;
use crate::metadata::ModelMeta;
use crate::network::HttpClient;
use crate::{Result, VaultError};
use reqwest::StatusCode;
use std::fs::File;
use std::path::Path;
use tracing::{error, info, warn};
use url::Url;

#[derive(Debug, Clone)]
pub struct HttpObjectStore {
    base: Url,
    http: HttpClient,
}

impl HttpObjectStore {
    /// Fails with [`VaultError::BackendUnavailable`] on a malformed base URL or if
    /// the HTTP client cannot be built.
    pub fn new(base: &str) -> Result<Self> {
        let unavailable = |message: String| VaultError::BackendUnavailable {
            backend: "http".to_string(),
            message,
        };
        let mut base = Url::parse(base).map_err(|e| unavailable(format!("{}: {}", base, e)))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(unavailable(format!("{} is not an http(s) URL", base)));
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http = HttpClient::new().map_err(|e| unavailable(e.to_string()))?;
        Ok(Self { base, http })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Public locator of `key`.
    pub fn locator(&self, key: &str) -> Result<String> {
        self.base
            .join(key)
            .map(|url| url.to_string())
            .map_err(|e| VaultError::BackendUnavailable {
                backend: self.name().to_string(),
                message: format!("cannot address {}: {}", key, e),
            })
    }

    fn exists(&self, url: &str) -> Result<bool> {
        self.http.exists(url).map_err(|e| self.unreachable(e))
    }

    fn unreachable(&self, e: VaultError) -> VaultError {
        match e {
            VaultError::Network { message, .. } => VaultError::BackendUnavailable {
                backend: self.name().to_string(),
                message,
            },
            other => other,
        }
    }

    fn check_status(url: &str, status: StatusCode) -> Result<()> {
        if status.is_success() {
            Ok(())
        } else {
            Err(VaultError::DownloadFailed {
                url: url.to_string(),
                status: status.as_u16(),
            })
        }
    }
}

impl StorageBackend for HttpObjectStore {
    fn name(&self) -> &'static str {
        "http"
    }

    /// The store cannot list keys, so initialization is tracked by a marker object.
    /// A forced reset rewrites the marker but cannot delete unknown blobs.
    fn reset(&self, force: bool) -> Result<()> {
        let marker = self.locator(BackendConfig::MARKER)?;
        if self.exists(&marker)? {
            if !force {
                return Err(VaultError::AlreadyInitialized {
                    namespace: self.base.to_string(),
                });
            }
            warn!(
                "{} cannot enumerate its blobs, only the marker is reset",
                self.base
            );
        }
        let response = self
            .http
            .put(&marker, Vec::<u8>::new())
            .map_err(|e| self.unreachable(e))?;
        Self::check_status(&marker, response.status())
    }

    fn upload_model(&self, path: &Path, meta: &ModelMeta, force: bool) -> Result<String> {
        let key = blob_key(meta);
        let url = self.locator(&key)?;
        if self.exists(&url)? && !force {
            error!("Model {} already exists, aborted.", meta.id);
            return Err(VaultError::AlreadyExists {
                model_id: meta.id.clone(),
                key,
            });
        }
        info!("Uploading {} from {}...", meta.model_type, path.display());
        let file = File::open(path).map_err(|e| VaultError::io_with_path(e, path))?;
        let response = self.http.put(&url, file).map_err(|e| self.unreachable(e))?;
        Self::check_status(&url, response.status())?;
        Ok(url)
    }

    fn delete_model(&self, meta: &ModelMeta) -> Result<()> {
        let url = self.locator(&blob_key(meta))?;
        let response = self.http.delete(&url).map_err(|e| self.unreachable(e))?;
        match response.status() {
            StatusCode::NOT_FOUND => {
                warn!("Model {} was already deleted", meta.id);
                Ok(())
            }
            status => {
                Self::check_status(&url, status)?;
                info!("Deleted {}", url);
                Ok(())
            }
        }
    }
}
