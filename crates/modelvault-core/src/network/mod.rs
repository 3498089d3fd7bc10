//! Networking: HTTP client, downloads and artifact size probes.

mod client;
mod download;

pub use client::HttpClient;
pub use download::{DownloadManager, DownloadProgress, ProgressFn};

use crate::{Result, VaultError};
use std::path::PathBuf;

/// Measures the size of a published artifact.
pub trait SizeProbe {
    /// Size in bytes of the object at `url`, `None` if the server does not say.
    fn content_length(&self, url: &str) -> Result<Option<u64>>;
}

impl SizeProbe for HttpClient {
    fn content_length(&self, url: &str) -> Result<Option<u64>> {
        HttpClient::content_length(self, url)
    }
}

/// Probe which reads `file://` locators from disk and sends HEAD requests for the rest.
#[derive(Debug, Clone, Default)]
pub struct LocatorSizeProbe {
    http: Option<HttpClient>,
}

impl LocatorSizeProbe {
    pub fn new() -> Result<Self> {
        Ok(Self {
            http: Some(HttpClient::new()?),
        })
    }

    /// A probe which only handles local locators.
    pub fn local_only() -> Self {
        Self { http: None }
    }
}

impl SizeProbe for LocatorSizeProbe {
    fn content_length(&self, url: &str) -> Result<Option<u64>> {
        if let Some(path) = file_locator_path(url) {
            let metadata =
                std::fs::metadata(&path).map_err(|e| VaultError::io_with_path(e, &path))?;
            return Ok(Some(metadata.len()));
        }
        match &self.http {
            Some(http) => http.content_length(url),
            None => Ok(None),
        }
    }
}

/// Path of a `file://` locator, `None` for other schemes.
pub fn file_locator_path(locator: &str) -> Option<PathBuf> {
    let parsed = url::Url::parse(locator).ok()?;
    if parsed.scheme() != "file" {
        return None;
    }
    parsed.to_file_path().ok()
}

/// Whether `locator` is an `http(s)://` URL.
pub fn is_http_locator(locator: &str) -> bool {
    url::Url::parse(locator)
        .map(|parsed| matches!(parsed.scheme(), "http" | "https"))
        .unwrap_or(false)
}
