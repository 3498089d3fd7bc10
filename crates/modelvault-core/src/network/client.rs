//! Blocking HTTP client shared by the object store, downloads and size probes.

use crate::config::NetworkConfig;
use crate::{Result, VaultError};
use reqwest::blocking::{Body, Client, Response};
use reqwest::{header, StatusCode};
use std::time::Duration;
use tracing::debug;

/// Thin wrapper around `reqwest::blocking::Client` with uniform error mapping.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    /// Create a new HTTP client with default configuration.
    pub fn new() -> Result<Self> {
        Self::with_timeout(NetworkConfig::REQUEST_TIMEOUT)
    }

    /// Create a new HTTP client with a custom request timeout.
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(NetworkConfig::USER_AGENT)
            .build()
            .map_err(|e| VaultError::Network {
                message: format!("Failed to create HTTP client: {}", e),
                source: Some(e),
            })?;
        Ok(Self { client })
    }

    pub fn get(&self, url: &str) -> Result<Response> {
        debug!("GET {}", url);
        self.client.get(url).send().map_err(|e| request_error("GET", url, e))
    }

    pub fn head(&self, url: &str) -> Result<Response> {
        debug!("HEAD {}", url);
        self.client
            .head(url)
            .send()
            .map_err(|e| request_error("HEAD", url, e))
    }

    pub fn put(&self, url: &str, body: impl Into<Body>) -> Result<Response> {
        debug!("PUT {}", url);
        self.client
            .put(url)
            .body(body)
            .send()
            .map_err(|e| request_error("PUT", url, e))
    }

    pub fn delete(&self, url: &str) -> Result<Response> {
        debug!("DELETE {}", url);
        self.client
            .delete(url)
            .send()
            .map_err(|e| request_error("DELETE", url, e))
    }

    /// Whether `url` answers a HEAD request with a success status.
    pub fn exists(&self, url: &str) -> Result<bool> {
        let response = self.head(url)?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(VaultError::DownloadFailed {
                url: url.to_string(),
                status: status.as_u16(),
            }),
        }
    }

    /// Content length reported by a HEAD request, if the server sends one.
    pub fn content_length(&self, url: &str) -> Result<Option<u64>> {
        let response = self.head(url)?;
        if !response.status().is_success() {
            return Err(VaultError::DownloadFailed {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(response
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok()))
    }
}

fn request_error(method: &str, url: &str, e: reqwest::Error) -> VaultError {
    VaultError::Network {
        message: format!("{} {} failed: {}", method, url, e),
        source: Some(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        assert!(HttpClient::new().is_ok());
        assert!(HttpClient::with_timeout(Duration::from_secs(1)).is_ok());
    }
}
