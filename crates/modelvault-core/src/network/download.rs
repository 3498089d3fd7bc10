//! Blocking blob downloads.
//!
//! Models fetched to disk are streamed into `<destination>.part` and renamed once
//! the body has been read in full.

use crate::config::NetworkConfig;
use crate::network::client::HttpClient;
use crate::{Result, VaultError};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Snapshot of a running transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadProgress {
    pub received: u64,
    /// Taken from `Content-Length` when the server sends one.
    pub expected: Option<u64>,
    pub bytes_per_sec: f64,
}

impl DownloadProgress {
    /// Share of the blob received so far, 0 to 100.
    pub fn percent(&self) -> Option<f64> {
        match self.expected {
            Some(0) => Some(100.0),
            Some(expected) => Some(self.received as f64 * 100.0 / expected as f64),
            None => None,
        }
    }

    pub fn remaining(&self) -> Option<Duration> {
        let expected = self.expected?;
        if self.bytes_per_sec <= 0.0 || self.received >= expected {
            return None;
        }
        Some(Duration::from_secs_f64(
            (expected - self.received) as f64 / self.bytes_per_sec,
        ))
    }
}

pub type ProgressFn<'a> = &'a dyn Fn(&DownloadProgress);

/// Streams model blobs from HTTP locators.
pub struct DownloadManager {
    http: HttpClient,
    report_every: Duration,
    buffer_len: usize,
}

impl DownloadManager {
    pub fn new() -> Result<Self> {
        Ok(Self::with_client(HttpClient::new()?))
    }

    pub fn with_client(http: HttpClient) -> Self {
        Self {
            http,
            report_every: NetworkConfig::DOWNLOAD_PROGRESS_INTERVAL,
            buffer_len: NetworkConfig::DOWNLOAD_CHUNK_SIZE,
        }
    }

    /// Fetch `url` into `destination` and return the blob size.
    pub fn download(
        &self,
        url: &str,
        destination: &Path,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<u64> {
        let partial = partial_path(destination);
        if let Some(dir) = partial.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| VaultError::io_with_path(e, dir))?;
        }

        let received = self
            .stream_to_file(url, &partial, progress)
            .and_then(|received| {
                std::fs::rename(&partial, destination)
                    .map_err(|e| VaultError::io_with_path(e, destination))?;
                Ok(received)
            });
        if received.is_err() {
            let _ = std::fs::remove_file(&partial);
        }
        let received = received?;
        info!("Fetched {} ({} bytes)", destination.display(), received);
        Ok(received)
    }

    pub fn download_to_vec(&self, url: &str, progress: Option<ProgressFn<'_>>) -> Result<Vec<u8>> {
        let mut blob = Vec::new();
        self.download_to_writer(url, &mut blob, progress)?;
        Ok(blob)
    }

    /// Copy the response body of `url` into `sink`.
    pub fn download_to_writer(
        &self,
        url: &str,
        sink: &mut dyn Write,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<u64> {
        let mut response = self.http.get(url)?;
        if !response.status().is_success() {
            return Err(VaultError::DownloadFailed {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let expected = response.content_length();
        let started = Instant::now();
        let snapshot = |received: u64| DownloadProgress {
            received,
            expected,
            bytes_per_sec: rate(received, started.elapsed()),
        };
        let notify = |update: &DownloadProgress| {
            if let Some(callback) = progress {
                callback(update);
            }
        };

        notify(&snapshot(0));
        let mut buffer = vec![0u8; self.buffer_len];
        let mut received = 0u64;
        let mut reported_at = started;
        loop {
            let n = response
                .read(&mut buffer)
                .map_err(|e| VaultError::Io {
                    message: format!("Failed reading response body of {}", url),
                    path: None,
                    source: Some(e),
                })?;
            if n == 0 {
                break;
            }
            sink.write_all(&buffer[..n])?;
            received += n as u64;

            if reported_at.elapsed() >= self.report_every {
                let update = snapshot(received);
                debug!(
                    "{}: {} bytes, {:.1}%",
                    url,
                    received,
                    update.percent().unwrap_or_default()
                );
                notify(&update);
                reported_at = Instant::now();
            }
        }
        notify(&snapshot(received));
        Ok(received)
    }

    fn stream_to_file(
        &self,
        url: &str,
        partial: &Path,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<u64> {
        let file = File::create(partial).map_err(|e| VaultError::io_with_path(e, partial))?;
        let mut sink = BufWriter::new(file);
        let received = self.download_to_writer(url, &mut sink, progress)?;
        sink.flush()
            .map_err(|e| VaultError::io_with_path(e, partial))?;
        Ok(received)
    }
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(NetworkConfig::DOWNLOAD_TEMP_SUFFIX);
    PathBuf::from(name)
}

fn rate(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        bytes as f64 / secs
    } else {
        0.0
    }
}
