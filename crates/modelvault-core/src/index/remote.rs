//! Index remote addresses.

use crate::config::IndexConfig;
use crate::{Result, VaultError};
use std::fmt;
use std::path::{Path, PathBuf};
use url::Url;

/// A validated index remote.
#[derive(Clone, PartialEq, Eq)]
pub struct RemoteSpec {
    /// The address as given, without credentials.
    address: String,
    /// The address used by the transport, credentials included.
    url: String,
    /// Repository path without the leading `/` and the `.git` suffix.
    repo: String,
}

impl RemoteSpec {
    /// Validate `remote` and embed the credentials, if any.
    ///
    /// The scheme must be one of [`IndexConfig::SCHEMES`]; host and repository
    /// path are required. `username` and `password` go together.
    pub fn parse(remote: &str, username: Option<&str>, password: Option<&str>) -> Result<Self> {
        let invalid = |reason: &str| VaultError::InvalidRemote {
            remote: remote.to_string(),
            reason: reason.to_string(),
        };
        let parsed = Url::parse(remote).map_err(|e| invalid(&e.to_string()))?;
        if !IndexConfig::SCHEMES.contains(&parsed.scheme()) {
            return Err(invalid("the URL does not contain a valid protocol"));
        }
        let host = parsed
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| invalid("the URL does not contain a valid domain"))?;
        let mut repo = parsed.path().trim_start_matches('/');
        repo = repo.strip_suffix(".git").unwrap_or(repo);
        if repo.is_empty() {
            return Err(invalid("the URL does not contain a valid repository path"));
        }

        // Empty values mean "not given".
        let username = username.filter(|user| !user.is_empty());
        let password = password.filter(|pass| !pass.is_empty());
        let url = match (username, password) {
            (Some(user), Some(pass)) => {
                let netloc = match parsed.port() {
                    Some(port) => format!("{}:{}", host, port),
                    None => host.to_string(),
                };
                format!(
                    "{}://{}:{}@{}/{}",
                    parsed.scheme(),
                    urlencoding::encode(user),
                    urlencoding::encode(pass),
                    netloc,
                    repo
                )
            }
            (None, None) => remote.to_string(),
            _ => return Err(VaultError::MissingCredentials),
        };
        Ok(Self {
            address: remote.to_string(),
            url,
            repo: repo.to_string(),
        })
    }

    /// Address for the transport. May contain credentials: never log it.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Address as configured, safe to log.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    /// Working copy location below `cache_root`.
    pub fn cache_path(&self, cache_root: &Path) -> PathBuf {
        self.repo
            .split('/')
            .filter(|segment| !segment.is_empty())
            .fold(cache_root.to_path_buf(), |path, segment| path.join(segment))
    }
}

impl fmt::Debug for RemoteSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSpec")
            .field("address", &self.address)
            .field("repo", &self.repo)
            .finish()
    }
}

impl fmt::Display for RemoteSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}
