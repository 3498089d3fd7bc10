//! Error types for ModelVault.
//!
//! The variants are grouped by the failure families the registry distinguishes:
//! configuration, transport, domain conflicts, missing entities, type mismatches,
//! codec failures and infrastructure. Only the CLI turns them into exit codes.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the ModelVault library.
#[derive(Debug, Error)]
pub enum VaultError {
    // Configuration and argument errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("License must be an SPDX identifier or \"Proprietary\", got \"{0}\"")]
    InvalidLicense(String),

    #[error("No such backend: {name} (known: {known:?})")]
    UnknownBackend { name: String, known: Vec<String> },

    #[error("Invalid backend arguments: {0}")]
    InvalidBackendArgs(String),

    #[error("Invalid index remote {remote}: {reason}")]
    InvalidRemote { remote: String, reason: String },

    #[error("Both username and password must be supplied to access the index with credentials")]
    MissingCredentials,

    // Transport errors
    #[error("Index repository does not exist: {0}")]
    RepositoryNotFound(String),

    #[error("Handshake with {remote} failed, check SSH is configured or the connection is stable: {message}")]
    Handshake { remote: String, message: String },

    #[error("Credentials rejected by {remote}: {message}")]
    Credentials { remote: String, message: String },

    #[error("{path} does not exist or is unreadable, run `init` first")]
    IndexUnreadable {
        path: PathBuf,
        #[source]
        source: Option<Box<VaultError>>,
    },

    #[error("Git {command} failed: {message}")]
    Transport { command: String, message: String },

    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    #[error("Download of {url} failed with status {status}")]
    DownloadFailed { url: String, status: u16 },

    // Domain conflicts
    #[error("Model {model_id} already exists at {key}")]
    AlreadyExists { model_id: String, key: String },

    #[error("Backend namespace {namespace} is already initialized, pass force to wipe it")]
    AlreadyInitialized { namespace: String },

    #[error("Push has failed: local head {local} differs from remote head {remote}")]
    PublishConflict { local: String, remote: String },

    #[error("{operation} requires the backend lock to be held")]
    TransactionRequired { operation: String },

    // Not-found errors
    #[error("Model not found: {model_id}")]
    ModelNotFound { model_id: String },

    #[error("Dependency {name} not found among {available:?}")]
    DependencyNotFound { name: String, available: Vec<String> },

    #[error("Unknown model type: {0}")]
    UnknownModelType(String),

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    // Type mismatches
    #[error("The supplied model is of the wrong type: needed {expected:?}, got {actual}")]
    TypeMismatch { expected: Vec<String>, actual: String },

    #[error("Incompatible model instance: {actual} <> {expected}")]
    IncompatibleInstance { expected: String, actual: String },

    // Codec errors
    #[error("Codec error: {message}")]
    Codec { message: String },

    #[error("Corrupt model container {path:?}: {message}")]
    CorruptContainer {
        message: String,
        path: Option<PathBuf>,
    },

    // Infrastructure
    #[error("Storage backend {backend} is unavailable: {message}")]
    BackendUnavailable { backend: String, message: String },

    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },
}

/// Result type alias for ModelVault operations.
pub type Result<T> = std::result::Result<T, VaultError>;

impl From<std::io::Error> for VaultError {
    fn from(err: std::io::Error) -> Self {
        VaultError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(err: serde_json::Error) -> Self {
        VaultError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for VaultError {
    fn from(err: reqwest::Error) -> Self {
        VaultError::Network {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl VaultError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if err.kind() == std::io::ErrorKind::NotFound {
            return VaultError::FileNotFound(path);
        }
        VaultError::Io {
            message: err.to_string(),
            path: Some(path),
            source: Some(err),
        }
    }

    /// Shorthand for a codec failure.
    pub fn codec(message: impl Into<String>) -> Self {
        VaultError::Codec {
            message: message.into(),
        }
    }

    /// Shorthand for a validation failure.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        VaultError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Repository or network unreachable, handshake or credential failure.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            VaultError::RepositoryNotFound(_)
                | VaultError::Handshake { .. }
                | VaultError::Credentials { .. }
                | VaultError::IndexUnreadable { .. }
                | VaultError::Transport { .. }
                | VaultError::Network { .. }
                | VaultError::DownloadFailed { .. }
        )
    }

    /// Recoverable by re-running with other flags or after re-fetching the index.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            VaultError::AlreadyExists { .. }
                | VaultError::AlreadyInitialized { .. }
                | VaultError::PublishConflict { .. }
                | VaultError::TransactionRequired { .. }
        )
    }

    /// The operation targeted a logical entity which does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            VaultError::ModelNotFound { .. }
                | VaultError::DependencyNotFound { .. }
                | VaultError::UnknownModelType(_)
                | VaultError::FileNotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = VaultError::ModelNotFound {
            model_id: "1e3da42a".into(),
        };
        assert_eq!(err.to_string(), "Model not found: 1e3da42a");

        let err = VaultError::TypeMismatch {
            expected: vec!["docfreq".into(), "bow".into()],
            actual: "id2vec".into(),
        };
        let text = err.to_string();
        assert!(text.contains("docfreq"));
        assert!(text.contains("id2vec"));
    }

    #[test]
    fn test_error_families() {
        assert!(VaultError::PublishConflict {
            local: "a".into(),
            remote: "b".into()
        }
        .is_conflict());
        assert!(VaultError::RepositoryNotFound("x".into()).is_transport());
        assert!(!VaultError::RepositoryNotFound("x".into()).is_not_found());
        assert!(VaultError::UnknownModelType("x".into()).is_not_found());
    }

    #[test]
    fn test_io_with_path_maps_not_found() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(matches!(
            VaultError::io_with_path(err, "/tmp/x"),
            VaultError::FileNotFound(_)
        ));
    }
}
