//! Version control operations used by the index repository.

use crate::{Result, VaultError};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tracing::debug;

/// Clone, pull, commit and push the working copy holding the index.
///
/// Heads are `None` when the repository has no commits yet.
pub trait IndexTransport: Send + Sync {
    fn clone_repo(&self, remote: &str, dest: &Path) -> Result<()>;

    /// Move `repo` to the remote head, dropping local commits which never made it.
    fn pull(&self, repo: &Path, remote: &str) -> Result<()>;

    fn local_head(&self, repo: &Path) -> Result<Option<String>>;

    fn remote_head(&self, remote: &str) -> Result<Option<String>>;

    /// Stage `paths`, which lie inside `repo`.
    fn add(&self, repo: &Path, paths: &[PathBuf]) -> Result<()>;

    /// Remove `paths` from the working copy and the stage.
    fn remove(&self, repo: &Path, paths: &[PathBuf]) -> Result<()>;

    fn commit(&self, repo: &Path, message: &str) -> Result<()>;

    fn push(&self, repo: &Path, remote: &str, branch: &str) -> Result<()>;

    /// `(name, email)` from the global configuration.
    fn global_identity(&self) -> Option<(String, String)>;
}

const NOT_FOUND_MARKERS: &[&str] = &[
    "repository not found",
    "does not appear to be a git repository",
    "not found",
];
const CREDENTIAL_MARKERS: &[&str] = &[
    "authentication failed",
    "could not read username",
    "could not read password",
    "permission denied",
    "invalid username or password",
    "403",
];
const REJECTED_MARKERS: &[&str] = &["[rejected]", "non-fast-forward", "fetch first"];
const HANDSHAKE_MARKERS: &[&str] = &[
    "could not read from remote repository",
    "connection closed",
    "connection reset",
    "connection refused",
    "connection timed out",
    "host key verification failed",
    "could not resolve host",
    "unable to access",
];

/// Map git's stderr onto the transport error kinds.
///
/// A push rejected because the remote moved becomes a [`VaultError::PublishConflict`]
/// without heads; the index repository fills them in.
pub fn classify_git_error(command: &str, remote: &str, stderr: &str) -> VaultError {
    let message = stderr.trim().to_string();
    let lower = message.to_lowercase();
    let has = |markers: &[&str]| markers.iter().any(|marker| lower.contains(marker));
    if command == "push" && has(REJECTED_MARKERS) {
        VaultError::PublishConflict {
            local: String::new(),
            remote: String::new(),
        }
    } else if has(CREDENTIAL_MARKERS) {
        VaultError::Credentials {
            remote: remote.to_string(),
            message,
        }
    } else if has(NOT_FOUND_MARKERS) {
        VaultError::RepositoryNotFound(remote.to_string())
    } else if has(HANDSHAKE_MARKERS) {
        VaultError::Handshake {
            remote: remote.to_string(),
            message,
        }
    } else {
        VaultError::Transport {
            command: command.to_string(),
            message,
        }
    }
}

/// [`IndexTransport`] running the `git` executable.
#[derive(Debug, Clone)]
pub struct GitCliTransport {
    program: PathBuf,
}

impl Default for GitCliTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl GitCliTransport {
    pub fn new() -> Self {
        Self {
            program: PathBuf::from("git"),
        }
    }

    /// Use another git executable.
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn run(&self, repo: Option<&Path>, args: &[&str]) -> Result<Output> {
        let mut command = Command::new(&self.program);
        if let Some(repo) = repo {
            command.arg("-C").arg(repo);
        }
        // Never wait for interactive credential prompts.
        command.args(args).env("GIT_TERMINAL_PROMPT", "0");
        debug!("git {}", args.first().copied().unwrap_or_default());
        command.output().map_err(|e| VaultError::Io {
            message: format!("Failed to execute git {}: {}", args.join(" "), e),
            path: repo.map(Path::to_path_buf),
            source: Some(e),
        })
    }

    /// Run and fail on a non-zero exit, classifying against `remote`.
    fn run_checked(&self, repo: Option<&Path>, args: &[&str], remote: &str) -> Result<String> {
        let output = self.run(repo, args)?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let command = args.first().copied().unwrap_or_default();
            Err(classify_git_error(
                command,
                remote,
                &String::from_utf8_lossy(&output.stderr),
            ))
        }
    }

    fn path_args(repo: &Path, paths: &[PathBuf]) -> Vec<String> {
        paths
            .iter()
            .map(|path| {
                path.strip_prefix(repo)
                    .unwrap_or(path)
                    .to_string_lossy()
                    .into_owned()
            })
            .collect()
    }

    fn config_value(&self, key: &str) -> Option<String> {
        let output = self.run(None, &["config", "--global", key]).ok()?;
        if !output.status.success() {
            return None;
        }
        let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!value.is_empty()).then_some(value)
    }
}

impl IndexTransport for GitCliTransport {
    fn clone_repo(&self, remote: &str, dest: &Path) -> Result<()> {
        let dest = dest.to_string_lossy();
        self.run_checked(None, &["clone", "--quiet", remote, &dest], remote)
            .map(|_| ())
    }

    fn pull(&self, repo: &Path, remote: &str) -> Result<()> {
        // The working copy is a cache of the remote: take its head as is.
        self.run_checked(Some(repo), &["fetch", "--quiet", remote, "HEAD"], remote)?;
        self.run_checked(Some(repo), &["reset", "--quiet", "--hard", "FETCH_HEAD"], remote)
            .map(|_| ())
    }

    fn local_head(&self, repo: &Path) -> Result<Option<String>> {
        let output = self.run(Some(repo), &["rev-parse", "--verify", "--quiet", "HEAD"])?;
        let head = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((output.status.success() && !head.is_empty()).then_some(head))
    }

    fn remote_head(&self, remote: &str) -> Result<Option<String>> {
        let stdout = self.run_checked(None, &["ls-remote", remote, "HEAD"], remote)?;
        Ok(stdout
            .split_whitespace()
            .next()
            .map(str::to_string))
    }

    fn add(&self, repo: &Path, paths: &[PathBuf]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let paths = Self::path_args(repo, paths);
        let mut args = vec!["add", "--"];
        args.extend(paths.iter().map(String::as_str));
        self.run_checked(Some(repo), &args, "").map(|_| ())
    }

    fn remove(&self, repo: &Path, paths: &[PathBuf]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let paths = Self::path_args(repo, paths);
        let mut args = vec!["rm", "--quiet", "-r", "-f", "--ignore-unmatch", "--"];
        args.extend(paths.iter().map(String::as_str));
        self.run_checked(Some(repo), &args, "").map(|_| ())
    }

    fn commit(&self, repo: &Path, message: &str) -> Result<()> {
        // Re-publishing an unchanged document still records the command.
        self.run_checked(
            Some(repo),
            &["commit", "--quiet", "--allow-empty", "-m", message],
            "",
        )
            .map(|_| ())
    }

    fn push(&self, repo: &Path, remote: &str, branch: &str) -> Result<()> {
        let refspec = format!("HEAD:{}", branch);
        self.run_checked(Some(repo), &["push", "--quiet", remote, &refspec], remote)
            .map(|_| ())
    }

    fn global_identity(&self) -> Option<(String, String)> {
        Some((self.config_value("user.name")?, self.config_value("user.email")?))
    }
}
