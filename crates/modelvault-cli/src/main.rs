//! ModelVault CLI - manage the model registry from the command line.
//!
//! Every handled failure is logged and turns into exit code 1.

mod commands;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use modelvault_core::config::{ConfigSource, Settings, SettingsOverride};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, error, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const OVERRIDE_FILE: &str = "modelvault.json";

#[derive(Parser, Debug)]
#[command(name = "modelvault")]
#[command(about = "Publish, list and delete versioned models")]
struct Cli {
    /// Logging verbosity
    #[arg(long, default_value = "info", global = true)]
    log_level: Level,

    /// JSON settings override file (defaults to ./modelvault.json when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone, Default)]
pub struct BackendArgs {
    /// Backend to use
    #[arg(long)]
    pub backend: Option<String>,

    /// Backend arguments, e.g. root=/srv/models
    #[arg(long)]
    pub args: Option<String>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct IndexArgs {
    /// Username for the index repository
    #[arg(long)]
    pub username: Option<String>,

    /// Password for the index repository
    #[arg(long)]
    pub password: Option<String>,

    /// URL of the remote index repository
    #[arg(long)]
    pub index_repo: Option<String>,

    /// Directory where the index repository is cached
    #[arg(long)]
    pub cache: Option<PathBuf>,

    /// Add a Signed-off-by trailer to the index commits
    #[arg(short, long)]
    pub signoff: bool,
}

#[derive(Args, Debug, Clone, Default)]
pub struct TemplateArgs {
    /// Template file (*.md.tmpl) for the model pages
    #[arg(long)]
    pub template_model: Option<PathBuf>,

    /// Template file (*.md.tmpl) for the README
    #[arg(long)]
    pub template_readme: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Initialize the registry
    Init {
        /// Destructively initialize the registry
        #[arg(short, long)]
        force: bool,
        #[command(flatten)]
        index: IndexArgs,
        #[command(flatten)]
        backend: BackendArgs,
    },
    /// Print brief information about a model
    Dump {
        /// Path to the model file, URL or ID
        input: String,
        #[command(flatten)]
        index: IndexArgs,
        #[command(flatten)]
        backend: BackendArgs,
    },
    /// Upload a model and update the registry
    Publish {
        /// Path to the model to publish
        model: PathBuf,
        /// JSON file with additional documentation of the model
        #[arg(long)]
        meta: Option<PathBuf>,
        /// Set this model as the default one
        #[arg(short = 'd', long)]
        update_default: bool,
        /// Overwrite an existing model
        #[arg(short, long)]
        force: bool,
        #[command(flatten)]
        index: IndexArgs,
        #[command(flatten)]
        backend: BackendArgs,
        #[command(flatten)]
        templates: TemplateArgs,
    },
    /// List all the models in the registry
    List {
        #[command(flatten)]
        index: IndexArgs,
    },
    /// Delete a model
    Delete {
        /// ID of the model to delete
        input: String,
        #[command(flatten)]
        index: IndexArgs,
        #[command(flatten)]
        backend: BackendArgs,
        #[command(flatten)]
        templates: TemplateArgs,
    },
}

impl Command {
    /// Settings layer carried by the flags.
    fn overrides(&self) -> SettingsOverride {
        let (index, backend) = match self {
            Command::Init { index, backend, .. }
            | Command::Dump { index, backend, .. }
            | Command::Publish { index, backend, .. }
            | Command::Delete { index, backend, .. } => (index, Some(backend)),
            Command::List { index } => (index, None),
        };
        SettingsOverride {
            backend: backend.and_then(|b| b.backend.clone()),
            backend_args: backend.and_then(|b| b.args.clone()),
            index_repo: index.index_repo.clone(),
            cache_dir: index.cache.clone(),
            always_signoff: index.signoff.then_some(true),
            ..Default::default()
        }
    }
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_str()));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let config = cli.config.clone().unwrap_or_else(|| PathBuf::from(OVERRIDE_FILE));
    let settings = Settings::load(&[
        ConfigSource::Env,
        ConfigSource::File(config),
        ConfigSource::Overrides(cli.command.overrides()),
    ])?;
    debug!("Settings: {:?}", settings);

    match commands::run(cli.command, &settings) {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            error!("{}", e);
            Ok(ExitCode::from(1))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_flags() {
        let cli = Cli::try_parse_from([
            "modelvault",
            "--log-level",
            "debug",
            "publish",
            "model.mvlt",
            "-d",
            "--force",
            "--backend",
            "fs",
            "--args",
            "root=/srv/models",
            "--signoff",
        ])
        .unwrap();
        assert_eq!(cli.log_level, Level::DEBUG);
        let overrides = cli.command.overrides();
        assert_eq!(overrides.backend.as_deref(), Some("fs"));
        assert_eq!(overrides.backend_args.as_deref(), Some("root=/srv/models"));
        assert_eq!(overrides.always_signoff, Some(true));
        match cli.command {
            Command::Publish {
                model,
                update_default,
                force,
                ..
            } => {
                assert_eq!(model, PathBuf::from("model.mvlt"));
                assert!(update_default && force);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unset_flags_do_not_override() {
        let cli = Cli::try_parse_from(["modelvault", "list"]).unwrap();
        let overrides = cli.command.overrides();
        assert_eq!(overrides, SettingsOverride::default());
    }

    #[test]
    fn test_subcommand_required() {
        assert!(Cli::try_parse_from(["modelvault"]).is_err());
    }
}
