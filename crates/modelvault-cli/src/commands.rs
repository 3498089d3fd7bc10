//! Subcommand handlers.

use crate::{BackendArgs, Command, IndexArgs, TemplateArgs};
use modelvault_core::backend::{BackendRegistry, StorageBackend};
use modelvault_core::config::Settings;
use modelvault_core::index::{FileTemplate, GitCliTransport, IndexOptions, IndexRepository};
use modelvault_core::metadata::{atomic_read_json, ExtraMeta};
use modelvault_core::model::{LoadOptions, ModelSource};
use modelvault_core::network::LocatorSizeProbe;
use modelvault_core::{dump_model, PublishOptions, Result, Vault};
use std::path::Path;
use tracing::{info, warn};

pub fn run(command: Command, settings: &Settings) -> Result<()> {
    match command {
        Command::Init { force, index, backend } => {
            let mut vault = open_vault(&index, settings, false)?
                .with_backend(create_backend(&backend, settings)?);
            vault.initialize(force)
        }
        Command::Dump { input, index, backend } => dump(&input, &index, &backend, settings),
        Command::Publish {
            model,
            meta,
            update_default,
            force,
            index,
            backend,
            templates,
        } => {
            let options = PublishOptions {
                force,
                update_default,
                extra: read_extra_meta(meta.as_deref())?,
            };
            let mut vault = open_vault(&index, settings, true)?
                .with_backend(create_backend(&backend, settings)?)
                .with_template(load_templates(&templates)?)
                .with_probe(Box::new(LocatorSizeProbe::new()?));
            let path = std::path::absolute(&model)
                .map_err(|e| modelvault_core::VaultError::io_with_path(e, &model))?;
            let published = vault.publish(&path, &options)?;
            println!("{}", published.url);
            Ok(())
        }
        Command::List { index } => {
            let vault = open_vault(&index, settings, true)?;
            for listing in vault.list() {
                print!("{}", listing);
            }
            Ok(())
        }
        Command::Delete {
            input,
            index,
            backend,
            templates,
        } => {
            let mut vault = open_vault(&index, settings, true)?
                .with_backend(create_backend(&backend, settings)?)
                .with_template(load_templates(&templates)?);
            vault.delete(&input).map(|_| ())
        }
    }
}

fn index_options(index: &IndexArgs, settings: &Settings, exists: bool) -> IndexOptions {
    IndexOptions {
        username: index.username.clone().filter(|u| !u.is_empty()),
        password: index.password.clone().filter(|p| !p.is_empty()),
        exists,
        ..IndexOptions::from_settings(settings)
    }
}

fn open_vault(index: &IndexArgs, settings: &Settings, exists: bool) -> Result<Vault> {
    let repository = IndexRepository::open(
        &index_options(index, settings, exists),
        Box::new(GitCliTransport::new()),
    )?;
    Ok(Vault::new(repository))
}

fn create_backend(backend: &BackendArgs, settings: &Settings) -> Result<Box<dyn StorageBackend>> {
    BackendRegistry::with_defaults().create(
        backend.backend.as_deref(),
        backend.args.as_deref(),
        settings,
    )
}

fn load_templates(templates: &TemplateArgs) -> Result<FileTemplate> {
    FileTemplate::load(
        templates.template_model.as_deref(),
        templates.template_readme.as_deref(),
    )
}

fn read_extra_meta(path: Option<&Path>) -> Result<ExtraMeta> {
    let Some(path) = path else {
        return Ok(ExtraMeta::default());
    };
    match atomic_read_json::<ExtraMeta>(path)? {
        Some(extra) => Ok(extra),
        None => {
            warn!("{} does not exist, publishing without extra metadata", path.display());
            Ok(ExtraMeta::default())
        }
    }
}

/// Paths and URLs load directly; IDs and the default go through the index.
fn dump(input: &str, index: &IndexArgs, backend: &BackendArgs, settings: &Settings) -> Result<()> {
    let source = ModelSource::parse(input);
    let backend = match (&backend.backend, &settings.backend) {
        (None, None) => None,
        _ => Some(create_backend(backend, settings)?),
    };
    let text = match source {
        ModelSource::Path(_) | ModelSource::Url(_) => {
            let mut options = LoadOptions::new().settings(settings);
            if let Some(backend) = backend.as_deref() {
                options = options.backend(backend);
            }
            dump_model(&source, None, &options)?
        }
        ModelSource::Id(_) | ModelSource::Default => {
            info!("Resolving {} through the index", source);
            let mut vault = open_vault(index, settings, true)?;
            if let Some(backend) = backend {
                vault = vault.with_backend(backend);
            }
            vault.dump(&source, None)?
        }
    };
    println!("{}", text);
    Ok(())
}
