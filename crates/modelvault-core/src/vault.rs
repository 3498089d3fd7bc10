//! Registry operations combining a storage backend with the index.
//!
//! Each operation runs one index session: mutate the fetched snapshot, then
//! publish it. A lost publish race surfaces as [`VaultError::PublishConflict`];
//! the caller re-opens the index and runs the operation again.

use crate::backend::StorageBackend;
use crate::codec::read_meta;
use crate::index::{IndexCommand, IndexRepository, MarkdownTemplate, PageTemplate, RemovedModel};
use crate::metadata::{extract_model_meta, ExtraMeta, ModelMeta, ModelSummary};
use crate::model::{GenericModel, LoadOptions, ModelRegistry, ModelSource};
use crate::network::{LocatorSizeProbe, SizeProbe};
use crate::{Result, VaultError};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use tracing::{error, info};

/// Flags of [`Vault::publish`].
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Overwrite an existing blob with the same ID.
    pub force: bool,
    /// Make the model the default of its type.
    pub update_default: bool,
    /// Documentation merged into the index entry.
    pub extra: ExtraMeta,
}

/// A model which made it into the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedModel {
    pub model_type: String,
    pub id: String,
    pub url: String,
}

/// One row of [`Vault::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedModel {
    pub id: String,
    pub created_at: String,
    pub is_default: bool,
}

/// The models of one type, newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeListing {
    pub model_type: String,
    pub models: Vec<ListedModel>,
}

impl fmt::Display for TypeListing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.model_type)?;
        for model in &self.models {
            let marker = if model.is_default { '*' } else { ' ' };
            writeln!(f, "  {} {} {}", marker, model.id, model.created_at)?;
        }
        Ok(())
    }
}

/// The registry: a storage backend for blobs plus the index describing them.
pub struct Vault {
    index: IndexRepository,
    backend: Option<Box<dyn StorageBackend>>,
    template: Box<dyn PageTemplate>,
    probe: Box<dyn SizeProbe>,
}

impl fmt::Debug for Vault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vault")
            .field("index", &self.index)
            .field("backend", &self.backend.as_ref().map(|b| b.name()))
            .finish()
    }
}

impl Vault {
    /// A vault over a fetched index, with Markdown pages and local size probes.
    pub fn new(index: IndexRepository) -> Self {
        Self {
            index,
            backend: None,
            template: Box::new(MarkdownTemplate),
            probe: Box::new(LocatorSizeProbe::local_only()),
        }
    }

    pub fn with_backend(mut self, backend: Box<dyn StorageBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Render the model pages and the README with `template`.
    pub fn with_template(mut self, template: impl PageTemplate + 'static) -> Self {
        self.template = Box::new(template);
        self
    }

    pub fn with_probe(mut self, probe: Box<dyn SizeProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn index(&self) -> &IndexRepository {
        &self.index
    }

    pub fn backend(&self) -> Option<&dyn StorageBackend> {
        self.backend.as_deref()
    }

    fn require_backend(&self) -> Result<&dyn StorageBackend> {
        self.backend.as_deref().ok_or_else(|| VaultError::Config {
            message: "no storage backend selected".to_string(),
        })
    }

    /// Reset the backend namespace and the index.
    pub fn initialize(&mut self, force: bool) -> Result<()> {
        let backend = self.require_backend()?;
        if let Err(e) = backend.reset(force) {
            error!("Failed to initialize the backend: {}", e);
            return Err(e);
        }
        self.index.reset()?;
        self.index.update_readme(self.template.as_ref())?;
        self.index.upload(&IndexCommand::Reset)?;
        info!("Successfully initialized");
        Ok(())
    }

    /// Upload the model file at `path` and register it.
    pub fn publish(&mut self, path: &Path, options: &PublishOptions) -> Result<PublishedModel> {
        let meta = read_meta(path)?;
        let backend = self.require_backend()?;
        let url = {
            let _lock = backend.lock()?;
            backend.upload_model(path, &meta, options.force)?
        };
        info!("Uploaded as {}", url);

        let index_meta = extract_model_meta(&meta, &options.extra, &url, self.probe.as_ref())?;
        self.index.add_model(
            &meta.model_type,
            &meta.id,
            &index_meta,
            self.template.as_ref(),
            options.update_default,
        )?;
        self.index.update_readme(self.template.as_ref())?;
        self.index.upload(&IndexCommand::Add {
            model_type: meta.model_type.clone(),
            id: meta.id.clone(),
        })?;
        info!("Successfully published {}/{}", meta.model_type, meta.id);
        Ok(PublishedModel {
            model_type: meta.model_type,
            id: meta.id,
            url,
        })
    }

    /// Every type with its models, newest first.
    pub fn list(&self) -> Vec<TypeListing> {
        let contents = self.index.contents();
        contents
            .models
            .iter()
            .map(|(model_type, bucket)| {
                let default = contents.default_id(model_type);
                let mut entries: Vec<(&String, &ModelSummary)> = bucket.iter().collect();
                entries.sort_by(|a, b| b.1.created().cmp(&a.1.created()).then(a.0.cmp(b.0)));
                TypeListing {
                    model_type: model_type.clone(),
                    models: entries
                        .into_iter()
                        .map(|(id, summary)| ListedModel {
                            id: id.clone(),
                            created_at: summary.created_at.clone(),
                            is_default: default == Some(id.as_str()),
                        })
                        .collect(),
                }
            })
            .collect()
    }

    /// Remove a model from the index and delete its blob, then publish.
    ///
    /// If the publish fails, the blob is already gone while the shared index still
    /// lists the model. Re-running the delete after a refetch completes it, since
    /// deleting a missing blob only logs.
    pub fn delete(&mut self, id: &str) -> Result<RemovedModel> {
        self.require_backend()?;
        let summary = self
            .index
            .contents()
            .find_any(id)
            .map(|(_, summary)| summary.clone());
        let removed = self.index.remove_model(id)?;
        self.index.update_readme(self.template.as_ref())?;
        if let Some(summary) = summary {
            let meta = blob_meta(&removed.model_type, &removed.id, summary);
            self.require_backend()?.delete_model(&meta)?;
        }
        if let Err(e) = self.index.upload(&IndexCommand::Delete {
            model_type: removed.model_type.clone(),
            id: removed.id.clone(),
        }) {
            error!(
                "Deleted the blob of {}/{} but the index still lists it: {}",
                removed.model_type, removed.id, e
            );
            return Err(e);
        }
        info!("Successfully deleted {}/{}", removed.model_type, removed.id);
        Ok(removed)
    }

    /// Describe a model, resolving IDs and defaults through this index.
    pub fn dump(&self, source: &ModelSource, registry: Option<&ModelRegistry>) -> Result<String> {
        let mut options = LoadOptions::new().index(self.index.contents());
        if let Some(backend) = self.backend.as_deref() {
            options = options.backend(backend);
        }
        dump_model(source, registry, &options)
    }
}

/// Describe any model: its metadata followed by the payload summary, if decoded.
pub fn dump_model(
    source: &ModelSource,
    registry: Option<&ModelRegistry>,
    options: &LoadOptions<'_>,
) -> Result<String> {
    let mut model = GenericModel::load(source, registry, options)?;
    let text = model.to_string();
    model.close();
    Ok(text)
}

/// The fields of an index entry the backend needs to address its blob.
fn blob_meta(model_type: &str, id: &str, summary: ModelSummary) -> ModelMeta {
    let created_at = summary.created();
    ModelMeta {
        model_type: model_type.to_string(),
        id: id.to_string(),
        version: summary.version,
        parent: summary.parent,
        created_at,
        dependencies: Vec::new(),
        license: summary.license,
        description: summary.description,
        vendor: summary.vendor,
        tags: summary.tags,
        references: summary.references,
        datasets: summary.datasets,
        series: summary.series,
        metrics: summary.metrics,
        extra: BTreeMap::new(),
        code: summary.code,
        environment: None,
    }
}
