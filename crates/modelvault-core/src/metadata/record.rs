//! The per-artifact metadata record.

use crate::metadata::environment::Environment;
use crate::metadata::license::check_license;
use crate::{Result, VaultError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Semver-like version: an ordered tuple of non-negative integers.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(pub Vec<u32>);

impl Version {
    pub fn initial() -> Self {
        Version(vec![1, 0, 0])
    }

    /// Increment the last component.
    pub fn bump_last(&self) -> Self {
        let mut parts = self.0.clone();
        match parts.last_mut() {
            Some(last) => *last += 1,
            None => parts.push(1),
        }
        Version(parts)
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.0
    }
}

impl From<Vec<u32>> for Version {
    fn from(parts: Vec<u32>) -> Self {
        Version(parts)
    }
}

impl From<&[u32]> for Version {
    fn from(parts: &[u32]) -> Self {
        Version(parts.to_vec())
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(u32::to_string).collect();
        write!(f, "{}", parts.join("."))
    }
}

/// A dependency of a model: either the full metadata or a `(type, id)` reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Dependency {
    Inline(Box<ModelMeta>),
    Reference {
        model: String,
        uuid: String,
    },
}

impl Dependency {
    pub fn model_type(&self) -> &str {
        match self {
            Dependency::Inline(meta) => &meta.model_type,
            Dependency::Reference { model, .. } => model,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Dependency::Inline(meta) => &meta.id,
            Dependency::Reference { uuid, .. } => uuid,
        }
    }
}

impl From<ModelMeta> for Dependency {
    fn from(meta: ModelMeta) -> Self {
        Dependency::Inline(Box::new(meta))
    }
}

impl From<&ModelMeta> for Dependency {
    fn from(meta: &ModelMeta) -> Self {
        Dependency::Inline(Box::new(meta.clone()))
    }
}

/// Metadata of one model instance.
///
/// `id` never changes once assigned; a new version is a new record with a new
/// `id` and `parent` pointing at the previous one. `created_at` is assigned
/// only when the model is written out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMeta {
    #[serde(rename = "model")]
    pub model_type: String,
    #[serde(rename = "uuid")]
    pub id: String,
    pub version: Version,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    pub license: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub vendor: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// `(title, url)` pairs.
    #[serde(default)]
    pub references: Vec<(String, String)>,
    /// `(name, url)` pairs.
    #[serde(default)]
    pub datasets: Vec<(String, String)>,
    #[serde(default)]
    pub series: Option<String>,
    #[serde(default)]
    pub metrics: BTreeMap<String, Value>,
    #[serde(default)]
    pub extra: BTreeMap<String, Value>,
    /// Usage example; `%s` stands for the model locator.
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub environment: Option<Environment>,
}

impl ModelMeta {
    /// Find the dependency whose type is `name`.
    pub fn dependency(&self, name: &str) -> Result<&Dependency> {
        self.dependencies
            .iter()
            .find(|dep| dep.model_type() == name)
            .ok_or_else(|| VaultError::DependencyNotFound {
                name: name.to_string(),
                available: self
                    .dependencies
                    .iter()
                    .map(|dep| dep.model_type().to_string())
                    .collect(),
            })
    }

    /// IDs of all dependencies, in declaration order.
    pub fn dependency_ids(&self) -> Vec<String> {
        self.dependencies
            .iter()
            .map(|dep| dep.id().to_string())
            .collect()
    }
}

/// Generate a new unique model ID.
pub fn new_model_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Create the metadata of a brand new model.
///
/// The version starts at `1.0.0`, `parent` is empty and `created_at` stays unset
/// until the model is saved.
pub fn generate_new_meta(
    name: &str,
    description: &str,
    vendor: &str,
    license: &str,
) -> Result<ModelMeta> {
    check_license(license)?;
    Ok(ModelMeta {
        model_type: name.to_string(),
        id: new_model_id(),
        version: Version::initial(),
        parent: None,
        created_at: None,
        dependencies: Vec::new(),
        license: license.to_string(),
        description: description.to_string(),
        vendor: vendor.to_string(),
        tags: Vec::new(),
        references: Vec::new(),
        datasets: Vec::new(),
        series: None,
        metrics: BTreeMap::new(),
        extra: BTreeMap::new(),
        code: None,
        environment: Some(crate::metadata::collect_environment()),
    })
}
