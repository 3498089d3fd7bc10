//! The `index.json` document.

use crate::metadata::{atomic_write_json, ModelSummary, TypeMeta};
use crate::{Result, VaultError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};

const LEGACY_DEFAULT_KEY: &str = "default";

/// Every model summary by type and ID, plus per-type documentation.
///
/// Older documents kept the default ID inside `models[type]["default"]`; those are
/// moved to `meta[type].default` on read. Unknown top-level keys are preserved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawDocument")]
pub struct IndexDocument {
    pub models: BTreeMap<String, BTreeMap<String, ModelSummary>>,
    pub meta: BTreeMap<String, TypeMeta>,
    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

#[derive(Deserialize)]
struct RawDocument {
    #[serde(default)]
    models: BTreeMap<String, BTreeMap<String, Value>>,
    #[serde(default)]
    meta: BTreeMap<String, TypeMeta>,
    #[serde(flatten)]
    other: BTreeMap<String, Value>,
}

impl TryFrom<RawDocument> for IndexDocument {
    type Error = serde_json::Error;

    fn try_from(raw: RawDocument) -> std::result::Result<Self, Self::Error> {
        let mut meta = raw.meta;
        let mut models = BTreeMap::new();
        for (model_type, entries) in raw.models {
            let mut bucket = BTreeMap::new();
            for (key, value) in entries {
                if key == LEGACY_DEFAULT_KEY {
                    if let Value::String(id) = value {
                        let type_meta = meta.entry(model_type.clone()).or_default();
                        if type_meta.default.is_empty() {
                            debug!("Migrating the legacy default of {}", model_type);
                            type_meta.default = id;
                        }
                        continue;
                    }
                }
                bucket.insert(key, serde_json::from_value::<ModelSummary>(value)?);
            }
            models.insert(model_type, bucket);
        }
        Ok(IndexDocument {
            models,
            meta,
            other: raw.other,
        })
    }
}

impl IndexDocument {
    /// Read `path`. A missing or malformed file is [`VaultError::IndexUnreadable`].
    pub fn load(path: &Path) -> Result<Self> {
        let unreadable = |source: VaultError| VaultError::IndexUnreadable {
            path: path.to_path_buf(),
            source: Some(Box::new(source)),
        };
        let text = std::fs::read_to_string(path)
            .map_err(|e| unreadable(VaultError::io_with_path(e, path)))?;
        let document: Self =
            serde_json::from_str(&text).map_err(|e| unreadable(VaultError::from(e)))?;
        document.check_defaults();
        Ok(document)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        atomic_write_json(path, self, true)
    }

    fn check_defaults(&self) {
        for (model_type, type_meta) in &self.meta {
            if !type_meta.default.is_empty() && self.find(model_type, &type_meta.default).is_none()
            {
                warn!(
                    "The default {} model {} is not in the index",
                    model_type, type_meta.default
                );
            }
        }
    }

    pub fn find(&self, model_type: &str, id: &str) -> Option<&ModelSummary> {
        self.models.get(model_type).and_then(|bucket| bucket.get(id))
    }

    /// Find `id` in any type; returns the owning type too.
    pub fn find_any(&self, id: &str) -> Option<(&str, &ModelSummary)> {
        self.models.iter().find_map(|(model_type, bucket)| {
            bucket
                .get(id)
                .map(|summary| (model_type.as_str(), summary))
        })
    }

    /// ID of the default model of `model_type`, if set.
    pub fn default_id(&self, model_type: &str) -> Option<&str> {
        self.meta
            .get(model_type)
            .map(|type_meta| type_meta.default.as_str())
            .filter(|id| !id.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty() && self.meta.is_empty()
    }

    /// Number of models over all types.
    pub fn len(&self) -> usize {
        self.models.values().map(BTreeMap::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_current_schema() {
        let document: IndexDocument = serde_json::from_value(json!({
            "models": {
                "docfreq": {
                    "12345678-9abc-def0-1234-56789abcdef0": {
                        "url": "https://example.com/docfreq.mvlt",
                        "created_at": "2017-06-19 09:59:14+0000",
                        "version": [1, 0, 0],
                        "custom": 7
                    }
                }
            },
            "meta": {
                "docfreq": {
                    "default": "12345678-9abc-def0-1234-56789abcdef0",
                    "code": "%s",
                    "description": "Document frequencies."
                }
            },
            "generation": 2
        }))
        .unwrap();
        let id = "12345678-9abc-def0-1234-56789abcdef0";
        assert_eq!(document.default_id("docfreq"), Some(id));
        let summary = document.find("docfreq", id).unwrap();
        assert_eq!(summary.other.get("custom"), Some(&json!(7)));
        assert!(summary.created().is_some());
        assert_eq!(document.find_any(id).map(|(t, _)| t), Some("docfreq"));
        assert_eq!(document.other.get("generation"), Some(&json!(2)));

        let round = serde_json::to_value(&document).unwrap();
        assert_eq!(round["generation"], json!(2));
        assert_eq!(round["models"]["docfreq"][id]["custom"], json!(7));
    }

    #[test]
    fn test_legacy_default_is_migrated() {
        let document: IndexDocument = serde_json::from_value(json!({
            "models": {
                "id2vec": {
                    "default": "abc",
                    "abc": {"url": "https://example.com/abc.mvlt"}
                }
            }
        }))
        .unwrap();
        assert_eq!(document.default_id("id2vec"), Some("abc"));
        assert_eq!(document.models["id2vec"].len(), 1);
        assert!(document.find("id2vec", "default").is_none());
    }

    #[test]
    fn test_load_errors() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("index.json");
        assert!(matches!(
            IndexDocument::load(&path),
            Err(VaultError::IndexUnreadable { .. })
        ));
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            IndexDocument::load(&path),
            Err(VaultError::IndexUnreadable { .. })
        ));
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("index.json");
        let mut document = IndexDocument::default();
        assert!(document.is_empty());
        document
            .models
            .entry("docfreq".into())
            .or_default()
            .insert("a".into(), ModelSummary::default());
        document.save(&path).unwrap();
        let loaded = IndexDocument::load(&path).unwrap();
        assert_eq!(loaded, document);
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.default_id("docfreq"), None);
    }
}
