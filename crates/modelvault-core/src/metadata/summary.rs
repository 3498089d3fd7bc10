//! Denormalized metadata stored in the index document.

use crate::metadata::record::{ModelMeta, Version};
use crate::network::SizeProbe;
use crate::Result;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::warn;

const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%z";

/// Per-type documentation kept under the index `meta` key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TypeMeta {
    /// ID of the default model of this type, empty if none.
    pub default: String,
    /// Usage example; `%s` stands for the model locator.
    pub code: String,
    pub description: String,
}

/// The index summary of one model.
///
/// Every field is optional on read so documents from older index generations
/// still deserialize. Unknown keys land in `other` and are written back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSummary {
    pub url: String,
    pub created_at: String,
    pub size: String,
    pub version: Version,
    pub parent: Option<String>,
    pub license: String,
    pub description: String,
    pub vendor: String,
    pub series: Option<String>,
    pub code: Option<String>,
    /// IDs of the dependencies.
    pub dependencies: Vec<String>,
    pub tags: Vec<String>,
    pub references: Vec<(String, String)>,
    pub datasets: Vec<(String, String)>,
    pub metrics: BTreeMap<String, Value>,
    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

impl ModelSummary {
    /// Parsed `created_at`, if it is in a known format.
    pub fn created(&self) -> Option<DateTime<Utc>> {
        parse_datetime(&self.created_at)
    }
}

/// User supplied documentation merged on publish, usually read from a JSON file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtraMeta {
    pub code: Option<String>,
    pub description: Option<String>,
    /// Arbitrary overrides applied on top of the generated summary.
    pub model: Map<String, Value>,
}

/// The result of [`extract_model_meta`]: type documentation plus the model summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub default: TypeMeta,
    pub model: ModelSummary,
}

/// Merge the saved metadata with user documentation and the probed artifact size.
///
/// The size probe hits the network for remote locators. A failed probe leaves the
/// size empty instead of failing the publish.
pub fn extract_model_meta(
    base: &ModelMeta,
    extra: &ExtraMeta,
    model_url: &str,
    probe: &dyn SizeProbe,
) -> Result<IndexMeta> {
    let size = match probe.content_length(model_url) {
        Ok(Some(bytes)) => natural_size(bytes),
        Ok(None) => String::new(),
        Err(e) => {
            warn!("Failed to measure {}: {}", model_url, e);
            String::new()
        }
    };

    let mut summary = ModelSummary {
        url: model_url.to_string(),
        created_at: base.created_at.map(format_datetime).unwrap_or_default(),
        size,
        version: base.version.clone(),
        parent: base.parent.clone(),
        license: base.license.clone(),
        description: base.description.clone(),
        vendor: base.vendor.clone(),
        series: base.series.clone(),
        code: base.code.clone().or_else(|| extra.code.clone()),
        dependencies: base.dependency_ids(),
        tags: base.tags.clone(),
        references: base.references.clone(),
        datasets: base.datasets.clone(),
        metrics: base.metrics.clone(),
        other: BTreeMap::new(),
    };
    if summary.description.is_empty() {
        if let Some(description) = &extra.description {
            summary.description = description.clone();
        }
    }
    if !extra.model.is_empty() {
        let mut value = serde_json::to_value(&summary)?;
        if let Value::Object(fields) = &mut value {
            for (key, override_value) in &extra.model {
                fields.insert(key.clone(), override_value.clone());
            }
        }
        summary = serde_json::from_value(value)?;
    }

    let default = TypeMeta {
        default: base.id.clone(),
        code: extra.code.clone().or_else(|| base.code.clone()).unwrap_or_default(),
        description: extra
            .description
            .clone()
            .unwrap_or_else(|| base.description.clone()),
    };
    Ok(IndexMeta {
        default,
        model: summary,
    })
}

/// Format a timestamp the way it appears in the index.
pub fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.format(DATETIME_FORMAT).to_string()
}

/// Parse an index timestamp. RFC 3339 and the naive `%Y-%m-%d %H:%M:%S` form are accepted too.
pub fn parse_datetime(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(text, DATETIME_FORMAT)
        .or_else(|_| DateTime::parse_from_rfc3339(text))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|naive| naive.and_utc())
        })
}

/// Human readable size with decimal units: `7 Bytes`, `1 Byte`, `1.5 kB`, `12.0 MB`.
pub fn natural_size(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["kB", "MB", "GB", "TB", "PB", "EB"];
    if bytes == 1 {
        return "1 Byte".to_string();
    }
    if bytes < 1000 {
        return format!("{} Bytes", bytes);
    }
    let mut value = bytes as f64 / 1000.0;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::generate_new_meta;
    use crate::VaultError;
    use chrono::TimeZone;

    struct FixedProbe(Option<u64>);

    impl SizeProbe for FixedProbe {
        fn content_length(&self, _url: &str) -> Result<Option<u64>> {
            Ok(self.0)
        }
    }

    struct FailingProbe;

    impl SizeProbe for FailingProbe {
        fn content_length(&self, url: &str) -> Result<Option<u64>> {
            Err(VaultError::DownloadFailed {
                url: url.to_string(),
                status: 404,
            })
        }
    }

    fn saved_meta() -> ModelMeta {
        let mut meta = generate_new_meta("docfreq", "model_description", "acme", "MIT").unwrap();
        meta.created_at = Some(Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).unwrap());
        meta.series = Some("series".into());
        meta.references = vec![("ref".into(), "https://ref".into())];
        meta
    }

    #[test]
    fn test_extract_model_meta() {
        let base = saved_meta();
        let extra = ExtraMeta {
            code: Some("load(\"%s\")".into()),
            description: Some("type description".into()),
            model: Map::new(),
        };
        let meta = extract_model_meta(&base, &extra, "https://host/model.mvlt", &FixedProbe(Some(7)))
            .unwrap();

        assert_eq!(meta.default.default, base.id);
        assert_eq!(meta.default.code, "load(\"%s\")");
        assert_eq!(meta.default.description, "type description");
        assert_eq!(meta.model.size, "7 Bytes");
        assert_eq!(meta.model.url, "https://host/model.mvlt");
        assert_eq!(meta.model.created_at, "2026-03-04 05:06:07+0000");
        assert_eq!(meta.model.description, "model_description");
        assert_eq!(meta.model.series.as_deref(), Some("series"));
        assert_eq!(meta.model.version, Version(vec![1, 0, 0]));
        assert_eq!(meta.model.created(), base.created_at);
    }

    #[test]
    fn test_extract_model_meta_overrides_and_failed_probe() {
        let base = saved_meta();
        let mut overrides = Map::new();
        overrides.insert("license".into(), Value::from("Apache-2.0"));
        overrides.insert("accuracy".into(), Value::from(0.97));
        let extra = ExtraMeta {
            model: overrides,
            ..Default::default()
        };
        let meta = extract_model_meta(&base, &extra, "https://host/x", &FailingProbe).unwrap();
        assert_eq!(meta.model.size, "");
        assert_eq!(meta.model.license, "Apache-2.0");
        assert_eq!(meta.model.other.get("accuracy"), Some(&Value::from(0.97)));
        assert_eq!(meta.default.description, "model_description");
    }

    #[test]
    fn test_natural_size() {
        assert_eq!(natural_size(0), "0 Bytes");
        assert_eq!(natural_size(1), "1 Byte");
        assert_eq!(natural_size(7), "7 Bytes");
        assert_eq!(natural_size(1500), "1.5 kB");
        assert_eq!(natural_size(12_000_000), "12.0 MB");
    }

    #[test]
    fn test_parse_datetime_formats() {
        let dt = Utc.with_ymd_and_hms(2020, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(parse_datetime(&format_datetime(dt)), Some(dt));
        assert_eq!(parse_datetime("2020-01-02T03:04:05Z"), Some(dt));
        assert_eq!(parse_datetime("2020-01-02 03:04:05"), Some(dt));
        assert_eq!(parse_datetime("yesterday"), None);
    }

    #[test]
    fn test_summary_tolerates_sparse_documents() {
        let summary: ModelSummary =
            serde_json::from_str(r#"{"url": "u", "legacy_field": 1}"#).unwrap();
        assert_eq!(summary.url, "u");
        assert!(summary.version.0.is_empty());
        assert_eq!(summary.other.get("legacy_field"), Some(&Value::from(1)));
    }
}
