//! Human readable pages of the index: one per model plus the README listing.

use crate::config::ContainerConfig;
use crate::metadata::{ModelSummary, TypeMeta};
use crate::{Result, VaultError};
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::info;

/// Extension required for template files.
pub const TEMPLATE_EXT: &str = ".md.tmpl";

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("placeholder pattern must compile")
});

static SECTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\{\{#\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}(.*?)\{\{/\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}")
        .expect("section pattern must compile")
});

/// Placeholder name to value.
pub type Fields = BTreeMap<&'static str, String>;

/// Everything the page of one model is rendered from.
#[derive(Debug, Clone, Copy)]
pub struct ModelPage<'a> {
    pub model_type: &'a str,
    pub model_id: &'a str,
    pub meta: &'a ModelSummary,
    /// Dependency ID to page link.
    pub links: &'a BTreeMap<String, String>,
}

/// Everything the README is rendered from.
#[derive(Debug, Clone, Copy)]
pub struct ReadmePage<'a> {
    pub models: &'a BTreeMap<String, BTreeMap<String, ModelSummary>>,
    pub meta: &'a BTreeMap<String, TypeMeta>,
    /// Type to ID to page link.
    pub links: &'a BTreeMap<String, BTreeMap<String, String>>,
}

/// Renders index pages.
pub trait PageTemplate {
    fn render_model(&self, page: &ModelPage<'_>) -> Result<String>;
    fn render_readme(&self, page: &ReadmePage<'_>) -> Result<String>;
}

/// Built-in Markdown pages.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkdownTemplate;

fn code_sample(code: &str, url: &str) -> String {
    code.replace("%s", url)
}

fn pairs_list(out: &mut String, pairs: &[(String, String)]) {
    for (title, url) in pairs {
        let _ = writeln!(out, "* [{}]({})", title, url);
    }
}

fn model_fields(page: &ModelPage<'_>) -> Fields {
    let meta = page.meta;
    let mut fields = BTreeMap::new();
    fields.insert("model_type", page.model_type.to_string());
    fields.insert("model_id", page.model_id.to_string());
    fields.insert("url", meta.url.clone());
    fields.insert("created_at", meta.created_at.clone());
    fields.insert("size", meta.size.clone());
    fields.insert("version", meta.version.to_string());
    fields.insert("parent", meta.parent.clone().unwrap_or_default());
    fields.insert("license", meta.license.clone());
    fields.insert("description", meta.description.clone());
    fields.insert("vendor", meta.vendor.clone());
    fields.insert("series", meta.series.clone().unwrap_or_default());
    fields.insert("tags", meta.tags.join(", "));
    fields.insert(
        "code",
        meta.code
            .as_deref()
            .map(|code| code_sample(code, &meta.url))
            .unwrap_or_default(),
    );

    let mut dependencies = String::new();
    for id in &meta.dependencies {
        match page.links.get(id) {
            Some(link) => {
                let _ = writeln!(dependencies, "* [{}]({})", id, link);
            }
            None => {
                let _ = writeln!(dependencies, "* {}", id);
            }
        }
    }
    fields.insert("dependencies", dependencies);

    let mut references = String::new();
    pairs_list(&mut references, &meta.references);
    fields.insert("references", references);
    let mut datasets = String::new();
    pairs_list(&mut datasets, &meta.datasets);
    fields.insert("datasets", datasets);

    let mut metrics = String::new();
    for (name, value) in &meta.metrics {
        let value = match value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        let _ = writeln!(metrics, "* {}: {}", name, value);
    }
    fields.insert("metrics", metrics);
    fields
}

fn newest_first(bucket: &BTreeMap<String, ModelSummary>) -> Vec<(&String, &ModelSummary)> {
    let mut ids: Vec<_> = bucket.iter().collect();
    ids.sort_by(|a, b| b.1.created().cmp(&a.1.created()).then_with(|| a.0.cmp(b.0)));
    ids
}

fn page_link(page: &ReadmePage<'_>, model_type: &str, id: &str) -> String {
    page.links
        .get(model_type)
        .and_then(|links| links.get(id))
        .cloned()
        .unwrap_or_default()
}

/// Rows of the `models` and `model_types` sections of a README template.
fn readme_sections(page: &ReadmePage<'_>) -> BTreeMap<&'static str, Vec<Fields>> {
    let mut types = Vec::new();
    let mut models = Vec::new();
    for (model_type, bucket) in page.models {
        let type_meta = page.meta.get(model_type).cloned().unwrap_or_default();
        for (id, summary) in newest_first(bucket) {
            let mut row = Fields::new();
            row.insert("model_type", model_type.clone());
            row.insert("model_id", id.clone());
            row.insert("link", page_link(page, model_type, id));
            row.insert("url", summary.url.clone());
            row.insert("version", summary.version.to_string());
            row.insert("created_at", summary.created_at.clone());
            row.insert("size", summary.size.clone());
            row.insert("license", summary.license.clone());
            row.insert("description", summary.description.clone());
            row.insert(
                "default",
                if *id == type_meta.default { "★" } else { "" }.to_string(),
            );
            models.push(row);
        }
        let default_url = bucket
            .get(&type_meta.default)
            .map(|summary| summary.url.as_str())
            .unwrap_or_default();
        let mut row = Fields::new();
        row.insert("model_type", model_type.clone());
        row.insert("description", type_meta.description.clone());
        row.insert("default", type_meta.default.clone());
        row.insert("code", code_sample(&type_meta.code, default_url));
        row.insert("count", bucket.len().to_string());
        types.push(row);
    }
    BTreeMap::from([("models", models), ("model_types", types)])
}

fn readme_listing(page: &ReadmePage<'_>) -> String {
    let mut out = String::new();
    for (model_type, bucket) in page.models {
        let type_meta = page.meta.get(model_type);
        let _ = writeln!(out, "## {}\n", model_type);
        if let Some(description) = type_meta
            .map(|m| m.description.as_str())
            .filter(|d| !d.is_empty())
        {
            let _ = writeln!(out, "{}\n", description);
        }
        let default = type_meta.map(|m| m.default.as_str()).unwrap_or_default();
        out.push_str("| Model | Version | Created | Size |\n|---|---|---|---|\n");
        for (id, summary) in newest_first(bucket) {
            let link = page_link(page, model_type, id);
            let marker = if id == default { " ★" } else { "" };
            let _ = writeln!(
                out,
                "| [{}]({}){} | {} | {} | {} |",
                id, link, marker, summary.version, summary.created_at, summary.size
            );
        }
        if let Some(code) = type_meta.map(|m| m.code.as_str()).filter(|c| !c.is_empty()) {
            let url = bucket.get(default).map(|s| s.url.as_str()).unwrap_or_default();
            let _ = writeln!(out, "\n```\n{}\n```", code_sample(code, url));
        }
        out.push('\n');
    }
    out
}

impl PageTemplate for MarkdownTemplate {
    fn render_model(&self, page: &ModelPage<'_>) -> Result<String> {
        let fields = model_fields(page);
        let field = |name: &str| fields.get(name).map(String::as_str).unwrap_or_default();
        let mut out = String::new();
        let _ = writeln!(out, "# {} {}\n", page.model_type, page.model_id);
        if !field("description").is_empty() {
            let _ = writeln!(out, "{}\n", field("description"));
        }
        out.push_str("| | |\n|---|---|\n");
        for (title, name) in [
            ("Version", "version"),
            ("Created", "created_at"),
            ("Size", "size"),
            ("License", "license"),
            ("Vendor", "vendor"),
            ("Series", "series"),
            ("Parent", "parent"),
            ("Tags", "tags"),
            ("URL", "url"),
        ] {
            if !field(name).is_empty() {
                let _ = writeln!(out, "| {} | {} |", title, field(name));
            }
        }
        for (title, name) in [
            ("Dependencies", "dependencies"),
            ("References", "references"),
            ("Datasets", "datasets"),
            ("Metrics", "metrics"),
        ] {
            if !field(name).is_empty() {
                let _ = write!(out, "\n## {}\n\n{}", title, field(name));
            }
        }
        if !field("code").is_empty() {
            let _ = writeln!(out, "\n## Usage\n\n```\n{}\n```", field("code"));
        }
        Ok(out)
    }

    fn render_readme(&self, page: &ReadmePage<'_>) -> Result<String> {
        Ok(format!("# Models\n\n{}", readme_listing(page)))
    }
}

/// A Markdown template file with `{{ name }}` placeholders.
///
/// `{{#name}} ... {{/name}}` repeats its body once per row of the section `name`.
/// Inside the body, row fields shadow the page fields. Sections do not nest.
#[derive(Debug, Clone)]
pub struct PlaceholderTemplate {
    path: PathBuf,
    source: String,
}

impl PlaceholderTemplate {
    /// Load a `*.md.tmpl` file.
    pub fn load(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default();
        if !name.ends_with(TEMPLATE_EXT) {
            return Err(VaultError::validation(
                "template",
                format!("{} must end with {}", path.display(), TEMPLATE_EXT),
            ));
        }
        let source =
            std::fs::read_to_string(path).map_err(|e| VaultError::io_with_path(e, path))?;
        info!("Loaded {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_source(source: impl Into<String>) -> Self {
        Self {
            path: PathBuf::new(),
            source: source.into(),
        }
    }

    /// Substitute every placeholder. Unknown names are an error.
    pub fn render(&self, fields: &Fields) -> Result<String> {
        self.render_sections(fields, &BTreeMap::new())
    }

    pub fn render_sections(
        &self,
        fields: &Fields,
        sections: &BTreeMap<&'static str, Vec<Fields>>,
    ) -> Result<String> {
        let mut out = String::with_capacity(self.source.len());
        let mut last = 0;
        for captures in SECTION.captures_iter(&self.source) {
            let (Some(whole), Some(open), Some(body), Some(close)) =
                (captures.get(0), captures.get(1), captures.get(2), captures.get(3))
            else {
                continue;
            };
            if open.as_str() != close.as_str() {
                return Err(self.invalid(format!(
                    "section \"{}\" is closed by \"{}\"",
                    open.as_str(),
                    close.as_str()
                )));
            }
            let rows = sections
                .get(open.as_str())
                .ok_or_else(|| self.invalid(format!("unknown section \"{}\"", open.as_str())))?;
            self.substitute(&mut out, &self.source[last..whole.start()], fields)?;
            for row in rows {
                let mut scope = fields.clone();
                scope.extend(row.iter().map(|(name, value)| (*name, value.clone())));
                self.substitute(&mut out, body.as_str(), &scope)?;
            }
            last = whole.end();
        }
        self.substitute(&mut out, &self.source[last..], fields)?;
        Ok(out)
    }

    fn substitute(&self, out: &mut String, text: &str, fields: &Fields) -> Result<()> {
        let mut last = 0;
        for captures in PLACEHOLDER.captures_iter(text) {
            let (Some(whole), Some(name)) = (captures.get(0), captures.get(1)) else {
                continue;
            };
            let value = fields.get(name.as_str()).ok_or_else(|| {
                self.invalid(format!("uses the unknown placeholder \"{}\"", name.as_str()))
            })?;
            out.push_str(&text[last..whole.start()]);
            out.push_str(value);
            last = whole.end();
        }
        out.push_str(&text[last..]);
        Ok(())
    }

    fn invalid(&self, message: String) -> VaultError {
        VaultError::validation("template", format!("{} {}", self.path.display(), message))
    }
}

/// Template files for either page, the built-in Markdown for the rest.
#[derive(Debug, Clone, Default)]
pub struct FileTemplate {
    model: Option<PlaceholderTemplate>,
    readme: Option<PlaceholderTemplate>,
}

impl FileTemplate {
    pub fn load(model: Option<&Path>, readme: Option<&Path>) -> Result<Self> {
        Ok(Self {
            model: model.map(PlaceholderTemplate::load).transpose()?,
            readme: readme.map(PlaceholderTemplate::load).transpose()?,
        })
    }

    pub fn new(model: Option<PlaceholderTemplate>, readme: Option<PlaceholderTemplate>) -> Self {
        Self { model, readme }
    }
}

impl PageTemplate for FileTemplate {
    fn render_model(&self, page: &ModelPage<'_>) -> Result<String> {
        match &self.model {
            Some(template) => template.render(&model_fields(page)),
            None => MarkdownTemplate.render_model(page),
        }
    }

    fn render_readme(&self, page: &ReadmePage<'_>) -> Result<String> {
        match &self.readme {
            Some(template) => {
                let mut fields = Fields::new();
                fields.insert("listing", readme_listing(page));
                fields.insert("types", page.models.len().to_string());
                fields.insert(
                    "count",
                    page.models.values().map(BTreeMap::len).sum::<usize>().to_string(),
                );
                fields.insert("default_name", ContainerConfig::DEFAULT_NAME.to_string());
                template.render_sections(&fields, &readme_sections(page))
            }
            None => MarkdownTemplate.render_readme(page),
        }
    }
}
