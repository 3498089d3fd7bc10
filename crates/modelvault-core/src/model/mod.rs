//! The model lifecycle: create, load, derive and save versioned artifacts.
//!
//! A [`Model`] pairs the metadata record with a typed payload. The payload type
//! implements [`Payload`] to turn itself into a tree of arrays and back; the
//! lifecycle never looks inside that tree.

mod generic;
mod source;

pub use generic::{AnyPayload, GenericModel, ModelRegistry, PayloadDecoder};
pub use source::{LoadOptions, ModelSource};

use crate::codec::{open_container, write_container, Compression, ContainerSource, TreeNode, WriteOptions};
use crate::config::ContainerConfig;
use crate::metadata::{
    check_license, collect_environment, format_datetime, natural_size, new_model_id, Dependency,
    ModelMeta, Version,
};
use crate::{Result, VaultError};
use chrono::Utc;
use serde_json::Value;
use source::resolve_source;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// A concrete model type.
pub trait Payload: Sized {
    /// Type name stored in the metadata, e.g. `docfreq`.
    const NAME: &'static str;
    const VENDOR: &'static str;
    /// Markdown description.
    const DESCRIPTION: &'static str;
    /// SPDX identifier or `Proprietary`.
    const LICENSE: &'static str = ContainerConfig::DEFAULT_LICENSE;
    /// Tree paths whose arrays are stored uncompressed.
    const NO_COMPRESSION: &'static [&'static str] = &[];
    /// Other type names this payload can decode, e.g. those of derived formats.
    const COMPATIBLE: &'static [&'static str] = &[];

    fn encode(&self) -> Result<TreeNode>;

    fn decode(tree: &TreeNode) -> Result<Self>;

    /// Brief human readable summary of the payload, without metadata.
    fn dump(&self) -> String {
        String::new()
    }
}

/// Type names accepted when loading `P`.
pub fn accepted_types<P: Payload>() -> Vec<String> {
    std::iter::once(P::NAME)
        .chain(P::COMPATIBLE.iter().copied())
        .map(str::to_string)
        .collect()
}

/// Where a model is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelState {
    /// Constructed in memory, never written.
    Unsaved,
    /// Read from an existing file.
    Loaded,
    /// New identity and version, not written yet.
    Derived,
    /// Written; `created_at` is fixed.
    Saved,
}

/// One model artifact: metadata plus a typed payload.
///
/// Models opened lazily keep their container file open until [`Model::close`]
/// is called or the last array referencing the file is dropped.
pub struct Model<P> {
    meta: ModelMeta,
    payload: Option<P>,
    state: ModelState,
    source: Option<String>,
    size: u64,
    container: Option<Arc<ContainerSource>>,
    write_options: WriteOptions,
}

macro_rules! meta_setters {
    ($($(#[$doc:meta])* $setter:ident => $field:ident: $ty:ty;)*) => {
        $(
            $(#[$doc])*
            pub fn $setter(&mut self, value: $ty) -> &mut Self {
                self.meta.$field = value;
                self
            }
        )*
    };
}

impl<P: Payload> Model<P> {
    /// A fresh, unsaved model holding `payload`.
    pub fn new(payload: P) -> Result<Self> {
        let mut model = Self::empty()?;
        model.payload = Some(payload);
        Ok(model)
    }

    /// A fresh, unsaved model without a payload yet.
    pub fn empty() -> Result<Self> {
        let meta = crate::metadata::generate_new_meta(
            P::NAME,
            P::DESCRIPTION,
            P::VENDOR,
            P::LICENSE,
        )?;
        Ok(Self::from_parts(meta, None, ModelState::Unsaved, None, 0, None))
    }

    pub(crate) fn from_parts(
        meta: ModelMeta,
        payload: Option<P>,
        state: ModelState,
        source: Option<String>,
        size: u64,
        container: Option<Arc<ContainerSource>>,
    ) -> Self {
        Self {
            meta,
            payload,
            state,
            source,
            size,
            container,
            write_options: WriteOptions {
                compression: Compression::default(),
                no_compression: P::NO_COMPRESSION.iter().collect(),
            },
        }
    }

    /// Load a model of this type.
    ///
    /// Resolution order: an existing local file, the cached `<id>.mvlt`, the
    /// index (for IDs and the default model), then a fetch through the backend.
    /// Fails with [`VaultError::TypeMismatch`] when the file holds another type.
    pub fn load(source: &ModelSource, options: &LoadOptions<'_>) -> Result<Self> {
        let resolved = resolve_source(source, Some(P::NAME), options)?;
        let container = open_container(&resolved.path, options.lazy)?;
        info!(
            "Reading {} ({})...",
            resolved.path.display(),
            natural_size(container.size)
        );
        check_type::<P>(&container.meta.model_type)?;
        let payload = match P::decode(&container.tree) {
            Ok(payload) => payload,
            Err(e) => {
                container.close();
                return Err(e);
            }
        };
        let source = container.source();
        Ok(Self::from_parts(
            container.meta,
            Some(payload),
            ModelState::Loaded,
            Some(resolved.label),
            container.size,
            source,
        ))
    }

    pub fn meta(&self) -> &ModelMeta {
        &self.meta
    }

    pub fn payload(&self) -> Option<&P> {
        self.payload.as_ref()
    }

    pub fn payload_mut(&mut self) -> Option<&mut P> {
        self.payload.as_mut()
    }

    pub fn set_payload(&mut self, payload: P) -> &mut Self {
        self.payload = Some(payload);
        self
    }

    pub fn into_payload(self) -> Option<P> {
        self.payload
    }

    pub fn state(&self) -> ModelState {
        self.state
    }

    /// Where the model was read from or last written to.
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Size of the serialized model in bytes, 0 before the first load or save.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn id(&self) -> &str {
        &self.meta.id
    }

    pub fn version(&self) -> &Version {
        &self.meta.version
    }

    pub fn parent(&self) -> Option<&str> {
        self.meta.parent.as_deref()
    }

    meta_setters! {
        set_description => description: String;
        set_vendor => vendor: String;
        /// Checked against the known identifiers on save.
        set_license => license: String;
        set_tags => tags: Vec<String>;
        set_references => references: Vec<(String, String)>;
        set_datasets => datasets: Vec<(String, String)>;
        set_series => series: Option<String>;
        set_metrics => metrics: BTreeMap<String, Value>;
        set_extra => extra: BTreeMap<String, Value>;
        /// Usage example; `%s` stands for the model locator.
        set_code => code: Option<String>;
    }

    /// Compression used for arrays outside the `NO_COMPRESSION` prefixes.
    pub fn set_compression(&mut self, compression: Compression) -> &mut Self {
        self.write_options.compression = compression;
        self
    }

    /// Start a new version of this model.
    ///
    /// Without `new_version` the last version component is incremented. A model
    /// which has never been written keeps its identity: only an explicit version
    /// is applied. Otherwise the current ID becomes the parent and a new ID is
    /// assigned; deriving again before saving keeps that parent.
    pub fn derive(&mut self, new_version: Option<Vec<u32>>) -> Result<&mut Self> {
        let explicit = match new_version {
            Some(parts) if parts.is_empty() => {
                return Err(VaultError::validation(
                    "version",
                    "the version must have at least one component",
                ))
            }
            Some(parts) => {
                let version = Version(parts);
                if version < self.meta.version {
                    return Err(VaultError::validation(
                        "version",
                        format!(
                            "{} is lower than the current version {}",
                            version, self.meta.version
                        ),
                    ));
                }
                Some(version)
            }
            None => None,
        };

        match self.state {
            ModelState::Unsaved => {
                if let Some(version) = explicit {
                    self.meta.version = version;
                }
            }
            ModelState::Loaded | ModelState::Saved => {
                self.meta.version = explicit.unwrap_or_else(|| self.meta.version.bump_last());
                self.meta.parent = Some(self.meta.id.clone());
                self.meta.id = new_model_id();
                self.state = ModelState::Derived;
            }
            ModelState::Derived => {
                self.meta.version = explicit.unwrap_or_else(|| self.meta.version.bump_last());
                self.meta.id = new_model_id();
            }
        }
        debug!(
            "Derived {} {} (parent {:?})",
            self.meta.model_type, self.meta.version, self.meta.parent
        );
        Ok(self)
    }

    /// Write the model to `output`.
    ///
    /// `series` is required unless one is already set. `dependencies`, when
    /// given, replace the current list. Stamps `created_at` and the environment.
    pub fn save(
        &mut self,
        output: &Path,
        series: Option<&str>,
        dependencies: Option<Vec<Dependency>>,
    ) -> Result<&mut Self> {
        check_license(&self.meta.license)?;
        match series {
            Some(series) if !series.is_empty() => self.meta.series = Some(series.to_string()),
            _ if self.meta.series.as_deref().is_some_and(|s| !s.is_empty()) => {}
            _ => return Err(VaultError::validation("series", "series must be specified")),
        }
        let payload = self
            .payload
            .as_ref()
            .ok_or_else(|| VaultError::validation("payload", "there is nothing to save"))?;
        if let Some(dependencies) = dependencies {
            self.meta.dependencies = dependencies;
        }
        let tree = payload.encode()?;

        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| VaultError::io_with_path(e, parent))?;
        }
        let mut meta = self.meta.clone();
        meta.created_at = Some(Utc::now());
        meta.environment = Some(collect_environment());
        let size = write_container(output, &meta, &tree, &self.write_options)?;
        info!("Saved {} {} to {}", meta.model_type, meta.id, output.display());

        self.meta = meta;
        self.size = size;
        self.source = Some(output.display().to_string());
        self.state = ModelState::Saved;
        Ok(self)
    }

    /// The dependency of type `name`.
    pub fn get_dependency(&self, name: &str) -> Result<&Dependency> {
        self.meta.dependency(name)
    }

    /// Replace the dependencies.
    pub fn set_dependencies<I, D>(&mut self, dependencies: I) -> &mut Self
    where
        I: IntoIterator<Item = D>,
        D: Into<Dependency>,
    {
        self.meta.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    /// Release the container file of a lazily loaded model. Arrays not read yet
    /// fail afterwards.
    pub fn close(&mut self) {
        if let Some(container) = self.container.take() {
            container.close();
        }
    }

    /// Whether a lazily loaded container is still open.
    pub fn is_open(&self) -> bool {
        self.container.as_ref().is_some_and(|c| c.is_open())
    }
}

pub(crate) fn check_type<P: Payload>(actual: &str) -> Result<()> {
    if actual == P::NAME || P::COMPATIBLE.contains(&actual) {
        Ok(())
    } else {
        Err(VaultError::TypeMismatch {
            expected: accepted_types::<P>(),
            actual: actual.to_string(),
        })
    }
}

/// Render the metadata as pretty JSON: timestamp formatted, size humanized and
/// environment packages flattened to one line.
pub(crate) fn describe(meta: &ModelMeta, size: u64, dump: &str) -> String {
    let mut value = match serde_json::to_value(meta) {
        Ok(value) => value,
        Err(_) => return format!("{:?}", meta),
    };
    if let Value::Object(fields) = &mut value {
        fields.insert(
            "created_at".to_string(),
            meta.created_at
                .map(|dt| Value::String(format_datetime(dt)))
                .unwrap_or(Value::Null),
        );
        fields.insert("size".to_string(), Value::String(natural_size(size)));
        if let (Some(env), Some(Value::Object(env_fields))) =
            (&meta.environment, fields.get_mut("environment"))
        {
            env_fields.insert("packages".to_string(), Value::String(env.packages_line()));
        }
    }
    let text = serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string());
    if dump.is_empty() {
        text
    } else {
        format!("{}\n{}", text, dump)
    }
}

impl<P: Payload> fmt::Display for Model<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dump = self.payload.as_ref().map(Payload::dump).unwrap_or_default();
        f.write_str(&describe(&self.meta, self.size, &dump))
    }
}

impl<P> fmt::Debug for Model<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("type", &self.meta.model_type)
            .field("id", &self.meta.id)
            .field("version", &self.meta.version)
            .field("state", &self.state)
            .field("source", &self.source)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::codec::{merge_text, split_strings, squeeze_bits, MergedStrings};
    use tempfile::TempDir;

    /// Token document frequencies.
    #[derive(Debug, Clone, PartialEq)]
    pub(crate) struct DocFreq {
        pub tokens: Vec<String>,
        pub freqs: Vec<u64>,
        pub docs: u64,
    }

    impl Payload for DocFreq {
        const NAME: &'static str = "docfreq";
        const VENDOR: &'static str = "acme";
        const DESCRIPTION: &'static str = "Document frequencies.";
        const LICENSE: &'static str = "MIT";
        const NO_COMPRESSION: &'static [&'static str] = &["/tokens/"];
        const COMPATIBLE: &'static [&'static str] = &["ordered_docfreq"];

        fn encode(&self) -> Result<TreeNode> {
            Ok(TreeNode::map()
                .with("tokens", merge_text(&self.tokens).to_tree())
                .with("freqs", TreeNode::vector(squeeze_bits(&self.freqs)))
                .with("docs", TreeNode::scalar(self.docs)))
        }

        fn decode(tree: &TreeNode) -> Result<Self> {
            Ok(DocFreq {
                tokens: split_strings(&MergedStrings::from_tree(tree.get("tokens")?)?)?
                    .into_text()?,
                freqs: tree.get("freqs")?.as_array()?.data().to_u64_vec()?,
                docs: tree.get("docs")?.as_u64()?,
            })
        }

        fn dump(&self) -> String {
            format!("Number of words: {}\nNumber of documents: {}", self.tokens.len(), self.docs)
        }
    }

    pub(crate) fn docfreq() -> DocFreq {
        DocFreq {
            tokens: vec!["get".into(), "name".into(), "привет".into()],
            freqs: vec![5, 300, 1],
            docs: 1000,
        }
    }

    #[test]
    fn test_new_model_is_unsaved() {
        let model = Model::new(docfreq()).unwrap();
        assert_eq!(model.state(), ModelState::Unsaved);
        assert_eq!(model.meta().model_type, "docfreq");
        assert_eq!(model.meta().license, "MIT");
        assert!(model.meta().created_at.is_none());
        assert_eq!(model.size(), 0);
        assert!(model.source().is_none());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("docfreq.mvlt");
        let mut model = Model::new(docfreq()).unwrap();
        model.save(&path, Some("test"), None).unwrap();
        assert_eq!(model.state(), ModelState::Saved);
        assert!(model.meta().created_at.is_some());
        assert_eq!(model.size(), std::fs::metadata(&path).unwrap().len());

        let loaded = Model::<DocFreq>::load(&ModelSource::Path(path.clone()), &LoadOptions::new())
            .unwrap();
        assert_eq!(loaded.state(), ModelState::Loaded);
        assert_eq!(loaded.payload(), Some(&docfreq()));
        assert_eq!(loaded.meta().id, model.meta().id);
        assert_eq!(loaded.meta().series.as_deref(), Some("test"));
        assert_eq!(loaded.meta().created_at, model.meta().created_at);
        assert_eq!(loaded.source(), Some(path.display().to_string().as_str()));
    }

    #[test]
    fn test_save_requires_series() {
        let temp_dir = TempDir::new().unwrap();
        let mut model = Model::new(docfreq()).unwrap();
        let err = model
            .save(&temp_dir.path().join("x.mvlt"), None, None)
            .unwrap_err();
        assert!(matches!(err, VaultError::Validation { ref field, .. } if field == "series"));
        assert_eq!(model.state(), ModelState::Unsaved);

        model.set_series(Some("set before".into()));
        model
            .save(&temp_dir.path().join("x.mvlt"), None, None)
            .unwrap();
        assert_eq!(model.meta().series.as_deref(), Some("set before"));
    }

    #[test]
    fn test_save_checks_license() {
        let temp_dir = TempDir::new().unwrap();
        let mut model = Model::new(docfreq()).unwrap();
        model.set_license("Madrid".into());
        assert!(matches!(
            model.save(&temp_dir.path().join("x.mvlt"), Some("s"), None),
            Err(VaultError::InvalidLicense(_))
        ));
    }

    #[test]
    fn test_derive_before_first_save_keeps_identity() {
        let mut model = Model::new(docfreq()).unwrap();
        let id = model.id().to_string();
        model.derive(None).unwrap();
        assert_eq!(model.version(), &Version(vec![1, 0, 0]));
        assert_eq!(model.id(), id);
        assert!(model.parent().is_none());

        model.derive(Some(vec![2, 0, 0])).unwrap();
        assert_eq!(model.version(), &Version(vec![2, 0, 0]));
        assert_eq!(model.id(), id);
        assert_eq!(model.state(), ModelState::Unsaved);
    }

    #[test]
    fn test_derive_after_save() {
        let temp_dir = TempDir::new().unwrap();
        let mut model = Model::new(docfreq()).unwrap();
        model
            .save(&temp_dir.path().join("v1.mvlt"), Some("s"), None)
            .unwrap();
        let first_id = model.id().to_string();

        model.derive(None).unwrap();
        assert_eq!(model.state(), ModelState::Derived);
        assert_eq!(model.version(), &Version(vec![1, 0, 1]));
        assert_eq!(model.parent(), Some(first_id.as_str()));
        assert_ne!(model.id(), first_id);

        let second_id = model.id().to_string();
        model.derive(Some(vec![1, 1, 0])).unwrap();
        assert_eq!(model.version(), &Version(vec![1, 1, 0]));
        assert_eq!(model.parent(), Some(first_id.as_str()));
        assert_ne!(model.id(), second_id);

        model
            .save(&temp_dir.path().join("v2.mvlt"), None, None)
            .unwrap();
        let saved_id = model.id().to_string();
        model.derive(None).unwrap();
        assert_eq!(model.parent(), Some(saved_id.as_str()));
    }

    #[test]
    fn test_derive_rejects_bad_versions() {
        let mut model = Model::new(docfreq()).unwrap();
        assert!(matches!(
            model.derive(Some(vec![])),
            Err(VaultError::Validation { .. })
        ));
        assert!(matches!(
            model.derive(Some(vec![0, 9])),
            Err(VaultError::Validation { .. })
        ));
        assert_eq!(model.version(), &Version(vec![1, 0, 0]));
    }

    #[test]
    fn test_dependencies() {
        let dep = crate::metadata::generate_new_meta("id2vec", "", "", "MIT").unwrap();
        let mut model = Model::new(docfreq()).unwrap();
        model.set_dependencies([&dep]);
        assert_eq!(model.get_dependency("id2vec").unwrap().id(), dep.id);
        assert!(matches!(
            model.get_dependency("bow"),
            Err(VaultError::DependencyNotFound { .. })
        ));

        let temp_dir = TempDir::new().unwrap();
        model
            .save(&temp_dir.path().join("x.mvlt"), Some("s"), Some(Vec::new()))
            .unwrap();
        assert!(model.meta().dependencies.is_empty());
    }

    #[test]
    fn test_wrong_type() {
        #[derive(Debug)]
        struct Bow;
        impl Payload for Bow {
            const NAME: &'static str = "bow";
            const VENDOR: &'static str = "acme";
            const DESCRIPTION: &'static str = "";
            fn encode(&self) -> Result<TreeNode> {
                Ok(TreeNode::map())
            }
            fn decode(_: &TreeNode) -> Result<Self> {
                Ok(Bow)
            }
        }

        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bow.mvlt");
        Model::new(Bow)
            .unwrap()
            .save(&path, Some("s"), None)
            .unwrap();
        let err = Model::<DocFreq>::load(&ModelSource::Path(path), &LoadOptions::new())
            .unwrap_err();
        match err {
            VaultError::TypeMismatch { expected, actual } => {
                assert_eq!(expected, vec!["docfreq", "ordered_docfreq"]);
                assert_eq!(actual, "bow");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_lazy_load_and_close() {
        #[derive(Debug)]
        struct Lazy(TreeNode);
        impl Payload for Lazy {
            const NAME: &'static str = "docfreq";
            const VENDOR: &'static str = "acme";
            const DESCRIPTION: &'static str = "";
            fn encode(&self) -> Result<TreeNode> {
                Ok(self.0.clone())
            }
            fn decode(tree: &TreeNode) -> Result<Self> {
                Ok(Lazy(tree.clone()))
            }
        }

        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("docfreq.mvlt");
        Model::new(docfreq())
            .unwrap()
            .save(&path, Some("s"), None)
            .unwrap();

        let mut model =
            Model::<Lazy>::load(&ModelSource::Path(path), &LoadOptions::new().lazy(true)).unwrap();
        assert!(model.is_open());
        let freqs = model.payload().unwrap().0.get("freqs").unwrap().as_handle().unwrap().clone();
        assert!(!freqs.is_loaded());
        assert_eq!(freqs.get().unwrap().data().to_u64_vec().unwrap(), vec![5, 300, 1]);

        model.close();
        assert!(!model.is_open());
        let lengths = model.payload().unwrap().0.get("tokens").unwrap().get("lengths").unwrap();
        assert!(lengths.as_array().is_err());
    }

    #[test]
    fn test_display() {
        let temp_dir = TempDir::new().unwrap();
        let mut model = Model::new(docfreq()).unwrap();
        model
            .save(&temp_dir.path().join("x.mvlt"), Some("s"), None)
            .unwrap();
        let text = model.to_string();
        assert!(text.contains("\"model\": \"docfreq\""));
        assert!(text.contains("\"size\": \""));
        assert!(text.ends_with("Number of words: 3\nNumber of documents: 1000"));
        let created = format_datetime(model.meta().created_at.unwrap());
        assert!(text.contains(&created));
    }
}
