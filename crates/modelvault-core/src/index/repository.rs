//! The git-backed index of published models.
//!
//! A session fetches the working copy, mutates the in-memory document and then
//! publishes it with a single commit. Publishing pushes and compares the local
//! and remote heads afterwards: when another writer pushed in between, the heads
//! differ and [`VaultError::PublishConflict`] is returned. Nothing is merged or
//! retried; the caller fetches again and redoes the change.

use crate::config::{IndexConfig, Settings};
use crate::index::document::IndexDocument;
use crate::index::remote::RemoteSpec;
use crate::index::template::{ModelPage, PageTemplate, ReadmePage};
use crate::index::transport::IndexTransport;
use crate::metadata::IndexMeta;
use crate::{Result, VaultError};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// How to reach the index.
#[derive(Debug, Clone)]
pub struct IndexOptions {
    pub remote: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Root of the cached working copies.
    pub cache_dir: PathBuf,
    /// Append a `Signed-off-by` trailer to commits.
    pub signoff: bool,
    /// Whether the index document must already exist. Only `init` clears this.
    pub exists: bool,
}

impl IndexOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            remote: settings.index_repo.clone(),
            username: None,
            password: None,
            cache_dir: settings.cache_dir.clone(),
            signoff: settings.always_signoff,
            exists: true,
        }
    }
}

/// Where a mutating session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Fetched,
    Mutated,
    Published,
    Aborted,
}

/// The change being published; determines the commit message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexCommand {
    Reset,
    Add { model_type: String, id: String },
    Delete { model_type: String, id: String },
}

impl IndexCommand {
    pub fn message(&self) -> String {
        match self {
            IndexCommand::Reset => "Initialize a new model index".to_string(),
            IndexCommand::Add { model_type, id } => format!("Add {}/{}", model_type, id),
            IndexCommand::Delete { model_type, id } => format!("Delete {}/{}", model_type, id),
        }
    }
}

/// What [`IndexRepository::remove_model`] removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedModel {
    pub model_type: String,
    pub id: String,
}

pub struct IndexRepository {
    remote: RemoteSpec,
    cached_repo: PathBuf,
    signoff: bool,
    transport: Box<dyn IndexTransport>,
    contents: IndexDocument,
    state: SessionState,
}

impl fmt::Debug for IndexRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexRepository")
            .field("remote", &self.remote)
            .field("cached_repo", &self.cached_repo)
            .field("signoff", &self.signoff)
            .field("state", &self.state)
            .finish()
    }
}

impl IndexRepository {
    /// Validate the remote and fetch the index.
    ///
    /// A missing or unreadable `index.json` is an error unless `options.exists`
    /// is false, in which case the session starts from an empty document.
    pub fn open(options: &IndexOptions, transport: Box<dyn IndexTransport>) -> Result<Self> {
        let remote = RemoteSpec::parse(
            &options.remote,
            options.username.as_deref(),
            options.password.as_deref(),
        )?;
        let cached_repo = remote.cache_path(&options.cache_dir);
        let mut repository = Self {
            remote,
            cached_repo,
            signoff: options.signoff,
            transport,
            contents: IndexDocument::default(),
            state: SessionState::Fetched,
        };
        match repository.fetch() {
            Ok(()) => {}
            Err(e @ VaultError::IndexUnreadable { .. }) => {
                if options.exists {
                    error!("{}", e);
                    return Err(e);
                }
                debug!("Starting from an empty index: {}", e);
            }
            Err(e) => {
                error!("Failed to fetch {}: {}", repository.remote, e);
                return Err(e);
            }
        }
        Ok(repository)
    }

    /// Clone the index if it is not cached, otherwise pull when the remote moved.
    /// Then read the document.
    pub fn fetch(&mut self) -> Result<()> {
        if let Some(parent) = self.cached_repo.parent() {
            fs::create_dir_all(parent).map_err(|e| VaultError::io_with_path(e, parent))?;
        }
        if !self.cached_repo.exists() {
            warn!(
                "Index not found, caching {} in {}",
                self.remote.repo(),
                self.cached_repo.display()
            );
            self.transport
                .clone_repo(self.remote.url(), &self.cached_repo)?;
        } else {
            debug!("Index is cached in {}", self.cached_repo.display());
            if self.heads_differ()? {
                info!("Cached index is not up to date, pulling {}", self.remote.repo());
                self.transport.pull(&self.cached_repo, self.remote.url())?;
            }
        }
        self.state = SessionState::Fetched;
        self.contents = IndexDocument::load(&self.index_path())?;
        Ok(())
    }

    pub fn contents(&self) -> &IndexDocument {
        &self.contents
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn remote(&self) -> &RemoteSpec {
        &self.remote
    }

    /// Local working copy.
    pub fn cached_repo(&self) -> &Path {
        &self.cached_repo
    }

    fn index_path(&self) -> PathBuf {
        self.cached_repo.join(IndexConfig::INDEX_FILE)
    }

    fn model_page_path(&self, model_type: &str, id: &str) -> PathBuf {
        self.cached_repo.join(model_type).join(format!("{}.md", id))
    }

    fn page_link(model_type: &str, id: &str) -> String {
        format!("/{}/{}.md", model_type, id)
    }

    fn heads_differ(&self) -> Result<bool> {
        let local = self.transport.local_head(&self.cached_repo)?;
        let remote = self.transport.remote_head(self.remote.url())?;
        Ok(local != remote)
    }

    /// Insert or overwrite a model and write its page.
    ///
    /// The type's default and documentation are replaced when `update_default` is
    /// set or the type is new.
    pub fn add_model(
        &mut self,
        model_type: &str,
        id: &str,
        meta: &IndexMeta,
        template: &dyn PageTemplate,
        update_default: bool,
    ) -> Result<()> {
        if update_default || !self.contents.meta.contains_key(model_type) {
            let mut type_meta = meta.default.clone();
            type_meta.default = id.to_string();
            self.contents.meta.insert(model_type.to_string(), type_meta);
        }
        self.contents
            .models
            .entry(model_type.to_string())
            .or_default()
            .insert(id.to_string(), meta.model.clone());
        self.state = SessionState::Mutated;

        let page_path = self.model_page_path(model_type, id);
        if let Some(dir) = page_path.parent() {
            fs::create_dir_all(dir).map_err(|e| VaultError::io_with_path(e, dir))?;
        }
        let mut links = BTreeMap::new();
        for (other_type, bucket) in &self.contents.models {
            for other_id in bucket.keys() {
                if meta.model.dependencies.contains(other_id) {
                    links.insert(other_id.clone(), Self::page_link(other_type, other_id));
                }
            }
        }
        let page = template.render_model(&ModelPage {
            model_type,
            model_id: id,
            meta: &meta.model,
            links: &links,
        })?;
        if page_path.exists() {
            fs::remove_file(&page_path).map_err(|e| VaultError::io_with_path(e, &page_path))?;
        }
        fs::write(&page_path, page).map_err(|e| VaultError::io_with_path(e, &page_path))?;
        self.transport
            .add(&self.cached_repo, std::slice::from_ref(&page_path))?;
        info!("Added {}", page_path.display());
        Ok(())
    }

    /// Remove a model by ID, wherever its type.
    ///
    /// Removing the default clears it. Removing the last model of a type drops
    /// the type and its directory.
    pub fn remove_model(&mut self, id: &str) -> Result<RemovedModel> {
        let model_type = match self.contents.find_any(id) {
            Some((model_type, _)) => model_type.to_string(),
            None => {
                error!("Model {} not found, aborted.", id);
                return Err(VaultError::ModelNotFound {
                    model_id: id.to_string(),
                });
            }
        };
        info!("Found {} among {} models.", id, model_type);
        let model_dir = self.cached_repo.join(&model_type);
        let last = self
            .contents
            .models
            .get(&model_type)
            .is_some_and(|bucket| bucket.len() == 1);

        let paths = if last {
            self.contents.models.remove(&model_type);
            self.contents.meta.remove(&model_type);
            list_files(&model_dir)?
        } else {
            if let Some(type_meta) = self.contents.meta.get_mut(&model_type) {
                if type_meta.default == id {
                    info!("Model is set as default, removing from index...");
                    type_meta.default.clear();
                }
            }
            if let Some(bucket) = self.contents.models.get_mut(&model_type) {
                bucket.remove(id);
            }
            let page = self.model_page_path(&model_type, id);
            if page.exists() {
                vec![page]
            } else {
                Vec::new()
            }
        };
        self.state = SessionState::Mutated;
        self.transport.remove(&self.cached_repo, &paths)?;
        if last && model_dir.is_dir() {
            // Git leaves empty directories behind.
            if let Err(e) = fs::remove_dir_all(&model_dir) {
                warn!("Failed to remove {}: {}", model_dir.display(), e);
            }
        }
        Ok(RemovedModel {
            model_type,
            id: id.to_string(),
        })
    }

    /// Regenerate the README listing from the current document.
    pub fn update_readme(&mut self, template: &dyn PageTemplate) -> Result<()> {
        let readme = self.cached_repo.join(IndexConfig::README_FILE);
        let links: BTreeMap<String, BTreeMap<String, String>> = self
            .contents
            .models
            .iter()
            .map(|(model_type, bucket)| {
                let links = bucket
                    .keys()
                    .map(|id| (id.clone(), Self::page_link(model_type, id)))
                    .collect();
                (model_type.clone(), links)
            })
            .collect();
        let text = template.render_readme(&ReadmePage {
            models: &self.contents.models,
            meta: &self.contents.meta,
            links: &links,
        })?;
        if readme.exists() {
            fs::remove_file(&readme).map_err(|e| VaultError::io_with_path(e, &readme))?;
        }
        fs::write(&readme, text).map_err(|e| VaultError::io_with_path(e, &readme))?;
        self.transport
            .add(&self.cached_repo, std::slice::from_ref(&readme))?;
        self.state = SessionState::Mutated;
        info!("Updated {}", readme.display());
        Ok(())
    }

    /// Remove every tracked file except the version control metadata and empty
    /// the document.
    pub fn reset(&mut self) -> Result<()> {
        let mut paths = Vec::new();
        if self.cached_repo.is_dir() {
            let entries = fs::read_dir(&self.cached_repo)
                .map_err(|e| VaultError::io_with_path(e, &self.cached_repo))?;
            for entry in entries {
                let entry = entry.map_err(|e| VaultError::io_with_path(e, &self.cached_repo))?;
                if entry.file_name().to_string_lossy().starts_with(".git") {
                    continue;
                }
                let path = entry.path();
                if path.is_dir() {
                    paths.extend(list_files(&path)?);
                } else {
                    paths.push(path);
                }
            }
        }
        self.transport.remove(&self.cached_repo, &paths)?;
        self.contents = IndexDocument::default();
        self.state = SessionState::Mutated;
        Ok(())
    }

    /// Write the document, commit and push, then verify the remote head is ours.
    pub fn upload(&mut self, command: &IndexCommand) -> Result<()> {
        let result = self.publish(command);
        self.state = if result.is_ok() {
            SessionState::Published
        } else {
            SessionState::Aborted
        };
        result
    }

    fn publish(&mut self, command: &IndexCommand) -> Result<()> {
        let index = self.index_path();
        info!("Writing the new {}...", IndexConfig::INDEX_FILE);
        self.contents.save(&index)?;
        self.transport
            .add(&self.cached_repo, std::slice::from_ref(&index))?;

        let mut message = command.message();
        if self.signoff {
            match self.transport.global_identity() {
                Some((name, email)) => {
                    message.push_str(&format!("\n\nSigned-off-by: {} <{}>", name, email));
                }
                None => warn!(
                    "Did not find the global user name or email, committing without sign-off."
                ),
            }
        } else {
            info!("Committing the index without sign-off.");
        }
        self.transport.commit(&self.cached_repo, &message)?;

        info!("Pushing the updated index...");
        let pushed = self.transport.push(
            &self.cached_repo,
            self.remote.url(),
            IndexConfig::PUSH_BRANCH,
        );
        match pushed {
            Err(VaultError::PublishConflict { .. }) => {
                error!("Push has failed: the remote rejected it as out of date");
                Err(self.conflict())
            }
            Err(e) => {
                error!("Push has failed: {}", e);
                Err(e)
            }
            // Some remotes accept a stale push without updating the branch.
            Ok(()) if self.heads_differ()? => {
                error!("Push has failed: the remote head moved");
                Err(self.conflict())
            }
            Ok(()) => Ok(()),
        }
    }

    fn conflict(&self) -> VaultError {
        let local = self.transport.local_head(&self.cached_repo).ok().flatten();
        let remote = self.transport.remote_head(self.remote.url()).ok().flatten();
        VaultError::PublishConflict {
            local: local.unwrap_or_default(),
            remote: remote.unwrap_or_default(),
        }
    }
}

fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(dir).min_depth(1) {
        let entry = entry.map_err(|e| VaultError::Io {
            message: format!("Failed to list {}: {}", dir.display(), e),
            path: Some(dir.to_path_buf()),
            source: e.into_io_error(),
        })?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::template::MarkdownTemplate;
    use crate::metadata::{ModelSummary, TypeMeta};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    #[derive(Debug, Default)]
    struct Remote {
        index: Option<String>,
        head: u32,
        /// Set by a concurrent writer between fetch and push.
        moved: bool,
        messages: Vec<String>,
    }

    #[derive(Clone, Default)]
    struct FakeTransport {
        remote: Arc<Mutex<Remote>>,
        local_head: Arc<Mutex<Option<u32>>>,
        identity: Option<(String, String)>,
    }

    impl FakeTransport {
        fn checkout(&self, repo: &Path) -> Result<()> {
            let remote = self.remote.lock().unwrap();
            fs::create_dir_all(repo)?;
            if let Some(index) = &remote.index {
                fs::write(repo.join(IndexConfig::INDEX_FILE), index)?;
            }
            *self.local_head.lock().unwrap() = Some(remote.head);
            Ok(())
        }
    }

    impl IndexTransport for FakeTransport {
        fn clone_repo(&self, _remote: &str, dest: &Path) -> Result<()> {
            self.checkout(dest)
        }
        fn pull(&self, repo: &Path, _remote: &str) -> Result<()> {
            self.checkout(repo)
        }
        fn local_head(&self, _repo: &Path) -> Result<Option<String>> {
            Ok(self.local_head.lock().unwrap().map(|h| h.to_string()))
        }
        fn remote_head(&self, _remote: &str) -> Result<Option<String>> {
            Ok(Some(self.remote.lock().unwrap().head.to_string()))
        }
        fn add(&self, _repo: &Path, paths: &[PathBuf]) -> Result<()> {
            assert!(paths.iter().all(|p| p.exists()));
            Ok(())
        }
        fn remove(&self, _repo: &Path, paths: &[PathBuf]) -> Result<()> {
            for path in paths {
                fs::remove_file(path)?;
            }
            Ok(())
        }
        fn commit(&self, _repo: &Path, message: &str) -> Result<()> {
            self.remote.lock().unwrap().messages.push(message.to_string());
            let mut head = self.local_head.lock().unwrap();
            *head = Some(head.unwrap_or(0) + 100);
            Ok(())
        }
        fn push(&self, repo: &Path, _remote: &str, _branch: &str) -> Result<()> {
            let mut remote = self.remote.lock().unwrap();
            if remote.moved {
                // The concurrent writer's commit wins silently.
                remote.head += 1;
                return Ok(());
            }
            remote.index = Some(fs::read_to_string(repo.join(IndexConfig::INDEX_FILE))?);
            remote.head = self.local_head.lock().unwrap().unwrap_or(0);
            Ok(())
        }
        fn global_identity(&self) -> Option<(String, String)> {
            self.identity.clone()
        }
    }

    fn options(temp_dir: &TempDir) -> IndexOptions {
        IndexOptions {
            remote: "https://github.com/acme/models".into(),
            username: None,
            password: None,
            cache_dir: temp_dir.path().to_path_buf(),
            signoff: false,
            exists: true,
        }
    }

    fn index_meta(id: &str, dependencies: Vec<String>) -> IndexMeta {
        IndexMeta {
            default: TypeMeta {
                default: id.into(),
                code: "%s".into(),
                description: "Frequencies.".into(),
            },
            model: ModelSummary {
                url: format!("file:///store/{}.mvlt", id),
                dependencies,
                ..ModelSummary::default()
            },
        }
    }

    fn empty_remote() -> FakeTransport {
        let transport = FakeTransport::default();
        transport.remote.lock().unwrap().index = Some("{\"models\": {}, \"meta\": {}}".into());
        transport
    }

    #[test]
    fn test_missing_index() {
        let temp_dir = TempDir::new().unwrap();
        let transport = FakeTransport::default();
        let err = IndexRepository::open(&options(&temp_dir), Box::new(transport.clone()))
            .unwrap_err();
        assert!(matches!(err, VaultError::IndexUnreadable { .. }));

        let temp_dir = TempDir::new().unwrap();
        let repo = IndexRepository::open(
            &IndexOptions {
                exists: false,
                ..options(&temp_dir)
            },
            Box::new(transport),
        )
        .unwrap();
        assert!(repo.contents().is_empty());
        assert_eq!(
            repo.cached_repo(),
            temp_dir.path().join("acme").join("models")
        );
    }

    #[test]
    fn test_add_keeps_first_default() {
        let temp_dir = TempDir::new().unwrap();
        let mut repo =
            IndexRepository::open(&options(&temp_dir), Box::new(empty_remote())).unwrap();
        repo.add_model("docfreq", "id1", &index_meta("id1", vec![]), &MarkdownTemplate, true)
            .unwrap();
        repo.add_model(
            "docfreq",
            "id2",
            &index_meta("id2", vec!["id1".into()]),
            &MarkdownTemplate,
            false,
        )
        .unwrap();
        assert_eq!(repo.state(), SessionState::Mutated);
        assert_eq!(repo.contents().default_id("docfreq"), Some("id1"));
        assert!(repo.contents().find("docfreq", "id1").is_some());
        assert!(repo.contents().find("docfreq", "id2").is_some());

        let page = fs::read_to_string(repo.cached_repo().join("docfreq").join("id2.md")).unwrap();
        assert!(page.contains("[id1](/docfreq/id1.md)"));

        repo.add_model("docfreq", "id3", &index_meta("id3", vec![]), &MarkdownTemplate, true)
            .unwrap();
        assert_eq!(repo.contents().default_id("docfreq"), Some("id3"));
    }

    #[test]
    fn test_remove_default_and_last() {
        let temp_dir = TempDir::new().unwrap();
        let mut repo =
            IndexRepository::open(&options(&temp_dir), Box::new(empty_remote())).unwrap();
        for id in ["id1", "id2"] {
            repo.add_model("docfreq", id, &index_meta(id, vec![]), &MarkdownTemplate, false)
                .unwrap();
        }
        assert_eq!(repo.contents().default_id("docfreq"), Some("id1"));

        let removed = repo.remove_model("id1").unwrap();
        assert_eq!(
            removed,
            RemovedModel {
                model_type: "docfreq".into(),
                id: "id1".into()
            }
        );
        assert_eq!(repo.contents().default_id("docfreq"), None);
        assert!(repo.contents().meta.contains_key("docfreq"));
        assert!(!repo.cached_repo().join("docfreq").join("id1.md").exists());

        repo.remove_model("id2").unwrap();
        assert!(!repo.contents().models.contains_key("docfreq"));
        assert!(!repo.contents().meta.contains_key("docfreq"));
        assert!(!repo.cached_repo().join("docfreq").exists());

        assert!(matches!(
            repo.remove_model("id2"),
            Err(VaultError::ModelNotFound { .. })
        ));
    }

    #[test]
    fn test_upload_and_refetch() {
        let temp_dir = TempDir::new().unwrap();
        let transport = empty_remote();
        let mut repo = IndexRepository::open(
            &IndexOptions {
                signoff: true,
                ..options(&temp_dir)
            },
            Box::new(FakeTransport {
                identity: Some(("Jane".into(), "jane@example.com".into())),
                ..transport.clone()
            }),
        )
        .unwrap();
        repo.add_model("docfreq", "id1", &index_meta("id1", vec![]), &MarkdownTemplate, true)
            .unwrap();
        repo.update_readme(&MarkdownTemplate).unwrap();
        repo.upload(&IndexCommand::Add {
            model_type: "docfreq".into(),
            id: "id1".into(),
        })
        .unwrap();
        assert_eq!(repo.state(), SessionState::Published);
        assert!(repo.cached_repo().join("README.md").exists());

        let messages = transport.remote.lock().unwrap().messages.clone();
        assert_eq!(
            messages,
            vec!["Add docfreq/id1\n\nSigned-off-by: Jane <jane@example.com>".to_string()]
        );

        let temp_dir = TempDir::new().unwrap();
        let other = IndexRepository::open(&options(&temp_dir), Box::new(transport)).unwrap();
        assert_eq!(other.contents().default_id("docfreq"), Some("id1"));
    }

    #[test]
    fn test_publish_conflict() {
        let temp_dir = TempDir::new().unwrap();
        let transport = empty_remote();
        let mut repo =
            IndexRepository::open(&options(&temp_dir), Box::new(transport.clone())).unwrap();
        repo.add_model("docfreq", "id1", &index_meta("id1", vec![]), &MarkdownTemplate, true)
            .unwrap();
        transport.remote.lock().unwrap().moved = true;
        let err = repo
            .upload(&IndexCommand::Add {
                model_type: "docfreq".into(),
                id: "id1".into(),
            })
            .unwrap_err();
        assert!(matches!(err, VaultError::PublishConflict { .. }));
        assert_eq!(repo.state(), SessionState::Aborted);
    }

    #[test]
    fn test_stale_cache_is_pulled() {
        let temp_dir = TempDir::new().unwrap();
        let transport = empty_remote();
        IndexRepository::open(&options(&temp_dir), Box::new(transport.clone())).unwrap();
        {
            let mut remote = transport.remote.lock().unwrap();
            remote.index = Some(
                "{\"models\": {\"bow\": {\"x\": {}}}, \"meta\": {\"bow\": {\"default\": \"x\"}}}"
                    .into(),
            );
            remote.head = 7;
        }
        let repo = IndexRepository::open(&options(&temp_dir), Box::new(transport)).unwrap();
        assert_eq!(repo.contents().default_id("bow"), Some("x"));
    }

    #[test]
    fn test_reset() {
        let temp_dir = TempDir::new().unwrap();
        let mut repo =
            IndexRepository::open(&options(&temp_dir), Box::new(empty_remote())).unwrap();
        repo.add_model("docfreq", "id1", &index_meta("id1", vec![]), &MarkdownTemplate, true)
            .unwrap();
        fs::create_dir_all(repo.cached_repo().join(".git")).unwrap();
        fs::write(repo.cached_repo().join(".git").join("HEAD"), "ref").unwrap();
        repo.reset().unwrap();
        assert!(repo.contents().is_empty());
        assert!(!repo.cached_repo().join("docfreq").join("id1.md").exists());
        assert!(!repo.cached_repo().join(IndexConfig::INDEX_FILE).exists());
        assert!(repo.cached_repo().join(".git").join("HEAD").exists());
    }
}
