//! Shared fixtures: an in-memory index remote and two payload types.

#![allow(dead_code)]

use modelvault_core::codec::{
    assemble_sparse_matrix, disassemble_sparse_matrix, merge_text, split_strings, squeeze_bits,
    MergedStrings, SparseMatrix, TreeNode,
};
use modelvault_core::config::IndexConfig;
use modelvault_core::index::{classify_git_error, IndexOptions, IndexRepository, IndexTransport};
use modelvault_core::{Model, Payload, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub const REMOTE: &str = "https://example.com/acme/models";

/// State of the shared remote.
#[derive(Debug, Default)]
pub struct RemoteState {
    pub index: Option<String>,
    pub head: u64,
    pub commits: u64,
    pub messages: Vec<String>,
}

#[derive(Debug, Default)]
struct Checkout {
    /// Remote head the working copy was last synced with.
    base: u64,
    head: Option<u64>,
    /// Messages of commits not pushed yet.
    pending: Vec<String>,
}

/// A transport over an in-memory remote.
///
/// A push from a working copy that is behind the remote is rejected with the
/// stderr git prints for a non-fast-forward push.
#[derive(Debug, Clone, Default)]
pub struct FakeTransport {
    pub remote: Arc<Mutex<RemoteState>>,
    checkout: Arc<Mutex<Checkout>>,
}

impl FakeTransport {
    /// Another client of the same remote.
    pub fn client(&self) -> Self {
        Self {
            remote: Arc::clone(&self.remote),
            checkout: Arc::default(),
        }
    }

    pub fn remote_index(&self) -> Option<String> {
        self.remote.lock().unwrap().index.clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.remote.lock().unwrap().messages.clone()
    }

    fn sync(&self, repo: &Path) -> Result<()> {
        let remote = self.remote.lock().unwrap();
        fs::create_dir_all(repo)?;
        if let Some(index) = &remote.index {
            fs::write(repo.join(IndexConfig::INDEX_FILE), index)?;
        }
        let mut checkout = self.checkout.lock().unwrap();
        checkout.base = remote.head;
        checkout.head = Some(remote.head);
        checkout.pending.clear();
        Ok(())
    }
}

impl IndexTransport for FakeTransport {
    fn clone_repo(&self, _remote: &str, dest: &Path) -> Result<()> {
        self.sync(dest)
    }

    fn pull(&self, repo: &Path, _remote: &str) -> Result<()> {
        self.sync(repo)
    }

    fn local_head(&self, _repo: &Path) -> Result<Option<String>> {
        Ok(self.checkout.lock().unwrap().head.map(|head| head.to_string()))
    }

    fn remote_head(&self, _remote: &str) -> Result<Option<String>> {
        Ok(Some(self.remote.lock().unwrap().head.to_string()))
    }

    fn add(&self, _repo: &Path, _paths: &[PathBuf]) -> Result<()> {
        Ok(())
    }

    fn remove(&self, _repo: &Path, paths: &[PathBuf]) -> Result<()> {
        for path in paths {
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    fn commit(&self, _repo: &Path, message: &str) -> Result<()> {
        let mut remote = self.remote.lock().unwrap();
        remote.commits += 1;
        let mut checkout = self.checkout.lock().unwrap();
        checkout.head = Some(remote.commits * 1000);
        checkout.pending.push(message.to_string());
        Ok(())
    }

    fn push(&self, repo: &Path, url: &str, branch: &str) -> Result<()> {
        let mut remote = self.remote.lock().unwrap();
        let mut checkout = self.checkout.lock().unwrap();
        if remote.head != checkout.base {
            return Err(classify_git_error(
                "push",
                url,
                &format!(
                    " ! [rejected]        HEAD -> {} (fetch first)\nerror: failed to push some refs to '{}'",
                    branch, url
                ),
            ));
        }
        remote.index = Some(fs::read_to_string(repo.join(IndexConfig::INDEX_FILE))?);
        remote.head = checkout.head.unwrap_or_default();
        remote.messages.append(&mut checkout.pending);
        checkout.base = remote.head;
        Ok(())
    }

    fn global_identity(&self) -> Option<(String, String)> {
        Some(("Jane Doe".to_string(), "jane@example.com".to_string()))
    }
}

pub fn index_options(cache: &Path, exists: bool) -> IndexOptions {
    IndexOptions {
        remote: REMOTE.to_string(),
        username: None,
        password: None,
        cache_dir: cache.to_path_buf(),
        signoff: false,
        exists,
    }
}

pub fn open_index(cache: &Path, transport: &FakeTransport) -> IndexRepository {
    IndexRepository::open(&index_options(cache, true), Box::new(transport.clone())).unwrap()
}

/// Token document frequencies.
#[derive(Debug, Clone, PartialEq)]
pub struct DocFreq {
    pub tokens: Vec<String>,
    pub freqs: Vec<u64>,
    pub docs: u64,
}

impl Payload for DocFreq {
    const NAME: &'static str = "docfreq";
    const VENDOR: &'static str = "acme";
    const DESCRIPTION: &'static str = "Document frequencies of identifiers.";
    const LICENSE: &'static str = "MIT";
    const NO_COMPRESSION: &'static [&'static str] = &["/tokens/"];

    fn encode(&self) -> Result<TreeNode> {
        Ok(TreeNode::map()
            .with("tokens", merge_text(&self.tokens).to_tree())
            .with("freqs", TreeNode::vector(squeeze_bits(&self.freqs)))
            .with("docs", TreeNode::scalar(self.docs)))
    }

    fn decode(tree: &TreeNode) -> Result<Self> {
        Ok(DocFreq {
            tokens: split_strings(&MergedStrings::from_tree(tree.get("tokens")?)?)?.into_text()?,
            freqs: tree.get("freqs")?.as_array()?.data().to_u64_vec()?,
            docs: tree.get("docs")?.as_u64()?,
        })
    }

    fn dump(&self) -> String {
        format!(
            "Number of words: {}\nNumber of documents: {}",
            self.tokens.len(),
            self.docs
        )
    }
}

pub fn docfreq() -> DocFreq {
    DocFreq {
        tokens: vec!["get".into(), "name".into(), "value".into()],
        freqs: vec![12, 400, 7],
        docs: 1000,
    }
}

/// Bag of words: a sparse document-token matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct Bow {
    pub documents: Vec<String>,
    pub matrix: SparseMatrix,
}

impl Payload for Bow {
    const NAME: &'static str = "bow";
    const VENDOR: &'static str = "acme";
    const DESCRIPTION: &'static str = "Bag of words.";

    fn encode(&self) -> Result<TreeNode> {
        Ok(TreeNode::map()
            .with("documents", merge_text(&self.documents).to_tree())
            .with("matrix", disassemble_sparse_matrix(&self.matrix)?))
    }

    fn decode(tree: &TreeNode) -> Result<Self> {
        Ok(Bow {
            documents: split_strings(&MergedStrings::from_tree(tree.get("documents")?)?)?
                .into_text()?,
            matrix: assemble_sparse_matrix(tree.get("matrix")?)?,
        })
    }
}

/// Save a fresh docfreq model and return it with its file.
pub fn saved_docfreq(dir: &TempDir, name: &str) -> (Model<DocFreq>, PathBuf) {
    let path = dir.path().join(format!("{}.mvlt", name));
    let mut model = Model::new(docfreq()).unwrap();
    model.save(&path, Some("test"), None).unwrap();
    (model, path)
}
