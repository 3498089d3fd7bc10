//! The model index: a git repository holding `index.json` plus Markdown pages.

mod document;
mod remote;
mod repository;
mod template;
mod transport;

pub use document::IndexDocument;
pub use remote::RemoteSpec;
pub use repository::{IndexCommand, IndexOptions, IndexRepository, RemovedModel, SessionState};
pub use template::{
    FileTemplate, MarkdownTemplate, ModelPage, PageTemplate, PlaceholderTemplate, ReadmePage,
};
pub use transport::{classify_git_error, GitCliTransport, IndexTransport};
