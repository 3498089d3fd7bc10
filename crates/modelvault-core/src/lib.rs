//! ModelVault Core - Headless library for versioned model artifacts.
//!
//! Models are binary containers holding a metadata header and a tree of typed
//! arrays. Published models live in a storage backend; a git repository holding
//! `index.json` records where they are, which one is the default of each type and
//! how they depend on each other.
//!
//! # Example
//!
//! ```rust,ignore
//! use modelvault_core::config::{ConfigSource, Settings};
//! use modelvault_core::index::{GitCliTransport, IndexOptions, IndexRepository};
//! use modelvault_core::Vault;
//!
//! fn main() -> modelvault_core::Result<()> {
//!     let settings = Settings::load(&[ConfigSource::Env])?;
//!     let index = IndexRepository::open(
//!         &IndexOptions::from_settings(&settings),
//!         Box::new(GitCliTransport::new()),
//!     )?;
//!     for listing in Vault::new(index).list() {
//!         print!("{}", listing);
//!     }
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod codec;
pub mod config;
pub mod error;
pub mod index;
pub mod metadata;
pub mod model;
pub mod network;
pub mod vault;

pub use backend::{BackendRegistry, StorageBackend};
pub use config::Settings;
pub use error::{Result, VaultError};
pub use index::{IndexDocument, IndexRepository};
pub use metadata::{generate_new_meta, ModelMeta};
pub use model::{GenericModel, Model, ModelRegistry, ModelSource, ModelState, Payload};
pub use vault::{dump_model, PublishOptions, PublishedModel, Vault};
