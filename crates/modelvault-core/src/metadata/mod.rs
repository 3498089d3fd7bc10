//! Model metadata: the per-artifact record, its index summary and persistence helpers.

pub mod atomic;
pub mod environment;
mod license;
mod record;
mod summary;

pub use atomic::{atomic_read_json, atomic_write_json, atomic_write_with};
pub use environment::{collect_environment, collect_environment_without_packages, Environment};
pub use license::{check_license, is_known_license};
pub use record::{generate_new_meta, new_model_id, Dependency, ModelMeta, Version};
pub use summary::{
    extract_model_meta, format_datetime, natural_size, parse_datetime, ExtraMeta, IndexMeta,
    ModelSummary, TypeMeta,
};
