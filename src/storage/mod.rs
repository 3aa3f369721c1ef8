//! Storage: relational rows, append-only completion analytics, blob files

pub mod blob;
pub mod completions;
pub mod relational;
pub mod schema;

pub use blob::{FileStorage, LocalFileStorage};
pub use completions::{CachedCompletion, CompletionStore};
pub use relational::{
    AnnotationFilter, Deployment, ExperimentCompletion, RelationalStorage, View, ViewFolder,
};
