//! DStore Metadata Store - durable file metadata
//!
//! One JSON record per stored file, written with a temp-file + rename so a
//! crash never leaves a torn record behind.

pub mod store;
pub mod types;

// Re-exports
pub use store::{MetaStore, MetaStoreError, MetaStoreResult};
pub use types::{FileRecord, RECORD_VERSION};
