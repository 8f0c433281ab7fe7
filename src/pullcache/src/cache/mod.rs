//! Filesystem-backed local store.

pub mod metadata;
pub mod storage;

pub use metadata::{ManifestMetadata, TagMapping};
pub use storage::FsStore;
