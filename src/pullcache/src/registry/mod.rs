//! Registry adapters.
//!
//! Everything the proxy reads from or writes to sits behind
//! [`ArtifactRegistry`]: upstream registries are reached over HTTP with
//! [`RegistryClient`], the local store is either the filesystem layout in
//! [`crate::cache::FsStore`] or another registry client.

pub mod auth;
pub mod client;
pub mod manager;

pub use client::RegistryClient;
pub use manager::RegistryManager;

use crate::error::Result;
use crate::model::{Descriptor, Manifest};
use async_trait::async_trait;
use std::pin::Pin;
use tokio::io::AsyncRead;

/// Byte stream of a blob body.
pub type BlobReader = Pin<Box<dyn AsyncRead + Send>>;

#[async_trait]
pub trait ArtifactRegistry: Send + Sync {
    async fn blob_exists(&self, repository: &str, digest: &str) -> Result<bool>;

    /// Open a blob for reading. Returns the declared size and the body.
    async fn pull_blob(&self, repository: &str, digest: &str) -> Result<(u64, BlobReader)>;

    /// Store a blob. The body must hash to `descriptor.digest`.
    async fn push_blob(
        &self,
        repository: &str,
        descriptor: &Descriptor,
        reader: BlobReader,
    ) -> Result<()>;

    /// Fetch a manifest by tag or digest. Absence is `ProxyError::NotFound`.
    async fn pull_manifest(&self, repository: &str, reference: &str) -> Result<Manifest>;

    /// Store `manifest` under `reference`, a tag or the manifest's own digest.
    async fn push_manifest(
        &self,
        repository: &str,
        reference: &str,
        manifest: &Manifest,
    ) -> Result<()>;

    async fn delete_manifest(&self, repository: &str, reference: &str) -> Result<()>;

    /// Whether a manifest is stored under `reference`.
    async fn manifest_exists(&self, repository: &str, reference: &str) -> Result<bool> {
        match self.pull_manifest(repository, reference).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}
