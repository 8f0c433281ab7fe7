use crate::error::{ProxyError, Result};
use crate::model::Manifest;
use crate::registry::{ArtifactRegistry, BlobReader, RegistryManager};
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Read access to the upstream registry bound to a project.
///
/// The adapter is resolved from the registry manager on first use.
pub struct RemoteSource {
    registry_id: String,
    manager: Arc<RegistryManager>,
    adapter: OnceCell<Arc<dyn ArtifactRegistry>>,
}

impl RemoteSource {
    pub fn new(manager: Arc<RegistryManager>, registry_id: impl Into<String>) -> Self {
        Self {
            registry_id: registry_id.into(),
            manager,
            adapter: OnceCell::new(),
        }
    }

    pub fn registry_id(&self) -> &str {
        &self.registry_id
    }

    async fn adapter(&self) -> Result<&Arc<dyn ArtifactRegistry>> {
        self.adapter
            .get_or_try_init(|| async { self.manager.get(&self.registry_id) })
            .await
    }

    pub async fn blob_reader(&self, repository: &str, digest: &str) -> Result<(u64, BlobReader)> {
        self.adapter().await?.pull_blob(repository, digest).await
    }

    /// Fetch a manifest by digest and check the payload hashes to it.
    pub async fn manifest_by_digest(&self, repository: &str, digest: &str) -> Result<Manifest> {
        let manifest = self.adapter().await?.pull_manifest(repository, digest).await?;
        if manifest.digest() != digest {
            return Err(ProxyError::DigestMismatch {
                expected: digest.to_string(),
                actual: manifest.digest().to_string(),
            });
        }
        Ok(manifest)
    }

    pub async fn manifest_by_tag(&self, repository: &str, tag: &str) -> Result<Manifest> {
        self.adapter().await?.pull_manifest(repository, tag).await
    }
}
