use super::inflight::{inflight_key, InflightTracker};
use crate::cache::FsStore;
use crate::config::LocalStoreConfig;
use crate::error::{ProxyError, Result};
use crate::model::{is_digest, Descriptor, Manifest, DEFAULT_TAG};
use crate::registry::{ArtifactRegistry, BlobReader, RegistryClient};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::futures::Notified;
use tokio::sync::{Notify, OnceCell};

/// The local store proxied content is replicated into.
///
/// The backing adapter is created lazily from [`LocalStoreConfig`] the
/// first time it is needed.
pub struct LocalCache {
    config: Option<LocalStoreConfig>,
    store: OnceCell<Arc<dyn ArtifactRegistry>>,
    inflight: Arc<InflightTracker>,
    blob_landed: Notify,
    list_grace: Duration,
}

impl LocalCache {
    pub fn new(config: LocalStoreConfig, list_grace: Duration) -> Self {
        Self {
            config: Some(config),
            store: OnceCell::new(),
            inflight: Arc::new(InflightTracker::new()),
            blob_landed: Notify::new(),
            list_grace,
        }
    }

    /// Wrap an already constructed store.
    pub fn with_store(store: Arc<dyn ArtifactRegistry>, list_grace: Duration) -> Self {
        Self {
            config: None,
            store: OnceCell::new_with(Some(store)),
            inflight: Arc::new(InflightTracker::new()),
            blob_landed: Notify::new(),
            list_grace,
        }
    }

    pub fn inflight(&self) -> &Arc<InflightTracker> {
        &self.inflight
    }

    async fn store(&self) -> Result<&Arc<dyn ArtifactRegistry>> {
        self.store
            .get_or_try_init(|| async {
                let store: Arc<dyn ArtifactRegistry> = match &self.config {
                    Some(LocalStoreConfig::Filesystem { directory }) => {
                        tracing::info!(directory = %directory, "Using filesystem local store");
                        Arc::new(FsStore::new(directory)?)
                    }
                    Some(LocalStoreConfig::Registry {
                        url,
                        secret,
                        insecure,
                    }) => {
                        tracing::info!(url = %url, "Using registry local store");
                        Arc::new(RegistryClient::with_secret(url, secret, *insecure)?)
                    }
                    None => {
                        return Err(ProxyError::Config(
                            "local store is not configured".to_string(),
                        ))
                    }
                };
                Ok::<_, ProxyError>(store)
            })
            .await
    }

    /// Create the backing store if that has not happened yet.
    pub async fn ensure_ready(&self) -> Result<()> {
        self.store().await.map(|_| ())
    }

    /// Resolves the next time a blob or manifest push to this store completes.
    ///
    /// Call `enable` on the pinned future before checking state, so a push
    /// landing in between is not missed.
    pub fn blob_landed(&self) -> Notified<'_> {
        self.blob_landed.notified()
    }

    pub async fn blob_exist(&self, repository: &str, digest: &str) -> Result<bool> {
        self.store().await?.blob_exists(repository, digest).await
    }

    /// Whether a manifest is stored under `reference` in `repository`.
    pub async fn manifest_exist(&self, repository: &str, reference: &str) -> Result<bool> {
        self.store().await?.manifest_exists(repository, reference).await
    }

    pub async fn open_blob(&self, repository: &str, digest: &str) -> Result<(u64, BlobReader)> {
        self.store().await?.pull_blob(repository, digest).await
    }

    pub async fn manifest(&self, repository: &str, reference: &str) -> Result<Manifest> {
        self.store().await?.pull_manifest(repository, reference).await
    }

    pub async fn push_blob(
        &self,
        repository: &str,
        descriptor: &Descriptor,
        reader: BlobReader,
    ) -> Result<()> {
        self.store()
            .await?
            .push_blob(repository, descriptor, reader)
            .await?;
        self.blob_landed.notify_waiters();
        Ok(())
    }

    /// Push a manifest under `tag`, skipping silently if the same
    /// `repository:tag` push is already running.
    pub async fn push_manifest(&self, repository: &str, tag: &str, manifest: &Manifest) -> Result<()> {
        let tag = if tag.is_empty() { DEFAULT_TAG } else { tag };
        let key = inflight_key(repository, tag);
        let Some(_guard) = self.inflight.guard(key.as_str()) else {
            tracing::debug!(key = %key, "Manifest push already in flight, skipping");
            return Ok(());
        };

        self.store()
            .await?
            .push_manifest(repository, tag, manifest)
            .await?;
        tracing::info!(repository = %repository, tag = %tag, digest = %manifest.digest(), "Manifest cached locally");
        self.blob_landed.notify_waiters();
        Ok(())
    }

    /// Wait out the grace period, then push the list trimmed to the
    /// sub-manifests already present locally.
    ///
    /// Nothing is pushed when no sub-manifest is present yet. A list
    /// referenced by digest is only pushed whole, since trimming changes
    /// its digest.
    pub async fn push_manifest_list(
        &self,
        repository: &str,
        reference: &str,
        manifest: &Manifest,
    ) -> Result<()> {
        tokio::time::sleep(self.list_grace).await;

        let mut present = Vec::with_capacity(manifest.references().len());
        for child in manifest.references() {
            match self.manifest_exist(repository, &child.digest).await {
                Ok(exists) => present.push(exists),
                Err(e) => {
                    tracing::debug!(digest = %child.digest, error = %e, "Sub-manifest check failed");
                    present.push(false);
                }
            }
        }

        let mut children = present.into_iter();
        let trimmed = manifest.retain_children(|_| children.next().unwrap_or(false))?;
        match trimmed {
            Some(trimmed) if is_digest(reference) && trimmed.digest() != manifest.digest() => {
                tracing::warn!(
                    repository = %repository,
                    digest = %reference,
                    kept = trimmed.references().len(),
                    total = manifest.references().len(),
                    "Manifest list pulled by digest is incomplete locally, not pushing it"
                );
                Ok(())
            }
            Some(trimmed) => {
                tracing::debug!(
                    repository = %repository,
                    kept = trimmed.references().len(),
                    total = manifest.references().len(),
                    "Pushing trimmed manifest list"
                );
                self.push_manifest(repository, reference, &trimmed).await
            }
            None => {
                tracing::warn!(
                    repository = %repository,
                    reference = %reference,
                    "No sub-manifest of the list is cached locally, not pushing it"
                );
                Ok(())
            }
        }
    }

    /// Descriptors referenced by `manifest` that are not present locally.
    /// A failed probe counts as missing.
    pub async fn check_dependencies(&self, repository: &str, manifest: &Manifest) -> Vec<Descriptor> {
        let mut missing = Vec::new();
        for descriptor in manifest.references() {
            match self.blob_exist(repository, &descriptor.digest).await {
                Ok(true) => {}
                Ok(false) => missing.push(descriptor.clone()),
                Err(e) => {
                    tracing::debug!(digest = %descriptor.digest, error = %e, "Dependency check failed");
                    missing.push(descriptor.clone());
                }
            }
        }
        missing
    }

    /// Best-effort removal of a tag that vanished upstream.
    pub async fn cleanup_tag(&self, repository: &str, tag: &str) {
        let result = match self.store().await {
            Ok(store) => store.delete_manifest(repository, tag).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => tracing::info!(repository = %repository, tag = %tag, "Removed tag missing upstream"),
            Err(e) => tracing::debug!(repository = %repository, tag = %tag, error = %e, "Tag cleanup failed"),
        }
    }
}
