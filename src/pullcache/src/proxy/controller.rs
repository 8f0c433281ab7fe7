use super::local::LocalCache;
use super::remote::RemoteSource;
use crate::config::ProxyTimings;
use crate::error::{ProxyError, Result};
use crate::model::{ArtifactInfo, Descriptor, Manifest, Project};
use crate::registry::RegistryManager;
use crate::sink::{ResponseHead, ResponseSink};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::task::TaskTracker;

/// Serves artifacts from upstream while replicating them into the local store.
///
/// Client-facing work happens on the request path; replication runs as
/// background tasks tracked by the controller.
pub struct ProxyController {
    local: Arc<LocalCache>,
    registries: Arc<RegistryManager>,
    timings: ProxyTimings,
    tasks: TaskTracker,
}

/// Everything a background replication task needs, detached from the request.
#[derive(Clone)]
struct Replicator {
    local: Arc<LocalCache>,
    remote: Arc<RemoteSource>,
    timings: ProxyTimings,
}

impl ProxyController {
    pub fn new(local: Arc<LocalCache>, registries: Arc<RegistryManager>, timings: ProxyTimings) -> Self {
        Self {
            local,
            registries,
            timings,
            tasks: TaskTracker::new(),
        }
    }

    pub fn local(&self) -> &Arc<LocalCache> {
        &self.local
    }

    pub fn registries(&self) -> &Arc<RegistryManager> {
        &self.registries
    }

    /// Finish construction: the local store is created at most once.
    pub async fn ensure_ready(&self) -> Result<()> {
        self.local.ensure_ready().await
    }

    /// Wait until every background task started so far has finished.
    pub async fn wait_background(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    pub fn remote_for(&self, project: &Project) -> Result<Arc<RemoteSource>> {
        let registry_id = project.registry_id.as_deref().ok_or_else(|| {
            ProxyError::Config(format!("project {} has no upstream registry", project.name))
        })?;
        Ok(Arc::new(RemoteSource::new(self.registries.clone(), registry_id)))
    }

    /// Whether the request can be answered from the local store alone.
    ///
    /// True when the artifact names a digest already present locally.
    /// Tag-only requests always go upstream so tags stay current. A failed
    /// probe answers false.
    pub async fn use_local(&self, art: &ArtifactInfo) -> bool {
        let Some(digest) = art.digest.as_deref() else {
            return false;
        };
        match self.local.blob_exist(&art.repository, digest).await {
            Ok(exists) => exists,
            Err(e) => {
                tracing::error!(repository = %art.repository, digest = %digest, error = %e, "Failed to check blob existence locally");
                false
            }
        }
    }

    /// Stream a blob from upstream into `sink`, then replicate it in the background.
    pub async fn proxy_blob<S>(&self, project: &Project, art: &ArtifactInfo, sink: &mut S) -> Result<()>
    where
        S: ResponseSink + ?Sized,
    {
        let digest = art
            .digest
            .clone()
            .ok_or_else(|| ProxyError::InvalidRepository(format!("{}: blob without digest", art.repository)))?;
        let remote_repo = art.remote_repository().to_string();
        let remote = self.remote_for(project)?;

        tracing::debug!(repository = %remote_repo, digest = %digest, "The blob doesn't exist locally, proxy the request to the upstream registry");

        let (size, reader) = remote.blob_reader(&remote_repo, &digest).await?;
        sink.set_head(ResponseHead {
            content_length: size,
            content_type: None,
            digest: digest.clone(),
        });

        let mut limited = reader.take(size);
        let written = tokio::io::copy(&mut limited, sink).await?;
        if written != size {
            return Err(ProxyError::SizeMismatch {
                expected: size,
                actual: written,
            });
        }

        let replicator = self.replicator(remote);
        let local_repo = art.repository.clone();
        self.tasks.spawn(async move {
            let descriptor = Descriptor::new(digest, size);
            if let Err(e) = replicator
                .put_blob_to_local(&remote_repo, &local_repo, &descriptor)
                .await
            {
                tracing::error!(repository = %local_repo, digest = %descriptor.digest, error = %e, "Error while pushing blob to local repo");
            }
        });
        Ok(())
    }

    /// Fetch a manifest from upstream into `sink`, then replicate it in the
    /// background once its dependencies are in the local store.
    pub async fn proxy_manifest<S>(&self, project: &Project, art: &ArtifactInfo, sink: &mut S) -> Result<()>
    where
        S: ResponseSink + ?Sized,
    {
        let remote_repo = art.remote_repository().to_string();
        let local_repo = art.repository.clone();
        let remote = self.remote_for(project)?;

        let pulled = match &art.digest {
            Some(digest) => remote.manifest_by_digest(&remote_repo, digest).await,
            None => remote.manifest_by_tag(&remote_repo, art.tag_or_default()).await,
        };
        let manifest = match pulled {
            Ok(manifest) => manifest,
            Err(e) if e.is_not_found() => {
                if let Some(tag) = art.tag.clone() {
                    let local = self.local.clone();
                    self.tasks.spawn(async move {
                        local.cleanup_tag(&local_repo, &tag).await;
                    });
                }
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        sink.set_head(ResponseHead {
            content_length: manifest.payload().len() as u64,
            content_type: Some(manifest.media_type().to_string()),
            digest: manifest.digest().to_string(),
        });
        sink.write_all(manifest.payload()).await?;
        sink.flush().await?;

        // Pulled by digest: replicate under the digest so no tag is overwritten.
        let reference = art
            .tag
            .clone()
            .unwrap_or_else(|| manifest.digest().to_string());
        let replicator = self.replicator(remote);
        self.tasks.spawn(async move {
            replicator
                .wait_and_push_manifest(&remote_repo, &local_repo, &reference, manifest)
                .await;
        });
        Ok(())
    }

    fn replicator(&self, remote: Arc<RemoteSource>) -> Replicator {
        Replicator {
            local: self.local.clone(),
            remote,
            timings: self.timings,
        }
    }
}

impl Replicator {
    async fn put_blob_to_local(&self, remote_repo: &str, local_repo: &str, descriptor: &Descriptor) -> Result<()> {
        let (size, reader) = self.remote.blob_reader(remote_repo, &descriptor.digest).await?;
        let mut descriptor = descriptor.clone();
        if descriptor.size == 0 {
            descriptor.size = size;
        }
        self.local.push_blob(local_repo, &descriptor, reader).await?;
        tracing::debug!(repository = %local_repo, digest = %descriptor.digest, "Blob pushed to local repo");
        Ok(())
    }

    async fn wait_and_push_manifest(&self, remote_repo: &str, local_repo: &str, reference: &str, manifest: Manifest) {
        if manifest.is_list() {
            if let Err(e) = self.local.push_manifest_list(local_repo, reference, &manifest).await {
                tracing::error!(repository = %local_repo, reference = %reference, error = %e, "Error when pushing manifest list to local");
            }
            return;
        }

        let missing = self.wait_for_dependencies(local_repo, &manifest).await;
        if !missing.is_empty() {
            tracing::debug!(repository = %local_repo, count = missing.len(), "Dependencies still missing, pushing them to local repo");
            for descriptor in &missing {
                if let Err(e) = self.put_blob_to_local(remote_repo, local_repo, descriptor).await {
                    tracing::error!(
                        repository = %local_repo,
                        digest = %descriptor.digest,
                        error = %e,
                        "Failed to push dependency, manifest not cached"
                    );
                    return;
                }
            }
        }

        if let Err(e) = self.local.push_manifest(local_repo, reference, &manifest).await {
            tracing::error!(repository = %local_repo, reference = %reference, error = %e, "Error when pushing manifest to local");
        }
    }

    /// Re-check dependencies on every interval tick, and whenever a push lands
    /// locally, until none is missing or the attempts run out.
    ///
    /// Returns whatever is still missing.
    async fn wait_for_dependencies(&self, repository: &str, manifest: &Manifest) -> Vec<Descriptor> {
        let landed = self.local.blob_landed();
        tokio::pin!(landed);
        landed.as_mut().enable();

        let mut missing = self.local.check_dependencies(repository, manifest).await;
        if missing.is_empty() {
            return missing;
        }

        let period = self.timings.poll_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        let mut attempts = 0;

        while attempts < self.timings.poll_attempts {
            tokio::select! {
                _ = ticker.tick() => attempts += 1,
                _ = &mut landed => {}
            }
            landed.set(self.local.blob_landed());
            landed.as_mut().enable();

            missing = self.local.check_dependencies(repository, manifest).await;
            if missing.is_empty() {
                break;
            }
            tracing::debug!(
                repository = %repository,
                attempt = attempts,
                remaining = missing.len(),
                "Waiting for dependencies of manifest {}",
                manifest.digest()
            );
        }
        missing
    }
}
