use super::metadata::{unix_now, ManifestMetadata, TagMapping};
use crate::error::{ProxyError, Result};
use crate::model::{is_digest, Descriptor, Manifest};
use crate::registry::{ArtifactRegistry, BlobReader};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};

static TEMP_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Content-addressable store laid out like a registry's own storage.
///
/// ```text
/// blobs/sha256/<hex>                          blob and manifest payloads
/// manifests/<repository>/sha256/<hex>.json    ManifestMetadata
/// manifests/<repository>/tags/<tag>.json      TagMapping
/// ```
///
/// Manifest payloads live in the blob area, so a sub-manifest of a list is
/// visible to `blob_exists` once it has been pushed.
pub struct FsStore {
    base_dir: PathBuf,
    blobs_dir: PathBuf,
    manifests_dir: PathBuf,
}

fn digest_hex(digest: &str) -> Result<&str> {
    let hex = digest
        .strip_prefix("sha256:")
        .ok_or_else(|| ProxyError::Cache(format!("Unsupported digest algorithm: {}", digest)))?;
    if hex.is_empty() || !hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
        return Err(ProxyError::Cache(format!("Malformed digest: {}", digest)));
    }
    Ok(hex)
}

fn check_repository(repository: &str) -> Result<()> {
    let valid = !repository.is_empty()
        && repository.split('/').all(|segment| {
            !segment.is_empty()
                && segment != "."
                && segment != ".."
                && segment
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
        });
    if valid {
        Ok(())
    } else {
        Err(ProxyError::InvalidRepository(repository.to_string()))
    }
}

fn check_tag(tag: &str) -> Result<()> {
    let valid = !tag.is_empty()
        && !tag.starts_with('.')
        && tag
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
    if valid {
        Ok(())
    } else {
        Err(ProxyError::Cache(format!("Invalid tag: {}", tag)))
    }
}

fn not_found_or(e: std::io::Error, what: String) -> ProxyError {
    if e.kind() == ErrorKind::NotFound {
        ProxyError::NotFound(what)
    } else {
        ProxyError::Cache(format!("Failed to read {}: {}", what, e))
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let sequence = TEMP_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    path.with_extension(format!("{}.{}.tmp", std::process::id(), sequence))
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| ProxyError::Cache(format!("Failed to create {}: {}", parent.display(), e)))?;
    }
    Ok(())
}

/// Atomic write: write to a temp file, then rename
async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    ensure_parent(path).await?;
    let temp = temp_path(path);
    if let Err(e) = fs::write(&temp, data).await {
        let _ = fs::remove_file(&temp).await;
        return Err(ProxyError::Cache(format!(
            "Failed to write {}: {}",
            path.display(),
            e
        )));
    }
    fs::rename(&temp, path)
        .await
        .map_err(|e| ProxyError::Cache(format!("Failed to rename {}: {}", path.display(), e)))
}

/// Copy `reader` into `file`, returning the byte count and the sha256 digest.
async fn copy_hashed<R>(reader: &mut R, file: &mut fs::File) -> std::io::Result<(u64, String)>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut hasher = Sha256::new();
    let mut written = 0u64;
    let mut buffer = vec![0u8; 8192];

    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        file.write_all(&buffer[..n]).await?;
        written += n as u64;
    }
    file.sync_all().await?;

    Ok((written, format!("sha256:{:x}", hasher.finalize())))
}

impl FsStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        let blobs_dir = base_dir.join("blobs").join("sha256");
        let manifests_dir = base_dir.join("manifests");

        std::fs::create_dir_all(&blobs_dir)
            .map_err(|e| ProxyError::Cache(format!("Failed to create blobs dir: {}", e)))?;
        std::fs::create_dir_all(&manifests_dir)
            .map_err(|e| ProxyError::Cache(format!("Failed to create manifests dir: {}", e)))?;

        Ok(Self {
            base_dir,
            blobs_dir,
            manifests_dir,
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Get blob path for a digest
    pub fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        Ok(self.blobs_dir.join(digest_hex(digest)?))
    }

    fn manifest_metadata_path(&self, repository: &str, digest: &str) -> Result<PathBuf> {
        check_repository(repository)?;
        Ok(self
            .manifests_dir
            .join(repository)
            .join("sha256")
            .join(format!("{}.json", digest_hex(digest)?)))
    }

    fn tag_path(&self, repository: &str, tag: &str) -> Result<PathBuf> {
        check_repository(repository)?;
        check_tag(tag)?;
        Ok(self
            .manifests_dir
            .join(repository)
            .join("tags")
            .join(format!("{}.json", tag)))
    }

    async fn read_tag(&self, repository: &str, tag: &str) -> Result<TagMapping> {
        let path = self.tag_path(repository, tag)?;
        let raw = fs::read(&path)
            .await
            .map_err(|e| not_found_or(e, format!("tag {}:{}", repository, tag)))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Stream `reader` into the blob area, verifying size and digest before
    /// the content becomes visible.
    async fn write_blob_stream(&self, descriptor: &Descriptor, reader: &mut BlobReader) -> Result<u64> {
        let path = self.blob_path(&descriptor.digest)?;
        ensure_parent(&path).await?;

        let temp = temp_path(&path);
        let mut file = fs::File::create(&temp)
            .await
            .map_err(|e| ProxyError::Cache(format!("Failed to create blob file: {}", e)))?;

        let (written, actual) = match copy_hashed(reader, &mut file).await {
            Ok(result) => result,
            Err(e) => {
                drop(file);
                let _ = fs::remove_file(&temp).await;
                return Err(ProxyError::Cache(format!(
                    "Failed to write blob {}: {}",
                    descriptor.digest, e
                )));
            }
        };
        drop(file);

        let verdict = if descriptor.size > 0 && written != descriptor.size {
            Err(ProxyError::SizeMismatch {
                expected: descriptor.size,
                actual: written,
            })
        } else if actual != descriptor.digest {
            Err(ProxyError::DigestMismatch {
                expected: descriptor.digest.clone(),
                actual,
            })
        } else {
            Ok(())
        };
        if let Err(e) = verdict {
            let _ = fs::remove_file(&temp).await;
            return Err(e);
        }

        fs::rename(&temp, &path)
            .await
            .map_err(|e| ProxyError::Cache(format!("Failed to rename blob: {}", e)))?;
        Ok(written)
    }
}

#[async_trait]
impl ArtifactRegistry for FsStore {
    async fn blob_exists(&self, _repository: &str, digest: &str) -> Result<bool> {
        let path = self.blob_path(digest)?;
        match fs::metadata(&path).await {
            Ok(metadata) => Ok(metadata.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ProxyError::Cache(format!(
                "Failed to stat blob {}: {}",
                digest, e
            ))),
        }
    }

    async fn pull_blob(&self, _repository: &str, digest: &str) -> Result<(u64, BlobReader)> {
        let path = self.blob_path(digest)?;
        let file = fs::File::open(&path)
            .await
            .map_err(|e| not_found_or(e, format!("blob {}", digest)))?;
        let size = file
            .metadata()
            .await
            .map_err(|e| ProxyError::Cache(format!("Failed to stat blob {}: {}", digest, e)))?
            .len();
        let reader: BlobReader = Box::pin(BufReader::new(file));
        Ok((size, reader))
    }

    async fn push_blob(
        &self,
        repository: &str,
        descriptor: &Descriptor,
        mut reader: BlobReader,
    ) -> Result<()> {
        if self.blob_exists(repository, &descriptor.digest).await? {
            tracing::debug!(digest = %descriptor.digest, "Blob already stored");
            return Ok(());
        }
        let written = self.write_blob_stream(descriptor, &mut reader).await?;
        tracing::debug!(
            repository = %repository,
            digest = %descriptor.digest,
            size = written,
            "Blob stored"
        );
        Ok(())
    }

    async fn pull_manifest(&self, repository: &str, reference: &str) -> Result<Manifest> {
        let digest = if is_digest(reference) {
            reference.to_string()
        } else {
            self.read_tag(repository, reference).await?.digest
        };

        let metadata_path = self.manifest_metadata_path(repository, &digest)?;
        let raw = fs::read(&metadata_path)
            .await
            .map_err(|e| not_found_or(e, format!("manifest {}@{}", repository, digest)))?;
        let metadata: ManifestMetadata = serde_json::from_slice(&raw)?;

        let payload = fs::read(self.blob_path(&digest)?)
            .await
            .map_err(|e| not_found_or(e, format!("manifest payload {}", digest)))?;
        Manifest::from_payload(Some(&metadata.media_type), payload)
    }

    async fn push_manifest(
        &self,
        repository: &str,
        reference: &str,
        manifest: &Manifest,
    ) -> Result<()> {
        let metadata_path = self.manifest_metadata_path(repository, manifest.digest())?;
        let tag_path = if is_digest(reference) {
            None
        } else {
            Some(self.tag_path(repository, reference)?)
        };

        let blob_path = self.blob_path(manifest.digest())?;
        if !self.blob_exists(repository, manifest.digest()).await? {
            write_atomic(&blob_path, manifest.payload()).await?;
        }

        let metadata = ManifestMetadata {
            digest: manifest.digest().to_string(),
            media_type: manifest.media_type().to_string(),
            size: manifest.payload().len() as u64,
            cached_at: unix_now(),
        };
        write_atomic(&metadata_path, &serde_json::to_vec(&metadata)?).await?;

        if let Some(tag_path) = tag_path {
            let mapping = TagMapping {
                tag: reference.to_string(),
                digest: manifest.digest().to_string(),
                updated_at: unix_now(),
            };
            write_atomic(&tag_path, &serde_json::to_vec(&mapping)?).await?;
        }

        tracing::debug!(
            repository = %repository,
            reference = %reference,
            digest = %manifest.digest(),
            "Manifest stored"
        );
        Ok(())
    }

    async fn manifest_exists(&self, repository: &str, reference: &str) -> Result<bool> {
        let path = if is_digest(reference) {
            self.manifest_metadata_path(repository, reference)?
        } else {
            self.tag_path(repository, reference)?
        };
        match fs::metadata(&path).await {
            Ok(metadata) => Ok(metadata.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ProxyError::Cache(format!(
                "Failed to stat manifest {}:{}: {}",
                repository, reference, e
            ))),
        }
    }

    async fn delete_manifest(&self, repository: &str, reference: &str) -> Result<()> {
        let path = if is_digest(reference) {
            self.manifest_metadata_path(repository, reference)?
        } else {
            self.tag_path(repository, reference)?
        };
        fs::remove_file(&path)
            .await
            .map_err(|e| not_found_or(e, format!("manifest {}:{}", repository, reference)))
    }
}
