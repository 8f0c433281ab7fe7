//! Value types for content-addressed registry artifacts.
//!
//! A [`Manifest`] keeps the exact bytes it was pulled with, so its digest is
//! stable and the payload can be replayed to clients and to the local store
//! unchanged.

use crate::error::{ProxyError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const MEDIA_TYPE_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

const KNOWN_MANIFEST_MEDIA_TYPES: [&str; 4] = [
    MEDIA_TYPE_MANIFEST_LIST,
    MEDIA_TYPE_OCI_INDEX,
    MEDIA_TYPE_MANIFEST_V2,
    MEDIA_TYPE_OCI_MANIFEST,
];

/// Tag used when a request names neither a tag nor a digest.
pub const DEFAULT_TAG: &str = "latest";

/// Compute the `sha256:<hex>` digest of a byte slice
pub fn compute_digest(data: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(data))
}

/// Tags never contain ':', digests always do (`algorithm:hex`).
pub fn is_digest(reference: &str) -> bool {
    reference.contains(':')
}

/// A proxied repository needs at least two segments after the project
/// namespace (`proxy/library/hello-world`, never `proxy/hello-world`).
pub fn valid_proxy_repository(repository: &str) -> bool {
    repository.matches('/').count() > 1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// Content-addressed pointer to a blob or a sub-manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    #[serde(default)]
    pub media_type: String,
    pub digest: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl Descriptor {
    pub fn new(digest: impl Into<String>, size: u64) -> Self {
        Self {
            media_type: String::new(),
            digest: digest.into(),
            size,
            platform: None,
        }
    }

    pub fn with_media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = media_type.into();
        self
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestDocument {
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    config: Option<Descriptor>,
    #[serde(default)]
    layers: Vec<Descriptor>,
    #[serde(default)]
    manifests: Vec<Descriptor>,
}

/// An image manifest or a manifest list, immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    media_type: String,
    payload: Bytes,
    digest: String,
    references: Vec<Descriptor>,
}

impl Manifest {
    /// Parse a manifest payload.
    ///
    /// `media_type_hint` is usually the `Content-Type` the payload was served
    /// with; it wins when it names a manifest type, otherwise the payload's own
    /// `mediaType` field is used.
    pub fn from_payload(media_type_hint: Option<&str>, payload: impl Into<Bytes>) -> Result<Self> {
        let payload = payload.into();
        let document: ManifestDocument = serde_json::from_slice(&payload)?;

        let declared = document.media_type.filter(|m| !m.is_empty());
        let media_type = match media_type_hint.map(normalize_media_type) {
            Some(hint) if KNOWN_MANIFEST_MEDIA_TYPES.iter().any(|m| *m == hint) => hint.to_string(),
            _ => declared.unwrap_or_else(|| {
                if document.manifests.is_empty() {
                    MEDIA_TYPE_OCI_MANIFEST.to_string()
                } else {
                    MEDIA_TYPE_OCI_INDEX.to_string()
                }
            }),
        };

        let references = if is_list_media_type(&media_type) {
            document.manifests
        } else {
            document.config.into_iter().chain(document.layers).collect()
        };

        Ok(Self {
            digest: compute_digest(&payload),
            media_type,
            payload,
            references,
        })
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Config and layers of an image manifest, sub-manifests of a list.
    pub fn references(&self) -> &[Descriptor] {
        &self.references
    }

    pub fn is_list(&self) -> bool {
        is_list_media_type(&self.media_type)
    }

    /// Keep only the sub-manifests accepted by `keep`, in their original order.
    ///
    /// Returns `None` when nothing would be left. Non-list manifests are
    /// returned unchanged.
    pub fn retain_children<F>(&self, mut keep: F) -> Result<Option<Manifest>>
    where
        F: FnMut(&Descriptor) -> bool,
    {
        if !self.is_list() {
            return Ok(Some(self.clone()));
        }

        let mut document: serde_json::Value = serde_json::from_slice(&self.payload)?;
        let entries = document
            .get_mut("manifests")
            .and_then(|v| v.as_array_mut())
            .ok_or_else(|| {
                ProxyError::Registry("Manifest list missing manifests array".to_string())
            })?;

        let mut retained = Vec::with_capacity(entries.len());
        for entry in entries.drain(..) {
            let descriptor: Descriptor = serde_json::from_value(entry.clone())?;
            if keep(&descriptor) {
                retained.push(entry);
            }
        }
        if retained.is_empty() {
            return Ok(None);
        }
        if retained.len() == self.references.len() {
            return Ok(Some(self.clone()));
        }
        *entries = retained;

        let payload = serde_json::to_vec_pretty(&document)?;
        Manifest::from_payload(Some(&self.media_type), payload).map(Some)
    }
}

fn normalize_media_type(content_type: &str) -> &str {
    content_type.split(';').next().unwrap_or("").trim()
}

fn is_list_media_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_MANIFEST_LIST || media_type == MEDIA_TYPE_OCI_INDEX
}

/// Identity of a requested artifact as resolved by the HTTP layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactInfo {
    pub project_name: String,
    /// Project-qualified repository, e.g. `proxy/library/hello-world`
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ArtifactInfo {
    pub fn new(project_name: impl Into<String>, repository: impl Into<String>) -> Self {
        Self {
            project_name: project_name.into(),
            repository: repository.into(),
            tag: None,
            digest: None,
        }
    }

    /// Build from a URL reference, which is either a tag or a digest.
    pub fn with_reference(self, reference: &str) -> Self {
        if is_digest(reference) {
            self.with_digest(reference)
        } else {
            self.with_tag(reference)
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into()).filter(|t: &String| !t.is_empty());
        self
    }

    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.digest = Some(digest.into()).filter(|d: &String| !d.is_empty());
        self
    }

    /// Repository name on the upstream registry: the project prefix stripped.
    pub fn remote_repository(&self) -> &str {
        self.repository
            .strip_prefix(&self.project_name)
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|rest| !rest.is_empty())
            .unwrap_or(self.repository.as_str())
    }

    /// Digest if known, otherwise the tag, otherwise `latest`.
    pub fn reference(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }

    pub fn tag_or_default(&self) -> &str {
        self.tag.as_deref().unwrap_or(DEFAULT_TAG)
    }
}

/// A repository namespace bound to an upstream registry connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub name: String,
    pub registry_id: Option<String>,
}

impl Project {
    pub fn new(name: impl Into<String>, registry_id: Option<String>) -> Self {
        Self {
            name: name.into(),
            registry_id,
        }
    }
}
