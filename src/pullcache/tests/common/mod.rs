//! Shared fixtures: an in-memory registry adapter and an HTTP mock registry.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use pullcache::config::ProxyTimings;
use pullcache::model::{compute_digest, Descriptor, Manifest, Project};
use pullcache::{
    ArtifactRegistry, BlobReader, LocalCache, ProxyController, ProxyError, RegistryManager, Result,
};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;

pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub fn descriptor_for(data: &[u8], media_type: &str) -> Descriptor {
    Descriptor::new(compute_digest(data), data.len() as u64).with_media_type(media_type)
}

pub fn image_manifest(config: &Descriptor, layers: &[Descriptor]) -> Manifest {
    let payload = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": config,
        "layers": layers,
    });
    Manifest::from_payload(None, serde_json::to_vec(&payload).unwrap()).unwrap()
}

pub fn manifest_list(children: &[(&Manifest, &str)]) -> Manifest {
    let entries: Vec<serde_json::Value> = children
        .iter()
        .map(|(child, arch)| {
            serde_json::json!({
                "mediaType": child.media_type(),
                "digest": child.digest(),
                "size": child.payload().len(),
                "platform": {"architecture": arch, "os": "linux"},
            })
        })
        .collect();
    let payload = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.index.v1+json",
        "manifests": entries,
    });
    Manifest::from_payload(None, serde_json::to_vec(&payload).unwrap()).unwrap()
}

/// Blobs and manifests of a small single-platform image.
pub struct TestImage {
    pub config: (Descriptor, Vec<u8>),
    pub layer: (Descriptor, Vec<u8>),
    pub manifest: Manifest,
}

impl TestImage {
    pub fn new(seed: &str) -> Self {
        let config_data = format!("{{\"architecture\":\"amd64\",\"seed\":\"{}\"}}", seed).into_bytes();
        let layer_data = format!("layer bytes for {}", seed).repeat(64).into_bytes();
        let config = descriptor_for(&config_data, "application/vnd.oci.image.config.v1+json");
        let layer = descriptor_for(&layer_data, "application/vnd.oci.image.layer.v1.tar+gzip");
        let manifest = image_manifest(&config, std::slice::from_ref(&layer));
        Self {
            config: (config, config_data),
            layer: (layer, layer_data),
            manifest,
        }
    }

    pub fn blobs(&self) -> [(&Descriptor, &[u8]); 2] {
        [
            (&self.config.0, self.config.1.as_slice()),
            (&self.layer.0, self.layer.1.as_slice()),
        ]
    }
}

/// In-memory registry adapter with failure injection and an event log.
#[derive(Default)]
pub struct MemoryRegistry {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    manifests: Mutex<HashMap<(String, String), Manifest>>,
    failing_probes: Mutex<HashSet<String>>,
    declared_sizes: Mutex<HashMap<String, u64>>,
    events: Mutex<Vec<String>>,
    blob_pulls: AtomicUsize,
}

impl MemoryRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert_blob(&self, data: &[u8]) -> String {
        let digest = compute_digest(data);
        self.blobs.lock().unwrap().insert(digest.clone(), data.to_vec());
        digest
    }

    pub fn insert_image_blobs(&self, image: &TestImage) {
        for (_, data) in image.blobs() {
            self.insert_blob(data);
        }
    }

    /// Store `manifest` under `reference` and under its digest.
    pub fn insert_manifest(&self, repository: &str, reference: &str, manifest: &Manifest) {
        let mut manifests = self.manifests.lock().unwrap();
        manifests.insert((repository.to_string(), reference.to_string()), manifest.clone());
        manifests.insert(
            (repository.to_string(), manifest.digest().to_string()),
            manifest.clone(),
        );
        self.blobs
            .lock()
            .unwrap()
            .insert(manifest.digest().to_string(), manifest.payload().to_vec());
    }

    /// Make existence probes for `digest` fail.
    pub fn fail_probe(&self, digest: &str) {
        self.failing_probes.lock().unwrap().insert(digest.to_string());
    }

    /// Announce `size` for `digest` regardless of the stored content.
    pub fn declare_size(&self, digest: &str, size: u64) {
        self.declared_sizes.lock().unwrap().insert(digest.to_string(), size);
    }

    pub fn has_blob(&self, digest: &str) -> bool {
        self.blobs.lock().unwrap().contains_key(digest)
    }

    pub fn blob(&self, digest: &str) -> Option<Vec<u8>> {
        self.blobs.lock().unwrap().get(digest).cloned()
    }

    pub fn manifest(&self, repository: &str, reference: &str) -> Option<Manifest> {
        self.manifests
            .lock()
            .unwrap()
            .get(&(repository.to_string(), reference.to_string()))
            .cloned()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn blob_pulls(&self) -> usize {
        self.blob_pulls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactRegistry for MemoryRegistry {
    async fn blob_exists(&self, _repository: &str, digest: &str) -> Result<bool> {
        if self.failing_probes.lock().unwrap().contains(digest) {
            return Err(ProxyError::Registry(format!("probe for {} failed", digest)));
        }
        Ok(self.has_blob(digest))
    }

    async fn pull_blob(&self, _repository: &str, digest: &str) -> Result<(u64, BlobReader)> {
        self.blob_pulls.fetch_add(1, Ordering::SeqCst);
        let data = self
            .blob(digest)
            .ok_or_else(|| ProxyError::NotFound(format!("blob {}", digest)))?;
        let size = self
            .declared_sizes
            .lock()
            .unwrap()
            .get(digest)
            .copied()
            .unwrap_or(data.len() as u64);
        Ok((size, Box::pin(std::io::Cursor::new(data))))
    }

    async fn push_blob(
        &self,
        _repository: &str,
        descriptor: &Descriptor,
        mut reader: BlobReader,
    ) -> Result<()> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await?;
        let actual = compute_digest(&data);
        if actual != descriptor.digest {
            return Err(ProxyError::DigestMismatch {
                expected: descriptor.digest.clone(),
                actual,
            });
        }
        self.blobs.lock().unwrap().insert(actual, data);
        self.events
            .lock()
            .unwrap()
            .push(format!("blob:{}", descriptor.digest));
        Ok(())
    }

    async fn pull_manifest(&self, repository: &str, reference: &str) -> Result<Manifest> {
        self.manifest(repository, reference)
            .ok_or_else(|| ProxyError::NotFound(format!("manifest {}:{}", repository, reference)))
    }

    async fn push_manifest(
        &self,
        repository: &str,
        reference: &str,
        manifest: &Manifest,
    ) -> Result<()> {
        self.insert_manifest(repository, reference, manifest);
        self.events
            .lock()
            .unwrap()
            .push(format!("manifest:{}", reference));
        Ok(())
    }

    async fn delete_manifest(&self, repository: &str, reference: &str) -> Result<()> {
        let removed = self
            .manifests
            .lock()
            .unwrap()
            .remove(&(repository.to_string(), reference.to_string()));
        self.events
            .lock()
            .unwrap()
            .push(format!("delete:{}", reference));
        removed
            .map(|_| ())
            .ok_or_else(|| ProxyError::NotFound(format!("manifest {}:{}", repository, reference)))
    }
}

/// Controller wired to in-memory upstream and local stores.
pub struct Harness {
    pub upstream: Arc<MemoryRegistry>,
    pub store: Arc<MemoryRegistry>,
    pub local: Arc<LocalCache>,
    pub controller: ProxyController,
    pub project: Project,
}

pub const UPSTREAM_ID: &str = "upstream";

pub fn test_timings() -> ProxyTimings {
    ProxyTimings {
        poll_interval: Duration::from_secs(20),
        poll_attempts: 10,
        manifest_list_grace: Duration::from_secs(900),
    }
}

pub fn harness(timings: ProxyTimings) -> Harness {
    let upstream = MemoryRegistry::new();
    let store = MemoryRegistry::new();
    let registries = Arc::new(RegistryManager::new(HashMap::new()));
    registries.register(UPSTREAM_ID, upstream.clone());
    let local = Arc::new(LocalCache::with_store(store.clone(), timings.manifest_list_grace));
    let controller = ProxyController::new(local.clone(), registries, timings);
    Harness {
        upstream,
        store,
        local,
        controller,
        project: Project::new("proxy", Some(UPSTREAM_ID.to_string())),
    }
}

pub const MOCK_TOKEN: &str = "mock-token";

#[derive(Default)]
struct MockState {
    require_token: bool,
    realm: Mutex<String>,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    manifests: Mutex<HashMap<(String, String), (String, Vec<u8>)>>,
    requests: Mutex<Vec<String>>,
    token_requests: AtomicUsize,
    next_upload: AtomicUsize,
}

/// A registry speaking just enough of the distribution API over HTTP.
pub struct MockRegistry {
    pub addr: SocketAddr,
    state: Arc<MockState>,
}

impl MockRegistry {
    pub async fn start(require_token: bool) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock registry");
        let addr = listener.local_addr().unwrap();

        let state = Arc::new(MockState {
            require_token,
            ..Default::default()
        });
        *state.realm.lock().unwrap() = format!("http://{}/token", addr);

        let app = Router::new()
            .route("/token", get(mock_token))
            .fallback(mock_registry)
            .with_state(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn add_blob(&self, data: &[u8]) -> String {
        let digest = compute_digest(data);
        self.state
            .blobs
            .lock()
            .unwrap()
            .insert(digest.clone(), data.to_vec());
        digest
    }

    pub fn add_image(&self, repository: &str, tag: &str, image: &TestImage) {
        for (_, data) in image.blobs() {
            self.add_blob(data);
        }
        self.add_manifest(repository, tag, &image.manifest);
    }

    pub fn add_manifest(&self, repository: &str, reference: &str, manifest: &Manifest) {
        let entry = (
            manifest.media_type().to_string(),
            manifest.payload().to_vec(),
        );
        let mut manifests = self.state.manifests.lock().unwrap();
        manifests.insert((repository.to_string(), reference.to_string()), entry.clone());
        manifests.insert((repository.to_string(), manifest.digest().to_string()), entry);
    }

    pub fn has_blob(&self, digest: &str) -> bool {
        self.state.blobs.lock().unwrap().contains_key(digest)
    }

    pub fn manifest(&self, repository: &str, reference: &str) -> Option<Vec<u8>> {
        self.state
            .manifests
            .lock()
            .unwrap()
            .get(&(repository.to_string(), reference.to_string()))
            .map(|(_, payload)| payload.clone())
    }

    /// Number of requests whose "METHOD path" line contains `needle`.
    pub fn requests_matching(&self, needle: &str) -> usize {
        self.state
            .requests
            .lock()
            .unwrap()
            .iter()
            .filter(|line| line.contains(needle))
            .count()
    }

    pub fn token_requests(&self) -> usize {
        self.state.token_requests.load(Ordering::SeqCst)
    }
}

/// Start a server that answers every request with 503.
pub async fn start_unavailable_mirror() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind unavailable mirror");
    let addr = listener.local_addr().unwrap();
    let app = Router::new().fallback(|| async { StatusCode::SERVICE_UNAVAILABLE });
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn mock_token(State(state): State<Arc<MockState>>) -> impl IntoResponse {
    state.token_requests.fetch_add(1, Ordering::SeqCst);
    Json(serde_json::json!({ "token": MOCK_TOKEN, "expires_in": 300 }))
}

fn unauthorized(state: &MockState, repository: &str) -> Response {
    let challenge = format!(
        "Bearer realm=\"{}\",service=\"mock\",scope=\"repository:{}:pull,push\"",
        state.realm.lock().unwrap(),
        repository
    );
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, challenge)],
    )
        .into_response()
}

fn query_digest(uri: &Uri) -> Option<String> {
    uri.query()?
        .split('&')
        .find_map(|pair| pair.strip_prefix("digest="))
        .map(|digest| digest.replace("%3A", ":"))
}

async fn mock_registry(
    State(state): State<Arc<MockState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();
    state
        .requests
        .lock()
        .unwrap()
        .push(format!("{} {}", method, path));

    let Some(rest) = path.strip_prefix("/v2/") else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let repository = rest
        .rfind("/manifests/")
        .or_else(|| rest.rfind("/blobs/"))
        .map(|idx| rest[..idx].to_string())
        .unwrap_or_default();

    if state.require_token {
        let authorized = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == format!("Bearer {}", MOCK_TOKEN));
        if !authorized {
            return unauthorized(&state, &repository);
        }
    }

    if let Some(idx) = rest.rfind("/manifests/") {
        let reference = rest[idx + "/manifests/".len()..].to_string();
        let key = (repository.clone(), reference.clone());
        return match method {
            Method::GET | Method::HEAD => match state.manifests.lock().unwrap().get(&key) {
                Some((media_type, payload)) => (
                    StatusCode::OK,
                    [
                        (header::CONTENT_TYPE, media_type.clone()),
                        (
                            header::HeaderName::from_static("docker-content-digest"),
                            compute_digest(payload),
                        ),
                    ],
                    payload.clone(),
                )
                    .into_response(),
                None => StatusCode::NOT_FOUND.into_response(),
            },
            Method::PUT => {
                let media_type = headers
                    .get(header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                let entry = (media_type, body.to_vec());
                let mut manifests = state.manifests.lock().unwrap();
                manifests.insert(key, entry.clone());
                manifests.insert((repository, compute_digest(&body)), entry);
                StatusCode::CREATED.into_response()
            }
            Method::DELETE => {
                let mut manifests = state.manifests.lock().unwrap();
                let before = manifests.len();
                manifests.retain(|(repo, _), (_, payload)| {
                    repo != &repository || compute_digest(payload) != reference
                });
                if manifests.len() == before {
                    StatusCode::NOT_FOUND.into_response()
                } else {
                    StatusCode::ACCEPTED.into_response()
                }
            }
            _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
        };
    }

    if let Some(idx) = rest.rfind("/blobs/uploads/") {
        let repository = rest[..idx].to_string();
        return match method {
            Method::POST => {
                let id = state.next_upload.fetch_add(1, Ordering::SeqCst);
                let location = format!("/v2/{}/blobs/uploads/{}", repository, id);
                (StatusCode::ACCEPTED, [(header::LOCATION, location)]).into_response()
            }
            Method::PUT => {
                let Some(digest) = query_digest(&uri) else {
                    return StatusCode::BAD_REQUEST.into_response();
                };
                if compute_digest(&body) != digest {
                    return StatusCode::BAD_REQUEST.into_response();
                }
                state.blobs.lock().unwrap().insert(digest, body.to_vec());
                StatusCode::CREATED.into_response()
            }
            _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
        };
    }

    if let Some(idx) = rest.rfind("/blobs/") {
        let digest = &rest[idx + "/blobs/".len()..];
        return match state.blobs.lock().unwrap().get(digest) {
            Some(data) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/octet-stream".to_string())],
                data.clone(),
            )
                .into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        };
    }

    StatusCode::NOT_FOUND.into_response()
}
