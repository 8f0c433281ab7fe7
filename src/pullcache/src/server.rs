use crate::config::{Config, ProjectConfig};
use crate::error::{ProxyError, Result};
use crate::model::{valid_proxy_repository, ArtifactInfo, Project};
use crate::proxy::{LocalCache, ProxyController};
use crate::registry::RegistryManager;
use crate::sink::{BufferSink, ChannelSink, ResponseHead};
use axum::{
    body::Body,
    extract::State,
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;
use tracing::error;

/// Bytes buffered between the upstream copy and the client connection
const BODY_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    controller: Arc<ProxyController>,
    projects: Arc<HashMap<String, ProjectConfig>>,
}

impl AppState {
    pub fn new(controller: Arc<ProxyController>, projects: HashMap<String, ProjectConfig>) -> Self {
        Self {
            controller,
            projects: Arc::new(projects),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let timings = config.proxy.timings();
        let registries = Arc::new(RegistryManager::new(config.upstream.registries.clone()));
        let local = Arc::new(LocalCache::new(config.local.clone(), timings.manifest_list_grace));
        let controller = Arc::new(ProxyController::new(local, registries, timings));
        Self::new(controller, config.projects.clone())
    }

    pub fn controller(&self) -> &Arc<ProxyController> {
        &self.controller
    }

    fn project(&self, name: &str) -> Option<Project> {
        self.projects
            .get(name)
            .map(|project| Project::new(name, project.registry.clone()))
    }

    /// A project without a reachable upstream is served from the local store only.
    fn can_proxy(&self, project: &Project) -> bool {
        project
            .registry_id
            .as_deref()
            .is_some_and(|id| self.controller.registries().is_ready(id))
    }
}

/// Registry API error in the distribution JSON format.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn from_proxy(err: ProxyError, not_found_code: &'static str) -> Self {
        let (status, code) = match &err {
            ProxyError::NotFound(_) => (StatusCode::NOT_FOUND, not_found_code),
            ProxyError::InvalidRepository(_) => (StatusCode::BAD_REQUEST, "NAME_INVALID"),
            ProxyError::Upstream(_)
            | ProxyError::Http(_)
            | ProxyError::DigestMismatch { .. }
            | ProxyError::SizeMismatch { .. } => (StatusCode::BAD_GATEWAY, "UNKNOWN"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "UNKNOWN"),
        };
        Self::new(status, code, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "errors": [{ "code": self.code, "message": self.message }]
        });
        (self.status, Json(body)).into_response()
    }
}

enum V2Request {
    Manifest { name: String, reference: String },
    Blob { name: String, digest: String },
}

// Axum's :name only matches single segments, so repository names are parsed manually
fn parse_v2_path(path: &str) -> Option<V2Request> {
    const V2_PREFIX: &str = "/v2/";
    const MANIFESTS_SUFFIX: &str = "/manifests/";
    const BLOBS_SUFFIX: &str = "/blobs/";

    let rest = path.strip_prefix(V2_PREFIX)?;
    if let Some(idx) = rest.rfind(MANIFESTS_SUFFIX) {
        let name = &rest[..idx];
        let reference = &rest[idx + MANIFESTS_SUFFIX.len()..];
        if name.is_empty() || reference.is_empty() {
            return None;
        }
        Some(V2Request::Manifest {
            name: name.to_string(),
            reference: reference.to_string(),
        })
    } else if let Some(idx) = rest.rfind(BLOBS_SUFFIX) {
        let name = &rest[..idx];
        let digest = &rest[idx + BLOBS_SUFFIX.len()..];
        if name.is_empty() || digest.is_empty() {
            return None;
        }
        Some(V2Request::Blob {
            name: name.to_string(),
            digest: digest.to_string(),
        })
    } else {
        None
    }
}

fn with_head(head: &ResponseHead, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.headers_mut() = head.headers();
    response
}

/// Resolve the project from the first path segment and build the artifact.
fn resolve(state: &AppState, name: &str, reference: &str) -> std::result::Result<(Project, ArtifactInfo), ApiError> {
    let project_name = name.split('/').next().unwrap_or_default();
    let project = state.project(project_name).ok_or_else(|| {
        ApiError::new(
            StatusCode::NOT_FOUND,
            "NAME_UNKNOWN",
            format!("project {} not found", project_name),
        )
    })?;
    let art = ArtifactInfo::new(project_name, name).with_reference(reference);
    Ok((project, art))
}

fn require_proxy_path(art: &ArtifactInfo) -> std::result::Result<(), ApiError> {
    if valid_proxy_repository(&art.repository) {
        Ok(())
    } else {
        Err(ApiError::new(
            StatusCode::NOT_FOUND,
            "NAME_UNKNOWN",
            format!("repository {} not found", art.repository),
        ))
    }
}

async fn manifest_response(
    state: &AppState,
    name: &str,
    reference: &str,
    head_only: bool,
) -> std::result::Result<Response, ApiError> {
    let (project, art) = resolve(state, name, reference)?;
    let controller = state.controller();
    let not_found = |e: ProxyError| ApiError::from_proxy(e, "MANIFEST_UNKNOWN");

    if !state.can_proxy(&project) || controller.use_local(&art).await {
        let manifest = controller
            .local()
            .manifest(&art.repository, art.reference())
            .await
            .map_err(not_found)?;
        let head = ResponseHead {
            content_length: manifest.payload().len() as u64,
            content_type: Some(manifest.media_type().to_string()),
            digest: manifest.digest().to_string(),
        };
        let body = if head_only {
            Body::empty()
        } else {
            Body::from(manifest.payload().clone())
        };
        return Ok(with_head(&head, body));
    }

    require_proxy_path(&art)?;
    tracing::debug!(repository = %art.repository, reference = %art.reference(), "Proxying manifest request");

    let mut sink = BufferSink::new();
    controller
        .proxy_manifest(&project, &art, &mut sink)
        .await
        .map_err(not_found)?;
    let (head, payload) = sink.into_parts();
    let head = head.ok_or_else(|| {
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "UNKNOWN", "manifest response without head")
    })?;
    let body = if head_only { Body::empty() } else { Body::from(payload) };
    Ok(with_head(&head, body))
}

async fn blob_response(
    state: &AppState,
    name: &str,
    digest: &str,
    head_only: bool,
) -> std::result::Result<Response, ApiError> {
    let (project, art) = resolve(state, name, digest)?;
    let controller = state.controller().clone();
    let not_found = |e: ProxyError| ApiError::from_proxy(e, "BLOB_UNKNOWN");

    if art.digest.is_none() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "DIGEST_INVALID",
            format!("invalid digest {}", digest),
        ));
    }

    if !state.can_proxy(&project) || controller.use_local(&art).await {
        let (size, reader) = controller
            .local()
            .open_blob(&art.repository, digest)
            .await
            .map_err(not_found)?;
        let head = ResponseHead {
            content_length: size,
            content_type: Some("application/octet-stream".to_string()),
            digest: digest.to_string(),
        };
        let body = if head_only {
            Body::empty()
        } else {
            Body::from_stream(ReaderStream::new(reader))
        };
        return Ok(with_head(&head, body));
    }

    if head_only {
        let remote = controller.remote_for(&project).map_err(not_found)?;
        let (size, _reader) = remote
            .blob_reader(art.remote_repository(), digest)
            .await
            .map_err(not_found)?;
        let head = ResponseHead {
            content_length: size,
            content_type: None,
            digest: digest.to_string(),
        };
        return Ok(with_head(&head, Body::empty()));
    }

    let (mut sink, head_rx, body) = ChannelSink::new(BODY_BUFFER_SIZE);
    let task = tokio::spawn(async move {
        let result = controller.proxy_blob(&project, &art, &mut sink).await;
        if let Err(e) = &result {
            tracing::warn!(repository = %art.repository, error = %e, "Blob proxy failed");
        }
        result
    });

    match head_rx.await {
        Ok(head) => Ok(with_head(&head, Body::from_stream(ReaderStream::new(body)))),
        Err(_) => match task.await {
            Ok(Err(e)) => Err(not_found(e)),
            Ok(Ok(())) => Err(ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "UNKNOWN",
                "blob response without head",
            )),
            Err(e) => Err(ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "UNKNOWN",
                format!("blob proxy task failed: {}", e),
            )),
        },
    }
}

async fn handle_v2(state: AppState, uri: Uri, head_only: bool) -> Response {
    let path = uri.path();
    tracing::debug!(path = %path, head_only, "Received v2 request");

    let result = match parse_v2_path(path) {
        Some(V2Request::Manifest { name, reference }) => {
            manifest_response(&state, &name, &reference, head_only).await
        }
        Some(V2Request::Blob { name, digest }) => blob_response(&state, &name, &digest, head_only).await,
        None => return (StatusCode::BAD_REQUEST, "Invalid v2 path").into_response(),
    };
    result.unwrap_or_else(IntoResponse::into_response)
}

async fn get_v2_wrapper(State(state): State<AppState>, uri: Uri) -> Response {
    handle_v2(state, uri, false).await
}

async fn head_v2_wrapper(State(state): State<AppState>, uri: Uri) -> Response {
    handle_v2(state, uri, true).await
}

async fn api_version() -> impl IntoResponse {
    tracing::debug!("GET /v2/ - API version request");
    (StatusCode::OK, "{}")
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v2/", get(api_version))
        .route("/v2/*path", get(get_v2_wrapper).head(head_v2_wrapper))
        .with_state(state)
}

/// Bind the listener and serve in a background task.
///
/// Returns the bound address (useful with port 0) and the server task.
pub async fn start_server(config: Config) -> Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    config.validate()?;
    let state = AppState::from_config(&config);
    state.controller().ensure_ready().await?;

    let addr = format!("{}:{}", config.server.bind_address, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| ProxyError::Config(format!("Failed to bind listener to {}: {}", addr, e)))?;
    let local_addr = listener.local_addr()?;

    tracing::info!(
        address = %local_addr,
        projects = config.projects.len(),
        registries = config.upstream.registries.len(),
        "Starting pull-through cache"
    );

    let app = build_router(state);
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error after startup: {}", e);
        } else {
            tracing::info!("HTTP server stopped");
        }
    });

    Ok((local_addr, handle))
}
