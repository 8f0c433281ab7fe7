use super::auth::{BearerChallenge, TokenCache};
use super::{ArtifactRegistry, BlobReader};
use crate::config::{RegistryAuth, RegistryConfig, DEFAULT_MANIFEST_ACCEPT_HEADER};
use crate::error::{ProxyError, Result};
use crate::model::{is_digest, Descriptor, Manifest};
use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::header::{
    HeaderMap, ACCEPT, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, LOCATION, WWW_AUTHENTICATE,
};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::io::{ReaderStream, StreamReader};

const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";

enum Credential {
    Anonymous,
    Basic(RegistryAuth),
    /// Shared secret of the local registry, sent as a bearer token as is
    Secret(String),
}

#[derive(Clone)]
enum Authorization {
    Basic(RegistryAuth),
    Bearer(String),
}

impl Authorization {
    fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            Authorization::Basic(auth) => request.basic_auth(&auth.username, Some(&auth.password)),
            Authorization::Bearer(token) => {
                request.header(AUTHORIZATION, format!("Bearer {}", token))
            }
        }
    }
}

/// A response together with the mirror and the credentials that produced it.
struct Exchange {
    response: Response,
    base: String,
    authorization: Option<Authorization>,
}

/// HTTP client for a registry speaking the distribution API, with multi-mirror support
pub struct RegistryClient {
    client: Client,
    mirrors: Vec<String>,
    credential: Credential,
    tokens: Arc<TokenCache>,
}

fn build_http_client(timeout_secs: u64, insecure: bool) -> Result<Client> {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(insecure)
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90))
        .timeout(Duration::from_secs(timeout_secs))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(ProxyError::Http)
}

fn send_error(what: &str, response: &Response) -> ProxyError {
    if response.status() == StatusCode::NOT_FOUND {
        ProxyError::NotFound(what.to_string())
    } else {
        ProxyError::Registry(format!("{} failed with status {}", what, response.status()))
    }
}

fn check_status(response: Response, what: &str) -> Result<Response> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(send_error(what, &response))
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: impl reqwest::header::AsHeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Upload locations may be absolute or relative to the mirror.
fn resolve_location(base: &str, location: &str) -> String {
    if location.starts_with("http://") || location.starts_with("https://") {
        location.to_string()
    } else {
        format!("{}/{}", base, location.trim_start_matches('/'))
    }
}

impl RegistryClient {
    pub fn new(config: &RegistryConfig, tokens: Arc<TokenCache>) -> Result<Self> {
        config.validate().map_err(ProxyError::Config)?;
        let credential = match &config.auth {
            Some(auth) => Credential::Basic(auth.clone()),
            None => Credential::Anonymous,
        };
        Ok(Self {
            client: build_http_client(config.timeout_secs, config.insecure)?,
            mirrors: config.mirrors.clone(),
            credential,
            tokens,
        })
    }

    /// Client for a registry that accepts a static shared secret.
    pub fn with_secret(url: &str, secret: &str, insecure: bool) -> Result<Self> {
        Ok(Self {
            client: build_http_client(600, insecure)?,
            mirrors: vec![url.to_string()],
            credential: Credential::Secret(secret.to_string()),
            tokens: Arc::new(TokenCache::new()),
        })
    }

    pub fn mirrors(&self) -> &[String] {
        &self.mirrors
    }

    fn initial_authorization(&self) -> Option<Authorization> {
        match &self.credential {
            Credential::Anonymous => None,
            Credential::Basic(auth) => Some(Authorization::Basic(auth.clone())),
            Credential::Secret(secret) => Some(Authorization::Bearer(secret.clone())),
        }
    }

    async fn bearer_token(&self, response: &Response, repository: &str) -> Option<String> {
        if matches!(self.credential, Credential::Secret(_)) {
            return None;
        }
        let challenge = BearerChallenge::parse(header_str(response.headers(), WWW_AUTHENTICATE)?)?;
        let credentials = match &self.credential {
            Credential::Basic(auth) => Some(auth),
            _ => None,
        };
        self.tokens
            .fetch(&self.client, &challenge, repository, credentials)
            .await
    }

    /// Send a request built by `build` to each mirror in order.
    ///
    /// A 401 with a bearer challenge is answered once with a fresh token.
    /// Transport errors and 5xx responses move on to the next mirror; any
    /// other response is returned to the caller.
    async fn execute<F>(&self, repository: &str, build: F) -> Result<Exchange>
    where
        F: Fn(&Client, &str) -> RequestBuilder,
    {
        let mut last_error = None;

        for mirror in &self.mirrors {
            let base = mirror.trim_end_matches('/');
            let mut authorization = self.initial_authorization();

            let mut request = build(&self.client, base);
            if let Some(auth) = &authorization {
                request = auth.apply(request);
            }
            let mut response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(mirror = %base, error = %e, "Mirror request failed, trying next mirror");
                    last_error = Some(ProxyError::Http(e));
                    continue;
                }
            };

            if response.status() == StatusCode::UNAUTHORIZED {
                if let Some(token) = self.bearer_token(&response, repository).await {
                    let auth = Authorization::Bearer(token);
                    match auth.apply(build(&self.client, base)).send().await {
                        Ok(retried) => response = retried,
                        Err(e) => {
                            tracing::warn!(mirror = %base, error = %e, "Authenticated retry failed, trying next mirror");
                            last_error = Some(ProxyError::Http(e));
                            continue;
                        }
                    }
                    authorization = Some(auth);
                }
            }

            if response.status().is_server_error() {
                tracing::warn!(
                    mirror = %base,
                    status = %response.status(),
                    "Mirror returned server error, trying next mirror"
                );
                last_error = Some(ProxyError::Upstream(format!(
                    "{} returned {}",
                    base,
                    response.status()
                )));
                continue;
            }

            return Ok(Exchange {
                response,
                base: base.to_string(),
                authorization,
            });
        }

        Err(last_error
            .unwrap_or_else(|| ProxyError::Upstream("no registry mirrors configured".to_string())))
    }

    async fn resolve_manifest_digest(&self, repository: &str, reference: &str) -> Result<String> {
        if is_digest(reference) {
            return Ok(reference.to_string());
        }
        let exchange = self
            .execute(repository, |client, base| {
                client
                    .head(format!("{}/v2/{}/manifests/{}", base, repository, reference))
                    .header(ACCEPT, DEFAULT_MANIFEST_ACCEPT_HEADER)
            })
            .await?;
        let response = check_status(
            exchange.response,
            &format!("manifest {}:{}", repository, reference),
        )?;
        header_str(response.headers(), DOCKER_CONTENT_DIGEST)
            .map(str::to_string)
            .ok_or_else(|| {
                ProxyError::Registry(format!(
                    "manifest {}:{} has no Docker-Content-Digest",
                    repository, reference
                ))
            })
    }
}

#[async_trait]
impl ArtifactRegistry for RegistryClient {
    async fn blob_exists(&self, repository: &str, digest: &str) -> Result<bool> {
        let exchange = self
            .execute(repository, |client, base| {
                client.head(format!("{}/v2/{}/blobs/{}", base, repository, digest))
            })
            .await?;
        match exchange.response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(ProxyError::Registry(format!(
                "blob check {}@{} failed with status {}",
                repository, digest, status
            ))),
        }
    }

    async fn manifest_exists(&self, repository: &str, reference: &str) -> Result<bool> {
        let exchange = self
            .execute(repository, |client, base| {
                client
                    .head(format!("{}/v2/{}/manifests/{}", base, repository, reference))
                    .header(ACCEPT, DEFAULT_MANIFEST_ACCEPT_HEADER)
            })
            .await?;
        match exchange.response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(ProxyError::Registry(format!(
                "manifest check {}:{} failed with status {}",
                repository, reference, status
            ))),
        }
    }

    async fn pull_blob(&self, repository: &str, digest: &str) -> Result<(u64, BlobReader)> {
        let exchange = self
            .execute(repository, |client, base| {
                client.get(format!("{}/v2/{}/blobs/{}", base, repository, digest))
            })
            .await?;
        let response = check_status(exchange.response, &format!("blob {}@{}", repository, digest))?;
        let size = response.content_length().ok_or_else(|| {
            ProxyError::Registry(format!("blob {} response has no Content-Length", digest))
        })?;

        tracing::debug!(repository = %repository, digest = %digest, size, mirror = %exchange.base, "Streaming blob from registry");

        let stream = response.bytes_stream().map_err(std::io::Error::other);
        let reader: BlobReader = Box::pin(StreamReader::new(stream));
        Ok((size, reader))
    }

    async fn push_blob(
        &self,
        repository: &str,
        descriptor: &Descriptor,
        reader: BlobReader,
    ) -> Result<()> {
        let exchange = self
            .execute(repository, |client, base| {
                client.post(format!("{}/v2/{}/blobs/uploads/", base, repository))
            })
            .await?;
        let response = check_status(
            exchange.response,
            &format!("upload session for {}", repository),
        )?;
        let location = header_str(response.headers(), LOCATION).ok_or_else(|| {
            ProxyError::Registry(format!("upload session for {} has no Location", repository))
        })?;

        let upload_url = resolve_location(&exchange.base, location);
        let separator = if upload_url.contains('?') { '&' } else { '?' };
        let put_url = format!("{}{}digest={}", upload_url, separator, descriptor.digest);

        let mut request = self
            .client
            .put(put_url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(reqwest::Body::wrap_stream(ReaderStream::new(reader)));
        if descriptor.size > 0 {
            request = request.header(CONTENT_LENGTH, descriptor.size);
        }
        if let Some(auth) = &exchange.authorization {
            request = auth.apply(request);
        }

        let response = request.send().await?;
        check_status(
            response,
            &format!("blob upload {}@{}", repository, descriptor.digest),
        )?;
        tracing::debug!(repository = %repository, digest = %descriptor.digest, "Blob uploaded");
        Ok(())
    }

    async fn pull_manifest(&self, repository: &str, reference: &str) -> Result<Manifest> {
        let exchange = self
            .execute(repository, |client, base| {
                client
                    .get(format!("{}/v2/{}/manifests/{}", base, repository, reference))
                    .header(ACCEPT, DEFAULT_MANIFEST_ACCEPT_HEADER)
            })
            .await?;
        let response = check_status(
            exchange.response,
            &format!("manifest {}:{}", repository, reference),
        )?;
        let content_type = header_str(response.headers(), CONTENT_TYPE).map(str::to_string);
        let payload = response.bytes().await?;
        Manifest::from_payload(content_type.as_deref(), payload)
    }

    async fn push_manifest(
        &self,
        repository: &str,
        reference: &str,
        manifest: &Manifest,
    ) -> Result<()> {
        let exchange = self
            .execute(repository, |client, base| {
                client
                    .put(format!("{}/v2/{}/manifests/{}", base, repository, reference))
                    .header(CONTENT_TYPE, manifest.media_type())
                    .body(manifest.payload().clone())
            })
            .await?;
        check_status(
            exchange.response,
            &format!("manifest push {}:{}", repository, reference),
        )?;
        Ok(())
    }

    async fn delete_manifest(&self, repository: &str, reference: &str) -> Result<()> {
        let digest = self.resolve_manifest_digest(repository, reference).await?;
        let exchange = self
            .execute(repository, |client, base| {
                client.delete(format!("{}/v2/{}/manifests/{}", base, repository, digest))
            })
            .await?;
        check_status(
            exchange.response,
            &format!("manifest delete {}:{}", repository, reference),
        )?;
        Ok(())
    }
}
