//! Registry client tests against a mock distribution API
//!
//! These tests verify:
//! - Bearer token negotiation from a WWW-Authenticate challenge, with caching
//! - Streaming blob pulls and monolithic blob uploads
//! - Manifest pull, push and delete-by-tag
//! - 404 mapped to NotFound
//! - Failover to the next mirror on 5xx

mod common;

use common::{start_unavailable_mirror, MockRegistry, TestImage};
use pullcache::config::{RegistryAuth, RegistryConfig};
use pullcache::model::{compute_digest, Descriptor, MEDIA_TYPE_OCI_MANIFEST};
use pullcache::registry::auth::TokenCache;
use pullcache::{ArtifactRegistry, RegistryClient};
use std::sync::Arc;
use tokio::io::AsyncReadExt;

const REPO: &str = "library/app";

fn client_for(mirrors: Vec<String>) -> RegistryClient {
    let config = RegistryConfig {
        mirrors,
        timeout_secs: 10,
        auth: None,
        insecure: false,
    };
    RegistryClient::new(&config, Arc::new(TokenCache::new())).unwrap()
}

#[tokio::test]
async fn test_pull_manifest_negotiates_token_once() {
    let mock = MockRegistry::start(true).await;
    let image = TestImage::new("token");
    mock.add_image(REPO, "v1", &image);
    let client = client_for(vec![mock.url()]);

    let manifest = client.pull_manifest(REPO, "v1").await.unwrap();
    assert_eq!(manifest.digest(), image.manifest.digest());
    assert_eq!(manifest.media_type(), MEDIA_TYPE_OCI_MANIFEST);

    let again = client.pull_manifest(REPO, image.manifest.digest()).await.unwrap();
    assert_eq!(again, manifest);
    assert_eq!(mock.token_requests(), 1, "token should be cached");
}

#[tokio::test]
async fn test_basic_credentials_sent_to_token_endpoint() {
    let mock = MockRegistry::start(true).await;
    let image = TestImage::new("basic");
    mock.add_image(REPO, "v1", &image);
    let config = RegistryConfig {
        mirrors: vec![mock.url()],
        timeout_secs: 10,
        auth: Some(RegistryAuth {
            username: "robot".to_string(),
            password: "hunter2".to_string(),
        }),
        insecure: false,
    };
    let client = RegistryClient::new(&config, Arc::new(TokenCache::new())).unwrap();

    assert!(client.pull_manifest(REPO, "v1").await.is_ok());
    assert_eq!(mock.token_requests(), 1);
}

#[tokio::test]
async fn test_pull_blob_streams_body() {
    let mock = MockRegistry::start(true).await;
    let data = b"0123456789".repeat(10_000);
    let digest = mock.add_blob(&data);
    let client = client_for(vec![mock.url()]);

    assert!(client.blob_exists(REPO, &digest).await.unwrap());
    let (size, mut reader) = client.pull_blob(REPO, &digest).await.unwrap();
    assert_eq!(size, data.len() as u64);

    let mut body = Vec::new();
    reader.read_to_end(&mut body).await.unwrap();
    assert_eq!(body, data);
}

#[tokio::test]
async fn test_missing_content_is_not_found() {
    let mock = MockRegistry::start(false).await;
    let client = client_for(vec![mock.url()]);
    let digest = compute_digest(b"absent");

    assert!(!client.blob_exists(REPO, &digest).await.unwrap());
    assert!(client.pull_blob(REPO, &digest).await.err().unwrap().is_not_found());
    assert!(client.pull_manifest(REPO, "nope").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_manifest_exists_uses_manifest_head() {
    let mock = MockRegistry::start(true).await;
    let image = TestImage::new("exists");
    mock.add_image(REPO, "v1", &image);
    let client = client_for(vec![mock.url()]);

    assert!(client.manifest_exists(REPO, image.manifest.digest()).await.unwrap());
    assert!(!client.manifest_exists(REPO, "absent").await.unwrap());
    assert_eq!(
        mock.requests_matching(&format!("HEAD /v2/{}/manifests/{}", REPO, image.manifest.digest())),
        2
    );
    assert_eq!(mock.requests_matching("/blobs/"), 0);
}

#[tokio::test]
async fn test_push_blob_uploads_monolithically() {
    let mock = MockRegistry::start(true).await;
    let client = client_for(vec![mock.url()]);
    let data = b"uploaded layer".repeat(500);
    let descriptor = Descriptor::new(compute_digest(&data), data.len() as u64);

    client
        .push_blob(REPO, &descriptor, Box::pin(std::io::Cursor::new(data.clone())))
        .await
        .unwrap();

    assert!(mock.has_blob(&descriptor.digest));
    assert_eq!(mock.requests_matching("POST /v2/library/app/blobs/uploads/"), 2);
    assert!(client.blob_exists(REPO, &descriptor.digest).await.unwrap());
}

#[tokio::test]
async fn test_push_and_delete_manifest_by_tag() {
    let mock = MockRegistry::start(false).await;
    let client = client_for(vec![mock.url()]);
    let image = TestImage::new("push");

    client.push_manifest(REPO, "2.0", &image.manifest).await.unwrap();
    assert_eq!(
        mock.manifest(REPO, "2.0").as_deref(),
        Some(image.manifest.payload().as_ref())
    );

    client.delete_manifest(REPO, "2.0").await.unwrap();
    assert!(mock.manifest(REPO, "2.0").is_none());
    assert_eq!(
        mock.requests_matching(&format!("DELETE /v2/{}/manifests/{}", REPO, image.manifest.digest())),
        1
    );

    assert!(client.delete_manifest(REPO, "2.0").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_failover_to_next_mirror() {
    let unavailable = start_unavailable_mirror().await;
    let mock = MockRegistry::start(false).await;
    let image = TestImage::new("failover");
    mock.add_image(REPO, "v1", &image);
    let client = client_for(vec![unavailable, mock.url()]);

    let manifest = client.pull_manifest(REPO, "v1").await.unwrap();
    assert_eq!(manifest.digest(), image.manifest.digest());
}

#[tokio::test]
async fn test_all_mirrors_down_is_upstream_error() {
    let first = start_unavailable_mirror().await;
    let second = start_unavailable_mirror().await;
    let client = client_for(vec![first, second]);

    let err = client.pull_manifest(REPO, "v1").await.unwrap_err();
    assert!(matches!(err, pullcache::ProxyError::Upstream(_)));
}

#[tokio::test]
async fn test_secret_client_sends_static_bearer() {
    let mock = MockRegistry::start(true).await;
    let image = TestImage::new("secret");
    mock.add_image(REPO, "v1", &image);

    let client = RegistryClient::with_secret(&mock.url(), common::MOCK_TOKEN, true).unwrap();
    assert!(client.pull_manifest(REPO, "v1").await.is_ok());
    assert_eq!(mock.token_requests(), 0);

    let wrong = RegistryClient::with_secret(&mock.url(), "wrong", true).unwrap();
    let err = wrong.pull_manifest(REPO, "v1").await.unwrap_err();
    assert!(matches!(err, pullcache::ProxyError::Registry(_)));
}
