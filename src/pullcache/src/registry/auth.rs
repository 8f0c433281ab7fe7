use crate::config::{RegistryAuth, DEFAULT_TOKEN_EXPIRY_SECS, TOKEN_EXPIRY_SAFETY_MARGIN_SECS};
use reqwest::Client;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Bearer challenge parsed from a `WWW-Authenticate` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

impl BearerChallenge {
    /// Parse `Bearer realm="...",service="...",scope="..."`.
    ///
    /// Returns `None` for non-bearer challenges or when the realm is missing.
    pub fn parse(www_auth: &str) -> Option<Self> {
        let auth_str = www_auth.trim();
        let auth_str = auth_str
            .strip_prefix("Bearer ")
            .or_else(|| auth_str.strip_prefix("bearer "))?;

        let mut realm = None;
        let mut service = None;
        let mut scope = None;

        for part in split_params(auth_str) {
            let Some((key, value)) = part.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"').to_string();
            match key.trim() {
                "realm" => realm = Some(value),
                "service" => service = Some(value),
                "scope" => scope = Some(value),
                _ => {}
            }
        }

        Some(Self {
            realm: realm?,
            service,
            scope,
        })
    }

    /// Token endpoint URL; the scope falls back to a pull scope on `repository`.
    pub fn token_url(&self, repository: &str) -> String {
        let scope = self
            .scope
            .clone()
            .unwrap_or_else(|| format!("repository:{}:pull", repository));
        let mut url = self.realm.clone();
        url.push(if url.contains('?') { '&' } else { '?' });
        if let Some(service) = &self.service {
            url.push_str(&format!("service={}&", service));
        }
        url.push_str(&format!("scope={}", scope));
        url
    }
}

/// Split on commas that are not inside quotes (scopes may contain commas).
fn split_params(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (idx, ch) in s.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(&s[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Tokens keyed by token URL, shared by all clients of a registry manager.
#[derive(Default)]
pub struct TokenCache {
    tokens: RwLock<HashMap<String, CachedToken>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    async fn get(&self, key: &str) -> Option<String> {
        let tokens = self.tokens.read().await;
        tokens.get(key).and_then(|cached| {
            if cached.expires_at > Instant::now() {
                Some(cached.token.clone())
            } else {
                None
            }
        })
    }

    async fn insert(&self, key: String, token: String, expires_in_seconds: Option<u64>) {
        let expires_in = expires_in_seconds.unwrap_or(DEFAULT_TOKEN_EXPIRY_SECS);
        let expires_at = Instant::now()
            + Duration::from_secs(expires_in.saturating_sub(TOKEN_EXPIRY_SAFETY_MARGIN_SECS));

        let mut tokens = self.tokens.write().await;
        tokens.insert(key, CachedToken { token, expires_at });
        tokens.retain(|_, cached| cached.expires_at > Instant::now());
    }

    /// Fetch a bearer token for `challenge`, reusing a cached one when still valid.
    pub async fn fetch(
        &self,
        client: &Client,
        challenge: &BearerChallenge,
        repository: &str,
        credentials: Option<&RegistryAuth>,
    ) -> Option<String> {
        let token_url = challenge.token_url(repository);
        if let Some(token) = self.get(&token_url).await {
            tracing::debug!(token_url = %token_url, "Using cached registry token");
            return Some(token);
        }

        let mut request = client.get(&token_url);
        if let Some(auth) = credentials {
            request = request.basic_auth(&auth.username, Some(&auth.password));
        }

        let response = match request.send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                tracing::warn!(
                    token_url = %token_url,
                    status = %response.status(),
                    "Token endpoint rejected the request"
                );
                return None;
            }
            Err(e) => {
                tracing::warn!(token_url = %token_url, error = %e, "Failed to fetch registry token");
                return None;
            }
        };

        let json = response.json::<serde_json::Value>().await.ok()?;
        // Docker Hub answers with "token", some registries with "access_token"
        let token = json
            .get("token")
            .and_then(|t| t.as_str())
            .or_else(|| json.get("access_token").and_then(|t| t.as_str()))?
            .to_string();
        let expires_in = json.get("expires_in").and_then(|v| v.as_u64());

        self.insert(token_url, token.clone(), expires_in).await;
        Some(token)
    }
}
