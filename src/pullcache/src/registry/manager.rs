use super::auth::TokenCache;
use super::{ArtifactRegistry, RegistryClient};
use crate::config::RegistryConfig;
use crate::error::{ProxyError, Result};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Resolves registry ids to adapters, creating HTTP clients on first use.
pub struct RegistryManager {
    configs: HashMap<String, RegistryConfig>,
    adapters: RwLock<HashMap<String, Arc<dyn ArtifactRegistry>>>,
    tokens: Arc<TokenCache>,
}

impl RegistryManager {
    pub fn new(configs: HashMap<String, RegistryConfig>) -> Self {
        Self {
            configs,
            adapters: RwLock::new(HashMap::new()),
            tokens: Arc::new(TokenCache::new()),
        }
    }

    /// Install a ready adapter under `id`, replacing any cached client.
    pub fn register(&self, id: impl Into<String>, adapter: Arc<dyn ArtifactRegistry>) {
        self.adapters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.into(), adapter);
    }

    /// True when `id` names a configured or registered registry.
    pub fn is_ready(&self, id: &str) -> bool {
        self.configs.contains_key(id)
            || self
                .adapters
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .contains_key(id)
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn ArtifactRegistry>> {
        if let Some(adapter) = self
            .adapters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
        {
            return Ok(adapter.clone());
        }

        let config = self
            .configs
            .get(id)
            .ok_or_else(|| ProxyError::Config(format!("unknown registry {}", id)))?;
        let client: Arc<dyn ArtifactRegistry> =
            Arc::new(RegistryClient::new(config, self.tokens.clone())?);

        tracing::debug!(registry = %id, mirrors = ?config.mirrors, "Created registry client");

        let mut adapters = self
            .adapters
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(adapters.entry(id.to_string()).or_insert(client).clone())
    }
}
