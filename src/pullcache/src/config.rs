use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

/// Default Docker Hub registry URL
pub const DEFAULT_REGISTRY_URL: &str = "https://registry-1.docker.io";

/// Default manifest Accept header for upstream requests.
/// Manifest list types go first so multi-platform images resolve to the list.
pub const DEFAULT_MANIFEST_ACCEPT_HEADER: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.oci.image.manifest.v1+json";

/// Default token expiry in seconds (5 minutes)
pub const DEFAULT_TOKEN_EXPIRY_SECS: u64 = 300;

/// Safety margin to subtract from token expiry (30 seconds)
pub const TOKEN_EXPIRY_SAFETY_MARGIN_SECS: u64 = 30;

/// Interval between two dependency checks of a pending manifest
pub const DEFAULT_DEPENDENCY_POLL_INTERVAL_SECS: u64 = 20;

/// Number of dependency checks before missing blobs are force-pushed
pub const DEFAULT_DEPENDENCY_POLL_ATTEMPTS: u32 = 10;

/// Grace period before a manifest list is trimmed and pushed (15 minutes)
pub const DEFAULT_MANIFEST_LIST_GRACE_SECS: u64 = 900;

static DEFAULT_CONFIG: OnceLock<Config> = OnceLock::new();

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub local: LocalStoreConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub projects: HashMap<String, ProjectConfig>,
    #[serde(default)]
    pub proxy: ProxyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
}

/// Where proxied content is replicated to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LocalStoreConfig {
    /// Content-addressed store in a local directory
    Filesystem { directory: String },
    /// The local registry's own API, authenticated with a shared secret
    Registry {
        url: String,
        secret: String,
        #[serde(default = "default_true")]
        insecure: bool,
    },
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Registry connections keyed by registry id
    #[serde(default)]
    pub registries: HashMap<String, RegistryConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// REQUIRED: Must have at least 1 mirror
    pub mirrors: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub auth: Option<RegistryAuth>,
    #[serde(default)]
    pub insecure: bool,
}

fn default_timeout_secs() -> u64 {
    30
}

impl RegistryConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.mirrors.is_empty() {
            return Err("RegistryConfig must have at least one mirror".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
}

/// Binds a project namespace to an upstream registry connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub registry: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub dependency_poll_interval_secs: u64,
    #[serde(default = "default_poll_attempts")]
    pub dependency_poll_attempts: u32,
    #[serde(default = "default_manifest_list_grace_secs")]
    pub manifest_list_grace_secs: u64,
}

fn default_poll_interval_secs() -> u64 {
    DEFAULT_DEPENDENCY_POLL_INTERVAL_SECS
}

fn default_poll_attempts() -> u32 {
    DEFAULT_DEPENDENCY_POLL_ATTEMPTS
}

fn default_manifest_list_grace_secs() -> u64 {
    DEFAULT_MANIFEST_LIST_GRACE_SECS
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            dependency_poll_interval_secs: default_poll_interval_secs(),
            dependency_poll_attempts: default_poll_attempts(),
            manifest_list_grace_secs: default_manifest_list_grace_secs(),
        }
    }
}

/// Fixed waits of the cache population protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyTimings {
    pub poll_interval: Duration,
    pub poll_attempts: u32,
    pub manifest_list_grace: Duration,
}

impl Default for ProxyTimings {
    fn default() -> Self {
        ProxyConfig::default().timings()
    }
}

impl ProxyConfig {
    pub fn timings(&self) -> ProxyTimings {
        ProxyTimings {
            poll_interval: Duration::from_secs(self.dependency_poll_interval_secs),
            poll_attempts: self.dependency_poll_attempts,
            manifest_list_grace: Duration::from_secs(self.manifest_list_grace_secs),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file and validate it.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Config> {
        let config: Config = toml::from_str(raw)
            .map_err(|e| ProxyError::Config(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (id, registry) in &self.upstream.registries {
            registry
                .validate()
                .map_err(|e| ProxyError::Config(format!("registry {}: {}", id, e)))?;
        }
        for (name, project) in &self.projects {
            if let Some(id) = &project.registry {
                if !self.upstream.registries.contains_key(id) {
                    return Err(ProxyError::Config(format!(
                        "project {} references unknown registry {}",
                        name, id
                    )));
                }
            }
        }
        if self.proxy.dependency_poll_attempts == 0 {
            return Err(ProxyError::Config(
                "proxy.dependency_poll_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    fn build_default() -> Config {
        let mut registries = HashMap::new();
        registries.insert(
            "dockerhub".to_string(),
            RegistryConfig {
                mirrors: vec![
                    DEFAULT_REGISTRY_URL.to_string(),
                    "https://registry.hub.docker.com".to_string(),
                ],
                timeout_secs: 600, // large layers
                auth: None,
                insecure: false,
            },
        );

        let mut projects = HashMap::new();
        projects.insert(
            "dockerhub_proxy".to_string(),
            ProjectConfig {
                registry: Some("dockerhub".to_string()),
            },
        );

        Config {
            server: ServerConfig {
                bind_address: "0.0.0.0".to_string(),
                port: 5050,
            },
            local: LocalStoreConfig::Filesystem {
                directory: "cache/pullcache".to_string(),
            },
            upstream: UpstreamConfig { registries },
            projects,
            proxy: ProxyConfig::default(),
        }
    }

    pub(crate) fn default_parsed() -> &'static Config {
        DEFAULT_CONFIG.get_or_init(Self::build_default)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_parsed().clone()
    }
}
