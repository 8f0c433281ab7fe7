//! Pull-through cache for OCI/Docker registries.
//!
//! Requests for a project's repositories are answered from upstream while the
//! content is replicated into a local store in the background; digest-addressed
//! blobs already cached are served locally.

pub mod cache;
pub mod config;
pub mod error;
pub mod model;
pub mod proxy;
pub mod registry;
pub mod server;
pub mod sink;

pub use cache::FsStore;
pub use config::{Config, LocalStoreConfig, ProxyTimings, RegistryConfig};
pub use error::{ProxyError, Result};
pub use model::{ArtifactInfo, Descriptor, Manifest, Project};
pub use proxy::{LocalCache, ProxyController, RemoteSource};
pub use registry::{ArtifactRegistry, BlobReader, RegistryClient, RegistryManager};
pub use sink::{BufferSink, ChannelSink, ResponseHead, ResponseSink};

/// Start the pull-through cache server with the given configuration
pub async fn start_server(
    config: Config,
) -> Result<(std::net::SocketAddr, tokio::task::JoinHandle<()>)> {
    server::start_server(config).await
}
