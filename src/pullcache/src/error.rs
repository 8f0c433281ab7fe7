use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("The size mismatch, actual: {actual}, expected: {expected}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("Digest mismatch, actual: {actual}, expected: {expected}")]
    DigestMismatch { expected: String, actual: String },

    #[error("Upstream unavailable: {0}")]
    Upstream(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Invalid repository: {0}")]
    InvalidRepository(String),
}

impl ProxyError {
    /// True when the remote (or local) store reported the artifact as absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProxyError::NotFound(_))
    }
}
