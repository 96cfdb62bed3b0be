use thiserror::Error;

use crate::layers::DiscoverySource;

/// Failure of a single provider call. Never leaves the `Guarded` adapter.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{provider} API error: {status}")]
    Status { provider: DiscoverySource, status: u16 },
    #[error("Malformed {provider} payload: {message}")]
    Malformed { provider: DiscoverySource, message: String },
    #[error("Rate limit exceeded for {0}")]
    RateLimited(DiscoverySource),
    #[error("Circuit open for {0}")]
    CircuitOpen(DiscoverySource),
}

impl SourceError {
    pub fn malformed(provider: DiscoverySource, message: impl ToString) -> Self {
        SourceError::Malformed {
            provider,
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error [{status}]: {message}")]
    Api { status: u16, message: String },
    #[error("Empty completion")]
    EmptyCompletion,
    #[error("Completion timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Synthesis failed: {0}")]
    Synthesis(String),
    #[error("Coordination failed: {0}")]
    Coordination(String),
    #[error("Task panicked: {0}")]
    Panic(String),
}

impl DiscoveryError {
    /// Best-effort message extraction from a caught panic payload.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        DiscoveryError::Panic(message)
    }
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;
