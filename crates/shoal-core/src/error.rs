//! Error types for Shoal core operations

use crate::coordinator::FailureReason;
use shoal_discovery::RendezvousError;
use shoal_files::ChunkError;
use thiserror::Error;

/// A configuration value violates an invariant
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid configuration: {0}")]
pub struct ConfigError(pub String);

impl ConfigError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Errors from a single chunk fetch
///
/// Absorbed by the coordinator: a failed fetch is retried elsewhere and only
/// feeds reputation, it never fails a download by itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Deadline elapsed before the chunk arrived
    #[error("Chunk fetch timed out")]
    Timeout,

    /// Peer does not have the requested chunk
    #[error("Chunk unavailable: {0}")]
    Unavailable(String),

    /// Data channel failure
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Errors surfaced by the download coordinator
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Manifest could not be used
    #[error("Invalid manifest: {0}")]
    Manifest(#[from] ChunkError),

    /// Download reached a terminal failure
    #[error("Download failed: {0}")]
    Failed(FailureReason),

    /// Download task ended without reporting an outcome
    #[error("Download task ended unexpectedly: {0}")]
    TaskJoin(String),
}

/// Errors from the node façade
#[derive(Debug, Error)]
pub enum NodeError {
    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Rendezvous channel failure
    #[error("Rendezvous error: {0}")]
    Rendezvous(#[from] RendezvousError),

    /// Coordinator failure
    #[error("Coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),
}

/// Result type for coordinator operations
pub type Result<T> = std::result::Result<T, CoordinatorError>;
