//! Data-channel seam used by the coordinator.

use crate::error::FetchError;
use async_trait::async_trait;
use shoal_discovery::PeerId;
use shoal_files::FileId;

/// A request for one chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRequest {
    /// File the chunk belongs to
    pub file_id: FileId,
    /// Chunk index
    pub index: u64,
    /// Byte offset of the chunk in the file
    pub offset: u64,
    /// Chunk length in bytes
    pub len: usize,
}

/// Fetches chunk bytes from a peer over an established data channel
///
/// The coordinator enforces deadlines and verifies hashes, so implementations
/// only move bytes.
#[async_trait]
pub trait ChunkFetcher: Send + Sync + 'static {
    /// Fetch one chunk from `peer`
    ///
    /// # Errors
    ///
    /// Returns `FetchError` if the peer cannot serve the chunk or the channel
    /// fails.
    async fn fetch_chunk(&self, peer: &PeerId, request: ChunkRequest) -> Result<Vec<u8>, FetchError>;
}
