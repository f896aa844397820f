//! # Shoal Files
//!
//! File layout for the Shoal multi-source downloader.
//!
//! This crate provides:
//! - Fixed-size chunk layout (the final chunk may be shorter)
//! - BLAKE3 per-chunk hashes and whole-file digests
//! - File manifests describing what a download must fetch and verify
//! - A seekable file chunker for the serving side
//! - Out-of-order chunk reassembly for the receiving side

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chunker;
pub mod manifest;

pub use chunker::{ChunkLayout, ChunkReassembler, FileChunker};
pub use manifest::{ChunkHash, FileId, FileManifest};

use thiserror::Error;

/// Default chunk size (256 KiB).
///
/// Small enough that a single slow peer holds back little of the file, large
/// enough that per-chunk request overhead stays negligible.
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// Largest file a manifest may describe
///
/// Downloads are reassembled in one buffer, which cannot exceed `isize::MAX`.
pub const MAX_FILE_SIZE: u64 = isize::MAX as u64;

/// Errors raised while chunking, hashing or reassembling a file
#[derive(Debug, Error)]
pub enum ChunkError {
    /// File I/O error
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Chunk size of zero was requested
    #[error("Chunk size must be greater than zero")]
    ZeroChunkSize,

    /// Chunk index past the end of the file
    #[error("Chunk index {index} out of bounds ({total} chunks)")]
    OutOfBounds {
        /// Requested index
        index: u64,
        /// Number of chunks in the layout
        total: u64,
    },

    /// Chunk payload length does not match the layout
    #[error("Chunk {index} has length {actual}, expected {expected}")]
    LengthMismatch {
        /// Chunk index
        index: u64,
        /// Length required by the layout
        expected: usize,
        /// Length received
        actual: usize,
    },

    /// Manifest is internally inconsistent
    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    /// File too large to hold in memory
    #[error("File of {size} bytes exceeds the {limit} byte limit")]
    TooLarge {
        /// Declared size
        size: u64,
        /// Largest size accepted
        limit: u64,
    },

    /// Reassembly finalized before every chunk arrived
    #[error("Transfer incomplete: {received}/{total} chunks received")]
    Incomplete {
        /// Chunks received so far
        received: u64,
        /// Chunks required
        total: u64,
    },
}

/// Result type for chunk operations
pub type Result<T> = std::result::Result<T, ChunkError>;
