//! Download events and outcomes.

use serde::{Deserialize, Serialize};
use shoal_discovery::PeerId;
use shoal_files::{ChunkHash, FileId};
use std::fmt;

/// Why a download ended without completing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureReason {
    /// No chunk completed within the configured number of passes
    Stalled,
    /// Cancelled by the caller
    Aborted,
    /// Reassembled file does not match the manifest digest
    Integrity,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureReason::Stalled => "stalled",
            FailureReason::Aborted => "aborted",
            FailureReason::Integrity => "integrity",
        })
    }
}

/// Why one chunk attempt failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkFailure {
    /// Deadline elapsed
    Timeout,
    /// Content hash or length did not match
    Integrity,
    /// Peer refused or the channel failed
    Fetch(String),
}

/// Progress and terminal events of a download
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadEvent {
    /// A chunk was verified
    Progress {
        /// Chunks completed so far
        completed: u64,
        /// Chunks in the file
        total: u64,
    },
    /// A chunk attempt failed; the chunk will be reassigned
    ChunkFailed {
        /// Chunk index
        index: u64,
        /// Peer that failed
        peer: PeerId,
        /// What went wrong
        reason: ChunkFailure,
    },
    /// Terminal: every chunk verified and the file reassembled
    Completed {
        /// BLAKE3 digest of the reassembled file
        digest: ChunkHash,
        /// File size in bytes
        total_bytes: u64,
    },
    /// Terminal: the download ended without a verified file
    Failed {
        /// Why
        reason: FailureReason,
    },
}

impl DownloadEvent {
    /// Whether no further events follow
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadEvent::Completed { .. } | DownloadEvent::Failed { .. }
        )
    }
}

/// A verified, reassembled file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedDownload {
    /// File identifier
    pub file_id: FileId,
    /// File content
    pub data: Vec<u8>,
    /// BLAKE3 digest of `data`
    pub digest: ChunkHash,
}

/// Final state of a download task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// Verified file
    Completed(CompletedDownload),
    /// Terminal failure
    Failed(FailureReason),
}
