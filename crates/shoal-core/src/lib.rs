//! # Shoal Core
//!
//! Peer reputation, candidate selection and multi-source download
//! coordination for the Shoal file-sharing network.
//!
//! This crate provides:
//! - A reputation store fed by chunk transfer outcomes
//! - Ranking of known peers for download and relay tasks
//! - A coordinator that fetches chunks from several peers at once
//! - A [`Node`] tying the rendezvous session to the above

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod coordinator;
pub mod error;
pub mod node;
pub mod reputation;
pub mod selection;

pub use coordinator::{
    Assignment, ChunkFailure, ChunkFetcher, ChunkRequest, ChunkState, CompletedDownload,
    Coordinator, CoordinatorConfig, DownloadEvent, DownloadHandle, DownloadOutcome, FailureReason,
    LoadGuard, PeerLoad, RacePolicy,
};
pub use error::{ConfigError, CoordinatorError, FetchError, NodeError};
pub use node::{MaintenanceConfig, Node, NodeConfig};
pub use reputation::{Outcome, ReputationConfig, ReputationEntry, ReputationStore};
pub use selection::{Candidate, CandidateList, Purpose, SelectionConfig, Selector, TaskContext};
