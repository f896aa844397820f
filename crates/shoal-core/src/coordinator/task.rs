//! Per-download actor.
//!
//! One tokio task owns a download's chunk table. Fetches run as separate tasks
//! and report back over a channel tagged with an attempt id; a result whose
//! attempt is no longer tracked (cancelled, raced out) is ignored.
//!
//! ```text
//!            assign                 verified
//! Pending ----------> InFlight ----------------> Completed
//!    ^                   |
//!    |   next pass       | timeout / bad hash / fetch error
//!    +------------ Failed <+
//! ```

use super::config::CoordinatorConfig;
use super::events::{ChunkFailure, CompletedDownload, DownloadEvent, DownloadOutcome, FailureReason};
use super::fetcher::{ChunkFetcher, ChunkRequest};
use super::load::{LoadGuard, PeerLoad};
use crate::error::FetchError;
use crate::reputation::{Outcome, ReputationStore};
use crate::selection::{CandidateList, Selector, TaskContext};
use shoal_discovery::{PeerId, PeerTable};
use shoal_files::{ChunkError, ChunkHash, ChunkLayout, ChunkReassembler, FileManifest};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

/// Collaborators shared by every download of a coordinator
pub(crate) struct Shared {
    pub(crate) config: CoordinatorConfig,
    pub(crate) fetcher: Arc<dyn ChunkFetcher>,
    pub(crate) peers: Arc<PeerTable>,
    pub(crate) reputation: Arc<ReputationStore>,
    pub(crate) selector: Arc<Selector>,
    pub(crate) load: PeerLoad,
    pub(crate) context: TaskContext,
}

impl Shared {
    /// Fresh ranking from the current peer table and reputation
    fn candidates(&self) -> CandidateList {
        self.selector
            .select(&self.context, &self.peers.snapshot(), &self.reputation)
    }
}

/// One request for a chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    /// Peer asked for the chunk
    pub peer: PeerId,
    /// When the request was issued
    pub started_at: Instant,
    attempt: u64,
}

/// State of one chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkState {
    /// Waiting for assignment
    Pending,
    /// Requested; `duplicate` is set only by the race policy
    InFlight {
        /// Original request
        primary: Assignment,
        /// Second request to a ranked-adjacent peer
        duplicate: Option<Assignment>,
    },
    /// Verified and stored
    Completed {
        /// BLAKE3 hash of the chunk
        hash: ChunkHash,
    },
    /// Last attempt failed; eligible again on the next pass
    Failed {
        /// What went wrong
        reason: ChunkFailure,
    },
}

struct ChunkSlot {
    state: ChunkState,
    /// Peers that failed this chunk, avoided while an alternative exists
    failed_peers: HashSet<PeerId>,
}

struct Attempt {
    chunk: u64,
    peer: PeerId,
    handle: JoinHandle<()>,
    _guard: LoadGuard,
}

pub(crate) struct FetchResult {
    attempt: u64,
    data: Result<Vec<u8>, FetchError>,
}

pub(crate) struct DownloadTask {
    id: u64,
    manifest: Arc<FileManifest>,
    layout: ChunkLayout,
    shared: Arc<Shared>,
    slots: Vec<ChunkSlot>,
    reassembler: ChunkReassembler,
    attempts: HashMap<u64, Attempt>,
    next_attempt: u64,
    completed: u64,
    idle_passes: u32,
    idle_limit: u32,
    progressed: bool,
    last_progress: Instant,
    results_tx: mpsc::UnboundedSender<FetchResult>,
    events: mpsc::UnboundedSender<DownloadEvent>,
}

impl DownloadTask {
    pub(crate) fn new(
        id: u64,
        manifest: Arc<FileManifest>,
        layout: ChunkLayout,
        shared: Arc<Shared>,
        events: mpsc::UnboundedSender<DownloadEvent>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<FetchResult>), ChunkError> {
        let reassembler = ChunkReassembler::new(layout)?;
        // The first chunk is the longest
        let idle_limit = shared
            .config
            .idle_pass_limit(layout.chunk_len(0).unwrap_or(0));
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let slots = (0..layout.num_chunks())
            .map(|_| ChunkSlot {
                state: ChunkState::Pending,
                failed_peers: HashSet::new(),
            })
            .collect();

        let task = Self {
            id,
            manifest,
            layout,
            shared,
            slots,
            reassembler,
            attempts: HashMap::new(),
            next_attempt: 0,
            completed: 0,
            idle_passes: 0,
            idle_limit,
            progressed: false,
            last_progress: Instant::now(),
            results_tx,
            events,
        };
        Ok((task, results_rx))
    }

    fn total(&self) -> u64 {
        self.layout.num_chunks()
    }

    fn emit(&self, event: DownloadEvent) {
        let _ = self.events.send(event);
    }

    /// Drive the download to a terminal outcome
    pub(crate) async fn run(
        mut self,
        mut results: mpsc::UnboundedReceiver<FetchResult>,
        mut cancel: watch::Receiver<bool>,
    ) -> DownloadOutcome {
        let mut ticker = time::interval(self.shared.config.pass_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        let mut cancel_open = true;

        tracing::info!(
            "Download {} started: file {} ({} bytes, {} chunks)",
            self.id,
            self.manifest.file_id.short(),
            self.layout.total_size(),
            self.total()
        );

        loop {
            if *cancel.borrow() {
                return self.fail(FailureReason::Aborted);
            }
            if self.completed == self.total() {
                return self.finish();
            }
            self.assign_pass();

            tokio::select! {
                biased;

                changed = cancel.changed(), if cancel_open => match changed {
                    Ok(()) => {
                        if *cancel.borrow() {
                            return self.fail(FailureReason::Aborted);
                        }
                    }
                    // Handle dropped without cancelling: keep going
                    Err(_) => cancel_open = false,
                },
                Some(result) = results.recv() => self.handle_result(result),
                _ = ticker.tick() => {
                    if self.progressed {
                        self.progressed = false;
                        self.idle_passes = 0;
                    } else {
                        self.idle_passes += 1;
                        if self.idle_passes >= self.idle_limit {
                            tracing::warn!(
                                "Download {} stalled after {} passes without progress ({}/{} chunks)",
                                self.id,
                                self.idle_passes,
                                self.completed,
                                self.total()
                            );
                            return self.fail(FailureReason::Stalled);
                        }
                    }
                }
            }
        }
    }

    /// Assign every eligible chunk, then consider duplicate races
    fn assign_pass(&mut self) {
        let max_in_flight = self.shared.config.max_in_flight;
        if self.attempts.len() >= max_in_flight {
            return;
        }
        let candidates = self.shared.candidates();
        if candidates.is_empty() {
            tracing::trace!("Download {}: no candidates", self.id);
            return;
        }

        for index in 0..self.total() {
            if self.attempts.len() >= max_in_flight {
                break;
            }
            let eligible = matches!(
                self.slots[index as usize].state,
                ChunkState::Pending | ChunkState::Failed { .. }
            );
            if !eligible {
                continue;
            }
            if let Some((peer, guard)) = self.pick_peer(index, &candidates, None) {
                self.start_attempt(index, peer, guard, false);
            }
        }

        self.race_pass(&candidates);
    }

    /// Best candidate for a chunk with spare capacity
    ///
    /// Peers that already failed the chunk are used only when no other
    /// candidate exists. With `after` set (a race), the search starts just
    /// below that peer's rank, skips it, and never falls back to failed peers.
    fn pick_peer(
        &self,
        index: u64,
        candidates: &CandidateList,
        after: Option<&PeerId>,
    ) -> Option<(PeerId, LoadGuard)> {
        let failed = &self.slots[index as usize].failed_peers;
        let limit = self.shared.config.per_peer_concurrency;

        let ranked: Vec<&PeerId> = match after {
            Some(primary) => {
                let start = candidates.position(primary).map_or(0, |p| p + 1);
                let ids: Vec<&PeerId> = candidates.peer_ids().collect();
                ids[start..]
                    .iter()
                    .chain(ids[..start].iter())
                    .copied()
                    .filter(|id| *id != primary)
                    .collect()
            }
            None => candidates.peer_ids().collect(),
        };

        let fresh = ranked.iter().filter(|id| !failed.contains(**id));
        let has_fresh = ranked.iter().any(|id| !failed.contains(*id));
        for peer in fresh {
            if let Some(guard) = self.shared.load.try_acquire(peer, limit) {
                return Some(((*peer).clone(), guard));
            }
        }

        if after.is_none() && !has_fresh {
            for peer in &ranked {
                if let Some(guard) = self.shared.load.try_acquire(peer, limit) {
                    return Some(((*peer).clone(), guard));
                }
            }
        }
        None
    }

    fn start_attempt(&mut self, index: u64, peer: PeerId, guard: LoadGuard, duplicate: bool) {
        let Ok(range) = self.layout.chunk_range(index) else {
            return;
        };
        let len = (range.end - range.start) as usize;
        let request = ChunkRequest {
            file_id: self.manifest.file_id.clone(),
            index,
            offset: range.start,
            len,
        };
        let deadline = self.shared.config.chunk_deadline(len);
        let attempt = self.next_attempt;
        self.next_attempt += 1;

        let fetcher = self.shared.fetcher.clone();
        let results = self.results_tx.clone();
        let target = peer.clone();
        let handle = tokio::spawn(async move {
            let data = match time::timeout(deadline, fetcher.fetch_chunk(&target, request)).await {
                Ok(result) => result,
                Err(_) => Err(FetchError::Timeout),
            };
            let _ = results.send(FetchResult { attempt, data });
        });

        self.attempts.insert(
            attempt,
            Attempt {
                chunk: index,
                peer: peer.clone(),
                handle,
                _guard: guard,
            },
        );

        tracing::debug!(
            "Download {}: chunk {} -> {}{}",
            self.id,
            index,
            peer.short(),
            if duplicate { " (race)" } else { "" }
        );

        let assignment = Assignment {
            peer,
            started_at: Instant::now(),
            attempt,
        };
        let slot = &mut self.slots[index as usize];
        slot.state = match std::mem::replace(&mut slot.state, ChunkState::Pending) {
            ChunkState::InFlight { primary, .. } if duplicate => ChunkState::InFlight {
                primary,
                duplicate: Some(assignment),
            },
            _ => ChunkState::InFlight {
                primary: assignment,
                duplicate: None,
            },
        };
    }

    /// Issue bounded duplicates for chunks stuck in flight
    fn race_pass(&mut self, candidates: &CandidateList) {
        let policy = &self.shared.config.race;
        if !policy.enabled || candidates.len() < 2 {
            return;
        }
        if self.last_progress.elapsed() < policy.stall_after {
            return;
        }

        let remaining = self.total() - self.completed;
        let budget = (remaining as f64 * policy.max_fraction).floor() as usize;
        let mut racing = self.racing_count();
        if racing >= budget {
            return;
        }

        let mut slow: Vec<(Instant, u64, PeerId)> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match &slot.state {
                ChunkState::InFlight {
                    primary,
                    duplicate: None,
                } if primary.started_at.elapsed() >= policy.stall_after => {
                    Some((primary.started_at, index as u64, primary.peer.clone()))
                }
                _ => None,
            })
            .collect();
        slow.sort_by_key(|(started, index, _)| (*started, *index));

        for (_, index, primary) in slow {
            if racing >= budget || self.attempts.len() >= self.shared.config.max_in_flight {
                break;
            }
            if let Some((peer, guard)) = self.pick_peer(index, candidates, Some(&primary)) {
                self.start_attempt(index, peer, guard, true);
                racing += 1;
            }
        }
    }

    fn racing_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| {
                matches!(
                    slot.state,
                    ChunkState::InFlight {
                        duplicate: Some(_),
                        ..
                    }
                )
            })
            .count()
    }

    fn handle_result(&mut self, result: FetchResult) {
        let Some(attempt) = self.attempts.remove(&result.attempt) else {
            tracing::trace!(
                "Download {}: ignoring result of abandoned attempt {}",
                self.id,
                result.attempt
            );
            return;
        };
        let index = attempt.chunk;
        let peer = attempt.peer.clone();
        drop(attempt);

        let reputation = &self.shared.reputation;
        match result.data {
            Ok(data) => match self.verify(index, &data) {
                Some(hash) => {
                    reputation.record(&peer, Outcome::Success);
                    self.complete_chunk(index, result.attempt, &data, hash);
                }
                None => {
                    reputation.record(&peer, Outcome::Failure);
                    tracing::warn!(
                        "Download {}: chunk {} from {} failed verification",
                        self.id,
                        index,
                        peer.short()
                    );
                    self.fail_attempt(index, result.attempt, peer, ChunkFailure::Integrity);
                }
            },
            Err(FetchError::Timeout) => {
                reputation.record(&peer, Outcome::Timeout);
                tracing::debug!(
                    "Download {}: chunk {} timed out on {}",
                    self.id,
                    index,
                    peer.short()
                );
                self.fail_attempt(index, result.attempt, peer, ChunkFailure::Timeout);
            }
            // Fetch errors may be transient; only bad content earns the full penalty
            Err(e) => {
                reputation.record(&peer, Outcome::Timeout);
                tracing::debug!(
                    "Download {}: chunk {} from {} failed: {}",
                    self.id,
                    index,
                    peer.short(),
                    e
                );
                self.fail_attempt(index, result.attempt, peer, ChunkFailure::Fetch(e.to_string()));
            }
        }
    }

    /// Hash of `data` if it is the expected content of chunk `index`
    fn verify(&self, index: u64, data: &[u8]) -> Option<ChunkHash> {
        let expected_len = self.layout.chunk_len(index).ok()?;
        if data.len() != expected_len {
            return None;
        }
        let hash = *blake3::hash(data).as_bytes();
        (self.manifest.expected_hash(index) == Some(&hash)).then_some(hash)
    }

    fn complete_chunk(&mut self, index: u64, attempt: u64, data: &[u8], hash: ChunkHash) {
        if let Err(e) = self.reassembler.write_chunk(index, data) {
            tracing::warn!("Download {}: storing chunk {} failed: {}", self.id, index, e);
            return;
        }

        let slot = &mut self.slots[index as usize];
        if let ChunkState::InFlight { primary, duplicate } = &slot.state {
            let losers = std::iter::once(primary.attempt)
                .chain(duplicate.as_ref().map(|d| d.attempt))
                .filter(|id| *id != attempt);
            for loser in losers {
                if let Some(abandoned) = self.attempts.remove(&loser) {
                    abandoned.handle.abort();
                    tracing::debug!(
                        "Download {}: chunk {} race won, dropping request to {}",
                        self.id,
                        index,
                        abandoned.peer.short()
                    );
                }
            }
        }
        slot.state = ChunkState::Completed { hash };

        self.completed += 1;
        self.progressed = true;
        self.last_progress = Instant::now();
        tracing::trace!(
            "Download {}: chunk {} complete ({}/{})",
            self.id,
            index,
            self.completed,
            self.total()
        );
        self.emit(DownloadEvent::Progress {
            completed: self.completed,
            total: self.total(),
        });
    }

    fn fail_attempt(&mut self, index: u64, attempt: u64, peer: PeerId, reason: ChunkFailure) {
        let slot = &mut self.slots[index as usize];
        slot.failed_peers.insert(peer.clone());

        slot.state = match std::mem::replace(&mut slot.state, ChunkState::Pending) {
            ChunkState::InFlight { primary, duplicate } => {
                // Keep whichever request is still outstanding
                let survivor = std::iter::once(primary)
                    .chain(duplicate)
                    .find(|a| a.attempt != attempt && self.attempts.contains_key(&a.attempt));
                match survivor {
                    Some(primary) => ChunkState::InFlight {
                        primary,
                        duplicate: None,
                    },
                    None => ChunkState::Failed {
                        reason: reason.clone(),
                    },
                }
            }
            other => other,
        };

        self.emit(DownloadEvent::ChunkFailed {
            index,
            peer,
            reason,
        });
    }

    fn abandon_all(&mut self) {
        for (_, attempt) in self.attempts.drain() {
            attempt.handle.abort();
        }
    }

    fn fail(mut self, reason: FailureReason) -> DownloadOutcome {
        self.abandon_all();
        tracing::info!(
            "Download {} of {} failed: {} ({}/{} chunks)",
            self.id,
            self.manifest.file_id.short(),
            reason,
            self.completed,
            self.total()
        );
        self.emit(DownloadEvent::Failed { reason });
        DownloadOutcome::Failed(reason)
    }

    fn finish(mut self) -> DownloadOutcome {
        self.abandon_all();
        let events = self.events.clone();
        let manifest = self.manifest.clone();
        let id = self.id;

        let data = match self.reassembler.finalize() {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!("Download {}: reassembly failed: {}", id, e);
                let _ = events.send(DownloadEvent::Failed {
                    reason: FailureReason::Integrity,
                });
                return DownloadOutcome::Failed(FailureReason::Integrity);
            }
        };

        let digest = *blake3::hash(&data).as_bytes();
        if digest != manifest.digest {
            tracing::warn!(
                "Download {}: digest {} does not match manifest {}",
                id,
                hex::encode(&digest[..8]),
                hex::encode(&manifest.digest[..8])
            );
            let _ = events.send(DownloadEvent::Failed {
                reason: FailureReason::Integrity,
            });
            return DownloadOutcome::Failed(FailureReason::Integrity);
        }

        tracing::info!(
            "Download {} of {} complete ({} bytes, digest {})",
            id,
            manifest.file_id.short(),
            data.len(),
            hex::encode(&digest[..8])
        );
        let _ = events.send(DownloadEvent::Completed {
            digest,
            total_bytes: data.len() as u64,
        });
        DownloadOutcome::Completed(CompletedDownload {
            file_id: manifest.file_id.clone(),
            data,
            digest,
        })
    }
}
