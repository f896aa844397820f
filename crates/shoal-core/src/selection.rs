//! Candidate selection for downloads and relays.
//!
//! Ranking key, highest first:
//!
//! 1. `reputation_weight * score + proximity_weight * proximity`, where
//!    proximity is `1 - distance / half_circumference` (0 for an unknown region)
//! 2. distance to the requester, ascending; unknown regions count as infinite
//! 3. `last_seen`, most recent first
//! 4. peer id, for a total order
//!
//! With the default proximity weight of zero the primary key is the
//! reputation score alone and distance only breaks ties.

use crate::error::ConfigError;
use crate::reputation::ReputationStore;
use serde::{Deserialize, Serialize};
use shoal_discovery::region::MAX_DISTANCE_KM;
use shoal_discovery::{PeerId, PeerRecord, RegionCatalogue, RegionId};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

/// What the candidates will be used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Purpose {
    /// Serving file chunks
    Download,
    /// Relaying traffic for us; requires a minimum score
    Relay,
}

/// Selection weights and limits
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionConfig {
    /// Weight of the reputation score in the primary key
    pub reputation_weight: f64,
    /// Weight of region proximity in the primary key
    pub proximity_weight: f64,
    /// Candidate cap when a context does not set one
    pub max_candidates: usize,
    /// Minimum score for relay candidates
    pub relay_min_score: f64,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            reputation_weight: 1.0,
            proximity_weight: 0.0,
            max_candidates: 8,
            relay_min_score: 0.6,
        }
    }
}

impl SelectionConfig {
    /// Check configuration invariants
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for negative or all-zero weights, a zero
    /// candidate cap, or a relay threshold outside `[0, 1]`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reputation_weight < 0.0 || self.proximity_weight < 0.0 {
            return Err(ConfigError::new("selection weights must be non-negative"));
        }
        if self.reputation_weight + self.proximity_weight <= 0.0 {
            return Err(ConfigError::new("at least one selection weight must be positive"));
        }
        if self.max_candidates == 0 {
            return Err(ConfigError::new("max_candidates must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.relay_min_score) {
            return Err(ConfigError::new("relay_min_score must be within [0, 1]"));
        }
        Ok(())
    }
}

/// Parameters of one selection request
#[derive(Debug, Clone, PartialEq)]
pub struct TaskContext {
    /// Region of the requesting node
    pub requester_region: Option<RegionId>,
    /// Download or relay
    pub purpose: Purpose,
    /// Candidate cap; the configured default when `None`
    pub max_candidates: Option<usize>,
    /// Peers never to return
    pub exclude: HashSet<PeerId>,
    /// Minimum score; for relays the configured threshold applies when `None`
    pub min_score: Option<f64>,
}

impl TaskContext {
    /// Context for choosing chunk sources
    #[must_use]
    pub fn download(requester_region: Option<RegionId>) -> Self {
        Self {
            requester_region,
            purpose: Purpose::Download,
            max_candidates: None,
            exclude: HashSet::new(),
            min_score: None,
        }
    }

    /// Context for choosing relays
    #[must_use]
    pub fn relay(requester_region: Option<RegionId>) -> Self {
        Self {
            purpose: Purpose::Relay,
            ..Self::download(requester_region)
        }
    }

    /// Cap the number of candidates
    #[must_use]
    pub fn with_max_candidates(mut self, max: usize) -> Self {
        self.max_candidates = Some(max);
        self
    }

    /// Exclude a peer
    #[must_use]
    pub fn excluding(mut self, peer_id: PeerId) -> Self {
        self.exclude.insert(peer_id);
        self
    }

    /// Require a minimum score
    #[must_use]
    pub fn with_min_score(mut self, min_score: f64) -> Self {
        self.min_score = Some(min_score);
        self
    }
}

/// One ranked peer
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// Peer identifier
    pub peer_id: PeerId,
    /// Reputation score at selection time
    pub score: f64,
    /// Distance to the requester; `None` when either region is unknown
    pub distance_km: Option<f64>,
    /// Last activity, milliseconds since the Unix epoch
    pub last_seen: u64,
    /// Weighted primary key
    pub weight: f64,
}

/// Ranked peers for one request
///
/// Immutable: a newer selection replaces the list wholesale.
#[derive(Debug, Clone)]
pub struct CandidateList {
    candidates: Vec<Candidate>,
    computed_at: Instant,
}

impl CandidateList {
    /// An empty list
    #[must_use]
    pub fn empty() -> Self {
        Self {
            candidates: Vec::new(),
            computed_at: Instant::now(),
        }
    }

    /// Candidates, best first
    #[must_use]
    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    /// Candidate peer ids, best first
    pub fn peer_ids(&self) -> impl Iterator<Item = &PeerId> {
        self.candidates.iter().map(|c| &c.peer_id)
    }

    /// Rank of a peer, 0 being best
    #[must_use]
    pub fn position(&self, peer_id: &PeerId) -> Option<usize> {
        self.candidates.iter().position(|c| &c.peer_id == peer_id)
    }

    /// When the list was computed
    #[must_use]
    pub fn computed_at(&self) -> Instant {
        self.computed_at
    }

    /// Number of candidates
    #[must_use]
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    /// Whether there are no candidates
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

/// Ranks known peers for a task
#[derive(Debug, Clone)]
pub struct Selector {
    config: SelectionConfig,
    catalogue: Arc<RegionCatalogue>,
}

impl Selector {
    /// Create a selector over a region catalogue
    #[must_use]
    pub fn new(config: SelectionConfig, catalogue: Arc<RegionCatalogue>) -> Self {
        Self { config, catalogue }
    }

    /// Selection configuration
    #[must_use]
    pub fn config(&self) -> &SelectionConfig {
        &self.config
    }

    /// Rank `peers` for `ctx`
    #[must_use]
    pub fn select(
        &self,
        ctx: &TaskContext,
        peers: &[PeerRecord],
        reputation: &ReputationStore,
    ) -> CandidateList {
        let min_score = match ctx.purpose {
            Purpose::Download => ctx.min_score.unwrap_or(0.0),
            Purpose::Relay => ctx.min_score.unwrap_or(self.config.relay_min_score),
        };
        let limit = ctx.max_candidates.unwrap_or(self.config.max_candidates);

        let mut candidates: Vec<Candidate> = peers
            .iter()
            .filter(|peer| !ctx.exclude.contains(&peer.peer_id))
            .filter_map(|peer| {
                let score = reputation.score(&peer.peer_id);
                if score < min_score {
                    return None;
                }
                let distance_km = match (ctx.requester_region, peer.region) {
                    (Some(ours), Some(theirs)) => self.catalogue.proximity_km(ours, theirs),
                    _ => None,
                };
                let proximity =
                    distance_km.map_or(0.0, |d| (1.0 - d / MAX_DISTANCE_KM).clamp(0.0, 1.0));
                Some(Candidate {
                    peer_id: peer.peer_id.clone(),
                    score,
                    distance_km,
                    last_seen: peer.last_seen,
                    weight: self.config.reputation_weight * score
                        + self.config.proximity_weight * proximity,
                })
            })
            .collect();

        candidates.sort_by(rank);
        candidates.truncate(limit);

        tracing::trace!(
            "Selected {} of {} peers for {:?}",
            candidates.len(),
            peers.len(),
            ctx.purpose
        );

        CandidateList {
            candidates,
            computed_at: Instant::now(),
        }
    }
}

fn rank(a: &Candidate, b: &Candidate) -> Ordering {
    b.weight
        .total_cmp(&a.weight)
        .then_with(|| {
            let da = a.distance_km.unwrap_or(f64::INFINITY);
            let db = b.distance_km.unwrap_or(f64::INFINITY);
            da.total_cmp(&db)
        })
        .then_with(|| b.last_seen.cmp(&a.last_seen))
        .then_with(|| a.peer_id.cmp(&b.peer_id))
}
