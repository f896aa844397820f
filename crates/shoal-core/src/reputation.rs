//! Peer reputation store.
//!
//! Scores live in `[0, 1]` and start at a neutral value. Each recorded outcome
//! moves the score a fixed fraction of the way toward 1 (success) or 0
//! (failure, timeout). Idle scores relax toward neutral with a configurable
//! half-life, so stale history stops dominating selection.

use crate::error::ConfigError;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use shoal_discovery::PeerId;
use std::time::{Duration, Instant};

/// Result of an interaction with a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// Chunk delivered and verified
    Success,
    /// Peer returned bad data or refused
    Failure,
    /// Peer did not answer in time
    Timeout,
}

/// Reputation tuning
#[derive(Debug, Clone, PartialEq)]
pub struct ReputationConfig {
    /// Score of a peer with no history
    pub neutral_score: f64,
    /// Fraction of the distance to 1.0 covered by a success
    pub success_step: f64,
    /// Fraction of the distance to 0.0 covered by a failure
    pub failure_step: f64,
    /// Fraction of the distance to 0.0 covered by a timeout
    pub timeout_step: f64,
    /// Idle time after which a score is halfway back to neutral
    pub decay_half_life: Duration,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            neutral_score: 0.5,
            success_step: 0.1,
            failure_step: 0.3,
            timeout_step: 0.15,
            decay_half_life: Duration::from_secs(600),
        }
    }
}

impl ReputationConfig {
    /// Check configuration invariants
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a step lies outside `(0, 1)`, the neutral score
    /// outside `[0, 1]`, a timeout is punished harder than a failure, or the
    /// half-life is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.neutral_score) {
            return Err(ConfigError::new("neutral_score must be within [0, 1]"));
        }
        for (name, step) in [
            ("success_step", self.success_step),
            ("failure_step", self.failure_step),
            ("timeout_step", self.timeout_step),
        ] {
            if !(step > 0.0 && step < 1.0) {
                return Err(ConfigError::new(format!("{name} must be within (0, 1)")));
            }
        }
        if self.timeout_step > self.failure_step {
            return Err(ConfigError::new(
                "timeout_step must not exceed failure_step",
            ));
        }
        if self.decay_half_life.is_zero() {
            return Err(ConfigError::new("decay_half_life must be non-zero"));
        }
        Ok(())
    }
}

/// Reputation of one peer
#[derive(Debug, Clone, PartialEq)]
pub struct ReputationEntry {
    /// Peer identifier
    pub peer_id: PeerId,
    /// Trust score in `[0, 1]`
    pub score: f64,
    /// Recorded successes
    pub success_count: u64,
    /// Recorded failures and timeouts
    pub failure_count: u64,
    /// Time of the last recorded outcome
    pub last_updated: Instant,
    /// Time up to which idle decay has been applied
    decayed_to: Instant,
}

/// Process-wide peer reputation
///
/// Shared by every download. Each entry is mutated under its own map shard
/// lock, so concurrent outcomes for one peer apply one after another.
#[derive(Debug)]
pub struct ReputationStore {
    config: ReputationConfig,
    entries: DashMap<PeerId, ReputationEntry>,
}

impl Default for ReputationStore {
    fn default() -> Self {
        Self::new(ReputationConfig::default())
    }
}

impl ReputationStore {
    /// Create an empty store
    #[must_use]
    pub fn new(config: ReputationConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
        }
    }

    /// Store configuration
    #[must_use]
    pub fn config(&self) -> &ReputationConfig {
        &self.config
    }

    /// Record an outcome, returning the updated score
    pub fn record(&self, peer_id: &PeerId, outcome: Outcome) -> f64 {
        self.record_at(peer_id, outcome, Instant::now())
    }

    /// Record an outcome observed at `now`
    pub fn record_at(&self, peer_id: &PeerId, outcome: Outcome, now: Instant) -> f64 {
        let mut entry = self
            .entries
            .entry(peer_id.clone())
            .or_insert_with(|| ReputationEntry {
                peer_id: peer_id.clone(),
                score: self.config.neutral_score,
                success_count: 0,
                failure_count: 0,
                last_updated: now,
                decayed_to: now,
            });

        let old = entry.score;
        entry.score = match outcome {
            Outcome::Success => {
                entry.success_count += 1;
                old + self.config.success_step * (1.0 - old)
            }
            Outcome::Failure => {
                entry.failure_count += 1;
                old - self.config.failure_step * old
            }
            Outcome::Timeout => {
                entry.failure_count += 1;
                old - self.config.timeout_step * old
            }
        }
        .clamp(0.0, 1.0);
        entry.last_updated = entry.last_updated.max(now);
        entry.decayed_to = entry.decayed_to.max(now);

        tracing::trace!(
            "Reputation {} {:?}: {:.3} -> {:.3}",
            peer_id.short(),
            outcome,
            old,
            entry.score
        );
        entry.score
    }

    /// Current score; the neutral default for an unknown peer
    ///
    /// Never creates an entry.
    #[must_use]
    pub fn score(&self, peer_id: &PeerId) -> f64 {
        self.entries
            .get(peer_id)
            .map_or(self.config.neutral_score, |entry| entry.score)
    }

    /// Copy of a peer's entry
    #[must_use]
    pub fn entry(&self, peer_id: &PeerId) -> Option<ReputationEntry> {
        self.entries.get(peer_id).map(|entry| entry.clone())
    }

    /// Relax every score toward neutral by the idle time up to `now`
    ///
    /// Idle time is measured from the later of the last outcome and the
    /// previous pass, so repeated passes compose into a single exponential
    /// decay. Entries touched after `now` are left alone.
    pub fn decay_pass(&self, now: Instant) {
        let half_life = self.config.decay_half_life.as_secs_f64();
        let neutral = self.config.neutral_score;

        for mut entry in self.entries.iter_mut() {
            let idle = now.saturating_duration_since(entry.decayed_to);
            if idle.is_zero() {
                continue;
            }
            let factor = 0.5_f64.powf(idle.as_secs_f64() / half_life);
            entry.score = (neutral + (entry.score - neutral) * factor).clamp(0.0, 1.0);
            entry.decayed_to = now;
        }
        tracing::debug!("Reputation decay pass over {} peers", self.entries.len());
    }

    /// Drop a peer's history
    pub fn forget(&self, peer_id: &PeerId) -> Option<ReputationEntry> {
        self.entries.remove(peer_id).map(|(_, entry)| entry)
    }

    /// Number of peers with history
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no peer has history
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy of every entry, highest score first
    #[must_use]
    pub fn snapshot(&self) -> Vec<ReputationEntry> {
        let mut entries: Vec<_> = self.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.peer_id.cmp(&b.peer_id))
        });
        entries
    }
}
