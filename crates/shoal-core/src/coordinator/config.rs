//! Coordinator configuration.

use crate::error::ConfigError;
use std::time::Duration;

/// Bounded duplicate-race policy for slow chunks
///
/// When no chunk has completed for `stall_after`, a chunk that has itself been
/// in flight that long may be requested a second time from the next-ranked
/// peer. The first answer wins and the other request is abandoned.
#[derive(Debug, Clone, PartialEq)]
pub struct RacePolicy {
    /// Whether duplicates are issued at all
    pub enabled: bool,
    /// Cap on duplicated chunks as a fraction of chunks not yet completed
    ///
    /// Rounded down, so a tail smaller than `1 / max_fraction` chunks is
    /// never duplicated.
    pub max_fraction: f64,
    /// Progress-free time before racing starts
    pub stall_after: Duration,
}

impl Default for RacePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_fraction: 0.1,
            stall_after: Duration::from_secs(3),
        }
    }
}

/// Download coordinator tuning
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorConfig {
    /// Candidates considered per assignment pass
    pub max_candidates: usize,
    /// In-flight requests allowed per peer across all downloads
    pub per_peer_concurrency: usize,
    /// In-flight requests allowed per download
    pub max_in_flight: usize,
    /// Minimum per-chunk deadline
    pub deadline_floor: Duration,
    /// Throughput assumed when scaling deadlines, bytes per second
    pub estimated_throughput: u64,
    /// Interval between housekeeping passes
    pub pass_interval: Duration,
    /// Consecutive passes without a completed chunk before the task stalls
    pub max_idle_passes: u32,
    /// Largest file a download may buffer, in bytes
    pub max_file_size: u64,
    /// Duplicate-race policy
    pub race: RacePolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_candidates: 8,
            per_peer_concurrency: 4,
            max_in_flight: 16,
            deadline_floor: Duration::from_secs(5),
            estimated_throughput: 256 * 1024,
            pass_interval: Duration::from_millis(500),
            max_idle_passes: 120,
            max_file_size: 4 * 1024 * 1024 * 1024,
            race: RacePolicy::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Deadline for a chunk of `len` bytes
    #[must_use]
    pub fn chunk_deadline(&self, len: usize) -> Duration {
        let secs = len as f64 / self.estimated_throughput.max(1) as f64;
        let scaled = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);
        scaled.max(self.deadline_floor)
    }

    /// Consecutive idle passes tolerated for chunks of up to `chunk_len` bytes
    ///
    /// Never fewer than `max_idle_passes`, and always enough to cover a timed
    /// out attempt plus its reassignment, so a peer answering at the estimated
    /// throughput cannot stall the task.
    #[must_use]
    pub fn idle_pass_limit(&self, chunk_len: usize) -> u32 {
        let deadline = self.chunk_deadline(chunk_len).as_nanos();
        let interval = self.pass_interval.as_nanos().max(1);
        let covering = (2 * deadline).div_ceil(interval) + 1;
        self.max_idle_passes
            .max(u32::try_from(covering).unwrap_or(u32::MAX))
    }

    /// Progress-free time after which a task stalls
    #[must_use]
    pub fn stall_window(&self) -> Duration {
        self.pass_interval * self.max_idle_passes
    }

    /// Check configuration invariants
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for zero limits or intervals, a race fraction
    /// outside `[0, 1]`, or a stall window no longer than the deadline floor
    /// (a single slow chunk would otherwise stall the task).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_candidates == 0 || self.per_peer_concurrency == 0 || self.max_in_flight == 0 {
            return Err(ConfigError::new(
                "candidate, per-peer and in-flight limits must be at least 1",
            ));
        }
        if self.deadline_floor.is_zero() || self.pass_interval.is_zero() {
            return Err(ConfigError::new(
                "deadline_floor and pass_interval must be non-zero",
            ));
        }
        if self.estimated_throughput == 0 {
            return Err(ConfigError::new("estimated_throughput must be non-zero"));
        }
        if self.max_idle_passes == 0 {
            return Err(ConfigError::new("max_idle_passes must be at least 1"));
        }
        if self.stall_window() <= self.deadline_floor {
            return Err(ConfigError::new(
                "pass_interval * max_idle_passes must exceed deadline_floor",
            ));
        }
        if self.max_file_size == 0 {
            return Err(ConfigError::new("max_file_size must be non-zero"));
        }
        if !(0.0..=1.0).contains(&self.race.max_fraction) {
            return Err(ConfigError::new("race.max_fraction must be within [0, 1]"));
        }
        Ok(())
    }
}
