//! Per-peer in-flight accounting shared by all downloads.

use dashmap::DashMap;
use shoal_discovery::PeerId;
use std::sync::Arc;

/// In-flight request counts per peer, across every download in the process
#[derive(Debug, Clone, Default)]
pub struct PeerLoad {
    counts: Arc<DashMap<PeerId, usize>>,
}

impl PeerLoad {
    /// Create an empty tracker
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a slot on `peer` if fewer than `limit` are in use
    #[must_use]
    pub fn try_acquire(&self, peer: &PeerId, limit: usize) -> Option<LoadGuard> {
        let mut count = self.counts.entry(peer.clone()).or_insert(0);
        if *count >= limit {
            return None;
        }
        *count += 1;
        drop(count);

        Some(LoadGuard {
            counts: self.counts.clone(),
            peer: peer.clone(),
        })
    }

    /// Current in-flight count for `peer`
    #[must_use]
    pub fn current(&self, peer: &PeerId) -> usize {
        self.counts.get(peer).map_or(0, |count| *count)
    }
}

/// A reserved slot; released on drop
#[derive(Debug)]
pub struct LoadGuard {
    counts: Arc<DashMap<PeerId, usize>>,
    peer: PeerId,
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.counts.remove_if_mut(&self.peer, |_, count| {
            *count = count.saturating_sub(1);
            *count == 0
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_respects_limit() {
        let load = PeerLoad::new();
        let peer = PeerId::new("a");

        let first = load.try_acquire(&peer, 2).unwrap();
        let second = load.try_acquire(&peer, 2).unwrap();
        assert!(load.try_acquire(&peer, 2).is_none());
        assert_eq!(load.current(&peer), 2);

        drop(first);
        assert_eq!(load.current(&peer), 1);
        let third = load.try_acquire(&peer, 2);
        assert!(third.is_some());

        drop(second);
        drop(third);
        assert_eq!(load.current(&peer), 0);
    }

    #[test]
    fn test_load_shared_between_clones() {
        let load = PeerLoad::new();
        let other = load.clone();
        let peer = PeerId::new("a");

        let _guard = load.try_acquire(&peer, 1).unwrap();
        assert!(other.try_acquire(&peer, 1).is_none());
    }
}
