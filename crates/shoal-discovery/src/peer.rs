//! Peer identifiers and the locally known peer set.

use crate::region::RegionId;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Session-scoped peer identifier issued by the rendezvous server
///
/// Not stable across reconnects: a new session gets a new id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Wrap an identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random 128-bit identifier, hex encoded
    #[must_use]
    pub fn generate() -> Self {
        Self(hex::encode(rand::random::<[u8; 16]>()))
    }

    /// Identifier as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 characters, for logs
    #[must_use]
    pub fn short(&self) -> &str {
        let end = self.0.char_indices().nth(8).map_or(self.0.len(), |(i, _)| i);
        &self.0[..end]
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Milliseconds since the Unix epoch
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// A peer known through the rendezvous channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Peer identifier
    pub peer_id: PeerId,
    /// Last activity, milliseconds since the Unix epoch
    pub last_seen: u64,
    /// Announced region, if any
    pub region: Option<RegionId>,
}

impl PeerRecord {
    /// Create a record
    #[must_use]
    pub fn new(peer_id: PeerId, last_seen: u64, region: Option<RegionId>) -> Self {
        Self {
            peer_id,
            last_seen,
            region,
        }
    }

    /// Whether the peer has been silent for longer than `threshold`
    #[must_use]
    pub fn is_stale(&self, now: u64, threshold: Duration) -> bool {
        now.saturating_sub(self.last_seen) > threshold.as_millis() as u64
    }
}

/// Process-wide set of reachable peers
///
/// Written by the rendezvous event pump; read by candidate selection for every
/// concurrent download. Each record is mutated under its shard lock only.
#[derive(Debug, Default)]
pub struct PeerTable {
    records: DashMap<PeerId, PeerRecord>,
}

impl PeerTable {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the known set with a pushed peer list
    ///
    /// The pushed list is authoritative: peers absent from it are dropped.
    /// `local` (our own session id) is never stored. A record's `last_seen`
    /// never moves backwards.
    pub fn apply_peer_list(&self, peers: &[PeerRecord], local: Option<&PeerId>) {
        self.records.retain(|id, _| peers.iter().any(|p| &p.peer_id == id));

        for peer in peers {
            if Some(&peer.peer_id) == local {
                continue;
            }
            self.records
                .entry(peer.peer_id.clone())
                .and_modify(|existing| {
                    existing.last_seen = existing.last_seen.max(peer.last_seen);
                    if peer.region.is_some() {
                        existing.region = peer.region;
                    }
                })
                .or_insert_with(|| peer.clone());
        }
    }

    /// Record activity from a peer; unknown peers are added
    pub fn touch(&self, peer_id: &PeerId, now: u64) {
        self.records
            .entry(peer_id.clone())
            .and_modify(|existing| existing.last_seen = existing.last_seen.max(now))
            .or_insert_with(|| PeerRecord::new(peer_id.clone(), now, None));
    }

    /// Remove a peer
    pub fn remove(&self, peer_id: &PeerId) -> Option<PeerRecord> {
        self.records.remove(peer_id).map(|(_, record)| record)
    }

    /// Drop peers silent for longer than `threshold`, returning how many went
    pub fn prune_stale(&self, now: u64, threshold: Duration) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_stale(now, threshold));
        before - self.records.len()
    }

    /// Look up a peer
    #[must_use]
    pub fn get(&self, peer_id: &PeerId) -> Option<PeerRecord> {
        self.records.get(peer_id).map(|r| r.clone())
    }

    /// Copy of every record, ordered by peer id
    #[must_use]
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        let mut records: Vec<_> = self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        records
    }

    /// Number of known peers
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no peer is known
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, last_seen: u64) -> PeerRecord {
        PeerRecord::new(PeerId::new(id), last_seen, None)
    }

    #[test]
    fn test_generate_peer_id_unique() {
        let a = PeerId::generate();
        let b = PeerId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert_eq!(a.short().len(), 8);
    }

    #[test]
    fn test_apply_peer_list_replaces_and_skips_local() {
        let table = PeerTable::new();
        let local = PeerId::new("me");

        table.apply_peer_list(&[record("a", 10), record("b", 20), record("me", 30)], Some(&local));
        assert_eq!(table.len(), 2);
        assert!(table.get(&local).is_none());

        // b disconnected
        table.apply_peer_list(&[record("a", 40)], Some(&local));
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&PeerId::new("a")).unwrap().last_seen, 40);
        assert!(table.get(&PeerId::new("b")).is_none());
    }

    #[test]
    fn test_apply_peer_list_keeps_newer_last_seen() {
        let table = PeerTable::new();
        table.touch(&PeerId::new("a"), 100);
        table.apply_peer_list(&[record("a", 50)], None);
        assert_eq!(table.get(&PeerId::new("a")).unwrap().last_seen, 100);
    }

    #[test]
    fn test_apply_peer_list_keeps_known_region() {
        let table = PeerTable::new();
        let with_region = PeerRecord::new(PeerId::new("a"), 1, Some(RegionId::EastAsia));
        table.apply_peer_list(&[with_region], None);
        table.apply_peer_list(&[record("a", 2)], None);
        assert_eq!(
            table.get(&PeerId::new("a")).unwrap().region,
            Some(RegionId::EastAsia)
        );
    }

    #[test]
    fn test_touch_and_prune() {
        let table = PeerTable::new();
        table.touch(&PeerId::new("old"), 1_000);
        table.touch(&PeerId::new("fresh"), 9_000);

        let removed = table.prune_stale(10_000, Duration::from_secs(5));
        assert_eq!(removed, 1);
        assert!(table.get(&PeerId::new("fresh")).is_some());
    }

    #[test]
    fn test_snapshot_sorted() {
        let table = PeerTable::new();
        table.touch(&PeerId::new("c"), 1);
        table.touch(&PeerId::new("a"), 1);
        table.touch(&PeerId::new("b"), 1);
        let ids: Vec<_> = table
            .snapshot()
            .into_iter()
            .map(|r| r.peer_id.as_str().to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
