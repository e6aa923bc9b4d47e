//! Per-peer bookkeeping of stored bodies, known holders and quota.

use std::collections::{HashMap, HashSet};

use rand::seq::IteratorRandom;
use serde::{Deserialize, Serialize};

use crate::id::FileKey;
use crate::reference::RingReference;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFile {
    pub size: u64,
    pub replication_degree: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageLedger {
    /// Keys whose bytes live on this peer.
    stored: HashMap<FileKey, StoredFile>,

    /// Known holders of a key, unique per peer.
    locations: HashMap<FileKey, Vec<RingReference>>,

    /// Keys this peer backed up itself.
    requested: HashSet<FileKey>,

    quota_bytes: u64,
}

impl StorageLedger {
    pub fn new(quota_bytes: u64) -> Self {
        Self { quota_bytes, ..Self::default() }
    }

    pub fn quota(&self) -> u64 {
        self.quota_bytes
    }

    pub fn set_quota(&mut self, bytes: u64) {
        self.quota_bytes = bytes;
    }

    pub fn occupied(&self) -> u64 {
        self.stored.values().map(|f| f.size).sum()
    }

    pub fn is_over_quota(&self) -> bool {
        self.occupied() > self.quota_bytes
    }

    /// Whether a body of `size` bytes fits under the quota once it replaces
    /// whatever is already stored for `key`.
    pub fn fits(&self, key: FileKey, size: u64) -> bool {
        let current = self.stored.get(&key).map_or(0, |f| f.size);
        (self.occupied() - current).saturating_add(size) <= self.quota_bytes
    }

    pub fn is_stored(&self, key: FileKey) -> bool {
        self.stored.contains_key(&key)
    }

    pub fn stored(&self, key: FileKey) -> Option<StoredFile> {
        self.stored.get(&key).copied()
    }

    /// Sorted for stable reporting.
    pub fn stored_keys(&self) -> Vec<FileKey> {
        let mut keys: Vec<_> = self.stored.keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    pub fn record_stored(&mut self, key: FileKey, size: u64, replication_degree: u32) {
        self.stored.insert(key, StoredFile { size, replication_degree });
    }

    pub fn remove_stored(&mut self, key: FileKey) -> Option<StoredFile> {
        self.stored.remove(&key)
    }

    /// Uniformly random stored key, `None` once nothing is stored.
    pub fn random_stored(&self) -> Option<FileKey> {
        self.stored.keys().copied().choose(&mut rand::thread_rng())
    }

    /// Adds `holder` for `key` unless a reference with the same id is present.
    pub fn add_location(&mut self, key: FileKey, holder: RingReference) -> bool {
        let holders = self.locations.entry(key).or_default();
        if holders.iter().any(|h| h.id == holder.id) {
            return false;
        }
        holders.push(holder);
        true
    }

    pub fn remove_location(&mut self, key: FileKey, holder: &RingReference) -> bool {
        let Some(holders) = self.locations.get_mut(&key) else { return false };
        let before = holders.len();
        holders.retain(|h| h.id != holder.id);
        let removed = holders.len() != before;
        if holders.is_empty() {
            self.locations.remove(&key);
        }
        removed
    }

    pub fn locations(&self, key: FileKey) -> &[RingReference] {
        self.locations.get(&key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn all_locations(&self) -> impl Iterator<Item = (FileKey, &[RingReference])> {
        self.locations.iter().map(|(k, v)| (*k, v.as_slice()))
    }

    /// Drops the stored copy and every remembered holder of `key`.
    pub fn forget(&mut self, key: FileKey) -> Option<StoredFile> {
        self.locations.remove(&key);
        self.stored.remove(&key)
    }

    pub fn mark_requested(&mut self, key: FileKey) {
        self.requested.insert(key);
    }

    pub fn unmark_requested(&mut self, key: FileKey) -> bool {
        self.requested.remove(&key)
    }

    pub fn is_requested(&self, key: FileKey) -> bool {
        self.requested.contains(&key)
    }

    pub fn requested_keys(&self) -> Vec<FileKey> {
        let mut keys: Vec<_> = self.requested.iter().copied().collect();
        keys.sort_unstable();
        keys
    }
}
