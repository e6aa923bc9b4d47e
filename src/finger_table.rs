//! Finger table: `m` references used both as Chord fingers and as a
//! single-hop routing index.

use crate::id::{FileKey, PeerId};
use crate::reference::RingReference;

#[derive(Debug, Clone)]
pub struct FingerTable {
    local: RingReference,
    entries: Vec<RingReference>,
}

impl FingerTable {
    /// `size` entries, all naming the local peer until something better is known.
    pub fn new(size: usize, local: RingReference) -> Self {
        Self { local, entries: vec![local; size] }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True while no entry names a peer other than the local one.
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| e.id == self.local.id)
    }

    /// Panics if `i >= m`.
    pub fn get(&self, i: usize) -> RingReference {
        self.entries[i]
    }

    /// Panics if `i >= m`.
    pub fn set(&mut self, i: usize, reference: RingReference) {
        self.entries[i] = reference;
    }

    /// Coarse seeding at join time; stabilization refines entry 0 later.
    pub fn replace_all(&mut self, reference: RingReference) {
        self.entries.fill(reference);
    }

    /// Best locally known candidate for `key`: an exact match if present,
    /// else the entry with the greatest id not above `key`, else entry 0.
    pub fn nearest_peer(&self, key: FileKey) -> RingReference {
        let mut best: Option<RingReference> = None;
        for entry in &self.entries {
            if entry.id == key {
                return *entry;
            }
            if entry.id < key && best.is_none_or(|b| entry.id > b.id) {
                best = Some(*entry);
            }
        }
        best.unwrap_or(self.entries[0])
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.entries.iter().map(|e| e.id).collect()
    }

    /// Diagnostic dump, one `| i | id |` row per entry.
    pub fn print(&self) -> String {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, e)| format!("| {i} | {} |", e.id))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
