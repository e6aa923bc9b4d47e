use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;

use crate::error::PeerError;
use crate::ledger::StorageLedger;

/// Durable home of a peer's ledger across restarts.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// `None` when nothing was saved yet.
    async fn load(&self) -> Result<Option<StorageLedger>, PeerError>;
    async fn save(&self, ledger: &StorageLedger) -> Result<(), PeerError>;
}

/// Ledger kept as JSON in a single file.
#[derive(Debug, Clone)]
pub struct JsonSnapshotStore {
    path: PathBuf,
}

impl JsonSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SnapshotStore for JsonSnapshotStore {
    async fn load(&self) -> Result<Option<StorageLedger>, PeerError> {
        let raw = match fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    async fn save(&self, ledger: &StorageLedger) -> Result<(), PeerError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(ledger)?;
        // write + rename: never half a snapshot on disk
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::RingId;

    #[tokio::test]
    async fn missing_snapshot_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSnapshotStore::new(dir.path().join("records.json"));
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn saved_ledger_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSnapshotStore::new(dir.path().join("node_1").join("records.json"));

        let mut ledger = StorageLedger::new(512);
        ledger.record_stored(RingId(3), 100, 1);
        ledger.mark_requested(RingId(4));
        store.save(&ledger).await.unwrap();

        assert_eq!(store.load().await.unwrap(), Some(ledger));
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        let store = JsonSnapshotStore::new(path);
        assert!(matches!(store.load().await, Err(PeerError::Snapshot(_))));
    }
}
