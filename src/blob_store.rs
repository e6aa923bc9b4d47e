use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;

use crate::id::{FileKey, PeerId};

/// On-disk layout of one peer:
///
/// ```text
/// <root>/node_<id>/backup/<key>     bodies held for the ring
/// <root>/node_<id>/restore/<name>   files this peer asked to restore
/// <root>/node_<id>/records.json     ledger snapshot
/// ```
#[derive(Debug, Clone)]
pub struct BlobStore {
    node_dir: PathBuf,
}

impl BlobStore {
    pub fn new(root: &Path, id: PeerId) -> Self {
        Self { node_dir: root.join(format!("node_{id}")) }
    }

    pub fn node_dir(&self) -> &Path {
        &self.node_dir
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.node_dir.join("backup")
    }

    pub fn restore_dir(&self) -> PathBuf {
        self.node_dir.join("restore")
    }

    pub async fn init(&self) -> io::Result<()> {
        fs::create_dir_all(self.backup_dir()).await?;
        fs::create_dir_all(self.restore_dir()).await
    }

    fn blob_path(&self, key: FileKey) -> PathBuf {
        self.backup_dir().join(key.to_string())
    }

    pub async fn save(&self, key: FileKey, data: &[u8]) -> io::Result<()> {
        fs::write(self.blob_path(key), data).await
    }

    pub async fn read(&self, key: FileKey) -> io::Result<Vec<u8>> {
        fs::read(self.blob_path(key)).await
    }

    /// Removing a blob that is already gone is not an error.
    pub async fn remove(&self, key: FileKey) -> io::Result<()> {
        match fs::remove_file(self.blob_path(key)).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Writes a restored file under the final component of `name`.
    pub async fn save_restored(&self, name: &str, data: &[u8]) -> io::Result<PathBuf> {
        let path = self.restore_dir().join(sanitize_filename(name));
        fs::write(&path, data).await?;
        Ok(path)
    }
}

fn sanitize_filename(name: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut out = String::with_capacity(base.len());
    for ch in base.chars() {
        let bad = ch == '/' || ch == '\\' || ch == '\0' || ch == ':' || ch == '\n' || ch == '\r';
        if bad { out.push('_'); } else { out.push(ch); }
    }
    if out.is_empty() { "_".into() } else { out }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::RingId;

    #[tokio::test]
    async fn save_read_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path(), RingId(42));
        store.init().await.unwrap();
        assert!(store.node_dir().ends_with("node_42"));

        store.save(RingId(7), b"hello").await.unwrap();
        assert_eq!(store.read(RingId(7)).await.unwrap(), b"hello");

        store.remove(RingId(7)).await.unwrap();
        assert!(store.read(RingId(7)).await.is_err());
        store.remove(RingId(7)).await.unwrap();
    }

    #[tokio::test]
    async fn restored_files_keep_their_base_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path(), RingId(1));
        store.init().await.unwrap();

        let path = store.save_restored("/tmp/some/report.txt", b"x").await.unwrap();
        assert_eq!(path, store.restore_dir().join("report.txt"));
    }

    #[test]
    fn sanitizes_odd_names() {
        assert_eq!(sanitize_filename("a:b"), "a_b");
        assert_eq!(sanitize_filename(""), "_");
        assert_eq!(sanitize_filename("dir/.."), "_");
    }
}
