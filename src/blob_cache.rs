use std::collections::HashMap;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::backend::{FileInfo, FileKind};
use crate::datamodel::{Blob, BlobId, ChunkId};
use crate::error::Result;
use crate::snapshot::Snapshot;

/// Knows which chunks already have a [`Blob`] on the backend, so they don't
/// need to be uploaded again.
///
/// The mapping is built from the snapshots on the backend and from a local
/// cache file, which has all blobs created since the last snapshot was saved.
/// That way a backup run that got interrupted does not re-upload what it
/// already managed to store.
#[derive(Debug, Default)]
pub struct BlobCache {
    blobs: HashMap<ChunkId, Blob>,
    cache_file: Option<PathBuf>,
}

#[derive(Serialize, Deserialize)]
struct CacheRecord {
    chunk_id: ChunkId,
    blob: Blob,
}

impl BlobCache {
    /// A cache that persists new blobs to `cache_file`, if given.
    pub fn new(cache_file: Option<PathBuf>) -> Self {
        Self {
            blobs: HashMap::new(),
            cache_file,
        }
    }

    /// Rebuilds the mapping from the blobs currently on the backend and the
    /// given snapshots.
    ///
    /// A mapping is only installed if its blob is listed with exactly the
    /// recorded size. When sources disagree about a chunk, the first one wins.
    /// Snapshots come first, in the given order, then the local cache file.
    pub async fn populate(&mut self, blob_infos: &[FileInfo], snapshots: &[Snapshot]) {
        self.blobs.clear();
        let on_backend: HashMap<BlobId, u64> = blob_infos
            .iter()
            .filter(|info| info.handle.kind == FileKind::Blob)
            .map(|info| (info.handle.hash, info.size))
            .collect();

        for snapshot in snapshots {
            self.add_snapshot(snapshot, &on_backend);
        }
        self.load_persistent_cache(&on_backend).await;
        tracing::info!(
            blobs = on_backend.len(),
            snapshots = snapshots.len(),
            cached = self.blobs.len(),
            "populated blob cache"
        );
    }

    pub fn get(&self, chunk_id: &ChunkId) -> Option<Blob> {
        self.blobs.get(chunk_id).copied()
    }

    /// Records a blob that was just saved to the backend.
    pub async fn put(&mut self, chunk_id: ChunkId, blob: Blob) -> Result<()> {
        let previous = self.blobs.insert(chunk_id, blob);
        if previous.is_none() {
            if let Some(path) = &self.cache_file {
                let record = postcard::to_stdvec(&CacheRecord { chunk_id, blob })?;
                let mut file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await?;
                file.write_all(&record).await?;
                file.flush().await?;
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    /// Frees the in-memory mapping at the end of a run.
    pub fn clear(&mut self) {
        tracing::debug!("clearing blob cache");
        self.blobs.clear();
    }

    /// Deletes the persistent cache file.
    ///
    /// Needed once a snapshot with all cached blobs was saved, and when
    /// switching to a repository the cached blobs may not exist in.
    pub async fn clear_local_cache(&self) -> Result<()> {
        let Some(path) = &self.cache_file else {
            return Ok(());
        };
        tracing::debug!(path = %path.display(), "clearing local blob cache");
        match tokio::fs::remove_file(path).await {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }

    async fn load_persistent_cache(&mut self, on_backend: &HashMap<BlobId, u64>) {
        let Some(path) = &self.cache_file else {
            return;
        };
        let contents = match tokio::fs::read(path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::debug!("no local blob cache found");
                return;
            }
            // a broken cache only costs us some duplicate uploads
            Err(err) => {
                tracing::error!(error = %err, "error loading local blob cache");
                return;
            }
        };

        let mut rest = &contents[..];
        while !rest.is_empty() {
            let record = match postcard::take_from_bytes::<CacheRecord>(rest) {
                Ok((record, tail)) => {
                    rest = tail;
                    record
                }
                Err(err) => {
                    tracing::error!(error = %err, "truncated local blob cache");
                    break;
                }
            };
            let blob = record.blob;
            match on_backend.get(&blob.id) {
                Some(&size) if size == blob.length as u64 => {
                    self.install(record.chunk_id, blob);
                }
                Some(size) => tracing::warn!(blob = ?blob.id, size, "cached blob has different size on backend"),
                None => tracing::warn!(blob = ?blob.id, "cached blob is missing from backend"),
            }
        }
    }

    fn add_snapshot(&mut self, snapshot: &Snapshot, on_backend: &HashMap<BlobId, u64>) {
        for (chunk_id, blob) in &snapshot.blobs {
            match on_backend.get(&blob.id) {
                Some(&size) if size == blob.length as u64 => self.install(*chunk_id, *blob),
                Some(size) => tracing::warn!(blob = ?blob.id, size, "blob has unexpected size"),
                None => tracing::warn!(blob = ?blob.id, token = snapshot.token, "blob from snapshot is missing"),
            }
        }
    }

    fn install(&mut self, chunk_id: ChunkId, blob: Blob) {
        let previous = self.blobs.entry(chunk_id).or_insert(blob);
        if previous.id != blob.id {
            tracing::warn!(?chunk_id, "chunk had more than one blob");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use crate::backend::FileHandle;
    use crate::datamodel::RepoId;
    use crate::snapshot::DeviceInfo;

    use super::*;

    const REPO: RepoId = RepoId([1; 32]);

    fn blob(id: u8, length: u32) -> Blob {
        Blob {
            id: BlobId([id; 32]),
            length,
            uncompressed_length: length * 2,
        }
    }

    fn info(blob: &Blob) -> FileInfo {
        FileInfo {
            handle: FileHandle::blob(REPO, blob.id),
            size: blob.length as u64,
        }
    }

    fn snapshot(token: u64, blobs: &[(ChunkId, Blob)]) -> Snapshot {
        Snapshot {
            version: 2,
            token,
            device: DeviceInfo::default(),
            apps: BTreeMap::new(),
            icon_chunk_ids: vec![],
            blobs: blobs.iter().copied().collect(),
        }
    }

    #[tokio::test]
    async fn test_populate_from_snapshots() {
        let (c1, c2, c3, c4) = (ChunkId([1; 32]), ChunkId([2; 32]), ChunkId([3; 32]), ChunkId([4; 32]));
        let (b1, b2, b3, b4) = (blob(1, 10), blob(2, 20), blob(3, 30), blob(4, 40));
        let mut resized = info(&b4);
        resized.size = 41;

        let infos = vec![info(&b1), info(&b2), resized, info(&b3)];
        let snapshots = vec![
            snapshot(1, &[(c1, b1), (c2, b2), (c4, b4)]),
            // disagrees about c1, first one wins
            snapshot(2, &[(c1, b3), (c3, blob(5, 50))]),
        ];

        let mut cache = BlobCache::new(None);
        cache.populate(&infos, &snapshots).await;
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&c1), Some(b1));
        assert_eq!(cache.get(&c2), Some(b2));
        // missing from the backend
        assert_eq!(cache.get(&c3), None);
        // wrong size on the backend
        assert_eq!(cache.get(&c4), None);

        // populating starts from scratch
        cache.populate(&[], &snapshots).await;
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_persistent_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blobs.cache");
        let (c1, c2, c3) = (ChunkId([1; 32]), ChunkId([2; 32]), ChunkId([3; 32]));
        let (b1, b2, b3) = (blob(1, 10), blob(2, 20), blob(3, 30));

        let mut cache = BlobCache::new(Some(path.clone()));
        cache.put(c1, b1).await.unwrap();
        cache.put(c2, b2).await.unwrap();
        cache.put(c3, b3).await.unwrap();
        // known mappings are not written twice
        cache.put(c1, b1).await.unwrap();
        cache.clear();
        assert!(cache.is_empty());

        let mut resized = info(&b2);
        resized.size = 21;
        let mut cache = BlobCache::new(Some(path.clone()));
        cache.populate(&[info(&b1), resized], &[]).await;
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&c1), Some(b1));

        cache.clear_local_cache().await.unwrap();
        assert!(!path.exists());
        cache.clear_local_cache().await.unwrap();
        cache.populate(&[info(&b1)], &[]).await;
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_conflicting_persistent_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blobs.cache");
        let (c1, c2) = (ChunkId([1; 32]), ChunkId([2; 32]));
        let (b1, b2, b3, b4) = (blob(1, 10), blob(2, 20), blob(3, 30), blob(4, 40));

        // records for the same chunk in separate runs
        let mut cache = BlobCache::new(Some(path.clone()));
        cache.put(c1, b1).await.unwrap();
        cache.put(c2, b3).await.unwrap();
        let mut cache = BlobCache::new(Some(path.clone()));
        cache.put(c1, b2).await.unwrap();

        let infos = [info(&b1), info(&b2), info(&b3), info(&b4)];
        cache.populate(&infos, &[]).await;
        assert_eq!(cache.get(&c1), Some(b1));
        assert_eq!(cache.get(&c2), Some(b3));

        // snapshots win over the local cache file
        cache.populate(&infos, &[snapshot(1, &[(c2, b4)])]).await;
        assert_eq!(cache.get(&c1), Some(b1));
        assert_eq!(cache.get(&c2), Some(b4));
    }

    #[tokio::test]
    async fn test_truncated_persistent_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blobs.cache");
        let (c1, c2) = (ChunkId([1; 32]), ChunkId([2; 32]));
        let (b1, b2) = (blob(1, 10), blob(2, 20));

        let mut cache = BlobCache::new(Some(path.clone()));
        cache.put(c1, b1).await.unwrap();
        cache.put(c2, b2).await.unwrap();

        let contents = std::fs::read(&path).unwrap();
        std::fs::write(&path, &contents[..contents.len() - 3]).unwrap();

        cache.populate(&[info(&b1), info(&b2)], &[]).await;
        assert_eq!(cache.get(&c1), Some(b1));
        assert_eq!(cache.get(&c2), None);
    }
}
