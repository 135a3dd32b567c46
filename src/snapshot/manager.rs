use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use crate::backend::{Backend, FileHandle};
use crate::crypto::{Crypto, VERSION};
use crate::datamodel::BlobId;
use crate::error::{Error, Result};
use crate::loader::Loader;

use super::Snapshot;

const SNAPSHOT_SUFFIX: &str = ".snapshot";

/// Stores and loads [`Snapshot`]s.
///
/// Snapshots are framed like blobs, but without padding:
///
/// ```text
/// [version][nonce][AEAD stream of: [u32 BE size][zstd(snapshot)]]
/// ```
///
/// They are also kept in a local cache directory, if one is configured, so
/// the backend is only hit once per snapshot.
pub struct SnapshotManager<B> {
    crypto: Arc<Crypto>,
    backend: Arc<B>,
    loader: Loader<B>,
    cache_dir: Option<PathBuf>,
    compression_level: i32,
    latest: Option<Snapshot>,
}

impl<B: Backend> SnapshotManager<B> {
    /// Snapshots get cached below `<cache_root>/<repo id>/`.
    pub fn new(
        crypto: Arc<Crypto>,
        backend: Arc<B>,
        cache_root: Option<PathBuf>,
        compression_level: i32,
    ) -> Self {
        let cache_dir = cache_root.map(|root| root.join(crypto.repo_id().to_hex()));
        Self {
            loader: Loader::new(crypto.clone(), backend.clone()),
            crypto,
            backend,
            cache_dir,
            compression_level,
            latest: None,
        }
    }

    /// The most recent snapshot seen by [`SnapshotManager::on_snapshots_loaded`].
    pub fn latest_snapshot(&self) -> Option<&Snapshot> {
        self.latest.as_ref()
    }

    /// Loads all the given snapshots, skipping those that fail to load.
    pub async fn on_snapshots_loaded(&mut self, handles: &[FileHandle]) -> Vec<Snapshot> {
        // a stale latest snapshot must not survive a switch to an empty repo
        self.latest = None;
        let mut snapshots = Vec::with_capacity(handles.len());
        for handle in handles {
            let snapshot = match self.load_snapshot(handle).await {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    tracing::error!(%handle, error = %err, "error loading snapshot");
                    continue;
                }
            };
            let latest_token = self.latest.as_ref().map_or(0, |latest| latest.token);
            if snapshot.token > latest_token {
                self.latest = Some(snapshot.clone());
            }
            snapshots.push(snapshot);
        }
        snapshots
    }

    /// Saves `snapshot` to the backend, and to the local cache while at it.
    pub async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<FileHandle> {
        let serialized = snapshot.to_bytes()?;
        let compressed = zstd::bulk::compress(&serialized, self.compression_level)?;
        let size = u32::try_from(compressed.len())
            .map_err(|_| Error::InvalidFormat("snapshot too large".into()))?;

        let mut plaintext = Vec::with_capacity(4 + compressed.len());
        plaintext.extend_from_slice(&size.to_be_bytes());
        plaintext.extend_from_slice(&compressed);

        let mut bytes = vec![VERSION];
        let ad = self.crypto.ad_for_version(VERSION);
        self.crypto.encrypt_into(&plaintext, &ad, &mut bytes)?;

        let hash = BlobId::from(blake3::hash(&bytes));
        let handle = FileHandle::snapshot(self.crypto.repo_id(), hash);
        self.backend
            .save(&handle, bytes.clone())
            .await
            .map_err(Error::backend)?;
        tracing::info!(%handle, token = snapshot.token, "saved snapshot");

        if let Err(err) = self.write_cache(&handle, &bytes).await {
            tracing::error!(%handle, error = %err, "error saving snapshot to cache");
        }
        Ok(handle)
    }

    /// Removes a snapshot from the backend and the local cache.
    pub async fn remove_snapshot(&self, handle: &FileHandle) -> Result<()> {
        self.backend.remove(handle).await.map_err(Error::backend)?;
        if let Some(dir) = &self.cache_dir {
            match tokio::fs::remove_file(dir.join(handle.name())).await {
                Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err.into()),
                _ => {}
            }
        }
        Ok(())
    }

    /// Loads a snapshot, from the local cache if possible.
    pub async fn load_snapshot(&self, handle: &FileHandle) -> Result<Snapshot> {
        if let Some(dir) = &self.cache_dir {
            let path = dir.join(handle.name());
            match tokio::fs::read(&path).await {
                Ok(cached) => match self.loader.decode(handle, &cached).await {
                    Ok(plaintext) => return Snapshot::from_bytes(&plaintext),
                    Err(err) => {
                        tracing::error!(%handle, error = %err, "error loading snapshot from cache, trying backend");
                    }
                },
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }

        let ciphertext = self.loader.load_ciphertext(handle).await?;
        let plaintext = self.loader.decode(handle, &ciphertext).await?;
        let snapshot = Snapshot::from_bytes(&plaintext)?;
        if let Err(err) = self.write_cache(handle, &ciphertext).await {
            tracing::error!(%handle, error = %err, "error saving snapshot to cache");
        }
        Ok(snapshot)
    }

    /// All snapshots in the local cache, without touching the backend.
    pub async fn load_cached_snapshots(&self) -> Result<Vec<Snapshot>> {
        let Some(dir) = &self.cache_dir else {
            return Ok(vec![]);
        };
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(err) => return Err(err.into()),
        };

        let mut snapshots = vec![];
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let hash = file_name
                .to_str()
                .and_then(|name| name.strip_suffix(SNAPSHOT_SUFFIX))
                .and_then(|hex| BlobId::from_hex(hex).ok());
            let Some(hash) = hash else {
                tracing::error!(path = %entry.path().display(), "unexpected file in snapshot cache");
                continue;
            };
            let handle = FileHandle::snapshot(self.crypto.repo_id(), hash);
            let cached = tokio::fs::read(entry.path()).await?;
            let plaintext = self.loader.decode(&handle, &cached).await?;
            snapshots.push(Snapshot::from_bytes(&plaintext)?);
        }
        snapshots.sort_by_key(|snapshot| snapshot.token);
        Ok(snapshots)
    }

    async fn write_cache(&self, handle: &FileHandle, bytes: &[u8]) -> io::Result<()> {
        let Some(dir) = &self.cache_dir else {
            return Ok(());
        };
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(dir.join(handle.name()), bytes).await
    }
}
