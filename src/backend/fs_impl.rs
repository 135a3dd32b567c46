use std::io;
use std::path::{Path, PathBuf};

use super::*;

const BLOBS_DIR: &str = "blobs";
const SNAPSHOTS_DIR: &str = "snapshots";
const SNAPSHOT_SUFFIX: &str = ".snapshot";

/// A [`Backend`] storing files in a local directory tree:
///
/// ```text
/// <root>/<repo id>/blobs/<first 2 hex chars>/<blob id>
/// <root>/<repo id>/snapshots/<hash>.snapshot
/// ```
#[derive(Debug, Clone)]
pub struct DirectoryBackend {
    root: PathBuf,
}

impl DirectoryBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn repo_dir(&self, repo_id: &RepoId) -> PathBuf {
        self.root.join(repo_id.to_hex())
    }

    fn path(&self, handle: &FileHandle) -> PathBuf {
        let repo_dir = self.repo_dir(&handle.repo_id);
        match handle.kind {
            FileKind::Blob => {
                let hex = handle.hash.to_hex();
                repo_dir.join(BLOBS_DIR).join(&hex[..2]).join(hex)
            }
            FileKind::Snapshot => repo_dir.join(SNAPSHOTS_DIR).join(handle.name()),
        }
    }

    /// Writes to a temp file next to `path`, then renames it into place so
    /// readers never see a partial file.
    async fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(format!(".tmp{}", rand::random::<u32>()));
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, data).await?;
        if let Err(err) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(err);
        }
        Ok(())
    }

    async fn list_dir(
        dir: &Path,
        repo_id: RepoId,
        kind: FileKind,
        out: &mut Vec<FileInfo>,
    ) -> io::Result<()> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err),
        };
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let hex = match kind {
                FileKind::Blob => Some(name),
                FileKind::Snapshot => name.strip_suffix(SNAPSHOT_SUFFIX),
            };
            match hex.map(BlobId::from_hex) {
                Some(Ok(hash)) => out.push(FileInfo {
                    handle: FileHandle {
                        repo_id,
                        kind,
                        hash,
                    },
                    size: metadata.len(),
                }),
                _ => tracing::warn!(path = %entry.path().display(), "unexpected file in backend"),
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Backend for DirectoryBackend {
    type Error = io::Error;
    type Reader = tokio::fs::File;

    async fn save(&self, handle: &FileHandle, data: Vec<u8>) -> Result<u64, Self::Error> {
        let path = self.path(handle);
        Self::atomic_write(&path, &data).await?;
        Ok(data.len() as u64)
    }

    async fn load(&self, handle: &FileHandle) -> Result<Self::Reader, Self::Error> {
        tokio::fs::File::open(self.path(handle)).await
    }

    async fn list(&self, repo_id: RepoId, kinds: &[FileKind]) -> Result<Vec<FileInfo>, Self::Error> {
        let repo_dir = self.repo_dir(&repo_id);
        let mut infos = vec![];

        if kinds.contains(&FileKind::Blob) {
            let blobs_dir = repo_dir.join(BLOBS_DIR);
            match tokio::fs::read_dir(&blobs_dir).await {
                Ok(mut prefixes) => {
                    while let Some(prefix) = prefixes.next_entry().await? {
                        if prefix.file_type().await?.is_dir() {
                            Self::list_dir(&prefix.path(), repo_id, FileKind::Blob, &mut infos)
                                .await?;
                        }
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
        }
        if kinds.contains(&FileKind::Snapshot) {
            let snapshots_dir = repo_dir.join(SNAPSHOTS_DIR);
            Self::list_dir(&snapshots_dir, repo_id, FileKind::Snapshot, &mut infos).await?;
        }
        Ok(infos)
    }

    async fn remove(&self, handle: &FileHandle) -> Result<(), Self::Error> {
        match tokio::fs::remove_file(self.path(handle)).await {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }
}
