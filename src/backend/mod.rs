use core::fmt;

use tokio::io::AsyncRead;

use crate::datamodel::{BlobId, RepoId};

pub mod fs_impl;
pub mod mem_impl;

pub use fs_impl::DirectoryBackend;
pub use mem_impl::MemoryBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FileKind {
    Blob,
    Snapshot,
}

/// A content handle on the backend: the repository plus the hash of the
/// stored bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileHandle {
    pub repo_id: RepoId,
    pub kind: FileKind,
    pub hash: BlobId,
}

impl FileHandle {
    pub fn blob(repo_id: RepoId, id: BlobId) -> Self {
        Self {
            repo_id,
            kind: FileKind::Blob,
            hash: id,
        }
    }

    pub fn snapshot(repo_id: RepoId, hash: BlobId) -> Self {
        Self {
            repo_id,
            kind: FileKind::Snapshot,
            hash,
        }
    }

    /// The file name a handle is stored under, unique within its kind.
    pub fn name(&self) -> String {
        match self.kind {
            FileKind::Blob => self.hash.to_hex(),
            FileKind::Snapshot => format!("{}.snapshot", self.hash.to_hex()),
        }
    }
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({:?}, {})", self.kind, self.repo_id, self.hash)
    }
}

impl fmt::Display for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    pub handle: FileHandle,
    pub size: u64,
}

/// A content-addressed store the pipeline saves blobs and snapshots to.
///
/// Files are never updated in place. Saving a handle that already exists
/// with the same bytes is a harmless overwrite.
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;
    type Reader: AsyncRead + Send + Unpin;

    /// Stores `data` under `handle` and returns the number of bytes written.
    async fn save(&self, handle: &FileHandle, data: Vec<u8>) -> Result<u64, Self::Error>;

    async fn load(&self, handle: &FileHandle) -> Result<Self::Reader, Self::Error>;

    /// Lists all files of the given kinds within one repository.
    async fn list(&self, repo_id: RepoId, kinds: &[FileKind]) -> Result<Vec<FileInfo>, Self::Error>;

    async fn remove(&self, handle: &FileHandle) -> Result<(), Self::Error>;
}
