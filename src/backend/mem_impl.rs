use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;

use super::*;

/// A [`Backend`] keeping all files in memory.
///
/// Besides being the backend of choice for tests, it counts saves and can be
/// told to fail the next few of them.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    files: Mutex<BTreeMap<FileHandle, Bytes>>,
    saves: AtomicUsize,
    failing_saves: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn files(&self) -> MutexGuard<'_, BTreeMap<FileHandle, Bytes>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of successful [`Backend::save`] calls so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Makes the next `n` calls to [`Backend::save`] fail.
    pub fn fail_next_saves(&self, n: usize) {
        self.failing_saves.store(n, Ordering::SeqCst);
    }

    pub fn contains(&self, handle: &FileHandle) -> bool {
        self.files().contains_key(handle)
    }

    pub fn get(&self, handle: &FileHandle) -> Option<Bytes> {
        self.files().get(handle).cloned()
    }

    /// Replaces a stored file without going through [`Backend::save`].
    pub fn put_raw(&self, handle: FileHandle, data: impl Into<Bytes>) {
        self.files().insert(handle, data.into());
    }

    pub fn handles(&self, kind: FileKind) -> Vec<FileHandle> {
        self.files()
            .keys()
            .filter(|handle| handle.kind == kind)
            .copied()
            .collect()
    }
}

#[async_trait::async_trait]
impl Backend for MemoryBackend {
    type Error = io::Error;
    type Reader = io::Cursor<Bytes>;

    async fn save(&self, handle: &FileHandle, data: Vec<u8>) -> Result<u64, Self::Error> {
        let failing = self.failing_saves.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_saves.store(failing - 1, Ordering::SeqCst);
            return Err(io::Error::other(format!("injected failure saving {handle}")));
        }
        let len = data.len() as u64;
        self.files().insert(*handle, data.into());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(len)
    }

    async fn load(&self, handle: &FileHandle) -> Result<Self::Reader, Self::Error> {
        match self.files().get(handle) {
            Some(data) => Ok(io::Cursor::new(data.clone())),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{handle} not found"),
            )),
        }
    }

    async fn list(&self, repo_id: RepoId, kinds: &[FileKind]) -> Result<Vec<FileInfo>, Self::Error> {
        Ok(self
            .files()
            .iter()
            .filter(|(handle, _)| handle.repo_id == repo_id && kinds.contains(&handle.kind))
            .map(|(handle, data)| FileInfo {
                handle: *handle,
                size: data.len() as u64,
            })
            .collect())
    }

    async fn remove(&self, handle: &FileHandle) -> Result<(), Self::Error> {
        self.files().remove(handle);
        Ok(())
    }
}
