use tokio::io::{AsyncRead, AsyncReadExt};

use crate::config::FullBackupConfig;
use crate::datamodel::BackupData;
use crate::error::{ensure_state, Error, Result};
use crate::receiver::BackupSink;

/// Outcome of handing more bytes to a full backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Ok,
    /// The app exceeded its quota, its backup needs to be cancelled.
    QuotaExceeded,
}

/// Outcome of checking the announced size of a full backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeCheck {
    Ok,
    /// Nothing to back up.
    Rejected,
    QuotaExceeded,
}

struct FullBackupState {
    package_name: String,
    reader: Box<dyn AsyncRead + Send + Unpin>,
    size: u64,
}

impl FullBackupState {
    fn owner(&self) -> String {
        format!("FullBackup {}", self.package_name)
    }
}

/// Backs up the data stream of one app at a time, in the increments the OS
/// announces.
pub struct FullBackup {
    config: FullBackupConfig,
    state: Option<FullBackupState>,
    buffer: Vec<u8>,
}

impl FullBackup {
    pub fn new(config: FullBackupConfig) -> Self {
        Self {
            config,
            state: None,
            buffer: vec![],
        }
    }

    pub fn has_state(&self) -> bool {
        self.state.is_some()
    }

    pub fn current_package(&self) -> Option<&str> {
        self.state.as_ref().map(|state| state.package_name.as_str())
    }

    pub fn quota(&self) -> u64 {
        self.config.effective_quota()
    }

    pub fn check_full_backup_size(&self, size: i64) -> SizeCheck {
        tracing::info!(size, "checking full backup size");
        if size <= 0 {
            SizeCheck::Rejected
        } else if size as u64 > self.quota() {
            SizeCheck::QuotaExceeded
        } else {
            SizeCheck::Ok
        }
    }

    pub fn perform_backup<R>(&mut self, package_name: &str, reader: R) -> Result<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        ensure_state!(
            self.state.is_none(),
            "unexpected full backup state for {:?}",
            self.current_package()
        );
        tracing::info!(package_name, "performing full backup");
        self.state = Some(FullBackupState {
            package_name: package_name.to_owned(),
            reader: Box::new(reader),
            size: 0,
        });
        Ok(())
    }

    /// Reads the next `num_bytes` from the app and hands them to `sink`.
    ///
    /// Once the total crosses the quota, nothing is read anymore and
    /// [`SendStatus::QuotaExceeded`] is returned. On errors, everything received
    /// for the app is dropped.
    pub async fn send_backup_data<S>(&mut self, sink: &mut S, num_bytes: usize) -> Result<SendStatus>
    where
        S: BackupSink + ?Sized,
    {
        let quota = self.quota();
        let Some(state) = self.state.as_mut() else {
            return Err(Error::IllegalState("no full backup state".into()));
        };
        state.size += num_bytes as u64;
        if state.size > quota {
            tracing::warn!(
                package_name = %state.package_name,
                size = state.size,
                quota,
                "full backup exceeds quota"
            );
            return Ok(SendStatus::QuotaExceeded);
        }
        tracing::trace!(num_bytes, total = state.size, "sending full backup data");

        let chunk_len = self.config.read_buffer_size.min(num_bytes);
        self.buffer.resize(chunk_len, 0);
        let owner = state.owner();
        let mut remaining = num_bytes;
        while remaining > 0 {
            let len = remaining.min(self.buffer.len());
            let buffer = &mut self.buffer[..len];
            let result = match state.reader.read_exact(buffer).await {
                Ok(_) => sink.add_bytes(&owner, buffer).await,
                Err(err) => Err(err.into()),
            };
            if let Err(err) = result {
                tracing::error!(package_name = %state.package_name, error = %err, "error sending full backup data");
                self.state = None;
                sink.discard(&owner)?;
                return Err(err);
            }
            remaining -= len;
        }
        Ok(SendStatus::Ok)
    }

    /// Drops the current app and everything received for it.
    pub fn cancel_full_backup<S>(&mut self, sink: &mut S) -> Result<()>
    where
        S: BackupSink + ?Sized,
    {
        let Some(state) = self.state.take() else {
            return Err(Error::IllegalState("no full backup state to cancel".into()));
        };
        tracing::info!(package_name = %state.package_name, "cancelling full backup");
        sink.discard(&state.owner())
    }

    /// Drops whatever app is still in flight, if any.
    ///
    /// For ending a run the OS did not wind down properly.
    pub fn clear_state<S>(&mut self, sink: &mut S)
    where
        S: BackupSink + ?Sized,
    {
        let Some(state) = self.state.take() else {
            return;
        };
        tracing::warn!(package_name = %state.package_name, "full backup still in progress, discarding it");
        if let Err(err) = sink.discard(&state.owner()) {
            tracing::error!(package_name = %state.package_name, error = %err, "error discarding full backup");
        }
    }

    /// Ends the backup of the current app and returns what it was stored as.
    pub async fn finish_backup<S>(&mut self, sink: &mut S) -> Result<BackupData>
    where
        S: BackupSink + ?Sized,
    {
        let Some(state) = self.state.take() else {
            return Err(Error::IllegalState("no full backup state to finish".into()));
        };
        tracing::info!(package_name = %state.package_name, size = state.size, "finishing full backup");
        sink.finalize(&state.owner()).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::backend::MemoryBackend;
    use crate::blob_cache::BlobCache;
    use crate::blob_creator::BlobCreator;
    use crate::chunker::Chunker;
    use crate::receiver::BackupReceiver;
    use crate::testutil;

    use super::*;

    fn receiver(backend: &Arc<MemoryBackend>) -> BackupReceiver<MemoryBackend> {
        let crypto = Arc::new(testutil::crypto());
        let chunker = Chunker::new(
            testutil::SMALL_CHUNKS,
            crypto.gear_table_key(),
            crypto.chunk_id_key(),
        );
        let creator = BlobCreator::new(crypto, backend.clone(), 3).unwrap();
        BackupReceiver::new(chunker, creator, BlobCache::new(None), 4096)
    }

    fn config(quota: u64) -> FullBackupConfig {
        FullBackupConfig {
            quota,
            unlimited: false,
            read_buffer_size: 1000,
        }
    }

    #[test]
    fn test_size_check() {
        let full = FullBackup::new(config(100));
        assert_eq!(full.check_full_backup_size(0), SizeCheck::Rejected);
        assert_eq!(full.check_full_backup_size(-1), SizeCheck::Rejected);
        assert_eq!(full.check_full_backup_size(100), SizeCheck::Ok);
        assert_eq!(full.check_full_backup_size(101), SizeCheck::QuotaExceeded);

        let unlimited = FullBackup::new(FullBackupConfig {
            unlimited: true,
            ..config(100)
        });
        assert_eq!(unlimited.check_full_backup_size(i64::MAX), SizeCheck::Ok);
    }

    #[tokio::test]
    async fn test_backup_in_increments() {
        let backend = Arc::new(MemoryBackend::new());
        let mut receiver = receiver(&backend);
        let mut full = FullBackup::new(config(1_000_000));
        let data = testutil::random_bytes(3, 50_000);

        full.perform_backup("org.example", std::io::Cursor::new(data.clone()))
            .unwrap();
        for _ in 0..5 {
            let status = full.send_backup_data(&mut receiver, 10_000).await.unwrap();
            assert_eq!(status, SendStatus::Ok);
        }
        assert_eq!(receiver.owner(), Some("FullBackup org.example"));

        let backup = full.finish_backup(&mut receiver).await.unwrap();
        assert!(!full.has_state());
        assert_eq!(backup.size(), data.len() as u64);
        assert!(backup.chunk_ids.len() > 1);
        assert_eq!(receiver.owner(), None);
    }

    #[tokio::test]
    async fn test_quota_exceeded() {
        let backend = Arc::new(MemoryBackend::new());
        let mut receiver = receiver(&backend);
        let mut full = FullBackup::new(config(25_000));
        let data = testutil::random_bytes(4, 30_000);

        full.perform_backup("org.example", std::io::Cursor::new(data))
            .unwrap();
        for _ in 0..2 {
            let status = full.send_backup_data(&mut receiver, 10_000).await.unwrap();
            assert_eq!(status, SendStatus::Ok);
        }
        let status = full.send_backup_data(&mut receiver, 10_000).await.unwrap();
        assert_eq!(status, SendStatus::QuotaExceeded);

        full.cancel_full_backup(&mut receiver).unwrap();
        assert!(!full.has_state());
        assert_eq!(receiver.owner(), None);

        // the next app starts from scratch
        full.perform_backup("org.other", &b"small"[..]).unwrap();
        full.send_backup_data(&mut receiver, 5).await.unwrap();
        let backup = full.finish_backup(&mut receiver).await.unwrap();
        assert_eq!(backup.size(), 5);
    }

    #[tokio::test]
    async fn test_clear_state() {
        let backend = Arc::new(MemoryBackend::new());
        let mut receiver = receiver(&backend);
        let mut full = FullBackup::new(config(10_000));

        // nothing to clear
        full.clear_state(&mut receiver);

        full.perform_backup("org.example", std::io::Cursor::new(vec![1; 20_000]))
            .unwrap();
        full.send_backup_data(&mut receiver, 5_000).await.unwrap();
        let status = full.send_backup_data(&mut receiver, 10_000).await.unwrap();
        assert_eq!(status, SendStatus::QuotaExceeded);
        assert_eq!(receiver.owner(), Some("FullBackup org.example"));

        full.clear_state(&mut receiver);
        assert!(!full.has_state());
        assert_eq!(receiver.owner(), None);
        receiver.add_bytes("IconManager", b"icons").await.unwrap();
    }

    #[tokio::test]
    async fn test_short_stream() {
        let backend = Arc::new(MemoryBackend::new());
        let mut receiver = receiver(&backend);
        let mut full = FullBackup::new(config(1_000_000));

        full.perform_backup("org.example", &b"too short"[..]).unwrap();
        let err = full.send_backup_data(&mut receiver, 100).await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert!(!full.has_state());
        assert_eq!(receiver.owner(), None);
    }

    #[tokio::test]
    async fn test_state_checks() {
        let backend = Arc::new(MemoryBackend::new());
        let mut receiver = receiver(&backend);
        let mut full = FullBackup::new(config(1000));

        let err = full.send_backup_data(&mut receiver, 1).await.unwrap_err();
        assert!(matches!(err, Error::IllegalState(_)));
        let err = full.cancel_full_backup(&mut receiver).unwrap_err();
        assert!(matches!(err, Error::IllegalState(_)));
        let err = full.finish_backup(&mut receiver).await.unwrap_err();
        assert!(matches!(err, Error::IllegalState(_)));

        full.perform_backup("org.example", &b""[..]).unwrap();
        let err = full.perform_backup("org.other", &b""[..]).unwrap_err();
        assert!(matches!(err, Error::IllegalState(_)));
        assert_eq!(full.current_package(), Some("org.example"));
    }
}
