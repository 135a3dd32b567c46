use tokio::io::AsyncRead;

use crate::crypto::Crypto;
use crate::datamodel::BackupData;
use crate::error::{ensure_state, Error, Result};
use crate::receiver::BackupSink;

use super::changeset::ChangeSetReader;
use super::{seal_table, KvDb, NO_DATA_END_SENTINEL};

/// What the OS tells us about a key/value backup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KvBackupFlags {
    /// Nothing changed since the last backup, the change set is empty.
    pub data_not_changed: bool,
    /// The change set only has the changes since the last backup.
    pub incremental: bool,
    /// The change set has all the data of the app.
    pub non_incremental: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvBackupStatus {
    Ok,
    /// The OS needs to send all data of the app instead of a delta.
    NonIncrementalRequired,
}

struct KvBackupState {
    package_name: String,
    db: KvDb,
    /// Whether the table needs to be stored at the end.
    upload_required: bool,
}

/// Backs up one key/value app at a time.
pub struct KvBackup {
    state: Option<KvBackupState>,
}

impl Default for KvBackup {
    fn default() -> Self {
        Self::new()
    }
}

impl KvBackup {
    pub fn new() -> Self {
        Self { state: None }
    }

    pub fn has_state(&self) -> bool {
        self.state.is_some()
    }

    pub fn current_package(&self) -> Option<&str> {
        self.state.as_ref().map(|state| state.package_name.as_str())
    }

    /// Applies the change set of `package_name` to a fresh local table.
    ///
    /// A change set that can not be parsed drops everything received for the
    /// app, so that no partial data gets stored.
    pub async fn perform_backup<R>(
        &mut self,
        package_name: &str,
        data: R,
        flags: KvBackupFlags,
    ) -> Result<KvBackupStatus>
    where
        R: AsyncRead + Unpin + Send,
    {
        ensure_state!(
            self.state.is_none(),
            "unexpected K/V state for {:?}",
            self.current_package()
        );
        if package_name == NO_DATA_END_SENTINEL {
            return Ok(KvBackupStatus::Ok);
        }

        if flags.data_not_changed {
            tracing::info!(package_name, "no K/V backup data has changed");
        } else if flags.incremental {
            // every backup starts out with an empty table, so there is
            // nothing a delta could be applied to
            tracing::warn!(package_name, "incremental K/V backup requested, need full data");
            return Ok(KvBackupStatus::NonIncrementalRequired);
        } else {
            tracing::info!(package_name, "performing K/V backup");
        }

        let db = KvDb::open_temporary()?;
        let mut state = KvBackupState {
            package_name: package_name.to_owned(),
            db,
            upload_required: !flags.data_not_changed,
        };
        if state.upload_required {
            store_records(&mut state, data).await?;
        }
        self.state = Some(state);
        Ok(KvBackupStatus::Ok)
    }

    /// Stores the table of the current app.
    ///
    /// Returns `None` if there was nothing to store, because the app's data did
    /// not change. The state is gone afterwards, no matter the outcome.
    pub async fn finish_backup<S>(
        &mut self,
        crypto: &Crypto,
        sink: &mut S,
    ) -> Result<Option<BackupData>>
    where
        S: BackupSink + ?Sized,
    {
        let Some(state) = self.state.take() else {
            return Err(Error::IllegalState("no K/V state in finish_backup".into()));
        };
        let package_name = state.package_name.as_str();
        tracing::info!(package_name, "finishing K/V backup");
        if !state.upload_required {
            return Ok(None);
        }

        state.db.vacuum()?;
        let records = state.db.get_all()?;
        let sealed = seal_table(crypto, package_name, &records).await?;

        let owner = format!("KV {package_name}");
        if let Err(err) = sink.add_bytes(&owner, &sealed).await {
            sink.discard(&owner)?;
            return Err(err);
        }
        let data = sink.finalize(&owner).await?;
        tracing::debug!(package_name, records = records.len(), "uploaded K/V table");
        Ok(Some(data))
    }

    /// Drops the state of the current app, if any.
    pub fn clear_state(&mut self) {
        if let Some(state) = self.state.take() {
            tracing::info!(package_name = %state.package_name, "resetting K/V backup state");
        }
    }
}

async fn store_records<R>(state: &mut KvBackupState, data: R) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
{
    let mut changes = ChangeSetReader::new(data);
    while let Some(op) = changes.next_operation().await.inspect_err(|err| {
        tracing::error!(package_name = %state.package_name, error = %err, "error reading K/V change set");
    })? {
        match op.value {
            Some(value) => {
                tracing::trace!(key = %op.key, size = value.len(), "put record");
                state.db.put(&op.key, &value)?;
            }
            None => {
                tracing::trace!(key = %op.key, "delete record");
                state.db.delete(&op.key)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::backend::MemoryBackend;
    use crate::blob_cache::BlobCache;
    use crate::blob_creator::BlobCreator;
    use crate::chunker::Chunker;
    use crate::kv::{open_table, ChangeSetWriter};
    use crate::loader::Loader;
    use crate::receiver::BackupReceiver;
    use crate::testutil;

    use super::*;

    struct Fixture {
        crypto: Arc<Crypto>,
        backend: Arc<MemoryBackend>,
        receiver: BackupReceiver<MemoryBackend>,
        kv: KvBackup,
    }

    fn fixture() -> Fixture {
        let crypto = Arc::new(testutil::crypto());
        let backend = Arc::new(MemoryBackend::new());
        let chunker = Chunker::new(
            testutil::SMALL_CHUNKS,
            crypto.gear_table_key(),
            crypto.chunk_id_key(),
        );
        let creator = BlobCreator::new(crypto.clone(), backend.clone(), 3).unwrap();
        Fixture {
            receiver: BackupReceiver::new(chunker, creator, BlobCache::new(None), 4096),
            crypto,
            backend,
            kv: KvBackup::new(),
        }
    }

    async fn change_set(puts: &[(&str, &[u8])], deletes: &[&str]) -> Vec<u8> {
        let mut writer = ChangeSetWriter::new(Vec::new());
        for (key, value) in puts {
            writer.write_record(key, value).await.unwrap();
        }
        for key in deletes {
            writer.write_delete(key).await.unwrap();
        }
        writer.into_inner()
    }

    #[tokio::test]
    async fn test_backup_replays_change_set() {
        let mut f = fixture();
        let data = change_set(&[("A", &[1u8, 2, 3][..]), ("B", &[4u8, 5][..])], &["A"]).await;

        let status = f
            .kv
            .perform_backup("org.example", &data[..], KvBackupFlags::default())
            .await
            .unwrap();
        assert_eq!(status, KvBackupStatus::Ok);
        assert_eq!(f.kv.current_package(), Some("org.example"));

        let backup = f
            .kv
            .finish_backup(&f.crypto, &mut f.receiver)
            .await
            .unwrap()
            .unwrap();
        assert!(!f.kv.has_state());
        assert_eq!(f.backend.save_count(), backup.blob_map.len());

        let loader = Loader::new(f.crypto.clone(), f.backend.clone());
        let mut sealed = vec![];
        for chunk_id in &backup.chunk_ids {
            let blob = backup.blob_map[chunk_id];
            let handle = crate::backend::FileHandle::blob(f.crypto.repo_id(), blob.id);
            sealed.extend(loader.load_file(&handle).await.unwrap());
        }
        let records = open_table(&f.crypto, "org.example", &sealed).await.unwrap();
        assert_eq!(records, vec![("B".to_string(), vec![4, 5])]);
    }

    #[tokio::test]
    async fn test_unchanged_table_dedups() {
        let mut f = fixture();
        let data = change_set(&[("key", &b"value"[..])], &[]).await;

        let mut backups = vec![];
        for _ in 0..2 {
            f.kv.perform_backup("org.example", &data[..], KvBackupFlags::default())
                .await
                .unwrap();
            let backup = f.kv.finish_backup(&f.crypto, &mut f.receiver).await.unwrap();
            backups.push(backup.unwrap());
        }
        assert_eq!(backups[0], backups[1]);
        assert_eq!(f.backend.save_count(), backups[0].blob_map.len());
    }

    #[tokio::test]
    async fn test_flags() {
        let mut f = fixture();
        let data = change_set(&[("key", &b"value"[..])], &[]).await;

        let flags = KvBackupFlags {
            incremental: true,
            ..Default::default()
        };
        let status = f.kv.perform_backup("org.example", &data[..], flags).await.unwrap();
        assert_eq!(status, KvBackupStatus::NonIncrementalRequired);
        assert!(!f.kv.has_state());

        let flags = KvBackupFlags {
            data_not_changed: true,
            ..Default::default()
        };
        let status = f.kv.perform_backup("org.example", &[][..], flags).await.unwrap();
        assert_eq!(status, KvBackupStatus::Ok);
        assert!(f.kv.has_state());
        let backup = f.kv.finish_backup(&f.crypto, &mut f.receiver).await.unwrap();
        assert!(backup.is_none());
        assert_eq!(f.backend.save_count(), 0);

        let status = f
            .kv
            .perform_backup(NO_DATA_END_SENTINEL, &[][..], KvBackupFlags::default())
            .await
            .unwrap();
        assert_eq!(status, KvBackupStatus::Ok);
        assert!(!f.kv.has_state());
    }

    #[tokio::test]
    async fn test_malformed_change_set() {
        let mut f = fixture();
        let mut data = change_set(&[("A", &[1u8, 2, 3][..])], &[]).await;
        data.truncate(data.len() - 1);

        let err = f
            .kv
            .perform_backup("org.example", &data[..], KvBackupFlags::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MalformedChangeSet(_)));
        assert!(!f.kv.has_state());
        assert_eq!(f.backend.save_count(), 0);
    }

    #[tokio::test]
    async fn test_state_checks() {
        let mut f = fixture();
        let err = f.kv.finish_backup(&f.crypto, &mut f.receiver).await.unwrap_err();
        assert!(matches!(err, Error::IllegalState(_)));

        f.kv.perform_backup("org.example", &[][..], KvBackupFlags::default())
            .await
            .unwrap();
        let err = f
            .kv
            .perform_backup("org.other", &[][..], KvBackupFlags::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IllegalState(_)));
        assert_eq!(f.kv.current_package(), Some("org.example"));

        f.kv.clear_state();
        assert!(!f.kv.has_state());
    }

    #[tokio::test]
    async fn test_failed_upload_clears_state() {
        let mut f = fixture();
        let data = change_set(&[("key", &b"value"[..])], &[]).await;
        f.kv.perform_backup("org.example", &data[..], KvBackupFlags::default())
            .await
            .unwrap();

        f.backend.fail_next_saves(1);
        let err = f.kv.finish_backup(&f.crypto, &mut f.receiver).await.unwrap_err();
        assert!(matches!(err, Error::Backend(_)));
        assert!(!f.kv.has_state());
        assert_eq!(f.receiver.owner(), None);
    }
}
