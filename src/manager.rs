use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::io::AsyncRead;

use crate::backend::{Backend, FileInfo, FileKind};
use crate::blob_cache::BlobCache;
use crate::blob_creator::BlobCreator;
use crate::chunker::Chunker;
use crate::config::Config;
use crate::crypto::{Crypto, KeyProvider};
use crate::error::{ensure_state, Error, Result};
use crate::full::{FullBackup, FullRestore, SendStatus, SizeCheck};
use crate::kv::{KvBackup, KvBackupFlags, KvBackupStatus, KvRestore};
use crate::receiver::BackupReceiver;
use crate::retry::{Delay, RetryPolicy, TokioDelay};
use crate::snapshot::{
    Apk, ApkSplit, AppState, BackupType, Clock, DeviceInfo, PackageInfo, Snapshot,
    SnapshotCreator, SnapshotManager, SystemClock,
};

const ICON_OWNER: &str = "IconManager";

/// Coordinates one backup run at a time.
///
/// A run starts with [`AppBackupManager::before_backup`], which seeds the
/// blob cache from what is on the backend, and ends with
/// [`AppBackupManager::after_backup_finished`], which saves the snapshot of
/// the run. In between, apps are backed up one after the other, either as
/// key/value or as full backups. A run that never finishes leaves no trace
/// restore could see.
pub struct AppBackupManager<B> {
    crypto: Arc<Crypto>,
    backend: Arc<B>,
    config: Config,
    device: DeviceInfo,
    clock: Arc<dyn Clock>,
    delay: Arc<dyn Delay>,
    retry: RetryPolicy,

    receiver: BackupReceiver<B>,
    kv: KvBackup,
    full: FullBackup,
    snapshot_manager: SnapshotManager<B>,
    snapshot_creator: Option<SnapshotCreator>,
    /// The app currently backed up by either `kv` or `full`.
    in_progress: Option<PackageInfo>,
    /// The OS started backing up without preparing a run.
    started_unprepared: bool,
}

impl<B: Backend + 'static> AppBackupManager<B> {
    pub fn new(
        keys: &impl KeyProvider,
        backend: Arc<B>,
        config: Config,
        device: DeviceInfo,
    ) -> Result<Self> {
        config.validate()?;
        let crypto = Arc::new(Crypto::new(keys));
        let repo_hex = crypto.repo_id().to_hex();

        let chunker = Chunker::new(
            config.chunker,
            crypto.gear_table_key(),
            crypto.chunk_id_key(),
        );
        let creator = BlobCreator::new(crypto.clone(), backend.clone(), config.compression_level)?;
        let cache_file = config
            .cache_dir
            .as_ref()
            .map(|dir| dir.join(format!("blobs-{repo_hex}.cache")));
        let receiver = BackupReceiver::new(
            chunker,
            creator,
            BlobCache::new(cache_file),
            config.full_backup.read_buffer_size,
        );
        let snapshot_manager = SnapshotManager::new(
            crypto.clone(),
            backend.clone(),
            config.cache_dir.as_ref().map(|dir| dir.join("snapshots")),
            config.compression_level,
        );

        Ok(Self {
            retry: RetryPolicy::from(config.snapshot_retry),
            full: FullBackup::new(config.full_backup),
            kv: KvBackup::new(),
            crypto,
            backend,
            config,
            device,
            clock: Arc::new(SystemClock),
            delay: Arc::new(TokioDelay),
            receiver,
            snapshot_manager,
            snapshot_creator: None,
            in_progress: None,
            started_unprepared: false,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_delay(mut self, delay: Arc<dyn Delay>) -> Self {
        self.delay = delay;
        self
    }

    pub fn crypto(&self) -> &Arc<Crypto> {
        &self.crypto
    }

    pub fn blob_cache(&self) -> &BlobCache {
        self.receiver.cache()
    }

    pub fn snapshot_manager(&self) -> &SnapshotManager<B> {
        &self.snapshot_manager
    }

    /// The snapshot of the current run, while it is being assembled.
    pub fn snapshot_creator(&self) -> Option<&SnapshotCreator> {
        self.snapshot_creator.as_ref()
    }

    pub fn is_run_active(&self) -> bool {
        self.snapshot_creator.is_some()
    }

    pub fn kv_restore(&self) -> KvRestore<B> {
        KvRestore::new(self.crypto.clone(), self.backend.clone())
    }

    pub fn full_restore(&self) -> FullRestore<B> {
        FullRestore::new(self.crypto.clone(), self.backend.clone(), self.config.restore)
    }

    /// Starts a backup run: loads the existing snapshots, seeds the blob cache
    /// from them and from the blobs on the backend.
    ///
    /// Errors are worth retrying, no run is started then.
    pub async fn before_backup(&mut self) -> Result<()> {
        tracing::info!("loading existing snapshots and blobs");
        let repo_id = self.crypto.repo_id();
        let files = self
            .backend
            .list(repo_id, &[FileKind::Blob, FileKind::Snapshot])
            .await
            .map_err(Error::backend)?;
        let (blob_infos, snapshot_infos): (Vec<FileInfo>, Vec<FileInfo>) = files
            .into_iter()
            .partition(|info| info.handle.kind == FileKind::Blob);
        let snapshot_handles: Vec<_> = snapshot_infos.iter().map(|info| info.handle).collect();
        tracing::info!(snapshots = snapshot_handles.len(), "found existing snapshots");

        let snapshots = self.snapshot_manager.on_snapshots_loaded(&snapshot_handles).await;
        if let Some(dir) = &self.config.cache_dir {
            tokio::fs::create_dir_all(dir).await?;
        }
        self.receiver
            .cache_mut()
            .populate(&blob_infos, &snapshots)
            .await;
        self.snapshot_creator = Some(SnapshotCreator::new(
            self.clock.clone(),
            self.device.clone(),
        ));
        Ok(())
    }

    /// Starts a run, unless one is active already.
    ///
    /// For backups the OS starts without announcing them first. Such a run
    /// is ended by [`AppBackupManager::finalize_backup_if_needed`].
    pub async fn ensure_backup_prepared(&mut self) -> Result<()> {
        if self.is_run_active() {
            return Ok(());
        }
        tracing::warn!("backup not prepared, starting run now");
        self.before_backup().await?;
        self.started_unprepared = true;
        Ok(())
    }

    /// Ends a run started by [`AppBackupManager::ensure_backup_prepared`].
    pub async fn finalize_backup_if_needed(&mut self) -> Result<Option<Snapshot>> {
        if !self.started_unprepared {
            return Ok(None);
        }
        tracing::warn!("backup not finalized, finishing run now");
        self.after_backup_finished(true).await
    }

    pub async fn perform_kv_backup<R>(
        &mut self,
        package: &PackageInfo,
        data: R,
        flags: KvBackupFlags,
    ) -> Result<KvBackupStatus>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.check_idle("K/V backup")?;
        let result = self
            .kv
            .perform_backup(&package.package_name, data, flags)
            .await;
        match result {
            Ok(status) => {
                if self.kv.has_state() {
                    self.in_progress = Some(package.clone());
                }
                Ok(status)
            }
            Err(err) => {
                self.record_failure(package, BackupType::Kv, AppState::UnknownError);
                Err(err)
            }
        }
    }

    pub async fn perform_full_backup<R>(&mut self, package: &PackageInfo, data: R) -> Result<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        self.check_idle("full backup")?;
        self.full.perform_backup(&package.package_name, data)?;
        self.in_progress = Some(package.clone());
        Ok(())
    }

    pub fn check_full_backup_size(&self, size: i64) -> SizeCheck {
        self.full.check_full_backup_size(size)
    }

    /// Reads the next `num_bytes` of the current full backup.
    ///
    /// On [`SendStatus::QuotaExceeded`], the OS is expected to cancel the
    /// backup with [`AppBackupManager::cancel_full_backup`].
    pub async fn send_backup_data(&mut self, num_bytes: usize) -> Result<SendStatus> {
        let result = self.full.send_backup_data(&mut self.receiver, num_bytes).await;
        if result.is_err() && !self.full.has_state() {
            if let Some(package) = self.in_progress.take() {
                self.record_failure(&package, BackupType::Full, AppState::UnknownError);
            }
        }
        result
    }

    /// Drops the current full backup, leaving the snapshot untouched.
    pub fn cancel_full_backup(&mut self) -> Result<()> {
        self.full.cancel_full_backup(&mut self.receiver)?;
        self.in_progress = None;
        Ok(())
    }

    /// Ends the backup of the current app and records it in the snapshot.
    ///
    /// If storing the app's data fails, the app is recorded as failed, unless
    /// it has an entry already.
    pub async fn finish_backup(&mut self) -> Result<()> {
        ensure_state!(self.is_run_active(), "no active backup run");
        let Some(package) = self.in_progress.take() else {
            return Err(Error::IllegalState("no backup in progress".into()));
        };

        if self.kv.has_state() {
            match self.kv.finish_backup(&self.crypto, &mut self.receiver).await {
                Ok(Some(data)) => {
                    self.creator_mut()?
                        .on_package_backed_up(&package, BackupType::Kv, data);
                }
                Ok(None) => self.on_no_data_in_current_run(&package.package_name, false)?,
                Err(err) => {
                    self.record_failure(&package, BackupType::Kv, AppState::UnknownError);
                    return Err(err);
                }
            }
        } else if self.full.has_state() {
            match self.full.finish_backup(&mut self.receiver).await {
                Ok(data) => {
                    self.creator_mut()?
                        .on_package_backed_up(&package, BackupType::Full, data);
                }
                Err(err) => {
                    self.record_failure(&package, BackupType::Full, AppState::UnknownError);
                    return Err(err);
                }
            }
        } else {
            return Err(Error::IllegalState(format!(
                "no backup state for {}",
                package.package_name
            )));
        }
        Ok(())
    }

    /// Carries the entry of an app over from the latest snapshot, because it
    /// did not send data in this run.
    pub fn on_no_data_in_current_run(&mut self, package_name: &str, is_stopped: bool) -> Result<()> {
        let Some(creator) = self.snapshot_creator.as_mut() else {
            return Err(Error::IllegalState("no active backup run".into()));
        };
        match self.snapshot_manager.latest_snapshot() {
            Some(latest) => creator.on_no_data_in_current_run(latest, package_name, is_stopped),
            None => tracing::warn!(package_name, "no data in current run, and no previous snapshot"),
        }
        Ok(())
    }

    /// Records why an app was not backed up in this run.
    pub fn on_package_not_backed_up(
        &mut self,
        package: &PackageInfo,
        backup_type: Option<BackupType>,
        state: AppState,
    ) -> Result<()> {
        self.creator_mut()?
            .on_package_failed(package, backup_type, state);
        Ok(())
    }

    /// Stores the given APK splits and records them, along with the metadata
    /// in `apk`, for `package`.
    pub async fn backup_apk<R>(
        &mut self,
        package: &PackageInfo,
        mut apk: Apk,
        splits: Vec<(String, R)>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        ensure_state!(self.is_run_active(), "no active backup run");
        let mut blob_map = BTreeMap::new();
        apk.splits.clear();
        for (name, reader) in splits {
            let owner = format!("APK {} {name}", package.package_name);
            let data = self.receiver.read_from_stream(&owner, reader).await?;
            tracing::debug!(package_name = %package.package_name, split = %name, size = data.size(), "stored APK split");
            apk.splits.push(ApkSplit {
                name,
                chunk_ids: data.chunk_ids,
            });
            blob_map.extend(data.blob_map);
        }
        self.creator_mut()?.on_apk_backed_up(package, apk, blob_map);
        Ok(())
    }

    /// Stores the archive with the icons of all apps.
    pub async fn backup_icons<R>(&mut self, reader: R) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        ensure_state!(self.is_run_active(), "no active backup run");
        let data = self.receiver.read_from_stream(ICON_OWNER, reader).await?;
        self.creator_mut()?.on_icons_backed_up(data);
        Ok(())
    }

    /// Ends the current run.
    ///
    /// Only a successful run gets its snapshot saved, with a few retries.
    /// Returns the saved snapshot. Either way, the run is over afterwards.
    pub async fn after_backup_finished(&mut self, success: bool) -> Result<Option<Snapshot>> {
        tracing::info!(success, "backup run finished");
        self.receiver.cache_mut().clear();
        self.started_unprepared = false;
        self.in_progress = None;
        self.kv.clear_state();
        self.full.clear_state(&mut self.receiver);
        let creator = self.snapshot_creator.take();
        if !success {
            return Ok(None);
        }

        let Some(mut creator) = creator else {
            return Err(Error::IllegalState("had no snapshot creator".into()));
        };
        let snapshot = creator.finalize_snapshot();
        let manager = &self.snapshot_manager;
        let to_save = &snapshot;
        self.retry
            .run(self.delay.as_ref(), move |_| manager.save_snapshot(to_save))
            .await?;

        // the snapshot references all blobs the local cache knows about
        if let Err(err) = self.receiver.cache().clear_local_cache().await {
            tracing::error!(error = %err, "error clearing local blob cache");
        }
        Ok(Some(snapshot))
    }

    fn check_idle(&self, what: &str) -> Result<()> {
        ensure_state!(self.is_run_active(), "{what} without an active backup run");
        ensure_state!(
            !self.kv.has_state() && !self.full.has_state(),
            "{what} while {:?} is still in progress",
            self.in_progress.as_ref().map(|package| &package.package_name)
        );
        Ok(())
    }

    fn creator_mut(&mut self) -> Result<&mut SnapshotCreator> {
        self.snapshot_creator
            .as_mut()
            .ok_or_else(|| Error::IllegalState("no active backup run".into()))
    }

    fn record_failure(&mut self, package: &PackageInfo, backup_type: BackupType, state: AppState) {
        if let Some(creator) = self.snapshot_creator.as_mut() {
            creator.on_package_failed(package, Some(backup_type), state);
        }
    }
}
