//! The manifest of one completed backup run.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::backend::FileHandle;
use crate::datamodel::{Blob, ChunkId, RepoId};
use crate::error::{Error, Result};

pub mod creator;
pub mod manager;

pub use creator::SnapshotCreator;
pub use manager::SnapshotManager;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Snapshot {
    pub version: u8,
    /// Creation time of the snapshot in milliseconds, also identifying the run.
    pub token: u64,
    pub device: DeviceInfo,
    pub apps: BTreeMap<String, AppEntry>,
    pub icon_chunk_ids: Vec<ChunkId>,
    /// One [`Blob`] for every chunk referenced anywhere in this snapshot.
    pub blobs: BTreeMap<ChunkId, Blob>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub user: String,
    pub device_id: String,
    pub sdk_int: u32,
    pub os_incremental: String,
    pub d2d: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BackupType {
    Kv,
    Full,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum AppState {
    #[default]
    Succeeded,
    NoData,
    QuotaExceeded,
    NotAllowed,
    UnknownError,
    WasStopped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppEntry {
    pub time: u64,
    pub backup_type: Option<BackupType>,
    pub name: String,
    pub system: bool,
    pub launchable_system_app: bool,
    pub chunk_ids: Vec<ChunkId>,
    pub size: u64,
    pub apk: Option<Apk>,
    pub state: AppState,
}

impl AppEntry {
    pub(crate) fn new(package: &PackageInfo) -> Self {
        Self {
            time: 0,
            backup_type: None,
            name: package.label.clone().unwrap_or_default(),
            system: package.system,
            launchable_system_app: package.system && package.launchable,
            chunk_ids: vec![],
            size: 0,
            apk: None,
            state: AppState::Succeeded,
        }
    }

    /// Every chunk this entry references, data first, then APK splits.
    pub fn all_chunk_ids(&self) -> impl Iterator<Item = &ChunkId> {
        let splits = self.apk.iter().flat_map(|apk| &apk.splits);
        self.chunk_ids
            .iter()
            .chain(splits.flat_map(|split| &split.chunk_ids))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Apk {
    pub version_code: u64,
    pub installer: String,
    pub signatures: Vec<Vec<u8>>,
    pub splits: Vec<ApkSplit>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApkSplit {
    pub name: String,
    pub chunk_ids: Vec<ChunkId>,
}

/// What the package enumerator tells us about an app. Not interpreted here,
/// only carried into the [`AppEntry`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageInfo {
    pub package_name: String,
    pub label: Option<String>,
    pub system: bool,
    pub launchable: bool,
}

impl PackageInfo {
    pub fn new(package_name: impl Into<String>) -> Self {
        Self {
            package_name: package_name.into(),
            ..Default::default()
        }
    }
}

/// The on-disk schema. New layouts get new variants, so older snapshots
/// stay readable.
#[derive(Deserialize)]
enum StoredSnapshot {
    V2(Snapshot),
}

/// Serializes exactly like [`StoredSnapshot`].
#[derive(Serialize)]
enum StoredSnapshotRef<'a> {
    V2(&'a Snapshot),
}

impl Snapshot {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(postcard::to_stdvec(&StoredSnapshotRef::V2(self))?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let StoredSnapshot::V2(snapshot) = postcard::from_bytes(bytes)?;
        Ok(snapshot)
    }

    /// Resolves chunk ids to the handles of their blobs, in order.
    pub fn blob_handles(&self, repo_id: RepoId, chunk_ids: &[ChunkId]) -> Result<Vec<FileHandle>> {
        chunk_ids
            .iter()
            .map(|chunk_id| {
                self.blobs
                    .get(chunk_id)
                    .map(|blob| FileHandle::blob(repo_id, blob.id))
                    .ok_or_else(|| Error::MissingBlob {
                        chunk_id: *chunk_id,
                    })
            })
            .collect()
    }
}

/// Source of snapshot tokens and entry timestamps.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }
}
