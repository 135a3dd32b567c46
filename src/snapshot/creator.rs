use std::collections::BTreeMap;
use std::sync::Arc;

use crate::crypto::VERSION;
use crate::datamodel::{BackupData, Blob, ChunkId};

use super::{Apk, AppEntry, AppState, BackupType, Clock, DeviceInfo, PackageInfo, Snapshot};

/// Assembles the [`Snapshot`] of a single backup run.
///
/// Every chunk an entry references gets its [`Blob`] recorded alongside, so the
/// finalized snapshot resolves all of its chunk ids.
pub struct SnapshotCreator {
    clock: Arc<dyn Clock>,
    device: DeviceInfo,
    apps: BTreeMap<String, AppEntry>,
    blobs: BTreeMap<ChunkId, Blob>,
    icon_chunk_ids: Vec<ChunkId>,
}

impl SnapshotCreator {
    pub fn new(clock: Arc<dyn Clock>, device: DeviceInfo) -> Self {
        Self {
            clock,
            device,
            apps: BTreeMap::new(),
            blobs: BTreeMap::new(),
            icon_chunk_ids: vec![],
        }
    }

    pub fn has_entry(&self, package_name: &str) -> bool {
        self.apps.contains_key(package_name)
    }

    pub fn entry(&self, package_name: &str) -> Option<&AppEntry> {
        self.apps.get(package_name)
    }

    /// Records the APK of an app, whose splits were all stored already.
    pub fn on_apk_backed_up(
        &mut self,
        package: &PackageInfo,
        apk: Apk,
        blob_map: BTreeMap<ChunkId, Blob>,
    ) {
        let entry = self.entry_mut(package);
        if let Some(label) = &package.label {
            entry.name.clone_from(label);
        }
        entry.apk = Some(apk);
        self.blobs.extend(blob_map);
    }

    /// Records the data of an app, which was stored completely.
    ///
    /// Not calling this effectively means the app did not get backed up.
    pub fn on_package_backed_up(
        &mut self,
        package: &PackageInfo,
        backup_type: BackupType,
        data: BackupData,
    ) {
        let time = self.clock.now_millis();
        let size = data.size();
        let entry = self.entry_mut(package);
        entry.time = time;
        entry.backup_type = Some(backup_type);
        if let Some(label) = &package.label {
            entry.name.clone_from(label);
        }
        entry.system = package.system;
        entry.launchable_system_app = package.system && package.launchable;
        entry.chunk_ids = data.chunk_ids;
        entry.size = size;
        entry.state = AppState::Succeeded;
        self.blobs.extend(data.blob_map);
    }

    /// Records why an app has no data in this run.
    ///
    /// Does nothing if the app's entry has data already, so a failure never
    /// replaces data that was stored before. An entry with only an APK gets
    /// marked as failed.
    pub fn on_package_failed(
        &mut self,
        package: &PackageInfo,
        backup_type: Option<BackupType>,
        state: AppState,
    ) {
        if let Some(entry) = self.apps.get(&package.package_name) {
            if entry.backup_type.is_some() || !entry.chunk_ids.is_empty() {
                return;
            }
        }
        let time = self.clock.now_millis();
        let entry = self.entry_mut(package);
        entry.time = time;
        entry.backup_type = backup_type;
        entry.state = state;
    }

    /// Carries the entry of an app that did not send data in this run over
    /// from `snapshot`, usually the latest one.
    ///
    /// Key/value apps whose data did not change don't hand us anything, but
    /// the new snapshot still needs to reference their data.
    pub fn on_no_data_in_current_run(
        &mut self,
        snapshot: &Snapshot,
        package_name: &str,
        is_stopped: bool,
    ) {
        tracing::info!(token = snapshot.token, package_name, "app has no data in current run");
        if self.has_entry(package_name) {
            // the OS backs up some apps repeatedly in one run
            tracing::info!(package_name, "already have data in current snapshot, not touching it");
            return;
        }
        let Some(app) = snapshot.apps.get(package_name) else {
            if !is_stopped {
                tracing::error!(package_name, "no changed data, but we had no data for it");
            }
            return;
        };

        for chunk_id in app.all_chunk_ids() {
            match snapshot.blobs.get(chunk_id) {
                Some(blob) => {
                    self.blobs.insert(*chunk_id, *blob);
                }
                None => tracing::error!(package_name, ?chunk_id, "no blob for chunk"),
            }
        }
        self.apps.insert(package_name.to_owned(), app.clone());
    }

    /// Records the icons of all apps, which were stored as one stream.
    pub fn on_icons_backed_up(&mut self, data: BackupData) {
        self.icon_chunk_ids = data.chunk_ids;
        self.blobs.extend(data.blob_map);
    }

    /// Assembles the final snapshot, leaving this creator empty.
    pub fn finalize_snapshot(&mut self) -> Snapshot {
        let snapshot = Snapshot {
            version: VERSION,
            token: self.clock.now_millis(),
            device: self.device.clone(),
            apps: std::mem::take(&mut self.apps),
            icon_chunk_ids: std::mem::take(&mut self.icon_chunk_ids),
            blobs: std::mem::take(&mut self.blobs),
        };
        tracing::info!(
            token = snapshot.token,
            apps = snapshot.apps.len(),
            blobs = snapshot.blobs.len(),
            "finalized snapshot"
        );
        snapshot
    }

    fn entry_mut(&mut self, package: &PackageInfo) -> &mut AppEntry {
        self.apps
            .entry(package.package_name.clone())
            .or_insert_with(|| AppEntry::new(package))
    }
}

#[cfg(test)]
mod tests {
    use crate::datamodel::BlobId;
    use crate::snapshot::ApkSplit;
    use crate::testutil::TickingClock;

    use super::*;

    fn blob(b: u8) -> Blob {
        Blob {
            id: BlobId([b; 32]),
            length: 100,
            uncompressed_length: b as u32 * 10,
        }
    }

    fn data(ids: &[u8]) -> BackupData {
        BackupData {
            chunk_ids: ids.iter().map(|b| ChunkId([*b; 32])).collect(),
            blob_map: ids.iter().map(|b| (ChunkId([*b; 32]), blob(*b))).collect(),
        }
    }

    fn creator() -> SnapshotCreator {
        let device = DeviceInfo {
            name: "Test Device".into(),
            ..Default::default()
        };
        SnapshotCreator::new(Arc::new(TickingClock::new(1000)), device)
    }

    fn package(name: &str) -> PackageInfo {
        PackageInfo {
            package_name: name.into(),
            label: Some(format!("Label of {name}")),
            system: true,
            launchable: false,
        }
    }

    #[test]
    fn test_snapshot_assembly() {
        let mut creator = creator();
        let example = package("org.example");

        let apk = Apk {
            version_code: 7,
            splits: vec![ApkSplit {
                name: "base".into(),
                chunk_ids: vec![ChunkId([9; 32])],
            }],
            ..Default::default()
        };
        creator.on_apk_backed_up(&example, apk.clone(), data(&[9]).blob_map);
        creator.on_package_backed_up(&example, BackupType::Full, data(&[1, 2, 1]));
        creator.on_icons_backed_up(data(&[3]));

        let snapshot = creator.finalize_snapshot();
        assert_eq!(snapshot.version, VERSION);
        assert_eq!(snapshot.token, 2000);
        assert_eq!(snapshot.device.name, "Test Device");
        assert_eq!(snapshot.icon_chunk_ids, vec![ChunkId([3; 32])]);

        let app = &snapshot.apps["org.example"];
        assert_eq!(app.time, 1000);
        assert_eq!(app.name, "Label of org.example");
        assert_eq!(app.backup_type, Some(BackupType::Full));
        assert_eq!(app.state, AppState::Succeeded);
        assert_eq!(app.size, 40);
        assert!(app.system);
        assert!(!app.launchable_system_app);
        assert_eq!(app.apk.as_ref(), Some(&apk));

        // every referenced chunk resolves
        for chunk_id in app.all_chunk_ids().chain(&snapshot.icon_chunk_ids) {
            assert!(snapshot.blobs.contains_key(chunk_id));
        }
        assert_eq!(snapshot.blobs.len(), 4);

        // finalizing leaves the creator empty
        let next = creator.finalize_snapshot();
        assert!(next.apps.is_empty());
        assert!(next.blobs.is_empty());
    }

    #[test]
    fn test_failures_never_replace_data() {
        let mut creator = creator();
        let example = package("org.example");

        creator.on_package_failed(&example, Some(BackupType::Kv), AppState::QuotaExceeded);
        assert_eq!(creator.entry("org.example").unwrap().state, AppState::QuotaExceeded);

        creator.on_package_backed_up(&example, BackupType::Kv, data(&[1]));
        creator.on_package_failed(&example, Some(BackupType::Kv), AppState::UnknownError);
        let entry = creator.entry("org.example").unwrap();
        assert_eq!(entry.state, AppState::Succeeded);
        assert_eq!(entry.chunk_ids, vec![ChunkId([1; 32])]);

        // a repeated backup replaces the chunk ids
        creator.on_package_backed_up(&example, BackupType::Kv, data(&[2]));
        let entry = creator.entry("org.example").unwrap();
        assert_eq!(entry.chunk_ids, vec![ChunkId([2; 32])]);
    }

    #[test]
    fn test_failure_after_apk() {
        let mut creator = creator();
        let example = package("org.example");
        let apk = Apk {
            version_code: 7,
            ..Default::default()
        };

        creator.on_apk_backed_up(&example, apk.clone(), BTreeMap::new());
        assert_eq!(creator.entry("org.example").unwrap().backup_type, None);
        creator.on_package_failed(&example, Some(BackupType::Full), AppState::QuotaExceeded);

        let entry = creator.entry("org.example").unwrap();
        assert_eq!(entry.state, AppState::QuotaExceeded);
        assert_eq!(entry.backup_type, Some(BackupType::Full));
        assert_eq!(entry.apk.as_ref(), Some(&apk));

        // the first failure sticks
        creator.on_package_failed(&example, Some(BackupType::Full), AppState::UnknownError);
        assert_eq!(creator.entry("org.example").unwrap().state, AppState::QuotaExceeded);
    }

    #[test]
    fn test_carry_forward() {
        let mut previous = creator();
        previous.on_package_backed_up(&package("org.example"), BackupType::Kv, data(&[1, 2]));
        previous.on_package_backed_up(&package("org.other"), BackupType::Kv, data(&[3]));
        let previous = previous.finalize_snapshot();

        let mut creator = creator();
        creator.on_package_backed_up(&package("org.other"), BackupType::Kv, data(&[4]));
        creator.on_no_data_in_current_run(&previous, "org.example", false);
        creator.on_no_data_in_current_run(&previous, "org.other", false);
        creator.on_no_data_in_current_run(&previous, "org.unknown", false);
        let snapshot = creator.finalize_snapshot();

        assert_eq!(snapshot.apps["org.example"], previous.apps["org.example"]);
        assert_eq!(snapshot.apps["org.other"].chunk_ids, vec![ChunkId([4; 32])]);
        assert!(!snapshot.apps.contains_key("org.unknown"));
        let blob_ids: Vec<_> = snapshot.blobs.keys().copied().collect();
        assert_eq!(
            blob_ids,
            vec![ChunkId([1; 32]), ChunkId([2; 32]), ChunkId([4; 32])]
        );
    }
}
