use std::sync::Arc;

use futures_util::TryStreamExt;

use crate::backend::{Backend, FileHandle};
use crate::crypto::Crypto;
use crate::error::{Error, Result};
use crate::loader::Loader;
use crate::snapshot::Snapshot;

use super::changeset::RecordSink;
use super::{open_table, KvDb, ANCESTRAL_RECORD_KEY, GLOBAL_METADATA_KEY, MAGIC_PACKAGE_MANAGER};

struct KvRestoreState {
    package_name: String,
    handles: Vec<FileHandle>,
    /// Restricts the package manager metadata to this single package.
    auto_restore_package: Option<String>,
}

/// Restores one key/value app at a time.
pub struct KvRestore<B> {
    crypto: Arc<Crypto>,
    loader: Loader<B>,
    state: Option<KvRestoreState>,
}

impl<B: Backend + 'static> KvRestore<B> {
    pub fn new(crypto: Arc<Crypto>, backend: Arc<B>) -> Self {
        Self {
            loader: Loader::new(crypto.clone(), backend),
            crypto,
            state: None,
        }
    }

    pub fn has_state(&self) -> bool {
        self.state.is_some()
    }

    /// Prepares restoring `package_name` from `snapshot`.
    ///
    /// The OS may decide not to restore a package after all, in which case the
    /// next call to this simply replaces the state.
    pub fn initialize_state(
        &mut self,
        snapshot: &Snapshot,
        package_name: &str,
        auto_restore_package: Option<&str>,
    ) -> Result<()> {
        let app = snapshot.apps.get(package_name).ok_or_else(|| {
            Error::InvalidFormat(format!("no app {package_name} in snapshot {}", snapshot.token))
        })?;
        let handles = snapshot.blob_handles(self.crypto.repo_id(), &app.chunk_ids)?;
        self.state = Some(KvRestoreState {
            package_name: package_name.to_owned(),
            handles,
            auto_restore_package: auto_restore_package.map(str::to_owned),
        });
        Ok(())
    }

    /// Writes all records of the current package to `sink`, sorted by key,
    /// and returns how many were written.
    ///
    /// The state is cleared afterwards, also when restoring failed.
    pub async fn get_restore_data<S>(&mut self, sink: &mut S) -> Result<usize>
    where
        S: RecordSink + ?Sized,
    {
        let Some(state) = self.state.take() else {
            return Err(Error::IllegalState("no K/V restore state".into()));
        };
        let package_name = state.package_name.as_str();
        self.restore(&state, sink).await.inspect_err(|err| {
            tracing::error!(package_name, error = %err, "unable to restore K/V data");
        })
    }

    async fn restore<S>(&self, state: &KvRestoreState, sink: &mut S) -> Result<usize>
    where
        S: RecordSink + ?Sized,
    {
        let package_name = state.package_name.as_str();
        let parts: Vec<_> = self
            .loader
            .load_files(state.handles.clone())
            .try_collect()
            .await?;
        let sealed = parts.concat();

        let db = KvDb::open_temporary()?;
        for (key, value) in open_table(&self.crypto, package_name, &sealed).await? {
            db.put(&key, &value)?;
        }

        let mut records = db.get_all()?;
        if let (MAGIC_PACKAGE_MANAGER, Some(single)) =
            (package_name, state.auto_restore_package.as_deref())
        {
            tracing::debug!(single, "single package restore, restricting package metadata");
            let keys = [ANCESTRAL_RECORD_KEY, GLOBAL_METADATA_KEY, single];
            records.retain(|(key, _)| keys.contains(&key.as_str()));
        }

        for (key, value) in &records {
            tracing::trace!(key = %key, size = value.len(), "restoring record");
            sink.write_record(key, value).await?;
        }
        tracing::info!(package_name, records = records.len(), "restored K/V data");
        Ok(records.len())
    }
}
