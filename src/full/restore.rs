use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::Stream;
use tokio::io::AsyncReadExt;
use tokio_util::io::StreamReader;

use crate::backend::{Backend, FileHandle};
use crate::config::RestoreConfig;
use crate::crypto::Crypto;
use crate::error::{Error, Result};
use crate::loader::Loader;
use crate::snapshot::Snapshot;

type BlobStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

struct FullRestoreState {
    package_name: String,
    handles: Vec<FileHandle>,
    /// Opened on the first pull.
    reader: Option<StreamReader<BlobStream, Bytes>>,
}

/// Restores the data stream of one app at a time, handing it out in
/// segments as the OS asks for them.
pub struct FullRestore<B> {
    crypto: Arc<Crypto>,
    loader: Loader<B>,
    config: RestoreConfig,
    state: Option<FullRestoreState>,
}

impl<B: Backend + 'static> FullRestore<B> {
    pub fn new(crypto: Arc<Crypto>, backend: Arc<B>, config: RestoreConfig) -> Self {
        Self {
            loader: Loader::new(crypto.clone(), backend),
            crypto,
            config,
            state: None,
        }
    }

    pub fn has_state(&self) -> bool {
        self.state.is_some()
    }

    /// Prepares restoring `package_name` from `snapshot`.
    ///
    /// The OS moves on to the next package without aborting when it skips
    /// one, so this replaces any state still in place, along with its open
    /// blob stream.
    pub fn initialize_state(&mut self, snapshot: &Snapshot, package_name: &str) -> Result<()> {
        let app = snapshot.apps.get(package_name).ok_or_else(|| {
            Error::InvalidFormat(format!("no app {package_name} in snapshot {}", snapshot.token))
        })?;
        let handles = snapshot.blob_handles(self.crypto.repo_id(), &app.chunk_ids)?;
        if let Some(previous) = &self.state {
            tracing::info!(package_name = %previous.package_name, "replacing unfinished full restore");
        }
        self.state = Some(FullRestoreState {
            package_name: package_name.to_owned(),
            handles,
            reader: None,
        });
        Ok(())
    }

    /// Returns the next segment of at most `max_len` bytes, or `None` once all
    /// data of the current app was handed out.
    ///
    /// Segments never span more than one blob, and an error leaves the state in
    /// place until [`FullRestore::abort_full_restore`] is called.
    pub async fn get_next_chunk(&mut self, max_len: usize) -> Result<Option<Bytes>> {
        let Some(state) = self.state.as_mut() else {
            return Err(Error::IllegalState("no full restore state".into()));
        };
        let reader = match &mut state.reader {
            Some(reader) => reader,
            empty => {
                tracing::info!(package_name = %state.package_name, "first chunk, opening blob stream");
                let stream: BlobStream = Box::pin(self.loader.load_files(state.handles.clone()));
                empty.insert(StreamReader::new(stream))
            }
        };

        let mut buffer = vec![0u8; max_len.min(self.config.max_segment_length).max(1)];
        let read = reader.read(&mut buffer).await.map_err(|err| {
            tracing::warn!(package_name = %state.package_name, error = %err, "error reading full restore data");
            unwrap_io_error(err)
        })?;
        if read == 0 {
            tracing::info!(package_name = %state.package_name, "EOF");
            return Ok(None);
        }
        buffer.truncate(read);
        Ok(Some(buffer.into()))
    }

    /// Abandons the restore of the current app.
    pub fn abort_full_restore(&mut self) -> Result<()> {
        let Some(state) = self.state.take() else {
            return Err(Error::IllegalState("no full restore state to abort".into()));
        };
        tracing::info!(package_name = %state.package_name, "aborting full restore");
        Ok(())
    }

    /// Ends the restore session, dropping any in-progress transfer.
    pub fn finish_restore(&mut self) {
        if let Some(state) = self.state.take() {
            tracing::info!(package_name = %state.package_name, "finishing full restore");
        }
    }
}

/// Recovers our own error from the I/O error the stream reader wraps it in.
fn unwrap_io_error(err: std::io::Error) -> Error {
    err.downcast::<Error>().unwrap_or_else(Error::Io)
}
