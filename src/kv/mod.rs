//! Key/value app backups.
//!
//! The change set an app hands over is replayed into a fresh local store,
//! which then gets serialized, encrypted and stored as a single stream.

use async_compression::tokio::bufread::GzipDecoder;
use async_compression::tokio::write::GzipEncoder;
use fjall::{PersistMode, TransactionalKeyspace, TransactionalPartitionHandle};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::crypto::{Crypto, VERSION};
use crate::error::{Error, Result};

pub mod backup;
pub mod changeset;
pub mod restore;

pub use backup::{KvBackup, KvBackupFlags, KvBackupStatus};
pub use changeset::{ChangeSetReader, ChangeSetWriter, KvOperation, RecordSink};
pub use restore::KvRestore;

/// The package of the OS package manager, whose metadata is backed up as a
/// key/value app.
pub const MAGIC_PACKAGE_MANAGER: &str = "@pm@";
/// Not a real package, signals the end of packages without new data.
pub const NO_DATA_END_SENTINEL: &str = "@end@";
pub const ANCESTRAL_RECORD_KEY: &str = "@ancestral_record@";
pub const GLOBAL_METADATA_KEY: &str = "@meta@";

/// An ephemeral local key/value table, deleted when dropped.
pub struct KvDb {
    keyspace: TransactionalKeyspace,
    records: TransactionalPartitionHandle,
    // must be dropped last
    _dir: tempfile::TempDir,
}

impl KvDb {
    pub fn open_temporary() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let keyspace = fjall::Config::new(dir.path()).open_transactional()?;
        let records = keyspace.open_partition("records", Default::default())?;
        Ok(Self {
            keyspace,
            records,
            _dir: dir,
        })
    }

    pub fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut write_tx = self.keyspace.write_tx()?;
        write_tx.insert(&self.records, key, value);
        commit(write_tx)
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        let mut write_tx = self.keyspace.write_tx()?;
        write_tx.remove(&self.records, key);
        commit(write_tx)
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let read_tx = self.keyspace.read_tx();
        Ok(read_tx.get(&self.records, key)?.map(|value| value.to_vec()))
    }

    /// All records, sorted by key.
    pub fn get_all(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let read_tx = self.keyspace.read_tx();
        read_tx
            .iter(&self.records)
            .map(|kv| -> Result<(String, Vec<u8>)> {
                let (key, value) = kv?;
                let key = String::from_utf8(key.to_vec())
                    .map_err(|_| Error::InvalidFormat("non UTF-8 record key".into()))?;
                Ok((key, value.to_vec()))
            })
            .collect()
    }

    /// Flushes everything to disk.
    pub fn vacuum(&self) -> Result<()> {
        Ok(self.keyspace.persist(PersistMode::SyncAll)?)
    }
}

fn commit(write_tx: fjall::WriteTransaction) -> Result<()> {
    write_tx
        .commit()?
        .map_err(|_| Error::IllegalState("conflicting write to local KV store".into()))
}

/// Serializes, compresses and encrypts a whole KV table:
///
/// ```text
/// [version][nonce][AEAD stream of: gzip(postcard(records))]
/// ```
///
/// The associated data binds the table to its package. The nonce is derived
/// from the contents, so an unchanged table encrypts to the same bytes and
/// keeps deduplicating.
pub(crate) async fn seal_table(
    crypto: &Crypto,
    package_name: &str,
    records: &[(String, Vec<u8>)],
) -> Result<Vec<u8>> {
    let serialized = postcard::to_stdvec(records)?;

    let mut encoder = GzipEncoder::new(Vec::new());
    encoder.write_all(&serialized).await?;
    encoder.shutdown().await?;
    let compressed = encoder.into_inner();

    let mut sealed = vec![VERSION];
    let ad = crypto.ad_for_kv(VERSION, package_name);
    crypto.encrypt_deterministic_into(&compressed, &ad, &mut sealed)?;
    Ok(sealed)
}

pub(crate) async fn open_table(
    crypto: &Crypto,
    package_name: &str,
    sealed: &[u8],
) -> Result<Vec<(String, Vec<u8>)>> {
    let (&version, ciphertext) = sealed
        .split_first()
        .ok_or_else(|| Error::InvalidFormat("empty KV table".into()))?;
    if version != VERSION {
        return Err(Error::UnsupportedVersion(version));
    }
    let ad = crypto.ad_for_kv(version, package_name);
    let compressed = crypto.decrypt(ciphertext, &ad)?;

    let mut serialized = vec![];
    GzipDecoder::new(&compressed[..])
        .read_to_end(&mut serialized)
        .await
        .map_err(|e| Error::Decompression(e.to_string()))?;
    Ok(postcard::from_bytes(&serialized)?)
}
