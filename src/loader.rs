use std::sync::Arc;

use async_compression::tokio::bufread::ZstdDecoder;
use bytes::Bytes;
use futures_util::Stream;
use tokio::io::AsyncReadExt;

use crate::backend::{Backend, FileHandle};
use crate::crypto::{Crypto, VERSION};
use crate::datamodel::BlobId;
use crate::error::{Error, Result};

/// Upper bound for the decompressed size of a single file.
const MAX_DECOMPRESSED_SIZE: u64 = 256 * 1024 * 1024;

/// Loads blobs and snapshots from the backend and turns them back into
/// plaintext.
///
/// The whole ciphertext is held in memory so its hash can be verified before
/// anything gets parsed.
pub struct Loader<B> {
    crypto: Arc<Crypto>,
    backend: Arc<B>,
}

impl<B> Clone for Loader<B> {
    fn clone(&self) -> Self {
        Self {
            crypto: self.crypto.clone(),
            backend: self.backend.clone(),
        }
    }
}

impl<B: Backend> Loader<B> {
    pub fn new(crypto: Arc<Crypto>, backend: Arc<B>) -> Self {
        Self { crypto, backend }
    }

    /// Downloads the raw, still encrypted bytes of a file.
    pub async fn load_ciphertext(&self, handle: &FileHandle) -> Result<Vec<u8>> {
        let mut reader = self.backend.load(handle).await.map_err(Error::backend)?;
        let mut ciphertext = vec![];
        reader.read_to_end(&mut ciphertext).await?;
        Ok(ciphertext)
    }

    /// Downloads, verifies, decrypts and decompresses a file.
    pub async fn load_file(&self, handle: &FileHandle) -> Result<Vec<u8>> {
        let ciphertext = self.load_ciphertext(handle).await?;
        self.decode(handle, &ciphertext).await
    }

    /// Loads the given files one after the other, in order.
    pub fn load_files(
        &self,
        handles: Vec<FileHandle>,
    ) -> impl Stream<Item = Result<Bytes>> + Send + 'static
    where
        B: 'static,
    {
        let loader = self.clone();
        async_stream::try_stream! {
            for handle in handles {
                let plaintext = loader.load_file(&handle).await?;
                yield Bytes::from(plaintext);
            }
        }
    }

    /// Decodes the ciphertext of the file identified by `handle`, which may
    /// come from the backend or from a local cache.
    pub async fn decode(&self, handle: &FileHandle, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let actual = BlobId::from(blake3::hash(ciphertext));
        if actual != handle.hash {
            return Err(Error::HashMismatch {
                handle: handle.to_string(),
                actual: actual.to_hex(),
            });
        }

        let (&version, rest) = ciphertext
            .split_first()
            .ok_or_else(|| Error::InvalidFormat(format!("{handle} is empty")))?;
        if version <= 1 {
            return Err(Error::InvalidFormat(format!(
                "{handle} has unexpected version {version}"
            )));
        }
        if version > VERSION {
            return Err(Error::UnsupportedVersion(version));
        }

        let ad = self.crypto.ad_for_version(version);
        let plaintext = self.crypto.decrypt(rest, &ad)?;
        let payload = unpad(&plaintext)?;

        let mut decoder = ZstdDecoder::new(payload).take(MAX_DECOMPRESSED_SIZE + 1);
        let mut decompressed = vec![];
        decoder
            .read_to_end(&mut decompressed)
            .await
            .map_err(|e| Error::Decompression(e.to_string()))?;
        if decompressed.len() as u64 > MAX_DECOMPRESSED_SIZE {
            return Err(Error::Decompression(format!(
                "{handle} exceeds {MAX_DECOMPRESSED_SIZE} bytes"
            )));
        }
        Ok(decompressed)
    }
}

/// Strips the size prefix and the padding from a decrypted payload.
pub(crate) fn unpad(plaintext: &[u8]) -> Result<&[u8]> {
    let (size, rest) = plaintext
        .split_first_chunk::<4>()
        .ok_or_else(|| Error::InvalidFormat("missing payload size".into()))?;
    let size = u32::from_be_bytes(*size) as usize;
    rest.get(..size).ok_or_else(|| {
        Error::InvalidFormat(format!(
            "payload size {size} exceeds decrypted length {}",
            rest.len()
        ))
    })
}
