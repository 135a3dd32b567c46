use std::sync::Arc;

use rand::RngCore;

use crate::backend::{Backend, FileHandle};
use crate::crypto::{self, Crypto, VERSION};
use crate::datamodel::{Blob, BlobId, Chunk};
use crate::error::{Error, Result};

/// Compresses, pads, encrypts and uploads single chunks.
///
/// A stored blob looks like this:
///
/// ```text
/// [version]
/// [nonce][AEAD stream of:
///     [u32 BE compressed size][zstd payload][random padding]]
/// ```
///
/// and its [`BlobId`] is the BLAKE3 hash over all of those bytes.
pub struct BlobCreator<B> {
    crypto: Arc<Crypto>,
    backend: Arc<B>,
    compressor: zstd::bulk::Compressor<'static>,
    compressed: Vec<u8>,
    plaintext: Vec<u8>,
}

impl<B: Backend> BlobCreator<B> {
    pub fn new(crypto: Arc<Crypto>, backend: Arc<B>, compression_level: i32) -> Result<Self> {
        Ok(Self {
            crypto,
            backend,
            compressor: zstd::bulk::Compressor::new(compression_level)?,
            compressed: Vec::new(),
            plaintext: Vec::new(),
        })
    }

    /// Creates a new [`Blob`] from the given chunk and uploads it.
    ///
    /// Nothing is returned unless the backend confirmed the save, so callers
    /// never end up referencing a blob that was not written.
    pub async fn create_blob(&mut self, chunk: &Chunk) -> Result<Blob> {
        self.compressed.clear();
        self.plaintext.clear();

        self.compressed
            .reserve(zstd::zstd_safe::compress_bound(chunk.len()));
        self.compressor
            .compress_to_buffer(&chunk.data, &mut self.compressed)?;
        let payload_size = u32::try_from(self.compressed.len())
            .map_err(|_| Error::InvalidFormat("compressed chunk too large".into()))?;

        // we could pad with zeros, but random bytes don't give away anything
        let padding = crypto::pad_to(self.compressed.len()) - self.compressed.len();
        self.plaintext.extend_from_slice(&payload_size.to_be_bytes());
        self.plaintext.extend_from_slice(&self.compressed);
        let padding_start = self.plaintext.len();
        self.plaintext.resize(padding_start + padding, 0);
        rand::thread_rng().fill_bytes(&mut self.plaintext[padding_start..]);

        let mut blob = Vec::with_capacity(1 + self.plaintext.len() + 64);
        blob.push(VERSION);
        let ad = self.crypto.ad_for_version(VERSION);
        self.crypto.encrypt_into(&self.plaintext, &ad, &mut blob)?;
        self.compressed.clear();
        self.plaintext.clear();

        let id = BlobId::from(blake3::hash(&blob));
        let handle = FileHandle::blob(self.crypto.repo_id(), id);
        let length = self
            .backend
            .save(&handle, blob)
            .await
            .map_err(Error::backend)?;

        tracing::trace!(?id, length, uncompressed = chunk.len(), "created blob");
        Ok(Blob {
            id,
            length: u32::try_from(length)
                .map_err(|_| Error::InvalidFormat(format!("blob {id} too large")))?,
            uncompressed_length: chunk.len() as u32,
        })
    }
}
