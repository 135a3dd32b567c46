use std::collections::BTreeMap;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::backend::Backend;
use crate::blob_cache::BlobCache;
use crate::blob_creator::BlobCreator;
use crate::chunker::Chunker;
use crate::datamodel::{BackupData, Blob, Chunk, ChunkId};
use crate::error::{ensure_state, Result};

/// Where the KV and full engines hand their backup bytes to.
#[async_trait::async_trait]
pub trait BackupSink: Send {
    /// Adds more bytes to the stream of `owner`. A stream must be ended with
    /// [`BackupSink::finalize`], even after an error.
    async fn add_bytes(&mut self, owner: &str, bytes: &[u8]) -> Result<()>;

    /// Ends the stream of `owner` and returns what it was stored as.
    async fn finalize(&mut self, owner: &str) -> Result<BackupData>;

    /// Ends the stream of `owner` without storing its tail.
    fn discard(&mut self, owner: &str) -> Result<()>;
}

/// The single point all backup data goes through.
///
/// Bytes get split into chunks, and every chunk without a blob in the
/// [`BlobCache`] is turned into a new one. Only one stream can be in flight
/// at a time, the one of the current `owner`.
pub struct BackupReceiver<B> {
    chunker: Chunker,
    creator: BlobCreator<B>,
    cache: BlobCache,
    read_buffer_size: usize,

    chunk_ids: Vec<ChunkId>,
    blob_map: BTreeMap<ChunkId, Blob>,
    owner: Option<String>,
}

impl<B: Backend> BackupReceiver<B> {
    pub fn new(
        chunker: Chunker,
        creator: BlobCreator<B>,
        cache: BlobCache,
        read_buffer_size: usize,
    ) -> Self {
        Self {
            chunker,
            creator,
            cache,
            read_buffer_size,
            chunk_ids: vec![],
            blob_map: BTreeMap::new(),
            owner: None,
        }
    }

    pub fn cache(&self) -> &BlobCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut BlobCache {
        &mut self.cache
    }

    /// The owner of the stream currently in flight.
    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub async fn add_bytes(&mut self, owner: &str, bytes: &[u8]) -> Result<()> {
        self.check_owner(owner)?;
        for chunk in self.chunker.add_bytes(bytes) {
            self.on_new_chunk(chunk).await?;
        }
        Ok(())
    }

    /// Reads the whole `reader` as the stream of `owner`.
    ///
    /// No call to [`BackupReceiver::finalize`] is needed afterwards, also not
    /// when this fails.
    pub async fn read_from_stream<R>(&mut self, owner: &str, mut reader: R) -> Result<BackupData>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.check_owner(owner)?;
        let mut buffer = vec![0u8; self.read_buffer_size];
        loop {
            let read = match reader.read(&mut buffer).await {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) => {
                    self.reset();
                    return Err(err.into());
                }
            };
            if let Err(err) = self.add_bytes(owner, &buffer[..read]).await {
                self.reset();
                return Err(err);
            }
        }
        self.finalize(owner).await
    }

    /// Ends the current stream and returns its chunk ids and blobs.
    ///
    /// The receiver is ready for the next stream afterwards, whether this
    /// succeeded or not.
    pub async fn finalize(&mut self, owner: &str) -> Result<BackupData> {
        self.check_owner(owner)?;
        let mut result = Ok(());
        for chunk in self.chunker.finalize() {
            if result.is_ok() {
                result = self.on_new_chunk(chunk).await;
            }
        }
        let data = BackupData {
            chunk_ids: std::mem::take(&mut self.chunk_ids),
            blob_map: std::mem::take(&mut self.blob_map),
        };
        self.owner = None;
        result.map(|()| data)
    }

    /// Ends the current stream, dropping everything that was not stored yet.
    pub fn discard(&mut self, owner: &str) -> Result<()> {
        self.check_owner(owner)?;
        self.reset();
        Ok(())
    }

    fn reset(&mut self) {
        let _ = self.chunker.finalize();
        self.chunk_ids.clear();
        self.blob_map.clear();
        self.owner = None;
    }

    async fn on_new_chunk(&mut self, chunk: Chunk) -> Result<()> {
        let blob = match self.cache.get(&chunk.hash) {
            Some(blob) => blob,
            None => {
                let blob = self.creator.create_blob(&chunk).await?;
                self.cache.put(chunk.hash, blob).await?;
                blob
            }
        };
        self.chunk_ids.push(chunk.hash);
        self.blob_map.insert(chunk.hash, blob);
        Ok(())
    }

    fn check_owner(&mut self, owner: &str) -> Result<()> {
        match &self.owner {
            None => self.owner = Some(owner.to_owned()),
            Some(current) => {
                ensure_state!(current == owner, "owned by {current}, but called from {owner}");
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl<B: Backend> BackupSink for BackupReceiver<B> {
    async fn add_bytes(&mut self, owner: &str, bytes: &[u8]) -> Result<()> {
        BackupReceiver::add_bytes(self, owner, bytes).await
    }

    async fn finalize(&mut self, owner: &str) -> Result<BackupData> {
        BackupReceiver::finalize(self, owner).await
    }

    fn discard(&mut self, owner: &str) -> Result<()> {
        BackupReceiver::discard(self, owner)
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::task::{Context, Poll};

    use tokio::io::ReadBuf;

    use crate::backend::MemoryBackend;
    use crate::error::Error;
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

    /// Yields some bytes, then fails.
    struct FailingReader(usize);

    impl AsyncRead for FailingReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.0 == 0 {
                return Poll::Ready(Err(io::Error::other("broken pipe")));
            }
            let len = self.0.min(buf.remaining());
            buf.put_slice(&vec![7u8; len]);
            self.0 -= len;
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_dedup_within_stream() {
        let backend = Arc::new(MemoryBackend::new());
        let mut receiver = receiver(&backend);

        // all-zero data is cut at max size, into identical chunks
        let max = testutil::SMALL_CHUNKS.max_size as usize;
        let data = vec![0u8; 4 * max];
        receiver.add_bytes("app", &data).await.unwrap();
        let backup = receiver.finalize("app").await.unwrap();

        assert_eq!(backup.chunk_ids.len(), 4);
        assert_eq!(backup.blob_map.len(), 1);
        assert_eq!(backend.save_count(), 1);
        assert_eq!(backup.size(), data.len() as u64);
    }

    #[tokio::test]
    async fn test_dedup_across_streams() {
        let backend = Arc::new(MemoryBackend::new());
        let mut receiver = receiver(&backend);
        let data = testutil::random_bytes(1, 100_000);

        let first = receiver
            .read_from_stream("app", &data[..])
            .await
            .unwrap();
        let saves = backend.save_count();
        assert_eq!(saves, first.blob_map.len());

        let second = receiver
            .read_from_stream("other.app", &data[..])
            .await
            .unwrap();
        assert_eq!(backend.save_count(), saves);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_owner_checks() {
        let backend = Arc::new(MemoryBackend::new());
        let mut receiver = receiver(&backend);

        receiver.add_bytes("app", b"hello").await.unwrap();
        assert_eq!(receiver.owner(), Some("app"));
        let err = receiver.add_bytes("other", b"world").await.unwrap_err();
        assert!(matches!(err, Error::IllegalState(_)));
        let err = receiver.finalize("other").await.unwrap_err();
        assert!(matches!(err, Error::IllegalState(_)));

        let backup = receiver.finalize("app").await.unwrap();
        assert_eq!(backup.chunk_ids.len(), 1);
        assert_eq!(receiver.owner(), None);

        // free for the next owner
        let backup = receiver.finalize("other").await.unwrap();
        assert_eq!(backup.chunk_ids.len(), 1);
    }

    #[tokio::test]
    async fn test_failing_stream_leaves_receiver_reusable() {
        let backend = Arc::new(MemoryBackend::new());
        let mut receiver = receiver(&backend);

        let err = receiver
            .read_from_stream("app", FailingReader(50_000))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(receiver.owner(), None);

        let backup = receiver
            .read_from_stream("other", &b"fresh start"[..])
            .await
            .unwrap();
        assert_eq!(backup.chunk_ids.len(), 1);
        assert_eq!(backup.size(), 11);
    }

    #[tokio::test]
    async fn test_failing_save() {
        let backend = Arc::new(MemoryBackend::new());
        let mut receiver = receiver(&backend);

        backend.fail_next_saves(1);
        receiver.add_bytes("app", b"will not be saved").await.unwrap();
        let err = receiver.finalize("app").await.unwrap_err();
        assert!(matches!(err, Error::Backend(_)));
        assert_eq!(receiver.owner(), None);
        assert!(receiver.cache().is_empty());

        let backup = receiver.finalize("app").await.unwrap();
        assert_eq!(backup.chunk_ids.len(), 1);
        assert_eq!(backend.save_count(), 1);
    }

    #[tokio::test]
    async fn test_discard() {
        let backend = Arc::new(MemoryBackend::new());
        let mut receiver = receiver(&backend);

        receiver.add_bytes("app", b"unfinished").await.unwrap();
        receiver.discard("app").unwrap();
        assert_eq!(backend.save_count(), 0);

        let backup = receiver.finalize("next").await.unwrap();
        // the next stream starts clean, with a single empty chunk
        assert_eq!(backup.chunk_ids.len(), 1);
        assert_eq!(backup.size(), 0);
    }
}
