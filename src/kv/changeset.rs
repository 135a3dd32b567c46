use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Value size marking a deleted key.
const DELETED: i32 = -1;

/// One entry of a key/value change set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvOperation {
    pub key: String,
    /// `None` deletes the key.
    pub value: Option<Vec<u8>>,
}

/// Reads a change set, encoded as a sequence of records:
///
/// ```text
/// [u32 BE key length][key, UTF-8][i32 BE value size, -1 = delete][value]
/// ```
pub struct ChangeSetReader<R> {
    reader: R,
}

impl<R: AsyncRead + Unpin> ChangeSetReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// The next operation, or `None` once the stream ended cleanly between
    /// two records.
    pub async fn next_operation(&mut self) -> Result<Option<KvOperation>> {
        let mut key_len = [0u8; 4];
        let read = read_full(&mut self.reader, &mut key_len).await?;
        match read {
            0 => return Ok(None),
            4 => {}
            _ => return Err(malformed("truncated record header")),
        }
        let key_len = u32::from_be_bytes(key_len) as u64;

        let mut key = Vec::new();
        (&mut self.reader).take(key_len).read_to_end(&mut key).await?;
        if key.len() as u64 != key_len {
            return Err(malformed("truncated key"));
        }
        let key = String::from_utf8(key).map_err(|_| malformed("key is not UTF-8"))?;

        let mut size = [0u8; 4];
        if read_full(&mut self.reader, &mut size).await? != 4 {
            return Err(malformed("truncated value size"));
        }
        let value = match i32::from_be_bytes(size) {
            DELETED => None,
            size if size < 0 => return Err(malformed("negative value size")),
            size => {
                let size = size as u64;
                // no preallocation, the size is not trustworthy
                let mut value = Vec::new();
                (&mut self.reader).take(size).read_to_end(&mut value).await?;
                if value.len() as u64 != size {
                    return Err(malformed("truncated value"));
                }
                Some(value)
            }
        };
        Ok(Some(KvOperation { key, value }))
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

/// Reads until `buf` is full or the stream ends, returning the bytes read.
async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await? {
            0 => break,
            read => filled += read,
        }
    }
    Ok(filled)
}

fn malformed(reason: &str) -> Error {
    Error::MalformedChangeSet(reason.into())
}

/// Where restored key/value records are written to.
#[async_trait::async_trait]
pub trait RecordSink: Send {
    async fn write_record(&mut self, key: &str, value: &[u8]) -> Result<()>;
}

/// Writes change sets in the format [`ChangeSetReader`] reads.
pub struct ChangeSetWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin + Send> ChangeSetWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write_record(&mut self, key: &str, value: &[u8]) -> Result<()> {
        let size = i32::try_from(value.len())
            .map_err(|_| Error::InvalidFormat(format!("value of {key:?} is too large")))?;
        self.write_key(key).await?;
        self.writer.write_all(&size.to_be_bytes()).await?;
        self.writer.write_all(value).await?;
        Ok(())
    }

    pub async fn write_delete(&mut self, key: &str) -> Result<()> {
        self.write_key(key).await?;
        self.writer.write_all(&DELETED.to_be_bytes()).await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        Ok(self.writer.flush().await?)
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    async fn write_key(&mut self, key: &str) -> Result<()> {
        let len = u32::try_from(key.len())
            .map_err(|_| Error::InvalidFormat("key is too large".into()))?;
        self.writer.write_all(&len.to_be_bytes()).await?;
        self.writer.write_all(key.as_bytes()).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl<W: AsyncWrite + Unpin + Send> RecordSink for ChangeSetWriter<W> {
    async fn write_record(&mut self, key: &str, value: &[u8]) -> Result<()> {
        ChangeSetWriter::write_record(self, key, value).await
    }
}
