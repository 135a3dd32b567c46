use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The keyed content hash of a plaintext [`Chunk`].
#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkId(pub [u8; 32]);

/// The content-addressable ID of a stored [`Blob`], the hash of its ciphertext.
#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlobId(pub [u8; 32]);

/// Identifies the backup repository of one user on one device.
#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RepoId(pub [u8; 32]);

macro_rules! hex_id {
    ($ty:ident) => {
        impl $ty {
            pub fn from_hex(hex: &str) -> Result<Self> {
                let mut bytes = [0u8; 32];
                let decoded = base16ct::mixed::decode(hex, &mut bytes)
                    .map_err(|_| Error::InvalidFormat(format!("invalid hex id: {hex:?}")))?;
                if decoded.len() != 32 {
                    return Err(Error::InvalidFormat(format!("short hex id: {hex:?}")));
                }
                Ok(Self(bytes))
            }

            pub fn to_hex(&self) -> String {
                base16ct::lower::encode_string(&self.0)
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl From<blake3::Hash> for $ty {
            fn from(hash: blake3::Hash) -> Self {
                Self(*hash.as_bytes())
            }
        }
    };
}

hex_id!(ChunkId);
hex_id!(BlobId);
hex_id!(RepoId);

/// A content-defined slice of a plaintext byte stream.
#[derive(Clone)]
pub struct Chunk {
    pub offset: u64,
    pub hash: ChunkId,
    pub data: Vec<u8>,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// The encrypted, compressed, on-backend representation of one chunk.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Blob {
    pub id: BlobId,
    /// Number of bytes stored on the backend.
    pub length: u32,
    /// Length of the plaintext chunk.
    pub uncompressed_length: u32,
}

/// What a [`crate::receiver::BackupReceiver`] hands back for one byte stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupData {
    pub chunk_ids: Vec<ChunkId>,
    pub blob_map: BTreeMap<ChunkId, Blob>,
}

impl BackupData {
    /// Size of the plaintext this data was created from.
    pub fn size(&self) -> u64 {
        self.chunk_ids
            .iter()
            .filter_map(|chunk_id| self.blob_map.get(chunk_id))
            .map(|blob| blob.uncompressed_length as u64)
            .sum()
    }
}

mod dbg {
    use super::*;
    use core::fmt;

    impl fmt::Debug for ChunkId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "ChunkId({:x})", base16ct::HexDisplay(&self.0[..6]))
        }
    }

    impl fmt::Display for ChunkId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:x}", base16ct::HexDisplay(&self.0))
        }
    }

    impl fmt::Debug for BlobId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "BlobId({:x})", base16ct::HexDisplay(&self.0[..6]))
        }
    }

    impl fmt::Display for BlobId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:x}", base16ct::HexDisplay(&self.0))
        }
    }

    impl fmt::Debug for RepoId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "RepoId({:x})", base16ct::HexDisplay(&self.0[..6]))
        }
    }

    impl fmt::Display for RepoId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:x}", base16ct::HexDisplay(&self.0))
        }
    }

    impl fmt::Debug for Chunk {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("Chunk")
                .field("offset", &self.offset)
                .field("length", &self.data.len())
                .field("hash", &self.hash)
                .finish()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_ids() {
        let id = ChunkId::from(blake3::hash(b"some chunk"));
        let hex = id.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(hex, id.to_string());
        assert_eq!(ChunkId::from_hex(&hex).unwrap(), id);
        assert_eq!(ChunkId::from_hex(&hex.to_uppercase()).unwrap(), id);

        assert!(BlobId::from_hex("abcd").is_err());
        assert!(BlobId::from_hex("not hex at all").is_err());
    }

    #[test]
    fn test_backup_data_size() {
        let a = ChunkId([1; 32]);
        let b = ChunkId([2; 32]);
        let blob = |len| Blob {
            id: BlobId([0; 32]),
            length: 42,
            uncompressed_length: len,
        };
        let data = BackupData {
            chunk_ids: vec![a, b, a],
            blob_map: [(a, blob(10)), (b, blob(5))].into_iter().collect(),
        };
        assert_eq!(data.size(), 25);
        assert_eq!(BackupData::default().size(), 0);
    }
}
