//! Content-defined chunking with a keyed gear table.
//!
//! This is FastCDC with normalization level 1: no cut point is considered
//! before `min_size`, a stricter mask is used until `avg_size` and a looser
//! one after it, and a cut is forced at `max_size`. The gear table is derived
//! from a secret key, so chunk boundaries are not predictable without it.

use crate::config::ChunkerConfig;
use crate::datamodel::{Chunk, ChunkId};

/// Number of trailing bytes that influence the masked bits of the hash.
const WINDOW: usize = 64;

pub struct GearTable([u64; 256]);

impl GearTable {
    pub fn from_key(key: &[u8; 32]) -> Self {
        let mut bytes = [0u8; 256 * 8];
        blake3::Hasher::new_keyed(key)
            .update(b"gear table")
            .finalize_xof()
            .fill(&mut bytes);

        let mut table = [0u64; 256];
        for (entry, bytes) in table.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut le = [0u8; 8];
            le.copy_from_slice(bytes);
            *entry = u64::from_le_bytes(le);
        }
        Self(table)
    }
}

/// Splits one byte stream at a time into [`Chunk`]s.
///
/// Bytes are pushed in with [`Chunker::add_bytes`]; once the stream ends,
/// [`Chunker::finalize`] flushes the tail and readies the chunker for the
/// next stream.
pub struct Chunker {
    config: ChunkerConfig,
    gear: GearTable,
    chunk_id_key: [u8; 32],
    mask_s: u64,
    mask_l: u64,

    /// Bytes of the chunk currently being accumulated.
    buffer: Vec<u8>,
    /// How many bytes of `buffer` already went through the rolling hash.
    scanned: usize,
    hash: u64,
    /// Stream offset of `buffer[0]`.
    offset: u64,
}

impl Chunker {
    pub fn new(config: ChunkerConfig, gear_table_key: &[u8; 32], chunk_id_key: &[u8; 32]) -> Self {
        let bits = (config.avg_size as f64).log2().round() as u32;
        Self {
            config,
            gear: GearTable::from_key(gear_table_key),
            chunk_id_key: *chunk_id_key,
            mask_s: high_mask(bits + 1),
            mask_l: high_mask(bits.saturating_sub(1)),
            buffer: Vec::new(),
            scanned: 0,
            hash: 0,
            offset: 0,
        }
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Feeds more bytes of the stream and returns all chunks completed by them.
    pub fn add_bytes(&mut self, bytes: &[u8]) -> Vec<Chunk> {
        self.buffer.extend_from_slice(bytes);

        let mut chunks = vec![];
        while let Some(len) = self.next_cut_point() {
            chunks.push(self.cut(len));
        }
        chunks
    }

    /// Ends the current stream.
    ///
    /// Returns the trailing partial chunk, if any. A stream that never got any
    /// bytes yields exactly one empty chunk.
    pub fn finalize(&mut self) -> Vec<Chunk> {
        let mut chunks = vec![];
        while let Some(len) = self.next_cut_point() {
            chunks.push(self.cut(len));
        }
        if !self.buffer.is_empty() || self.offset == 0 {
            let len = self.buffer.len();
            chunks.push(self.cut(len));
        }
        self.offset = 0;
        chunks
    }

    fn next_cut_point(&mut self) -> Option<usize> {
        let min_size = self.config.min_size as usize;
        let avg_size = self.config.avg_size as usize;
        let max_size = self.config.max_size as usize;

        // bytes further than `WINDOW` before `min_size` can not influence a
        // cut point, so they are skipped entirely
        let hash_from = min_size.saturating_sub(WINDOW);
        if self.scanned < hash_from {
            self.scanned = hash_from.min(self.buffer.len());
        }

        while self.scanned < self.buffer.len() {
            let byte = self.buffer[self.scanned];
            self.scanned += 1;
            let len = self.scanned;

            if len >= max_size {
                return Some(max_size);
            }
            self.hash = (self.hash << 1).wrapping_add(self.gear.0[byte as usize]);
            if len < min_size {
                continue;
            }
            let mask = if len < avg_size {
                self.mask_s
            } else {
                self.mask_l
            };
            if self.hash & mask == 0 {
                return Some(len);
            }
        }
        None
    }

    fn cut(&mut self, len: usize) -> Chunk {
        let rest = self.buffer.split_off(len);
        let data = std::mem::replace(&mut self.buffer, rest);
        self.scanned = 0;
        self.hash = 0;

        let chunk = Chunk {
            offset: self.offset,
            hash: ChunkId::from(blake3::keyed_hash(&self.chunk_id_key, &data)),
            data,
        };
        self.offset += len as u64;
        chunk
    }
}

/// A mask selecting the `bits` most significant bits, which depend on the
/// whole window rather than just the last few bytes.
fn high_mask(bits: u32) -> u64 {
    match bits {
        0 => 0,
        64.. => u64::MAX,
        bits => u64::MAX << (64 - bits),
    }
}
