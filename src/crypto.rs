//! Key derivation and authenticated encryption.
//!
//! All secrets are derived from a single 32-byte main key supplied by a
//! [`KeyProvider`]. Encrypted payloads use XChaCha20-Poly1305 in the STREAM
//! construction: `[19-byte nonce prefix][segment]...[last segment]`, where
//! every segment but the last holds exactly [`SEGMENT_SIZE`] plaintext bytes.

use chacha20poly1305::aead::generic_array::GenericArray;
use chacha20poly1305::aead::stream::{DecryptorBE32, EncryptorBE32};
use chacha20poly1305::aead::{KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305};
use rand::RngCore;

use crate::datamodel::{ChunkId, RepoId};
use crate::error::{Error, Result};

/// Version byte written in front of every blob and snapshot.
pub const VERSION: u8 = 2;

/// Plaintext bytes per STREAM segment.
pub const SEGMENT_SIZE: usize = 1024 * 1024;
pub const NONCE_PREFIX_LEN: usize = 19;
pub const TAG_LEN: usize = 16;

const CTX_STREAM_KEY: &str = "appvault 2024-06-01 app backup stream key";
const CTX_GEAR_TABLE_KEY: &str = "appvault 2024-06-01 app backup gear table key";
const CTX_CHUNK_ID_KEY: &str = "appvault 2024-06-01 app backup chunk id key";
const CTX_REPO_ID_KEY: &str = "appvault 2024-06-01 app backup repo id key";
const CTX_NONCE_KEY: &str = "appvault 2024-06-01 app backup synthetic nonce key";

/// Supplies the secret material the pipeline works with.
pub trait KeyProvider {
    fn main_key(&self) -> [u8; 32];

    /// A stable identifier of this device, used to namespace the repository.
    fn device_id(&self) -> &str;
}

/// A [`KeyProvider`] over fixed, already loaded key material.
#[derive(Clone)]
pub struct StaticKeyProvider {
    main_key: [u8; 32],
    device_id: String,
}

impl StaticKeyProvider {
    pub fn new(main_key: [u8; 32], device_id: impl Into<String>) -> Self {
        Self {
            main_key,
            device_id: device_id.into(),
        }
    }
}

impl KeyProvider for StaticKeyProvider {
    fn main_key(&self) -> [u8; 32] {
        self.main_key
    }

    fn device_id(&self) -> &str {
        &self.device_id
    }
}

pub struct Crypto {
    stream_key: [u8; 32],
    gear_table_key: [u8; 32],
    chunk_id_key: [u8; 32],
    nonce_key: [u8; 32],
    repo_id: RepoId,
}

impl Crypto {
    pub fn new(keys: &impl KeyProvider) -> Self {
        let main_key = keys.main_key();
        let repo_id_key = blake3::derive_key(CTX_REPO_ID_KEY, &main_key);
        let repo_id = blake3::keyed_hash(&repo_id_key, keys.device_id().as_bytes()).into();

        Self {
            stream_key: blake3::derive_key(CTX_STREAM_KEY, &main_key),
            gear_table_key: blake3::derive_key(CTX_GEAR_TABLE_KEY, &main_key),
            chunk_id_key: blake3::derive_key(CTX_CHUNK_ID_KEY, &main_key),
            nonce_key: blake3::derive_key(CTX_NONCE_KEY, &main_key),
            repo_id,
        }
    }

    pub fn repo_id(&self) -> RepoId {
        self.repo_id
    }

    pub fn gear_table_key(&self) -> &[u8; 32] {
        &self.gear_table_key
    }

    pub fn chunk_id_key(&self) -> &[u8; 32] {
        &self.chunk_id_key
    }

    pub fn chunk_id(&self, data: &[u8]) -> ChunkId {
        blake3::keyed_hash(&self.chunk_id_key, data).into()
    }

    pub fn ad_for_version(&self, version: u8) -> Vec<u8> {
        vec![version]
    }

    /// Associated data binding a KV table to its package.
    pub fn ad_for_kv(&self, version: u8, package_name: &str) -> Vec<u8> {
        let mut ad = Vec::with_capacity(1 + package_name.len());
        ad.push(version);
        ad.extend_from_slice(package_name.as_bytes());
        ad
    }

    pub fn random_bytes(&self, len: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes
    }

    /// Encrypts `plaintext` under a fresh random nonce and appends the
    /// framed ciphertext to `out`.
    pub fn encrypt_into(&self, plaintext: &[u8], ad: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let mut nonce = [0u8; NONCE_PREFIX_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        self.encrypt_with_nonce(nonce, plaintext, ad, out)
    }

    /// Like [`Crypto::encrypt_into`], but the nonce is a keyed hash over
    /// `ad` and `plaintext`, so equal inputs produce equal ciphertexts.
    pub fn encrypt_deterministic_into(
        &self,
        plaintext: &[u8],
        ad: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<()> {
        let hash = blake3::Hasher::new_keyed(&self.nonce_key)
            .update(&(ad.len() as u64).to_le_bytes())
            .update(ad)
            .update(plaintext)
            .finalize();
        let mut nonce = [0u8; NONCE_PREFIX_LEN];
        nonce.copy_from_slice(&hash.as_bytes()[..NONCE_PREFIX_LEN]);
        self.encrypt_with_nonce(nonce, plaintext, ad, out)
    }

    fn encrypt_with_nonce(
        &self,
        nonce: [u8; NONCE_PREFIX_LEN],
        plaintext: &[u8],
        ad: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<()> {
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&self.stream_key));
        let mut encryptor = EncryptorBE32::from_aead(cipher, GenericArray::from_slice(&nonce));

        out.reserve(NONCE_PREFIX_LEN + plaintext.len() + TAG_LEN * segment_count(plaintext.len()));
        out.extend_from_slice(&nonce);

        let mut rest = plaintext;
        while rest.len() > SEGMENT_SIZE {
            let (segment, tail) = rest.split_at(SEGMENT_SIZE);
            let ciphertext = encryptor
                .encrypt_next(Payload { msg: segment, aad: ad })
                .map_err(|_| Error::EncryptionFailed)?;
            out.extend_from_slice(&ciphertext);
            rest = tail;
        }
        let ciphertext = encryptor
            .encrypt_last(Payload { msg: rest, aad: ad })
            .map_err(|_| Error::EncryptionFailed)?;
        out.extend_from_slice(&ciphertext);
        Ok(())
    }

    /// Decrypts and authenticates data framed by one of the encrypt functions.
    pub fn decrypt(&self, data: &[u8], ad: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_PREFIX_LEN + TAG_LEN {
            return Err(Error::DecryptionFailed);
        }
        let (nonce, mut rest) = data.split_at(NONCE_PREFIX_LEN);
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&self.stream_key));
        let mut decryptor = DecryptorBE32::from_aead(cipher, GenericArray::from_slice(nonce));

        let mut plaintext = Vec::with_capacity(rest.len());
        while rest.len() > SEGMENT_SIZE + TAG_LEN {
            let (segment, tail) = rest.split_at(SEGMENT_SIZE + TAG_LEN);
            let decrypted = decryptor
                .decrypt_next(Payload { msg: segment, aad: ad })
                .map_err(|_| Error::DecryptionFailed)?;
            plaintext.extend_from_slice(&decrypted);
            rest = tail;
        }
        let decrypted = decryptor
            .decrypt_last(Payload { msg: rest, aad: ad })
            .map_err(|_| Error::DecryptionFailed)?;
        plaintext.extend_from_slice(&decrypted);
        Ok(plaintext)
    }
}

fn segment_count(plaintext_len: usize) -> usize {
    plaintext_len.saturating_sub(1) / SEGMENT_SIZE + 1
}

/// The size a payload of `size` bytes gets padded to (Padmé).
///
/// The overhead is at most 12% and the padded size leaks O(log log n) bits.
pub fn pad_to(size: usize) -> usize {
    if size < 2 {
        return size;
    }
    let e = usize::BITS - 1 - size.leading_zeros();
    let s = u32::BITS - e.leading_zeros();
    let last_bits = e - s;
    let mask = (1usize << last_bits) - 1;
    (size + mask) & !mask
}
