//! Encrypted, deduplicated app backups.
//!
//! App data arrives as byte streams, either as a change set of key/value
//! records or as one opaque stream per app. Streams are split into
//! content-defined chunks, every new chunk is stored as one encrypted blob,
//! and each backup run ends with a [`snapshot::Snapshot`] that lists which
//! chunks make up which app. Restore walks a snapshot back to the blobs.
//!
//! [`AppBackupManager`] drives a backup run, [`kv::KvRestore`] and
//! [`full::FullRestore`] hand the data back.

pub mod backend;
pub mod blob_cache;
pub mod blob_creator;
pub mod chunker;
pub mod config;
pub mod crypto;
pub mod datamodel;
pub mod error;
pub mod full;
pub mod kv;
pub mod loader;
pub mod manager;
pub mod receiver;
pub mod retry;
pub mod snapshot;

#[cfg(test)]
mod testutil;

pub use config::Config;
pub use crypto::{Crypto, KeyProvider, StaticKeyProvider};
pub use error::{Error, Result};
pub use manager::AppBackupManager;
