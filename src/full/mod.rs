//! Full app backups, a single opaque byte stream per app.

pub mod backup;
pub mod restore;

pub use backup::{FullBackup, SendStatus, SizeCheck};
pub use restore::FullRestore;
