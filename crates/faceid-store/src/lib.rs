//! faceid-store: `EncodingStore` implementations.
//!
//! [`MemoryStore`] keeps records in process memory; [`SqliteStore`] persists
//! them in a single SQLite table and can seal blobs at rest with
//! [`BlobSealer`].

pub mod memory;
pub mod seal;
pub mod sqlite;

pub use memory::MemoryStore;
pub use seal::{BlobSealer, SealError};
pub use sqlite::SqliteStore;
