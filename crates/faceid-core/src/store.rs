//! Persistence seam for enrolled encodings.
//!
//! The engine never touches storage directly; it reads and writes opaque
//! encoding blobs ([`FaceEncoding::to_bytes`](crate::FaceEncoding::to_bytes))
//! through this trait.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store backend: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("record for `{identity}` is corrupt: {reason}")]
    Corrupt { identity: String, reason: String },
}

impl StoreError {
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Backend(Box::new(err))
    }
}

/// One persisted enrollment: identity key plus serialized encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrollmentRecord {
    pub identity: String,
    pub blob: Vec<u8>,
}

/// Key-value store of encoding blobs keyed by identity.
///
/// `load_all` must return records in a stable order (first enrollment
/// first); identification is first-match-wins over that order.
pub trait EncodingStore: Send + Sync {
    /// Insert or overwrite the blob for `identity`. Overwriting keeps the
    /// record's original position in `load_all`.
    fn put(&self, identity: &str, blob: &[u8]) -> Result<(), StoreError>;

    fn contains(&self, identity: &str) -> Result<bool, StoreError>;

    /// Delete `identity`. Returns whether a record existed.
    fn remove(&self, identity: &str) -> Result<bool, StoreError>;

    fn load_all(&self) -> Result<Vec<EnrollmentRecord>, StoreError>;
}
