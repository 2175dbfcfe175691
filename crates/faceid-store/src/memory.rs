use faceid_core::{EncodingStore, EnrollmentRecord, StoreError};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Insertion-ordered in-memory store. Contents vanish with the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<Vec<EnrollmentRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<EnrollmentRecord>> {
        self.records.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<EnrollmentRecord>> {
        self.records.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl EncodingStore for MemoryStore {
    fn put(&self, identity: &str, blob: &[u8]) -> Result<(), StoreError> {
        let mut records = self.write();
        match records.iter_mut().find(|r| r.identity == identity) {
            Some(existing) => existing.blob = blob.to_vec(),
            None => records.push(EnrollmentRecord {
                identity: identity.to_string(),
                blob: blob.to_vec(),
            }),
        }
        Ok(())
    }

    fn contains(&self, identity: &str) -> Result<bool, StoreError> {
        Ok(self.read().iter().any(|r| r.identity == identity))
    }

    fn remove(&self, identity: &str) -> Result<bool, StoreError> {
        let mut records = self.write();
        let before = records.len();
        records.retain(|r| r.identity != identity);
        Ok(records.len() != before)
    }

    fn load_all(&self) -> Result<Vec<EnrollmentRecord>, StoreError> {
        Ok(self.read().clone())
    }
}
