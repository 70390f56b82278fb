// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Module for the in-memory backing store.

use std::collections::HashMap;
use std::sync::Arc;

use azihsm_psa_interface::AssetError;
use azihsm_psa_interface::AssetResult;
use azihsm_psa_interface::PersistentStore;
use parking_lot::RwLock;

/// In-memory [`PersistentStore`].
///
/// Clones share the same records, which lets a test drop a key store and
/// reopen another one over the same storage.
#[derive(Debug, Clone, Default)]
pub struct SimPersistentStore {
    inner: Arc<RwLock<SimPersistentInner>>,
}

#[derive(Debug, Default)]
struct SimPersistentInner {
    records: HashMap<u32, Vec<u8>>,
    fail_writes: bool,
}

impl SimPersistentStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following write fail with `AssetError::StorageFailure`.
    pub fn set_write_failure(&self, fail: bool) {
        self.inner.write().fail_writes = fail;
    }

    /// Returns `true` if a record exists for `uid`.
    pub fn contains(&self, uid: u32) -> bool {
        self.inner.read().records.contains_key(&uid)
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    /// Returns `true` if no record is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PersistentStore for SimPersistentStore {
    fn read(&self, uid: u32) -> AssetResult<Vec<u8>> {
        self.inner
            .read()
            .records
            .get(&uid)
            .cloned()
            .ok_or(AssetError::NotFound)
    }

    fn write(&self, uid: u32, data: &[u8]) -> AssetResult<()> {
        let mut inner = self.inner.write();
        if inner.fail_writes {
            tracing::error!(uid, "Simulated storage write failure");
            Err(AssetError::StorageFailure)?
        }
        inner.records.insert(uid, data.to_vec());
        Ok(())
    }

    fn clear(&self, uid: u32) -> AssetResult<()> {
        self.inner.write().records.remove(&uid);
        Ok(())
    }

    fn info(&self, uid: u32) -> AssetResult<Option<usize>> {
        Ok(self.inner.read().records.get(&uid).map(Vec::len))
    }
}

#[cfg(test)]
mod tests {
    use test_with_tracing::test;

    use super::*;

    #[test]
    fn test_read_write_clear() {
        let store = SimPersistentStore::new();
        assert_eq!(store.read(1), Err(AssetError::NotFound));
        assert_eq!(store.info(1), Ok(None));

        store.write(1, &[1, 2, 3]).unwrap();
        assert_eq!(store.read(1).unwrap(), vec![1, 2, 3]);
        assert_eq!(store.info(1), Ok(Some(3)));

        store.clear(1).unwrap();
        store.clear(1).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_write_failure() {
        let store = SimPersistentStore::new();
        store.set_write_failure(true);
        assert_eq!(store.write(7, &[0]), Err(AssetError::StorageFailure));
        assert!(!store.contains(7));
    }

    #[test]
    fn test_clones_share_records() {
        let store = SimPersistentStore::new();
        let other = store.clone();
        store.write(9, &[9]).unwrap();
        assert_eq!(other.read(9).unwrap(), vec![9]);
    }
}
