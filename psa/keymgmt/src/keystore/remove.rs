// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Key removal: destroy and purge.

use azihsm_psa_interface::AssetError;

use super::KeyStoreInner;
use crate::attributes::*;
use crate::KeyMgmtError;
use crate::KeyMgmtResult;

impl KeyStoreInner {
    pub(super) fn destroy(&mut self, id: KeyId) -> KeyMgmtResult<()> {
        let index = self.resolve(id)?;
        if self.table.get(index)?.in_use {
            tracing::error!(id, "Cannot destroy a key in use");
            Err(KeyMgmtError::InvalidHandle)?
        }

        let copies: Vec<KeyId> = self
            .table
            .iter()
            .filter(|(other, slot)| *other != index && slot.source_key_id == id)
            .map(|(_, slot)| slot.id())
            .collect();
        for copy in copies {
            tracing::debug!(id, copy, "Destroying copy");
            self.destroy(copy)?;
        }

        self.release_assets(index)?;

        if self.table.get(index)?.attributes.lifetime.persistence() == KeyPersistence::Default {
            match self.storage.clear(id) {
                Ok(()) | Err(AssetError::NotFound) => {}
                Err(error) => Err(error)?,
            }
        }

        self.table.clear(index);
        tracing::debug!(id, index, "Key destroyed");
        Ok(())
    }

    pub(super) fn purge(&mut self, id: KeyId) -> KeyMgmtResult<()> {
        let Some(index) = self.table.find(id) else {
            if (KEY_ID_USER_MIN..=KEY_ID_USER_MAX).contains(&id) && self.storage.info(id)?.is_some() {
                return Ok(());
            }
            tracing::error!(id, "No such key");
            return Err(KeyMgmtError::InvalidHandle);
        };

        let slot = self.table.get(index)?;
        if !slot.attributes.lifetime.is_backed() {
            return Ok(());
        }
        if slot.in_use {
            tracing::error!(id, "Cannot purge a key in use");
            Err(KeyMgmtError::InvalidHandle)?
        }

        self.release_assets(index)?;
        self.table.clear(index);
        tracing::debug!(id, index, "Key purged");
        Ok(())
    }

    /// Frees the assets of the slot at `index` one at a time. An asset that
    /// fails to free stays owned by the slot.
    fn release_assets(&mut self, index: usize) -> KeyMgmtResult<()> {
        for part in 0..2 {
            if let Some(asset) = self.table.get(index)?.assets[part] {
                self.store.free(asset)?;
                self.table.get_mut(index)?.assets[part] = None;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use azihsm_psa_sim::SimAssetStore;
    use azihsm_psa_sim::SimFault;
    use azihsm_psa_sim::SimPersistentStore;
    use test_with_tracing::test;

    use super::*;
    use crate::algorithm::Algorithm;
    use crate::algorithm::KeyType;
    use crate::config::KeyStoreConfig;
    use crate::KeyStore;
    use crate::LoadRequest;

    fn key_store() -> (KeyStore, SimAssetStore, SimPersistentStore) {
        let sim = SimAssetStore::new().unwrap();
        let storage = SimPersistentStore::new();
        let store = KeyStore::new(
            KeyStoreConfig::default(),
            Arc::new(sim.clone()),
            Arc::new(storage.clone()),
        )
        .unwrap();
        (store, sim, storage)
    }

    fn aes(persistence: KeyPersistence, location: KeyLocation) -> KeyAttributes {
        KeyAttributes::new(KeyType::Aes, 128)
            .with_lifetime(persistence, location)
            .with_usage(KeyUsage::new().with_copy(true).with_encrypt(true))
            .with_algorithm(Algorithm::Ctr)
    }

    #[test]
    fn test_destroy_persistent() {
        let (store, sim, storage) = key_store();
        let id = store
            .import_key(
                &aes(KeyPersistence::Default, KeyLocation::PrimarySecureElement).with_id(0x20),
                &[1; 16],
            )
            .unwrap();
        store
            .load_key(id, KeyUsage::new().with_encrypt(true), LoadRequest::Asset)
            .unwrap();
        assert_eq!(sim.live_assets(), 1);

        store.destroy_key(id).unwrap();
        assert!(!storage.contains(id));
        assert_eq!(sim.live_assets(), 0);
        assert_eq!(store.get_key(id).unwrap_err(), KeyMgmtError::InvalidHandle);
        assert_eq!(store.destroy_key(id).unwrap_err(), KeyMgmtError::InvalidHandle);
    }

    #[test]
    fn test_destroy_in_use() {
        let (store, _, _) = key_store();
        let id = store
            .import_key(&aes(KeyPersistence::Volatile, KeyLocation::LocalStorage), &[1; 16])
            .unwrap();

        store.lock_key(id).unwrap();
        assert_eq!(store.destroy_key(id).unwrap_err(), KeyMgmtError::InvalidHandle);
        store.unlock_key(id).unwrap();
        store.destroy_key(id).unwrap();
    }

    #[test]
    fn test_destroy_takes_resident_copies() {
        let (store, _, _) = key_store();
        let source = store
            .import_key(&aes(KeyPersistence::Volatile, KeyLocation::LocalStorage), &[1; 16])
            .unwrap();
        let requested = aes(KeyPersistence::Volatile, KeyLocation::LocalStorage);
        let first = store.copy_key(source, &requested).unwrap();
        let second = store.copy_key(source, &requested).unwrap();
        let unrelated = store.import_key(&requested, &[2; 16]).unwrap();

        store.destroy_key(source).unwrap();
        for id in [source, first, second] {
            assert_eq!(store.get_key(id).unwrap_err(), KeyMgmtError::InvalidHandle);
        }
        assert!(store.get_key(unrelated).is_ok());
    }

    #[test]
    fn test_destroy_keeps_slot_when_free_fails() {
        let (store, sim, _) = key_store();
        let id = store
            .import_key(
                &aes(KeyPersistence::HsmAssetStore, KeyLocation::PrimarySecureElement).with_id(0x21),
                &[1; 16],
            )
            .unwrap();

        sim.inject_fault(SimFault::Free);
        assert_eq!(store.destroy_key(id).unwrap_err(), KeyMgmtError::HardwareFailure);
        assert!(store.get_key(id).unwrap().assets[0].is_some());

        store.destroy_key(id).unwrap();
        assert_eq!(sim.live_assets(), 0);
    }

    #[test]
    fn test_purge() {
        let (store, sim, storage) = key_store();
        let persistent = store
            .import_key(
                &aes(KeyPersistence::Default, KeyLocation::PrimarySecureElement).with_id(0x22),
                &[1; 16],
            )
            .unwrap();
        store
            .load_key(persistent, KeyUsage::new().with_encrypt(true), LoadRequest::Asset)
            .unwrap();

        store.purge_key(persistent).unwrap();
        assert_eq!(sim.live_assets(), 0);
        assert!(storage.contains(persistent));
        assert_eq!(store.purge_key(persistent), Ok(()), "purging a purged key is a no-op");
        assert_eq!(store.get_key(persistent).unwrap().assets, [None, None]);

        let volatile = store
            .import_key(&aes(KeyPersistence::Volatile, KeyLocation::LocalStorage), &[1; 16])
            .unwrap();
        store.purge_key(volatile).unwrap();
        assert!(store.get_key(volatile).is_ok());

        assert_eq!(store.purge_key(0x23), Err(KeyMgmtError::InvalidHandle));

        store.lock_key(persistent).unwrap();
        assert_eq!(store.purge_key(persistent), Err(KeyMgmtError::InvalidHandle));
        store.unlock_key(persistent).unwrap();
    }
}
