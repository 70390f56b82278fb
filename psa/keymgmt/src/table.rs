// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Module for the key slot table.
//!
//! The table is one array split in three contiguous regions:
//!
//! | Region        | Keys                            | Identifier              |
//! |---------------|---------------------------------|-------------------------|
//! | persistent    | backing store keys, cached      | caller assigned         |
//! | asset store   | keys held as hardware assets    | caller assigned         |
//! | volatile      | volatile keys                   | derived from the index  |

use std::ops::Range;

use crate::attributes::KeyId;
use crate::attributes::KeyPersistence;
use crate::attributes::KEY_ID_VOLATILE_MAX;
use crate::attributes::KEY_ID_VOLATILE_MIN;
use crate::config::KeyStoreConfig;
use crate::slot::KeySlot;
use crate::KeyMgmtError;
use crate::KeyMgmtResult;

/// Slot table.
#[derive(Debug)]
pub(crate) struct KeySlotTable {
    slots: Vec<Option<KeySlot>>,
    persistent: Range<usize>,
    asset_store: Range<usize>,
    volatile: Range<usize>,
}

/// A slot made free for a new key.
#[derive(Debug)]
pub(crate) struct FreeSlot {
    pub(crate) index: usize,
    pub(crate) evicted: Option<KeySlot>,
}

impl KeySlotTable {
    pub(crate) fn new(config: &KeyStoreConfig) -> Self {
        let persistent = 0..config.persistent_slots;
        let asset_store = persistent.end..persistent.end + config.asset_store_slots;
        let volatile = asset_store.end..asset_store.end + config.volatile_slots;

        let mut slots = Vec::with_capacity(volatile.end);
        slots.resize_with(volatile.end, || None);

        Self {
            slots,
            persistent,
            asset_store,
            volatile,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    fn region(&self, persistence: KeyPersistence) -> Range<usize> {
        match persistence {
            KeyPersistence::Volatile => self.volatile.clone(),
            KeyPersistence::HsmAssetStore => self.asset_store.clone(),
            _ => self.persistent.clone(),
        }
    }

    /// Finds a free slot for a key of `persistence` and marks it allocated.
    ///
    /// When the persistent region is full the first slot without the CACHE
    /// usage flag is evicted; when every slot prefers caching, the first slot
    /// of the region is. Slots in use or holding a loaded asset are never
    /// evicted.
    ///
    /// # Returns
    /// * The slot index and the evicted slot.
    ///
    /// # Errors
    /// * `KeyMgmtError::InsufficientStorage` - If no slot can be made free.
    pub(crate) fn find_free_slot(&mut self, persistence: KeyPersistence) -> KeyMgmtResult<FreeSlot> {
        let region = self.region(persistence);

        if let Some(index) = region.clone().find(|index| self.slots[*index].is_none()) {
            self.slots[index] = Some(KeySlot::default());
            tracing::debug!(index, ?persistence, "Slot allocated");
            return Ok(FreeSlot {
                index,
                evicted: None,
            });
        }

        if region != self.persistent {
            tracing::error!(?persistence, "No free key slot");
            Err(KeyMgmtError::InsufficientStorage)?
        }

        let pinned = |slot: &KeySlot| slot.in_use || slot.holds_assets();
        let victim = region
            .clone()
            .find(|index| {
                self.slots[*index]
                    .as_ref()
                    .is_some_and(|slot| !pinned(slot) && !slot.attributes.usage().cache())
            })
            .unwrap_or(region.start);

        if self.slots[victim].as_ref().is_some_and(pinned) {
            tracing::error!(victim, "Eviction candidate is in use");
            Err(KeyMgmtError::InsufficientStorage)?
        }

        let evicted = self.slots[victim].replace(KeySlot::default());
        tracing::debug!(
            index = victim,
            evicted = evicted.as_ref().map(KeySlot::id),
            "Persistent slot evicted"
        );
        Ok(FreeSlot {
            index: victim,
            evicted,
        })
    }

    /// Identifier of the volatile key held at `index`.
    pub(crate) fn volatile_id(&self, index: usize) -> KeyMgmtResult<KeyId> {
        if !self.volatile.contains(&index) {
            tracing::error!(index, "Slot is not in the volatile region");
            Err(KeyMgmtError::CorruptionDetected)?
        }
        Ok(KEY_ID_VOLATILE_MIN + (index - self.volatile.start) as KeyId)
    }

    /// Finds the slot holding `id`.
    pub(crate) fn find(&self, id: KeyId) -> Option<usize> {
        if (KEY_ID_VOLATILE_MIN..=KEY_ID_VOLATILE_MAX).contains(&id) {
            let index = self.volatile.start + (id - KEY_ID_VOLATILE_MIN) as usize;
            return self
                .volatile
                .contains(&index)
                .then_some(index)
                .filter(|index| self.slots[*index].as_ref().is_some_and(|slot| slot.id() == id));
        }

        (self.persistent.start..self.asset_store.end)
            .find(|index| self.slots[*index].as_ref().is_some_and(|slot| slot.id() == id))
    }

    pub(crate) fn get(&self, index: usize) -> KeyMgmtResult<&KeySlot> {
        self.slots
            .get(index)
            .and_then(Option::as_ref)
            .ok_or(KeyMgmtError::InvalidHandle)
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> KeyMgmtResult<&mut KeySlot> {
        self.slots
            .get_mut(index)
            .and_then(Option::as_mut)
            .ok_or(KeyMgmtError::InvalidHandle)
    }

    /// Clears a slot and returns its previous content.
    pub(crate) fn clear(&mut self, index: usize) -> Option<KeySlot> {
        self.slots.get_mut(index).and_then(Option::take)
    }

    /// Marks a slot in use.
    ///
    /// # Errors
    /// * `KeyMgmtError::InvalidHandle` - If the slot is not allocated.
    /// * `KeyMgmtError::KeyInUse` - If the slot is already in use.
    pub(crate) fn lock(&mut self, index: usize) -> KeyMgmtResult<()> {
        let slot = self.get_mut(index)?;
        if slot.in_use {
            tracing::error!(index, id = slot.id(), "Key already in use");
            Err(KeyMgmtError::KeyInUse)?
        }
        slot.in_use = true;
        Ok(())
    }

    /// Clears the in-use flag of a slot.
    ///
    /// # Errors
    /// * `KeyMgmtError::InvalidHandle` - If the slot is not allocated.
    /// * `KeyMgmtError::CorruptionDetected` - If the slot is not in use.
    pub(crate) fn unlock(&mut self, index: usize) -> KeyMgmtResult<()> {
        let slot = self.get_mut(index)?;
        if !slot.in_use {
            tracing::error!(index, id = slot.id(), "Corruption: unlocking a key not in use");
            Err(KeyMgmtError::CorruptionDetected)?
        }
        slot.in_use = false;
        Ok(())
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (usize, &KeySlot)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|slot| (index, slot)))
    }
}

#[cfg(test)]
mod tests {
    use test_with_tracing::test;

    use azihsm_psa_interface::AssetId;

    use super::*;
    use crate::algorithm::KeyType;
    use crate::attributes::KeyAttributes;
    use crate::attributes::KeyUsage;

    fn table() -> KeySlotTable {
        KeySlotTable::new(&KeyStoreConfig {
            persistent_slots: 2,
            asset_store_slots: 1,
            volatile_slots: 2,
            ..Default::default()
        })
    }

    fn install(table: &mut KeySlotTable, persistence: KeyPersistence, id: KeyId, usage: KeyUsage) -> usize {
        let free = table.find_free_slot(persistence).unwrap();
        let slot = table.get_mut(free.index).unwrap();
        slot.attributes = KeyAttributes::new(KeyType::Aes, 128)
            .with_id(id)
            .with_usage(usage);
        free.index
    }

    #[test]
    fn test_regions() {
        let mut table = table();
        assert_eq!(table.len(), 5);

        assert_eq!(table.find_free_slot(KeyPersistence::HsmAssetStore).unwrap().index, 2);
        assert_eq!(
            table.find_free_slot(KeyPersistence::HsmAssetStore).unwrap_err(),
            KeyMgmtError::InsufficientStorage
        );

        assert_eq!(table.find_free_slot(KeyPersistence::Volatile).unwrap().index, 3);
        assert_eq!(table.volatile_id(4), Ok(KEY_ID_VOLATILE_MIN + 1));
        assert_eq!(table.volatile_id(0), Err(KeyMgmtError::CorruptionDetected));
    }

    #[test]
    fn test_find() {
        let mut table = table();
        let persistent = install(&mut table, KeyPersistence::Default, 7, KeyUsage::new());
        let index = table.find_free_slot(KeyPersistence::Volatile).unwrap().index;
        let id = table.volatile_id(index).unwrap();
        table.get_mut(index).unwrap().attributes.id = id;

        assert_eq!(table.find(7), Some(persistent));
        assert_eq!(table.find(id), Some(index));
        assert_eq!(table.find(id + 1), None);
        assert_eq!(table.find(KEY_ID_VOLATILE_MAX), None);
        assert_eq!(table.find(8), None);
    }

    #[test]
    fn test_evicts_first_non_cache_slot() {
        let mut table = table();
        let cache = KeyUsage::new().with_cache(true);
        install(&mut table, KeyPersistence::Default, 1, cache);
        install(&mut table, KeyPersistence::Default, 2, KeyUsage::new());

        let free = table.find_free_slot(KeyPersistence::Default).unwrap();
        assert_eq!(free.index, 1);
        assert_eq!(free.evicted.map(|slot| slot.id()), Some(2));
        assert_eq!(table.find(1), Some(0));
    }

    #[test]
    fn test_evicts_index_zero_when_all_cached() {
        let mut table = table();
        let cache = KeyUsage::new().with_cache(true);
        install(&mut table, KeyPersistence::Default, 1, cache);
        install(&mut table, KeyPersistence::Default, 2, cache);

        let free = table.find_free_slot(KeyPersistence::Default).unwrap();
        assert_eq!(free.index, 0);
        assert_eq!(free.evicted.map(|slot| slot.id()), Some(1));
    }

    #[test]
    fn test_never_evicts_slot_in_use() {
        let mut table = table();
        let cache = KeyUsage::new().with_cache(true);
        let first = install(&mut table, KeyPersistence::Default, 1, cache);
        install(&mut table, KeyPersistence::Default, 2, cache);
        table.lock(first).unwrap();

        assert_eq!(
            table.find_free_slot(KeyPersistence::Default).unwrap_err(),
            KeyMgmtError::InsufficientStorage
        );
    }

    #[test]
    fn test_never_evicts_slot_holding_asset() {
        let mut table = table();
        let first = install(&mut table, KeyPersistence::Default, 1, KeyUsage::new());
        install(&mut table, KeyPersistence::Default, 2, KeyUsage::new());
        table.get_mut(first).unwrap().assets[0] = AssetId::from_raw(0x10);

        let free = table.find_free_slot(KeyPersistence::Default).unwrap();
        assert_eq!(free.index, 1, "the slot holding an asset is skipped");
        assert_eq!(free.evicted.map(|slot| slot.id()), Some(2));

        table.get_mut(1).unwrap().assets[1] = AssetId::from_raw(0x11);
        assert_eq!(
            table.find_free_slot(KeyPersistence::Default).unwrap_err(),
            KeyMgmtError::InsufficientStorage
        );
        assert_eq!(table.find(1), Some(first));
    }

    #[test]
    fn test_lock_discipline() {
        let mut table = table();
        let index = install(&mut table, KeyPersistence::Default, 1, KeyUsage::new());

        table.lock(index).unwrap();
        assert_eq!(table.lock(index), Err(KeyMgmtError::KeyInUse));
        table.unlock(index).unwrap();
        assert_eq!(table.unlock(index), Err(KeyMgmtError::CorruptionDetected));
        assert_eq!(table.lock(4), Err(KeyMgmtError::InvalidHandle));
    }
}
