// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Module for the asset table. Holds every live asset with its policy and
//! content.

use azihsm_psa_interface::AssetError;
use azihsm_psa_interface::AssetId;
use azihsm_psa_interface::AssetPolicy;
use azihsm_psa_interface::AssetResult;
use zeroize::Zeroizing;

/// Largest asset the table accepts, in bytes.
pub(crate) const MAX_ASSET_SIZE: usize = 1024;

/// One live asset.
#[derive(Debug)]
pub(crate) struct AssetEntry {
    generation: u16,
    policy: AssetPolicy,
    size: usize,
    content: Option<Zeroizing<Vec<u8>>>,
    number: Option<u32>,
}

impl AssetEntry {
    pub(crate) fn policy(&self) -> AssetPolicy {
        self.policy
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn is_static(&self) -> bool {
        self.number.is_some()
    }

    /// Returns the content of a loaded asset.
    ///
    /// # Errors
    /// * `AssetError::InvalidAsset` - If the asset was never loaded.
    pub(crate) fn content(&self) -> AssetResult<&[u8]> {
        self.content
            .as_ref()
            .map(|content| content.as_slice())
            .ok_or(AssetError::InvalidAsset)
    }

    /// Checks that the asset can still be loaded.
    ///
    /// # Errors
    /// * `AssetError::PolicyViolation` - If the asset already has content.
    pub(crate) fn check_empty(&self) -> AssetResult<()> {
        if self.content.is_some() {
            Err(AssetError::PolicyViolation)?
        }
        Ok(())
    }

    /// Loads the content of an empty asset.
    ///
    /// # Errors
    /// * `AssetError::PolicyViolation` - If the asset already has content.
    /// * `AssetError::InvalidParameter` - If `data` does not match the asset size.
    pub(crate) fn load(&mut self, data: &[u8]) -> AssetResult<()> {
        self.check_empty()?;
        if data.len() != self.size {
            tracing::error!(expected = self.size, actual = data.len(), "Asset size mismatch");
            Err(AssetError::InvalidParameter)?
        }
        self.content = Some(Zeroizing::new(data.to_vec()));
        Ok(())
    }
}

/// Fixed capacity table of assets.
///
/// Handles encode the slot index in the low 16 bits and an allocation
/// generation in the high 16 bits, so a stale handle never aliases a newer
/// asset in the same slot.
#[derive(Debug)]
pub(crate) struct AssetTable {
    entries: Vec<Option<AssetEntry>>,
    generation: u16,
}

impl AssetTable {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.min(u16::MAX as usize - 1);
        Self {
            entries: (0..capacity).map(|_| None).collect(),
            generation: 0,
        }
    }

    fn next_generation(&mut self) -> u16 {
        self.generation = self.generation.wrapping_add(1);
        if self.generation == 0 {
            self.generation = 1;
        }
        self.generation
    }

    /// Adds an empty asset.
    ///
    /// # Errors
    /// * `AssetError::InvalidParameter` - If the policy is empty or the size is out of range.
    /// * `AssetError::OutOfResources` - If every slot is taken.
    pub(crate) fn insert(
        &mut self,
        policy: AssetPolicy,
        size: usize,
        number: Option<u32>,
    ) -> AssetResult<AssetId> {
        if policy.is_empty() || size == 0 || size > MAX_ASSET_SIZE {
            tracing::error!(%policy, size, "Invalid asset request");
            Err(AssetError::InvalidParameter)?
        }

        let index = self
            .entries
            .iter()
            .position(Option::is_none)
            .ok_or(AssetError::OutOfResources)?;

        let generation = self.next_generation();
        self.entries[index] = Some(AssetEntry {
            generation,
            policy,
            size,
            content: None,
            number,
        });

        AssetId::from_raw(((generation as u32) << 16) | (index as u32 + 1))
            .ok_or(AssetError::InvalidAsset)
    }

    fn index_of(&self, asset: AssetId) -> AssetResult<usize> {
        let raw = asset.raw();
        let index = ((raw & 0xFFFF) as usize)
            .checked_sub(1)
            .ok_or(AssetError::InvalidAsset)?;
        let generation = (raw >> 16) as u16;

        match self.entries.get(index) {
            Some(Some(entry)) if entry.generation == generation => Ok(index),
            _ => Err(AssetError::InvalidAsset),
        }
    }

    pub(crate) fn get(&self, asset: AssetId) -> AssetResult<&AssetEntry> {
        let index = self.index_of(asset)?;
        self.entries[index].as_ref().ok_or(AssetError::InvalidAsset)
    }

    pub(crate) fn get_mut(&mut self, asset: AssetId) -> AssetResult<&mut AssetEntry> {
        let index = self.index_of(asset)?;
        self.entries[index].as_mut().ok_or(AssetError::InvalidAsset)
    }

    /// Removes a dynamic asset.
    ///
    /// # Errors
    /// * `AssetError::InvalidAsset` - If the handle is stale.
    /// * `AssetError::PolicyViolation` - If the asset is a static asset.
    pub(crate) fn remove(&mut self, asset: AssetId) -> AssetResult<()> {
        let index = self.index_of(asset)?;
        if self.entries[index]
            .as_ref()
            .is_some_and(AssetEntry::is_static)
        {
            Err(AssetError::PolicyViolation)?
        }
        self.entries[index] = None;
        Ok(())
    }

    pub(crate) fn find_number(&self, number: u32) -> Option<AssetId> {
        self.entries.iter().enumerate().find_map(|(index, entry)| {
            let entry = entry.as_ref()?;
            if entry.number == Some(number) {
                AssetId::from_raw(((entry.generation as u32) << 16) | (index as u32 + 1))
            } else {
                None
            }
        })
    }

    /// Number of live dynamic assets.
    pub(crate) fn live_count(&self) -> usize {
        self.entries
            .iter()
            .flatten()
            .filter(|entry| !entry.is_static())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use test_with_tracing::test;

    use super::*;

    #[test]
    fn test_insert_remove() {
        let mut table = AssetTable::new(2);

        let first = table.insert(AssetPolicy::SYM_CIPHER_BULK, 16, None).unwrap();
        let second = table.insert(AssetPolicy::SYM_CIPHER_BULK, 16, None).unwrap();
        assert_eq!(
            table.insert(AssetPolicy::SYM_CIPHER_BULK, 16, None),
            Err(AssetError::OutOfResources)
        );
        assert_eq!(table.live_count(), 2);

        table.remove(first).unwrap();
        assert_eq!(table.get(first).unwrap_err(), AssetError::InvalidAsset);

        let third = table.insert(AssetPolicy::SYM_CIPHER_BULK, 16, None).unwrap();
        assert_ne!(first, third);
        assert!(table.get(second).is_ok());
    }

    #[test]
    fn test_static_asset_cannot_be_removed() {
        let mut table = AssetTable::new(4);
        let huk = table.insert(AssetPolicy::SYM_DERIVE, 32, Some(0x61)).unwrap();

        assert_eq!(table.find_number(0x61), Some(huk));
        assert_eq!(table.remove(huk), Err(AssetError::PolicyViolation));
        assert_eq!(table.live_count(), 0);
    }

    #[test]
    fn test_load_once() {
        let mut table = AssetTable::new(1);
        let asset = table.insert(AssetPolicy::SYM_CIPHER_AUTH, 4, None).unwrap();
        let entry = table.get_mut(asset).unwrap();

        assert_eq!(entry.content(), Err(AssetError::InvalidAsset));
        assert_eq!(entry.load(&[1, 2, 3]), Err(AssetError::InvalidParameter));
        entry.load(&[1, 2, 3, 4]).unwrap();
        assert_eq!(entry.load(&[1, 2, 3, 4]), Err(AssetError::PolicyViolation));
        assert_eq!(entry.content().unwrap(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_rejects_empty_policy() {
        let mut table = AssetTable::new(1);
        assert_eq!(
            table.insert(AssetPolicy::NONE, 16, None),
            Err(AssetError::InvalidParameter)
        );
        assert_eq!(
            table.insert(AssetPolicy::SYM_DERIVE, MAX_ASSET_SIZE + 1, None),
            Err(AssetError::InvalidParameter)
        );
    }
}
