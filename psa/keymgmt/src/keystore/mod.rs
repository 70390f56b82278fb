// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Module for the key store.
//!
//! The key store owns the slot table and drives the asset store and the
//! backing store through the key lifecycle. All slot mutation happens under
//! one lock on the store; the per-slot in-use flag is advisory and guards
//! material while an operation uses it.

mod access;
mod create;
mod remove;

use std::sync::Arc;

use azihsm_psa_interface::AssetError;
use azihsm_psa_interface::AssetId;
use azihsm_psa_interface::AssetPolicy;
use azihsm_psa_interface::AssetStore;
use azihsm_psa_interface::PersistentStore;
use parking_lot::RwLock;
use tracing::instrument;
use zeroize::Zeroizing;

use crate::attributes::*;
use crate::cleanup::settle;
use crate::cleanup::CleanupAction;
use crate::cleanup::CleanupStack;
use crate::cleanup::CleanupTarget;
use crate::config::KeyStoreConfig;
use crate::persist;
use crate::policy::PolicyContext;
use crate::slot::Direction;
use crate::slot::KeySlot;
use crate::slot::Representation;
use crate::table::KeySlotTable;
use crate::KeyMgmtError;
use crate::KeyMgmtResult;

/// Snapshot of a resident key slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInfo {
    /// Key attributes.
    pub attributes: KeyAttributes,

    /// Asset policy of the key, encrypt/generate direction for bidirectional keys.
    pub asset_policy: AssetPolicy,

    /// Size of the unwrapped material in bytes.
    pub key_size: usize,

    /// The key has one part per direction.
    pub bidirectional: bool,

    /// The slot is locked by an operation.
    pub in_use: bool,

    /// Size of the first material component in bits.
    pub modulus_bits: usize,

    /// Size of the second material component in bits.
    pub exponent_bits: usize,

    /// Identifier of the key this key was copied from, [`KEY_ID_NULL`] otherwise.
    pub source_key_id: KeyId,

    /// Length of each cached material part.
    pub material_len: [Option<usize>; 2],

    /// Assets held by the slot.
    pub assets: [Option<AssetId>; 2],
}

impl From<&KeySlot> for KeyInfo {
    fn from(slot: &KeySlot) -> Self {
        Self {
            attributes: slot.attributes,
            asset_policy: slot.policy,
            key_size: slot.key_size,
            bidirectional: slot.bidirectional,
            in_use: slot.in_use,
            modulus_bits: slot.modulus_bits,
            exponent_bits: slot.exponent_bits,
            source_key_id: slot.source_key_id,
            material_len: [
                slot.material[0].as_ref().map(|part| part.len()),
                slot.material[1].as_ref().map(|part| part.len()),
            ],
            assets: slot.assets,
        }
    }
}

/// Form a key is loaded in for use.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LoadRequest {
    /// Load the key into an asset.
    Asset,
    /// Return the plaintext material, at most `capacity` bytes.
    Plaintext {
        /// Largest acceptable material size.
        capacity: usize,
    },
}

/// Key loaded for use. Hand it back with [`KeyStore::release_key`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadedKey {
    /// Key held by an asset.
    Asset {
        /// Asset holding the key.
        asset: AssetId,
        /// Direction the asset was loaded for.
        direction: Option<Direction>,
        /// The asset belongs to the caller rather than to the slot.
        ephemeral: bool,
    },
    /// Plaintext material.
    Plaintext(Zeroizing<Vec<u8>>),
}

/// Key store.
#[derive(Clone)]
pub struct KeyStore {
    inner: Arc<RwLock<KeyStoreInner>>,
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore").finish_non_exhaustive()
    }
}

impl KeyStore {
    /// Creates a key store.
    ///
    /// # Arguments
    /// * `config` - Slot table layout and behavior switches.
    /// * `store` - Hardware asset store.
    /// * `storage` - Backing store of persistent keys.
    ///
    /// # Errors
    /// * `KeyMgmtError::InvalidArgument` - If the configuration is invalid.
    pub fn new(
        config: KeyStoreConfig,
        store: Arc<dyn AssetStore>,
        storage: Arc<dyn PersistentStore>,
    ) -> KeyMgmtResult<Self> {
        config.validate()?;
        tracing::debug!(?config, "Creating key store");

        Ok(Self {
            inner: Arc::new(RwLock::new(KeyStoreInner {
                table: KeySlotTable::new(&config),
                config,
                store,
                storage,
            })),
        })
    }

    /// Imports a key.
    ///
    /// # Arguments
    /// * `attributes` - Attributes of the new key. `bits` may be `0`.
    /// * `data` - Material in application format.
    ///
    /// # Returns
    /// * The identifier of the key. Volatile keys get one assigned.
    ///
    /// # Errors
    /// * `KeyMgmtError::InvalidArgument` - If the attributes or the material are invalid.
    /// * `KeyMgmtError::AlreadyExists` - If a key with the identifier exists.
    /// * `KeyMgmtError::InsufficientStorage` - If no slot is available.
    #[instrument(skip(self, data), fields(id = attributes.id, len = data.len()))]
    pub fn import_key(&self, attributes: &KeyAttributes, data: &[u8]) -> KeyMgmtResult<KeyId> {
        self.inner.write().import(attributes, data)
    }

    /// Generates a key.
    ///
    /// # Errors
    /// * `KeyMgmtError::NotSupported` - For asymmetric keys in local storage and RSA keys.
    #[instrument(skip(self), fields(id = attributes.id))]
    pub fn generate_key(&self, attributes: &KeyAttributes) -> KeyMgmtResult<KeyId> {
        self.inner.write().generate(attributes)
    }

    /// Copies a key.
    ///
    /// The new key gets the intersection of the source policy and the
    /// policy in `attributes`.
    ///
    /// # Errors
    /// * `KeyMgmtError::NotPermitted` - If the source cannot be copied to the target location.
    /// * `KeyMgmtError::KeyInUse` - If the source is in use.
    #[instrument(skip(self), fields(target = attributes.id))]
    pub fn copy_key(&self, source: KeyId, attributes: &KeyAttributes) -> KeyMgmtResult<KeyId> {
        self.inner.write().copy(source, attributes)
    }

    /// Exports the plaintext of a local symmetric key.
    ///
    /// # Returns
    /// * The number of bytes written to `out`.
    ///
    /// # Errors
    /// * `KeyMgmtError::NotPermitted` - If the key lacks the EXPORT usage.
    /// * `KeyMgmtError::NotSupported` - For asymmetric and secure element keys.
    /// * `KeyMgmtError::BufferTooSmall` - If `out` is too small.
    #[instrument(skip(self, out))]
    pub fn export_key(&self, id: KeyId, out: &mut [u8]) -> KeyMgmtResult<usize> {
        self.inner.write().export(id, out)
    }

    /// Exports the public part of an asymmetric key.
    ///
    /// # Returns
    /// * The number of bytes written to `out`.
    #[instrument(skip(self, out))]
    pub fn export_public_key(&self, id: KeyId, out: &mut [u8]) -> KeyMgmtResult<usize> {
        self.inner.write().export_public(id, out)
    }

    /// Destroys a key and every resident copy of it.
    ///
    /// # Errors
    /// * `KeyMgmtError::InvalidHandle` - If the key does not exist or is in use.
    #[instrument(skip(self))]
    pub fn destroy_key(&self, id: KeyId) -> KeyMgmtResult<()> {
        self.inner.write().destroy(id)
    }

    /// Drops the cached copy of a persistent key.
    #[instrument(skip(self))]
    pub fn purge_key(&self, id: KeyId) -> KeyMgmtResult<()> {
        self.inner.write().purge(id)
    }

    /// Returns the attributes of a key.
    #[instrument(skip(self))]
    pub fn get_key_attributes(&self, id: KeyId) -> KeyMgmtResult<KeyAttributes> {
        let mut inner = self.inner.write();
        let index = inner.resolve(id)?;
        Ok(inner.table.get(index)?.attributes)
    }

    /// Validates a key handle and returns the state of its slot.
    #[instrument(skip(self))]
    pub fn get_key(&self, id: KeyId) -> KeyMgmtResult<KeyInfo> {
        let mut inner = self.inner.write();
        let index = inner.resolve(id)?;
        Ok(KeyInfo::from(inner.table.get(index)?))
    }

    /// Marks a key in use.
    ///
    /// # Errors
    /// * `KeyMgmtError::KeyInUse` - If the key is already in use.
    #[instrument(skip(self))]
    pub fn lock_key(&self, id: KeyId) -> KeyMgmtResult<()> {
        let mut inner = self.inner.write();
        let index = inner.resolve(id)?;
        inner.table.lock(index)
    }

    /// Clears the in-use flag of a key.
    ///
    /// # Errors
    /// * `KeyMgmtError::CorruptionDetected` - If the key is not in use.
    #[instrument(skip(self))]
    pub fn unlock_key(&self, id: KeyId) -> KeyMgmtResult<()> {
        let mut inner = self.inner.write();
        let index = inner.table.find(id).ok_or_else(|| {
            tracing::error!(id, "Unlocking a key that is not resident");
            KeyMgmtError::InvalidHandle
        })?;
        inner.table.unlock(index)
    }

    /// Loads a key for use.
    ///
    /// # Arguments
    /// * `id` - Key identifier.
    /// * `usage` - Intended usage. Selects the direction of bidirectional keys.
    /// * `request` - Form to load the key in.
    ///
    /// # Errors
    /// * `KeyMgmtError::NotPermitted` - If the key does not allow `usage`.
    /// * `KeyMgmtError::InvalidArgument` - If `usage` selects no single direction of a
    ///   bidirectional key.
    #[instrument(skip(self))]
    pub fn load_key(
        &self,
        id: KeyId,
        usage: KeyUsage,
        request: LoadRequest,
    ) -> KeyMgmtResult<LoadedKey> {
        self.inner.write().load(id, usage, request)
    }

    /// Releases a key returned by [`KeyStore::load_key`].
    #[instrument(skip(self, loaded))]
    pub fn release_key(&self, id: KeyId, loaded: &LoadedKey) -> KeyMgmtResult<()> {
        self.inner.write().release(id, loaded)
    }

    /// Logs every allocated slot.
    pub fn dump(&self) {
        self.inner.read().dump();
    }

    pub(crate) fn derive(
        &self,
        attributes: &KeyAttributes,
        kdk: KeyId,
        fixed_input: &[u8],
    ) -> KeyMgmtResult<KeyId> {
        self.inner.write().derive(attributes, kdk, fixed_input)
    }

    #[cfg(test)]
    fn with_inner<T>(&self, f: impl FnOnce(&mut KeyStoreInner) -> T) -> T {
        f(&mut self.inner.write())
    }
}

pub(crate) struct KeyStoreInner {
    config: KeyStoreConfig,
    table: KeySlotTable,
    store: Arc<dyn AssetStore>,
    storage: Arc<dyn PersistentStore>,
}

impl KeyStoreInner {
    fn policy_context(&self) -> PolicyContext {
        PolicyContext {
            non_secure: !self.store.is_access_secure(),
            dpa_support: self.config.dpa_support,
        }
    }

    fn kek(&self) -> KeyMgmtResult<AssetId> {
        self.store.key_blob_kek()?.ok_or_else(|| {
            tracing::error!("Key blob KEK not available");
            KeyMgmtError::HardwareFailure
        })
    }

    /// Wraps `plaintext` for an asset of `policy`.
    fn wrap(&self, policy: AssetPolicy, plaintext: &[u8]) -> KeyMgmtResult<Zeroizing<Vec<u8>>> {
        let kek = self.kek()?;
        let asset = self.store.alloc(policy, plaintext.len())?;
        let blob = self
            .store
            .load_plaintext_export(asset, plaintext, kek)
            .map(Zeroizing::new)
            .map_err(KeyMgmtError::from);
        let freed = self.store.free(asset).map_err(KeyMgmtError::from);
        settle(blob, freed)
    }

    /// Finds the slot of `id`, reloading persistent keys from the backing store.
    ///
    /// # Errors
    /// * `KeyMgmtError::InvalidHandle` - If no key `id` exists.
    fn resolve(&mut self, id: KeyId) -> KeyMgmtResult<usize> {
        if id != KEY_ID_NULL {
            if let Some(index) = self.table.find(id) {
                return Ok(index);
            }
        }

        if !(KEY_ID_USER_MIN..=KEY_ID_USER_MAX).contains(&id) {
            tracing::error!(id, "No such key");
            Err(KeyMgmtError::InvalidHandle)?
        }

        let record = match self.storage.read(id) {
            Ok(record) => Zeroizing::new(record),
            Err(AssetError::NotFound) => {
                tracing::error!(id, "No such key");
                Err(KeyMgmtError::InvalidHandle)?
            }
            Err(error) => Err(error)?,
        };

        let mut slot = persist::decode(id, &record)?;
        if slot.attributes.lifetime.persistence() != KeyPersistence::Default {
            tracing::error!(id, "Corruption: stored key is not persistent");
            Err(KeyMgmtError::CorruptionDetected)?
        }
        if !slot.attributes.usage().cache() {
            slot.forget_material();
        }

        crate::cleanup::transact(self, |inner, cleanup| {
            let index = inner.allocate_slot(KeyPersistence::Default, cleanup)?;
            *inner.table.get_mut(index)? = slot;
            tracing::debug!(id, index, "Key reloaded from storage");
            Ok(index)
        })
    }

    /// Reads the stored copy of key `id`.
    fn stored_slot(&self, id: KeyId) -> KeyMgmtResult<KeySlot> {
        let record = match self.storage.read(id) {
            Ok(record) => Zeroizing::new(record),
            Err(AssetError::NotFound) => {
                tracing::error!(id, "Corruption: resident persistent key has no record");
                Err(KeyMgmtError::CorruptionDetected)?
            }
            Err(error) => Err(error)?,
        };
        persist::decode(id, &record)
    }

    /// Material part `part` of the key at `index`, from the slot or the
    /// backing store.
    fn material(&self, index: usize, part: usize) -> KeyMgmtResult<Zeroizing<Vec<u8>>> {
        let slot = self.table.get(index)?;
        if let Some(material) = &slot.material[part] {
            return Ok(material.clone());
        }

        if slot.attributes.lifetime.persistence() != KeyPersistence::Default {
            tracing::error!(id = slot.id(), part, "Corruption: key without material");
            Err(KeyMgmtError::CorruptionDetected)?
        }

        self.stored_slot(slot.id())?.material[part]
            .take()
            .ok_or_else(|| {
                tracing::error!(id = slot.id(), part, "Corruption: record lacks a material part");
                KeyMgmtError::CorruptionDetected
            })
    }

    /// Returns an asset holding the key at `index` for `direction`.
    ///
    /// Keys that are not held as assets are loaded into a transient asset
    /// the caller must free.
    ///
    /// # Returns
    /// * The asset and whether it is transient.
    fn part_asset(
        &self,
        index: usize,
        direction: Option<Direction>,
    ) -> KeyMgmtResult<(AssetId, bool)> {
        let slot = self.table.get(index)?;
        let part = slot.part(direction);
        if let Some(asset) = slot.assets[part] {
            return Ok((asset, false));
        }

        let representation = slot.representation();
        if representation == Representation::Asset {
            tracing::error!(id = slot.id(), part, "Corruption: asset store key without asset");
            Err(KeyMgmtError::CorruptionDetected)?
        }

        let policy = slot.direction_policy(direction);
        let material = self.material(index, part)?;
        let asset = self.store.alloc(policy, slot.key_size)?;

        let loaded = match representation {
            Representation::Wrapped => self
                .kek()
                .and_then(|kek| Ok(self.store.load_import(asset, kek, &material)?)),
            _ => self
                .store
                .load_plaintext(asset, &material)
                .map_err(KeyMgmtError::from),
        };

        match loaded {
            Ok(()) => Ok((asset, true)),
            Err(error) => {
                let freed = self.store.free(asset).map_err(KeyMgmtError::from);
                settle(Err(error), freed)
            }
        }
    }

    /// Allocates a slot in the region of `persistence`, releasing the
    /// assets of an evicted key.
    fn allocate_slot(
        &mut self,
        persistence: KeyPersistence,
        cleanup: &mut CleanupStack,
    ) -> KeyMgmtResult<usize> {
        let free = self.table.find_free_slot(persistence)?;
        cleanup.on_error(CleanupAction::ClearSlot(free.index));

        if let Some(evicted) = free.evicted {
            self.release_evicted(evicted)?;
        }
        Ok(free.index)
    }

    /// Frees every asset of an evicted slot.
    ///
    /// # Returns
    /// * The error of the first failing free, after all were attempted.
    fn release_evicted(&self, mut evicted: KeySlot) -> KeyMgmtResult<()> {
        let mut first_error = None;

        for asset in evicted.take_assets() {
            if let Err(error) = self.store.free(asset) {
                tracing::error!(?error, ?asset, id = evicted.id(), "Failed to free evicted asset");
                first_error.get_or_insert(KeyMgmtError::from(error));
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Checks the identifier and lifetime of a key about to be created.
    ///
    /// # Arguments
    /// * `attributes` - Attributes of the new key.
    /// * `allow_roots` - Whether the hardware root identifiers are acceptable.
    ///
    /// # Errors
    /// * `KeyMgmtError::InvalidArgument` - If the identifier or lifetime is invalid.
    /// * `KeyMgmtError::AlreadyExists` - If the identifier is taken.
    fn check_new_key(&self, attributes: &KeyAttributes, allow_roots: bool) -> KeyMgmtResult<()> {
        let id = attributes.id;
        let lifetime = attributes.lifetime;

        if !matches!(
            lifetime.location(),
            KeyLocation::LocalStorage | KeyLocation::PrimarySecureElement
        ) {
            tracing::error!(?lifetime, "Unknown key location");
            Err(KeyMgmtError::InvalidArgument)?
        }

        match lifetime.persistence() {
            KeyPersistence::Volatile => {
                if id != KEY_ID_NULL {
                    tracing::error!(id, "Volatile keys get their identifier assigned");
                    Err(KeyMgmtError::InvalidArgument)?
                }
                return Ok(());
            }
            KeyPersistence::Default => {}
            KeyPersistence::HsmAssetStore if lifetime.is_secure_element() => {}
            persistence => {
                tracing::error!(?persistence, "Persistence not supported for new keys");
                Err(KeyMgmtError::InvalidArgument)?
            }
        }

        if !(KEY_ID_USER_MIN..=KEY_ID_USER_MAX).contains(&id)
            || (is_hardware_root(id) && !allow_roots)
        {
            tracing::error!(id, "Invalid key identifier");
            Err(KeyMgmtError::InvalidArgument)?
        }

        if self.table.find(id).is_some() || self.storage.info(id)?.is_some() {
            tracing::error!(id, "Key already exists");
            Err(KeyMgmtError::AlreadyExists)?
        }
        Ok(())
    }

    /// Installs a fully built slot at `index` and persists it.
    ///
    /// # Returns
    /// * The identifier of the key.
    fn commit(
        &mut self,
        index: usize,
        mut slot: KeySlot,
        cleanup: &mut CleanupStack,
    ) -> KeyMgmtResult<KeyId> {
        let lifetime = slot.attributes.lifetime;
        if lifetime.is_volatile() {
            slot.attributes.id = self.table.volatile_id(index)?;
        }
        let id = slot.id();

        if lifetime.persistence() == KeyPersistence::Default {
            let record = persist::encode(&slot)?;
            self.storage.write(id, &record)?;
            cleanup.on_error(CleanupAction::ClearRecord(id));

            if !slot.attributes.usage().cache() {
                slot.forget_material();
            }
        }

        tracing::debug!(id, index, representation = %slot.representation(), "Key installed");
        *self.table.get_mut(index)? = slot;
        Ok(id)
    }

    fn dump(&self) {
        tracing::debug!(slots = self.table.len(), "Key store dump");
        for (index, slot) in self.table.iter() {
            tracing::debug!(
                index,
                id = slot.id(),
                key_type = ?slot.attributes.key_type,
                bits = slot.attributes.bits,
                lifetime = ?slot.attributes.lifetime,
                usage = ?slot.attributes.usage(),
                policy = %slot.policy,
                in_use = slot.in_use,
                bidirectional = slot.bidirectional,
                source_key_id = slot.source_key_id,
                assets = ?slot.assets,
                cached = slot.material[0].is_some(),
                "Key slot"
            );
        }
    }
}

impl CleanupTarget for KeyStoreInner {
    fn free_asset(&mut self, asset: AssetId) -> KeyMgmtResult<()> {
        Ok(self.store.free(asset)?)
    }

    fn clear_slot(&mut self, index: usize) -> KeyMgmtResult<()> {
        self.table.clear(index);
        Ok(())
    }

    fn clear_record(&mut self, id: KeyId) -> KeyMgmtResult<()> {
        Ok(self.storage.clear(id)?)
    }

    fn unlock_slot(&mut self, index: usize) -> KeyMgmtResult<()> {
        self.table.unlock(index)
    }
}
