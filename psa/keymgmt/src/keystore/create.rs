// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Key creation: import, generation, copy and derivation.

use azihsm_psa_interface::AssetPolicy;
use azihsm_psa_interface::ASSET_NUMBER_HUK;
use zeroize::Zeroizing;

use super::KeyStoreInner;
use crate::algorithm::EccFamily;
use crate::attributes::*;
use crate::cleanup::transact;
use crate::cleanup::CleanupAction;
use crate::cleanup::CleanupStack;
use crate::cleanup::When;
use crate::format::ecc_private_size;
use crate::format::ecc_public_size;
use crate::format::to_device;
use crate::policy::is_bidirectional;
use crate::policy::translate;
use crate::pubkey::generate_key_pair;
use crate::slot::KeySlot;
use crate::slot::Representation;
use crate::KeyMgmtError;
use crate::KeyMgmtResult;

/// Material of a new key in the form it is stored in.
struct Prepared {
    plaintext: Zeroizing<Vec<u8>>,
    bits: usize,
    modulus_bits: usize,
    exponent_bits: usize,
}

impl Prepared {
    fn symmetric(plaintext: Zeroizing<Vec<u8>>) -> Self {
        let bits = plaintext.len() * 8;
        Self {
            plaintext,
            bits,
            modulus_bits: 0,
            exponent_bits: 0,
        }
    }
}

impl KeyStoreInner {
    pub(super) fn import(&mut self, attributes: &KeyAttributes, data: &[u8]) -> KeyMgmtResult<KeyId> {
        let key_type = attributes.require_type()?;
        if data.is_empty() {
            tracing::error!("Importing empty key material");
            Err(KeyMgmtError::InvalidArgument)?
        }
        self.check_new_key(attributes, false)?;

        let prepared = if key_type.is_symmetric() {
            let prepared = Prepared::symmetric(Zeroizing::new(data.to_vec()));
            if attributes.bits != 0 && attributes.bits != prepared.bits {
                tracing::error!(bits = attributes.bits, len = data.len(), "Key size does not match the material");
                Err(KeyMgmtError::InvalidArgument)?
            }
            prepared
        } else {
            let device = to_device(key_type, attributes.bits, data)?;
            Prepared {
                plaintext: device.vector,
                bits: device.bits,
                modulus_bits: device.modulus_bits,
                exponent_bits: device.exponent_bits,
            }
        };

        self.create(attributes, prepared)
    }

    pub(super) fn generate(&mut self, attributes: &KeyAttributes) -> KeyMgmtResult<KeyId> {
        let key_type = attributes.require_type()?;
        let bits = attributes.bits;
        if bits == 0 || key_type.is_public_key() {
            tracing::error!(%key_type, bits, "Cannot generate a key of this type and size");
            Err(KeyMgmtError::InvalidArgument)?
        }
        self.check_new_key(attributes, false)?;

        if key_type.is_symmetric() {
            if bits % 8 != 0 {
                tracing::error!(bits, "Symmetric key size is not a whole number of bytes");
                Err(KeyMgmtError::InvalidArgument)?
            }
            return self.generate_symmetric(attributes);
        }

        if !attributes.lifetime.is_secure_element() {
            tracing::error!(%key_type, "Asymmetric generation needs the secure element");
            Err(KeyMgmtError::NotSupported)?
        }

        match key_type.ecc_family() {
            Some(family) => self.generate_ecc_pair(attributes, family),
            None => {
                tracing::error!(%key_type, "RSA key generation is not supported");
                Err(KeyMgmtError::NotSupported)
            }
        }
    }

    /// Generates a symmetric key. Keys held by the asset store in a single
    /// asset never leave the hardware.
    fn generate_symmetric(&mut self, attributes: &KeyAttributes) -> KeyMgmtResult<KeyId> {
        let key_type = attributes.require_type()?;
        let key_size = attributes.bits / 8;
        let mut slot = KeySlot {
            attributes: *attributes,
            key_size,
            policy: translate(key_type, &attributes.policy, attributes.bits, self.policy_context())?,
            bidirectional: is_bidirectional(key_type, &attributes.policy),
            ..Default::default()
        };

        if slot.representation() == Representation::Asset && slot.parts() == 1 {
            return transact(self, |inner, cleanup| {
                let index = inner.allocate_slot(KeyPersistence::HsmAssetStore, cleanup)?;
                let asset = inner.store.alloc(slot.policy, key_size)?;
                cleanup.on_error(CleanupAction::FreeAsset(asset));
                slot.assets[0] = Some(asset);
                inner.store.load_random(asset)?;
                inner.commit(index, slot, cleanup)
            });
        }

        let mut plaintext = Zeroizing::new(vec![0u8; key_size]);
        self.store.random(&mut plaintext)?;
        self.create(attributes, Prepared::symmetric(plaintext))
    }

    fn generate_ecc_pair(&mut self, attributes: &KeyAttributes, family: EccFamily) -> KeyMgmtResult<KeyId> {
        let key_type = attributes.require_type()?;
        let bits = attributes.bits;
        let policy = translate(key_type, &attributes.policy, bits, self.policy_context())?;
        let mut slot = KeySlot {
            attributes: *attributes,
            key_size: ecc_private_size(bits),
            policy,
            modulus_bits: bits,
            exponent_bits: bits,
            ..Default::default()
        };
        let in_asset_store = slot.representation() == Representation::Asset;

        transact(self, |inner, cleanup| {
            let index = inner.allocate_slot(attributes.lifetime.persistence(), cleanup)?;
            let kek = if in_asset_store { None } else { Some(inner.kek()?) };

            let private_key = inner.store.alloc(policy, slot.key_size)?;
            let when = if in_asset_store { When::OnError } else { When::Always };
            cleanup.push(when, CleanupAction::FreeAsset(private_key));

            let public_key = inner
                .store
                .alloc(policy.to_public(), ecc_public_size(family, bits))?;
            cleanup.always(CleanupAction::FreeAsset(public_key));

            match generate_key_pair(&*inner.store, family, bits, private_key, public_key, kek)? {
                Some(blob) => slot.material[0] = Some(Zeroizing::new(blob)),
                None => slot.assets[0] = Some(private_key),
            }

            inner.commit(index, slot, cleanup)
        })
    }

    pub(super) fn copy(&mut self, source: KeyId, attributes: &KeyAttributes) -> KeyMgmtResult<KeyId> {
        let source_index = self.resolve(source)?;

        transact(self, |inner, cleanup| {
            inner.table.lock(source_index)?;
            cleanup.always(CleanupAction::UnlockSlot(source_index));

            let src = inner.table.get(source_index)?;
            let src_lifetime = src.attributes.lifetime;
            if src.is_copy() || !src.attributes.usage().copy() {
                tracing::error!(source, "Key cannot be copied");
                Err(KeyMgmtError::NotPermitted)?
            }
            if src.representation() == Representation::Asset
                || (src_lifetime.is_secure_element() && !attributes.lifetime.is_secure_element())
            {
                tracing::error!(source, lifetime = ?attributes.lifetime, "Key cannot leave the secure element");
                Err(KeyMgmtError::NotPermitted)?
            }

            let key_type = src.key_type()?;
            if attributes.key_type.is_some_and(|wanted| wanted != key_type)
                || (attributes.bits != 0 && attributes.bits != src.attributes.bits)
            {
                tracing::error!(source, "Copy does not match the source type and size");
                Err(KeyMgmtError::InvalidArgument)?
            }

            let target = KeyAttributes {
                id: attributes.id,
                key_type: Some(key_type),
                bits: src.attributes.bits,
                lifetime: attributes.lifetime,
                policy: src.attributes.policy.restrict(&attributes.policy)?,
            };
            let mut slot = KeySlot {
                attributes: target,
                key_size: src.key_size,
                policy: src.policy,
                bidirectional: src.bidirectional,
                modulus_bits: src.modulus_bits,
                exponent_bits: src.exponent_bits,
                source_key_id: source,
                ..Default::default()
            };
            let src_representation = src.representation();
            let src_parts = src.parts();

            inner.check_new_key(&target, false)?;
            let parts = (0..src_parts)
                .map(|part| inner.material(source_index, part))
                .collect::<KeyMgmtResult<Vec<_>>>()?;

            let index = inner.allocate_slot(target.lifetime.persistence(), cleanup)?;
            match (src_representation, slot.representation()) {
                (Representation::Plaintext, _) => inner.materialize(&mut slot, &parts[0], cleanup)?,
                (Representation::Wrapped, Representation::Wrapped) => {
                    for (part, blob) in parts.into_iter().enumerate() {
                        slot.material[part] = Some(blob);
                    }
                }
                (Representation::Wrapped, Representation::Asset) => {
                    let kek = inner.kek()?;
                    for (part, blob) in parts.iter().enumerate() {
                        let asset = inner.store.alloc(slot.part_policy(part), slot.key_size)?;
                        cleanup.on_error(CleanupAction::FreeAsset(asset));
                        slot.assets[part] = Some(asset);
                        inner.store.load_import(asset, kek, blob)?;
                    }
                }
                (from, to) => {
                    tracing::error!(%from, %to, "Corruption: unexpected copy representations");
                    Err(KeyMgmtError::CorruptionDetected)?
                }
            }

            inner.commit(index, slot, cleanup)
        })
    }

    /// Derives a key into the asset store from the key derivation key `kdk`.
    ///
    /// # Arguments
    /// * `attributes` - Attributes of the derived key.
    /// * `kdk` - [`KEY_ID_HUK`] or a resident key derivation key.
    /// * `fixed_input` - Label and context of the derivation.
    pub(super) fn derive(
        &mut self,
        attributes: &KeyAttributes,
        kdk: KeyId,
        fixed_input: &[u8],
    ) -> KeyMgmtResult<KeyId> {
        let key_type = attributes.require_type()?;
        if !key_type.is_symmetric() {
            tracing::error!(%key_type, "Only symmetric keys can be derived");
            Err(KeyMgmtError::NotSupported)?
        }
        let bits = attributes.bits;
        if bits == 0 || bits % 8 != 0 {
            tracing::error!(bits, "Derived key size is not a whole number of bytes");
            Err(KeyMgmtError::InvalidArgument)?
        }
        let lifetime = attributes.lifetime;
        if !lifetime.is_asset_store() || !lifetime.is_secure_element() {
            tracing::error!(?lifetime, "Derived keys live in the asset store");
            Err(KeyMgmtError::InvalidArgument)?
        }

        self.check_new_key(attributes, true)?;

        let context = self.policy_context();
        let policy = if attributes.id == KEY_ID_TKDK {
            let mut policy = AssetPolicy::SYM_DERIVE | AssetPolicy::SCAD_TRUSTED;
            if context.non_secure {
                policy |= AssetPolicy::SOURCE_NON_SECURE;
            }
            policy
        } else {
            translate(key_type, &attributes.policy, bits, context)?
        };

        let mut input = Zeroizing::new(fixed_input.to_vec());
        if !is_hardware_root(kdk) {
            let output_bits = u32::try_from(bits).map_err(|_| KeyMgmtError::InvalidArgument)?;
            input.extend_from_slice(&output_bits.to_be_bytes());
        }
        let counter_mode = kdk != KEY_ID_HUK;

        let mut slot = KeySlot {
            attributes: *attributes,
            key_size: bits / 8,
            policy,
            bidirectional: is_bidirectional(key_type, &attributes.policy),
            ..Default::default()
        };

        transact(self, |inner, cleanup| {
            let kdk_asset = if kdk == KEY_ID_HUK {
                inner.store.search(ASSET_NUMBER_HUK)?
            } else {
                let kdk_index = inner.resolve(kdk)?;
                inner.table.lock(kdk_index)?;
                cleanup.always(CleanupAction::UnlockSlot(kdk_index));

                let (asset, transient) = inner.part_asset(kdk_index, None)?;
                if transient {
                    cleanup.always(CleanupAction::FreeAsset(asset));
                }
                asset
            };

            let index = inner.allocate_slot(KeyPersistence::HsmAssetStore, cleanup)?;
            for part in 0..slot.parts() {
                let asset = inner.store.alloc(slot.part_policy(part), slot.key_size)?;
                cleanup.on_error(CleanupAction::FreeAsset(asset));
                slot.assets[part] = Some(asset);
                inner.store.load_derive(asset, kdk_asset, &input, counter_mode)?;
            }

            tracing::debug!(kdk, id = slot.id(), bits, counter_mode, "Key derived");
            inner.commit(index, slot, cleanup)
        })
    }

    /// Creates a key from prepared material.
    fn create(&mut self, attributes: &KeyAttributes, prepared: Prepared) -> KeyMgmtResult<KeyId> {
        let key_type = attributes.require_type()?;
        let policy = translate(key_type, &attributes.policy, prepared.bits, self.policy_context())?;

        let mut slot = KeySlot {
            attributes: KeyAttributes {
                bits: prepared.bits,
                ..*attributes
            },
            key_size: prepared.plaintext.len(),
            policy,
            bidirectional: is_bidirectional(key_type, &attributes.policy),
            modulus_bits: prepared.modulus_bits,
            exponent_bits: prepared.exponent_bits,
            ..Default::default()
        };

        transact(self, |inner, cleanup| {
            let index = inner.allocate_slot(attributes.lifetime.persistence(), cleanup)?;
            inner.materialize(&mut slot, &prepared.plaintext, cleanup)?;
            inner.commit(index, slot, cleanup)
        })
    }

    /// Stores `plaintext` in `slot` in the representation of its lifetime.
    fn materialize(
        &self,
        slot: &mut KeySlot,
        plaintext: &[u8],
        cleanup: &mut CleanupStack,
    ) -> KeyMgmtResult<()> {
        match slot.representation() {
            Representation::Plaintext => {
                slot.material[0] = Some(Zeroizing::new(plaintext.to_vec()));
            }
            Representation::Wrapped => {
                for part in 0..slot.parts() {
                    slot.material[part] = Some(self.wrap(slot.part_policy(part), plaintext)?);
                }
            }
            Representation::Asset => {
                for part in 0..slot.parts() {
                    let asset = self.store.alloc(slot.part_policy(part), plaintext.len())?;
                    cleanup.on_error(CleanupAction::FreeAsset(asset));
                    slot.assets[part] = Some(asset);
                    self.store.load_plaintext(asset, plaintext)?;
                }
            }
        }
        Ok(())
    }
}
