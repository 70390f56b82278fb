// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Key use: load, release and export.

use crate::algorithm::Algorithm;
use crate::algorithm::EccFamily;
use crate::algorithm::KeyType;
use crate::attributes::*;
use crate::cleanup::settle;
use crate::cleanup::transact;
use crate::cleanup::CleanupAction;
use crate::format::public_from_device;
use crate::pubkey::ephemeral_public_asset;
use crate::pubkey::public_key_export;
use crate::slot::Direction;
use crate::slot::Representation;
use crate::KeyMgmtError;
use crate::KeyMgmtResult;

use super::KeyStoreInner;
use super::LoadRequest;
use super::LoadedKey;

impl KeyStoreInner {
    pub(super) fn load(
        &mut self,
        id: KeyId,
        usage: KeyUsage,
        request: LoadRequest,
    ) -> KeyMgmtResult<LoadedKey> {
        let index = self.resolve(id)?;
        let slot = self.table.get(index)?;

        if !slot.attributes.usage().contains(usage) {
            tracing::error!(id, ?usage, "Key usage does not permit the request");
            Err(KeyMgmtError::NotPermitted)?
        }
        let direction = if slot.bidirectional {
            Some(Direction::for_usage(usage)?)
        } else {
            None
        };

        match request {
            LoadRequest::Plaintext { capacity } => {
                if slot.representation() != Representation::Plaintext {
                    tracing::error!(id, "Key material is not available in plaintext");
                    Err(KeyMgmtError::NotSupported)?
                }
                if slot.key_size > capacity {
                    tracing::error!(id, key_size = slot.key_size, capacity, "Buffer too small for the key");
                    Err(KeyMgmtError::BufferTooSmall)?
                }
                Ok(LoadedKey::Plaintext(self.material(index, 0)?))
            }
            LoadRequest::Asset => match slot.key_type()? {
                KeyType::EccKeyPair(family) if usage.is_verify() => {
                    self.load_public_asset(index, family)
                }
                _ => self.load_asset(index, direction),
            },
        }
    }

    /// Loads the public key of the key pair at `index` into an asset owned
    /// by the caller.
    fn load_public_asset(&self, index: usize, family: EccFamily) -> KeyMgmtResult<LoadedKey> {
        let slot = self.table.get(index)?;
        let (bits, policy) = (slot.attributes.bits, slot.policy);

        let (private_key, transient) = self.part_asset(index, None)?;
        let public_key = ephemeral_public_asset(&*self.store, family, bits, private_key, policy);
        let freed = if transient {
            self.store.free(private_key).map_err(KeyMgmtError::from)
        } else {
            Ok(())
        };

        match (public_key, freed) {
            (Ok(asset), Ok(())) => Ok(LoadedKey::Asset {
                asset,
                direction: None,
                ephemeral: true,
            }),
            (Ok(asset), Err(error)) => {
                let freed = self.store.free(asset).map_err(KeyMgmtError::from);
                settle(Err(error), freed)
            }
            (Err(error), freed) => settle(Err(error), freed),
        }
    }

    fn load_asset(&mut self, index: usize, direction: Option<Direction>) -> KeyMgmtResult<LoadedKey> {
        let (asset, transient) = self.part_asset(index, direction)?;

        let slot = self.table.get_mut(index)?;
        let ephemeral = transient && slot.bidirectional && slot.parts() == 1;
        if transient && !ephemeral {
            let part = slot.part(direction);
            slot.assets[part] = Some(asset);
        }

        tracing::debug!(id = slot.id(), %asset, ?direction, ephemeral, "Key loaded");
        Ok(LoadedKey::Asset {
            asset,
            direction,
            ephemeral,
        })
    }

    pub(super) fn release(&mut self, id: KeyId, loaded: &LoadedKey) -> KeyMgmtResult<()> {
        let (asset, direction) = match loaded {
            LoadedKey::Plaintext(_) => return Ok(()),
            LoadedKey::Asset {
                asset,
                ephemeral: true,
                ..
            } => return Ok(self.store.free(*asset)?),
            LoadedKey::Asset {
                asset, direction, ..
            } => (*asset, *direction),
        };

        let index = self.table.find(id).ok_or_else(|| {
            tracing::error!(id, "Releasing a key that is not resident");
            KeyMgmtError::InvalidHandle
        })?;
        let slot = self.table.get_mut(index)?;
        if slot.representation() == Representation::Asset {
            return Ok(());
        }

        let part = slot.part(direction);
        if slot.assets[part] != Some(asset) {
            tracing::error!(id, %asset, "Released asset does not belong to the key");
            Err(KeyMgmtError::InvalidArgument)?
        }
        slot.assets[part] = None;

        if let Err(error) = self.store.free(asset) {
            self.table.get_mut(index)?.assets[part] = Some(asset);
            Err(error)?
        }
        Ok(())
    }

    pub(super) fn export(&mut self, id: KeyId, out: &mut [u8]) -> KeyMgmtResult<usize> {
        let index = self.resolve(id)?;

        transact(self, |inner, cleanup| {
            inner.table.lock(index)?;
            cleanup.always(CleanupAction::UnlockSlot(index));

            let slot = inner.table.get(index)?;
            if !slot.attributes.usage().export() {
                tracing::error!(id, "Key usage does not permit export");
                Err(KeyMgmtError::NotPermitted)?
            }
            if slot.key_type()?.is_asymmetric() || slot.attributes.lifetime.is_secure_element() {
                tracing::error!(id, "Only local symmetric keys can be exported");
                Err(KeyMgmtError::NotSupported)?
            }

            let material = if slot.attributes.lifetime.persistence() == KeyPersistence::Default {
                let stored = inner.stored_slot(id)?.material[0].take().ok_or_else(|| {
                    tracing::error!(id, "Corruption: record without material");
                    KeyMgmtError::CorruptionDetected
                })?;
                if slot.material[0].as_ref().is_some_and(|cached| *cached != stored) {
                    tracing::error!(id, "Corruption: cached material differs from the record");
                    Err(KeyMgmtError::CorruptionDetected)?
                }
                stored
            } else {
                inner.material(index, 0)?
            };

            let len = material.len();
            let Some(out) = out.get_mut(..len) else {
                tracing::error!(id, len, "Buffer too small for the key");
                return Err(KeyMgmtError::BufferTooSmall);
            };
            out.copy_from_slice(&material);
            Ok(len)
        })
    }

    pub(super) fn export_public(&mut self, id: KeyId, out: &mut [u8]) -> KeyMgmtResult<usize> {
        let index = self.resolve(id)?;
        let der = !self.config.der_bypass;

        transact(self, |inner, cleanup| {
            inner.table.lock(index)?;
            cleanup.always(CleanupAction::UnlockSlot(index));

            let slot = inner.table.get(index)?;
            let key_type = slot.key_type()?;
            let bits = slot.attributes.bits;

            let public = match key_type {
                KeyType::EccKeyPair(family) => {
                    let ecdh = slot.attributes.alg() == Some(Algorithm::Ecdh);
                    let mismatch = match family {
                        EccFamily::Montgomery => !ecdh,
                        EccFamily::TwistedEdwards => ecdh,
                        _ => false,
                    };
                    if mismatch {
                        tracing::error!(id, %family, "Algorithm does not match the curve");
                        Err(KeyMgmtError::InvalidArgument)?
                    }

                    let (asset, transient) = inner.part_asset(index, None)?;
                    if transient {
                        cleanup.always(CleanupAction::FreeAsset(asset));
                    }
                    public_key_export(&*inner.store, family, bits, asset, der)?
                }
                KeyType::EccPublicKey(_) | KeyType::RsaPublicKey => {
                    let vector = inner.material(index, 0)?;
                    public_from_device(key_type, bits, &vector, der)?
                }
                KeyType::RsaKeyPair => {
                    tracing::error!(id, "RSA public key export is not supported");
                    Err(KeyMgmtError::NotSupported)?
                }
                _ => {
                    tracing::error!(id, %key_type, "Key has no public part");
                    Err(KeyMgmtError::InvalidArgument)?
                }
            };

            let len = public.len();
            let Some(out) = out.get_mut(..len) else {
                tracing::error!(id, len, "Buffer too small for the public key");
                return Err(KeyMgmtError::BufferTooSmall);
            };
            out.copy_from_slice(&public);
            Ok(len)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use azihsm_psa_interface::AssetPolicy;
    use azihsm_psa_interface::AssetStore;
    use azihsm_psa_sim::SimAssetStore;
    use azihsm_psa_sim::SimFault;
    use azihsm_psa_sim::SimPersistentStore;
    use test_with_tracing::test;

    use super::*;
    use crate::algorithm::HashAlg;
    use crate::algorithm::HashSel;
    use crate::config::KeyStoreConfig;
    use crate::KeyStore;

    fn key_store(config: KeyStoreConfig) -> (KeyStore, SimAssetStore) {
        let sim = SimAssetStore::new().unwrap();
        let store = KeyStore::new(
            config,
            Arc::new(sim.clone()),
            Arc::new(SimPersistentStore::new()),
        )
        .unwrap();
        (store, sim)
    }

    fn cipher(location: KeyLocation) -> KeyAttributes {
        KeyAttributes::new(KeyType::Aes, 128)
            .with_lifetime(KeyPersistence::Volatile, location)
            .with_usage(KeyUsage::new().with_encrypt(true).with_decrypt(true))
            .with_algorithm(Algorithm::Gcm)
    }

    #[test]
    fn test_load_wrapped_caches_asset_until_release() {
        let (store, sim) = key_store(KeyStoreConfig::default());
        let id = store
            .import_key(&cipher(KeyLocation::PrimarySecureElement), &[1; 16])
            .unwrap();
        let decrypt = KeyUsage::new().with_decrypt(true);

        let loaded = store.load_key(id, decrypt, LoadRequest::Asset).unwrap();
        let LoadedKey::Asset {
            asset,
            direction,
            ephemeral,
        } = loaded
        else {
            panic!("expected an asset, got {loaded:?}");
        };
        assert_eq!(direction, Some(Direction::DecVrfy));
        assert!(!ephemeral);
        assert_eq!(store.get_key(id).unwrap().assets, [None, Some(asset)]);
        assert_eq!(
            store.load_key(id, decrypt, LoadRequest::Asset),
            Ok(loaded.clone()),
            "second load reuses the asset"
        );

        store.release_key(id, &loaded).unwrap();
        assert_eq!(store.get_key(id).unwrap().assets, [None, None]);
        assert_eq!(sim.live_assets(), 0);
        assert_eq!(
            store.release_key(id, &loaded).unwrap_err(),
            KeyMgmtError::InvalidArgument
        );
    }

    #[test]
    fn test_load_local_bidirectional_is_ephemeral() {
        let (store, sim) = key_store(KeyStoreConfig::default());
        let id = store
            .import_key(&cipher(KeyLocation::LocalStorage), &[2; 16])
            .unwrap();

        let loaded = store
            .load_key(id, KeyUsage::new().with_decrypt(true), LoadRequest::Asset)
            .unwrap();
        let LoadedKey::Asset { asset, ephemeral, .. } = loaded else {
            panic!("expected an asset, got {loaded:?}");
        };
        assert!(ephemeral);
        assert_eq!(
            sim.asset_policy(asset).map(|policy| policy & AssetPolicy::DIR_MASK),
            Some(AssetPolicy::DIR_DEC_VRFY)
        );
        assert_eq!(store.get_key(id).unwrap().assets, [None, None]);

        store.release_key(id, &loaded).unwrap();
        assert_eq!(sim.live_assets(), 0);
    }

    #[test]
    fn test_load_plaintext() {
        let (store, _) = key_store(KeyStoreConfig::default());
        let id = store
            .import_key(&cipher(KeyLocation::LocalStorage), &[3; 16])
            .unwrap();
        let encrypt = KeyUsage::new().with_encrypt(true);

        assert_eq!(
            store.load_key(id, encrypt, LoadRequest::Plaintext { capacity: 15 }),
            Err(KeyMgmtError::BufferTooSmall)
        );
        let loaded = store
            .load_key(id, encrypt, LoadRequest::Plaintext { capacity: 16 })
            .unwrap();
        assert_eq!(loaded, LoadedKey::Plaintext(vec![3; 16].into()));
        store.release_key(id, &loaded).unwrap();

        assert_eq!(
            store.load_key(id, KeyUsage::new().with_export(true), LoadRequest::Asset),
            Err(KeyMgmtError::NotPermitted)
        );

        let se = store
            .import_key(&cipher(KeyLocation::PrimarySecureElement), &[3; 16])
            .unwrap();
        assert_eq!(
            store.load_key(se, encrypt, LoadRequest::Plaintext { capacity: 16 }),
            Err(KeyMgmtError::NotSupported)
        );
    }

    #[test]
    fn test_load_verify_of_key_pair_gives_public_asset() {
        let (store, sim) = key_store(KeyStoreConfig::default());
        let attributes = KeyAttributes::new(KeyType::EccKeyPair(EccFamily::SecpR1), 256)
            .with_id(0x10)
            .with_lifetime(KeyPersistence::HsmAssetStore, KeyLocation::PrimarySecureElement)
            .with_usage(KeyUsage::new().with_sign_hash(true).with_verify_hash(true))
            .with_algorithm(Algorithm::Ecdsa(HashSel::Specific(HashAlg::Sha256)));
        let id = store.generate_key(&attributes).unwrap();
        let private_key = store.get_key(id).unwrap().assets[0].unwrap();

        let loaded = store
            .load_key(id, KeyUsage::new().with_verify_hash(true), LoadRequest::Asset)
            .unwrap();
        let LoadedKey::Asset { asset, ephemeral, .. } = loaded else {
            panic!("expected an asset, got {loaded:?}");
        };
        assert!(ephemeral);
        assert_ne!(asset, private_key);
        assert!(!sim.asset_policy(asset).unwrap().is_private());

        let signing = store
            .load_key(id, KeyUsage::new().with_sign_hash(true), LoadRequest::Asset)
            .unwrap();
        assert_eq!(
            signing,
            LoadedKey::Asset {
                asset: private_key,
                direction: None,
                ephemeral: false
            }
        );

        store.release_key(id, &loaded).unwrap();
        store.release_key(id, &signing).unwrap();
        assert_eq!(sim.live_assets(), 1, "asset store keys keep their asset");
    }

    #[test]
    fn test_export_rules() {
        let (store, _) = key_store(KeyStoreConfig::default());
        let exportable = KeyAttributes::new(KeyType::Aes, 128)
            .with_usage(KeyUsage::new().with_export(true).with_encrypt(true))
            .with_algorithm(Algorithm::Ctr);

        let id = store.import_key(&exportable, &[4; 16]).unwrap();
        let mut out = [0u8; 16];
        assert_eq!(store.export_key(id, &mut out[..15]), Err(KeyMgmtError::BufferTooSmall));
        assert_eq!(store.export_key(id, &mut out), Ok(16));
        assert_eq!(out, [4; 16]);
        assert!(!store.get_key(id).unwrap().in_use);

        let sealed = store
            .import_key(&exportable.with_usage(KeyUsage::new().with_encrypt(true)), &[4; 16])
            .unwrap();
        assert_eq!(store.export_key(sealed, &mut out), Err(KeyMgmtError::NotPermitted));

        let se = store
            .import_key(
                &exportable.with_lifetime(KeyPersistence::Volatile, KeyLocation::PrimarySecureElement),
                &[4; 16],
            )
            .unwrap();
        assert_eq!(store.export_key(se, &mut out), Err(KeyMgmtError::NotSupported));

        store.lock_key(id).unwrap();
        assert_eq!(store.export_key(id, &mut out), Err(KeyMgmtError::KeyInUse));
        store.unlock_key(id).unwrap();
    }

    #[test]
    fn test_export_public_of_generated_pair() {
        let (store, sim) = key_store(KeyStoreConfig {
            der_bypass: false,
            ..Default::default()
        });
        let attributes = KeyAttributes::new(KeyType::EccKeyPair(EccFamily::SecpR1), 256)
            .with_lifetime(KeyPersistence::Volatile, KeyLocation::PrimarySecureElement)
            .with_usage(KeyUsage::new().with_sign_hash(true))
            .with_algorithm(Algorithm::Ecdsa(HashSel::Any));
        let id = store.generate_key(&attributes).unwrap();

        let mut out = [0u8; 128];
        let len = store.export_public_key(id, &mut out).unwrap();
        assert_eq!(out[0], 0x30, "DER wrapped");
        assert!(len > 65);
        assert_eq!(sim.live_assets(), 0);

        assert_eq!(
            store.export_public_key(id, &mut out[..len - 1]),
            Err(KeyMgmtError::BufferTooSmall)
        );
        assert!(!store.get_key(id).unwrap().in_use);

        sim.inject_fault(SimFault::LoadImport);
        assert_eq!(
            store.export_public_key(id, &mut out),
            Err(KeyMgmtError::HardwareFailure)
        );
        assert!(!store.get_key(id).unwrap().in_use);
    }

    #[test]
    fn test_export_public_curve_rules() {
        let (store, _) = key_store(KeyStoreConfig::default());
        let edwards = KeyAttributes::new(KeyType::EccKeyPair(EccFamily::TwistedEdwards), 255)
            .with_lifetime(KeyPersistence::Volatile, KeyLocation::PrimarySecureElement)
            .with_usage(KeyUsage::new().with_sign_message(true))
            .with_algorithm(Algorithm::PureEdDsa);
        let id = store.generate_key(&edwards).unwrap();

        let mut out = [0u8; 64];
        assert_eq!(store.export_public_key(id, &mut out), Ok(32));

        let symmetric = store
            .import_key(
                &KeyAttributes::new(KeyType::Aes, 128)
                    .with_usage(KeyUsage::new().with_encrypt(true))
                    .with_algorithm(Algorithm::Ctr),
                &[1; 16],
            )
            .unwrap();
        assert_eq!(
            store.export_public_key(symmetric, &mut out),
            Err(KeyMgmtError::InvalidArgument)
        );
    }

    #[test]
    fn test_release_unknown_key() {
        let (store, sim) = key_store(KeyStoreConfig::default());
        let asset = sim.alloc(AssetPolicy::SYM_MAC_HASH, 32).unwrap();
        let loaded = LoadedKey::Asset {
            asset,
            direction: None,
            ephemeral: false,
        };
        assert_eq!(
            store.release_key(KEY_ID_VOLATILE_MIN, &loaded),
            Err(KeyMgmtError::InvalidHandle)
        );
    }
}
