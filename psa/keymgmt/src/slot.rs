// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Key slot entries.

use azihsm_psa_interface::AssetId;
use azihsm_psa_interface::AssetPolicy;
use zeroize::Zeroizing;

use crate::algorithm::KeyType;
use crate::attributes::KeyAttributes;
use crate::attributes::KeyId;
use crate::attributes::KeyUsage;
use crate::attributes::KEY_ID_NULL;
use crate::KeyMgmtError;
use crate::KeyMgmtResult;

/// Direction of a bidirectional key.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
pub enum Direction {
    /// Encrypt, generate a MAC.
    EncGen,
    /// Decrypt, verify a MAC.
    DecVrfy,
}

impl Direction {
    /// Both directions, in part order.
    pub const ALL: [Direction; 2] = [Direction::EncGen, Direction::DecVrfy];

    /// Index of the direction in the per-direction arrays of a slot.
    pub const fn index(self) -> usize {
        match self {
            Direction::EncGen => 0,
            Direction::DecVrfy => 1,
        }
    }

    /// Asset policy of the direction, from the encrypt/generate policy.
    pub fn policy(self, enc_gen: AssetPolicy) -> AssetPolicy {
        match self {
            Direction::EncGen => enc_gen,
            Direction::DecVrfy => enc_gen ^ AssetPolicy::DIR_MASK,
        }
    }

    /// Direction selected by the usage of a load request.
    ///
    /// # Errors
    /// * `KeyMgmtError::InvalidArgument` - If the usage selects both or neither direction.
    pub fn for_usage(usage: KeyUsage) -> KeyMgmtResult<Self> {
        let forward = usage.encrypt() || usage.sign_message();
        let backward = usage.decrypt() || usage.verify_message();
        match (forward, backward) {
            (true, false) => Ok(Direction::EncGen),
            (false, true) => Ok(Direction::DecVrfy),
            _ => {
                tracing::error!(?usage, "Usage does not select a single direction");
                Err(KeyMgmtError::InvalidArgument)
            }
        }
    }
}

/// Form the material of a slot takes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, strum::Display)]
pub(crate) enum Representation {
    /// Plaintext, hardware layout for asymmetric keys.
    Plaintext,
    /// Blob wrapped under the key blob KEK.
    Wrapped,
    /// Asset held by the hardware asset store.
    Asset,
}

/// Allocated key slot.
#[derive(Debug, Default)]
pub(crate) struct KeySlot {
    pub(crate) attributes: KeyAttributes,
    pub(crate) in_use: bool,
    pub(crate) material: [Option<Zeroizing<Vec<u8>>>; 2],
    pub(crate) assets: [Option<AssetId>; 2],
    pub(crate) key_size: usize,
    pub(crate) policy: AssetPolicy,
    pub(crate) bidirectional: bool,
    pub(crate) modulus_bits: usize,
    pub(crate) exponent_bits: usize,
    pub(crate) source_key_id: KeyId,
}

impl KeySlot {
    pub(crate) fn id(&self) -> KeyId {
        self.attributes.id
    }

    pub(crate) fn key_type(&self) -> KeyMgmtResult<KeyType> {
        self.attributes.key_type.ok_or_else(|| {
            tracing::error!(id = self.id(), "Allocated slot without a key type");
            KeyMgmtError::CorruptionDetected
        })
    }

    pub(crate) fn representation(&self) -> Representation {
        let lifetime = self.attributes.lifetime;
        let public = self
            .attributes
            .key_type
            .is_some_and(|key_type| key_type.is_public_key());

        if public || !lifetime.is_secure_element() {
            Representation::Plaintext
        } else if lifetime.is_asset_store() {
            Representation::Asset
        } else {
            Representation::Wrapped
        }
    }

    /// Number of material parts: two for bidirectional keys held wrapped or
    /// as assets, one otherwise.
    pub(crate) fn parts(&self) -> usize {
        if self.bidirectional && self.representation() != Representation::Plaintext {
            2
        } else {
            1
        }
    }

    /// Part index used for `direction`.
    pub(crate) fn part(&self, direction: Option<Direction>) -> usize {
        match direction {
            Some(direction) if self.parts() == 2 => direction.index(),
            _ => 0,
        }
    }

    /// Asset policy of material part `part`.
    pub(crate) fn part_policy(&self, part: usize) -> AssetPolicy {
        if self.parts() == 2 {
            Direction::ALL[part].policy(self.policy)
        } else {
            self.policy
        }
    }

    /// Asset policy of a key loaded for `direction`.
    ///
    /// Bidirectional keys held in a single part pick the policy of the
    /// direction at load time.
    pub(crate) fn direction_policy(&self, direction: Option<Direction>) -> AssetPolicy {
        match direction {
            Some(direction) if self.bidirectional => direction.policy(self.policy),
            _ => self.policy,
        }
    }

    /// Returns `true` if the slot owns a hardware asset.
    pub(crate) fn holds_assets(&self) -> bool {
        self.assets.iter().any(Option::is_some)
    }

    /// Returns `true` if the key was copied from another key.
    pub(crate) fn is_copy(&self) -> bool {
        self.source_key_id != KEY_ID_NULL
    }

    /// Drops the cached material.
    pub(crate) fn forget_material(&mut self) {
        self.material = [None, None];
    }

    /// Takes every asset out of the slot.
    pub(crate) fn take_assets(&mut self) -> Vec<AssetId> {
        self.assets.iter_mut().filter_map(Option::take).collect()
    }
}

#[cfg(test)]
mod tests {
    use test_with_tracing::test;

    use super::*;
    use crate::attributes::KeyLocation;
    use crate::attributes::KeyPersistence;

    #[test]
    fn test_direction_for_usage() {
        assert_eq!(
            Direction::for_usage(KeyUsage::new().with_encrypt(true)),
            Ok(Direction::EncGen)
        );
        assert_eq!(
            Direction::for_usage(KeyUsage::new().with_verify_message(true)),
            Ok(Direction::DecVrfy)
        );
        assert_eq!(
            Direction::for_usage(KeyUsage::new()),
            Err(KeyMgmtError::InvalidArgument)
        );
        assert_eq!(
            Direction::for_usage(KeyUsage::new().with_encrypt(true).with_decrypt(true)),
            Err(KeyMgmtError::InvalidArgument)
        );
    }

    #[test]
    fn test_direction_policy() {
        let enc = AssetPolicy::SYM_CIPHER_AUTH | AssetPolicy::DIR_ENC_GEN;
        assert_eq!(Direction::EncGen.policy(enc), enc);
        assert_eq!(Direction::DecVrfy.policy(enc), enc ^ AssetPolicy::DIR_MASK);
    }

    #[test]
    fn test_representation() {
        let mut slot = KeySlot {
            attributes: KeyAttributes::new(KeyType::Aes, 128)
                .with_lifetime(KeyPersistence::Volatile, KeyLocation::PrimarySecureElement),
            policy: AssetPolicy::SYM_CIPHER_AUTH | AssetPolicy::DIR_ENC_GEN,
            bidirectional: true,
            ..Default::default()
        };
        assert_eq!(slot.representation(), Representation::Wrapped);
        assert_eq!(slot.parts(), 2);
        assert_eq!(slot.part(Some(Direction::DecVrfy)), 1);
        assert_eq!(slot.part_policy(1), slot.policy ^ AssetPolicy::DIR_MASK);
        assert!(!slot.holds_assets());

        slot.attributes = slot
            .attributes
            .with_lifetime(KeyPersistence::Volatile, KeyLocation::LocalStorage);
        assert_eq!(slot.representation(), Representation::Plaintext);
        assert_eq!(slot.part(Some(Direction::DecVrfy)), 0);
        assert_eq!(slot.part_policy(0), slot.policy);
        assert_eq!(
            slot.direction_policy(Some(Direction::DecVrfy)),
            Direction::DecVrfy.policy(slot.policy)
        );

        slot.attributes = slot
            .attributes
            .with_lifetime(KeyPersistence::HsmAssetStore, KeyLocation::PrimarySecureElement);
        assert_eq!(slot.representation(), Representation::Asset);
        slot.assets[1] = AssetId::from_raw(9);
        assert!(slot.holds_assets());
        assert_eq!(slot.take_assets(), AssetId::from_raw(9).into_iter().collect::<Vec<_>>());
        assert!(!slot.holds_assets());
    }
}
