// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Key attributes: identifier, type, size, lifetime and policy.

use bitfield_struct::bitfield;
use open_enum::open_enum;

use crate::algorithm::Algorithm;
use crate::algorithm::KeyType;
use crate::KeyMgmtError;
use crate::KeyMgmtResult;

/// Key identifier.
pub type KeyId = u32;

/// The null key identifier.
pub const KEY_ID_NULL: KeyId = 0;
/// Lowest identifier an application may assign.
pub const KEY_ID_USER_MIN: KeyId = 0x0000_0001;
/// Highest identifier an application may assign.
pub const KEY_ID_USER_MAX: KeyId = 0x3FFF_FFFF;
/// Trusted key derivation key, derived from the HUK.
pub const KEY_ID_TKDK: KeyId = 0x3FFF_FFFE;
/// Hardware Unique Key.
pub const KEY_ID_HUK: KeyId = 0x3FFF_FFFF;
/// Lowest volatile key identifier.
pub const KEY_ID_VOLATILE_MIN: KeyId = 0x7FFF_0000;
/// Highest volatile key identifier.
pub const KEY_ID_VOLATILE_MAX: KeyId = 0x7FFF_FFFF;

/// Returns `true` for identifiers of keys rooted in the hardware.
pub const fn is_hardware_root(id: KeyId) -> bool {
    id == KEY_ID_HUK || id == KEY_ID_TKDK
}

/// Key persistence.
#[open_enum]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum KeyPersistence {
    /// Key lives in memory only.
    Volatile = 0x00,

    /// Key is written to the backing store.
    Default = 0x01,

    /// Key lives in the hardware asset store.
    HsmAssetStore = 0x80,

    /// Key cannot be modified or destroyed.
    ReadOnly = 0xFF,
}

/// Key location.
#[open_enum]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum KeyLocation {
    /// Material is held by the engine.
    LocalStorage = 0x00_0000,

    /// Material is wrapped by, or held in, the secure element.
    PrimarySecureElement = 0x00_0001,
}

/// Key lifetime: persistence in the low byte, location above it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct KeyLifetime(u32);

impl KeyLifetime {
    /// Volatile key at the local location.
    pub const VOLATILE: Self = Self::new(KeyPersistence::Volatile, KeyLocation::LocalStorage);

    /// Persistent key at the local location.
    pub const PERSISTENT: Self = Self::new(KeyPersistence::Default, KeyLocation::LocalStorage);

    /// Builds a lifetime from its parts.
    pub const fn new(persistence: KeyPersistence, location: KeyLocation) -> Self {
        Self(persistence.0 as u32 | (location.0 << 8))
    }

    /// Creates a lifetime from its encoding.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the encoding.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Persistence part.
    pub const fn persistence(self) -> KeyPersistence {
        KeyPersistence((self.0 & 0xFF) as u8)
    }

    /// Location part.
    pub const fn location(self) -> KeyLocation {
        KeyLocation(self.0 >> 8)
    }

    /// Returns `true` for volatile keys.
    pub const fn is_volatile(self) -> bool {
        self.persistence().0 == KeyPersistence::Volatile.0
    }

    /// Returns `true` for keys held in the hardware asset store.
    pub const fn is_asset_store(self) -> bool {
        self.persistence().0 == KeyPersistence::HsmAssetStore.0
    }

    /// Returns `true` for keys written to the backing store.
    pub const fn is_backed(self) -> bool {
        !self.is_volatile() && !self.is_asset_store()
    }

    /// Returns `true` for keys at the secure element location.
    pub const fn is_secure_element(self) -> bool {
        self.location().0 == KeyLocation::PrimarySecureElement.0
    }
}

impl Default for KeyLifetime {
    fn default() -> Self {
        Self::VOLATILE
    }
}

/// Key usage flags.
#[bitfield(u32)]
#[derive(PartialEq, Eq, Hash)]
pub struct KeyUsage {
    /// Material may be exported.
    pub export: bool,

    /// Key may be copied.
    pub copy: bool,

    /// Persistent material may stay cached in memory.
    pub cache: bool,

    #[bits(5)]
    __: u8,

    /// Encrypt with a cipher or AEAD.
    pub encrypt: bool,

    /// Decrypt with a cipher or AEAD.
    pub decrypt: bool,

    /// Sign or compute a MAC over a message.
    pub sign_message: bool,

    /// Verify a message signature or MAC.
    pub verify_message: bool,

    /// Sign a hash.
    pub sign_hash: bool,

    /// Verify a hash signature.
    pub verify_hash: bool,

    /// Derive keys.
    pub derive: bool,

    /// Verify a derivation.
    pub verify_derivation: bool,

    #[bits(16)]
    __: u16,
}

impl KeyUsage {
    /// Returns `true` if every flag of `other` is set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.into_bits() & other.into_bits() == other.into_bits()
    }

    /// Returns `true` if no flag is set.
    pub const fn is_empty(self) -> bool {
        self.into_bits() == 0
    }

    /// Flags set in both `self` and `other`.
    pub const fn intersect(self, other: Self) -> Self {
        Self::from_bits(self.into_bits() & other.into_bits())
    }

    /// Flags set in `self` or `other`.
    pub const fn union(self, other: Self) -> Self {
        Self::from_bits(self.into_bits() | other.into_bits())
    }

    /// Returns `true` if any verify class flag is set.
    pub const fn is_verify(self) -> bool {
        self.verify_message() || self.verify_hash() || self.verify_derivation()
    }
}

/// Usage flags and permitted algorithms of a key.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub struct KeyPolicy {
    /// Usage flags.
    pub usage: KeyUsage,

    /// Primary permitted algorithm.
    pub alg: Option<Algorithm>,

    /// Secondary permitted algorithm.
    pub alg2: Option<Algorithm>,
}

impl KeyPolicy {
    /// Intersection of two policies.
    ///
    /// Usage flags are intersected and each algorithm is intersected with
    /// [`Algorithm::intersect`]. The operation is commutative.
    pub fn intersect(&self, other: &Self) -> Self {
        Self {
            usage: self.usage.intersect(other.usage),
            alg: Algorithm::intersect(self.alg, other.alg),
            alg2: Algorithm::intersect(self.alg2, other.alg2),
        }
    }

    /// Restricts `self` by `constraint`.
    ///
    /// # Errors
    /// * `KeyMgmtError::InvalidArgument` - If both policies name an algorithm
    ///   and the algorithms have no intersection.
    pub fn restrict(&self, constraint: &Self) -> KeyMgmtResult<Self> {
        let restricted = self.intersect(constraint);

        let incompatible = |a: Option<Algorithm>, b: Option<Algorithm>, both: Option<Algorithm>| {
            a.is_some() && b.is_some() && both.is_none()
        };
        if incompatible(self.alg, constraint.alg, restricted.alg)
            || incompatible(self.alg2, constraint.alg2, restricted.alg2)
        {
            tracing::error!(policy = ?self, ?constraint, "Incompatible key policies");
            Err(KeyMgmtError::InvalidArgument)?
        }

        Ok(restricted)
    }
}

/// Key attributes.
///
/// `bits == 0` lets import infer the size from the material.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub struct KeyAttributes {
    /// Key identifier. Must be [`KEY_ID_NULL`] for volatile keys on creation.
    pub id: KeyId,

    /// Key type.
    pub key_type: Option<KeyType>,

    /// Key size in bits.
    pub bits: usize,

    /// Key lifetime.
    pub lifetime: KeyLifetime,

    /// Key policy.
    pub policy: KeyPolicy,
}

impl KeyAttributes {
    /// Creates attributes for a key of `key_type` and `bits`.
    pub fn new(key_type: KeyType, bits: usize) -> Self {
        Self {
            key_type: Some(key_type),
            bits,
            ..Default::default()
        }
    }

    /// Sets the identifier.
    pub fn with_id(mut self, id: KeyId) -> Self {
        self.id = id;
        self
    }

    /// Sets the lifetime.
    pub fn with_lifetime(mut self, persistence: KeyPersistence, location: KeyLocation) -> Self {
        self.lifetime = KeyLifetime::new(persistence, location);
        self
    }

    /// Sets the usage flags.
    pub fn with_usage(mut self, usage: KeyUsage) -> Self {
        self.policy.usage = usage;
        self
    }

    /// Sets the primary algorithm.
    pub fn with_algorithm(mut self, alg: Algorithm) -> Self {
        self.policy.alg = Some(alg);
        self
    }

    /// Sets the secondary algorithm.
    pub fn with_algorithm2(mut self, alg: Algorithm) -> Self {
        self.policy.alg2 = Some(alg);
        self
    }

    /// Usage flags.
    pub fn usage(&self) -> KeyUsage {
        self.policy.usage
    }

    /// Primary algorithm.
    pub fn alg(&self) -> Option<Algorithm> {
        self.policy.alg
    }

    /// Returns the key type or fails for attributes without one.
    pub fn require_type(&self) -> KeyMgmtResult<KeyType> {
        self.key_type.ok_or_else(|| {
            tracing::error!(id = self.id, "Key type not set");
            KeyMgmtError::InvalidArgument
        })
    }

    /// Resets every field to its default.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use test_with_tracing::test;

    use super::*;
    use crate::algorithm::HashAlg;
    use crate::algorithm::HashSel;

    #[test]
    fn test_lifetime_encoding() {
        let lifetime =
            KeyLifetime::new(KeyPersistence::HsmAssetStore, KeyLocation::PrimarySecureElement);
        assert_eq!(lifetime.raw(), 0x0180);
        assert_eq!(lifetime.persistence(), KeyPersistence::HsmAssetStore);
        assert_eq!(lifetime.location(), KeyLocation::PrimarySecureElement);
        assert!(lifetime.is_asset_store());
        assert!(!lifetime.is_backed());

        let custom = KeyLifetime::from_raw(0x0005);
        assert!(custom.is_backed());
        assert!(!custom.is_secure_element());
        assert!(KeyLifetime::default().is_volatile());
    }

    #[test]
    fn test_usage_layout() {
        let usage = KeyUsage::new()
            .with_export(true)
            .with_encrypt(true)
            .with_verify_derivation(true);
        assert_eq!(usage.into_bits(), 0x0000_8101);
        assert!(usage.contains(KeyUsage::new().with_encrypt(true)));
        assert!(!usage.contains(KeyUsage::new().with_decrypt(true)));
        assert!(usage.is_verify());
    }

    #[test]
    fn test_policy_intersect_commutes() {
        let usages = [
            KeyUsage::new().with_copy(true).with_sign_hash(true),
            KeyUsage::new().with_sign_hash(true).with_verify_hash(true),
            KeyUsage::new(),
        ];
        let algs = [
            None,
            Some(Algorithm::Ecdsa(HashSel::Any)),
            Some(Algorithm::Ecdsa(HashSel::Specific(HashAlg::Sha384))),
            Some(Algorithm::Ecdh),
        ];

        for usage_a in usages {
            for usage_b in usages {
                for alg_a in algs {
                    for alg_b in algs {
                        let a = KeyPolicy {
                            usage: usage_a,
                            alg: alg_a,
                            alg2: None,
                        };
                        let b = KeyPolicy {
                            usage: usage_b,
                            alg: alg_b,
                            alg2: alg_a,
                        };
                        assert_eq!(a.intersect(&b), b.intersect(&a));
                    }
                }
            }
        }
    }

    #[test]
    fn test_policy_restrict() {
        let source = KeyPolicy {
            usage: KeyUsage::new().with_copy(true).with_sign_hash(true),
            alg: Some(Algorithm::Ecdsa(HashSel::Any)),
            alg2: None,
        };
        let wanted = KeyPolicy {
            usage: KeyUsage::new().with_sign_hash(true).with_export(true),
            alg: Some(Algorithm::Ecdsa(HashSel::Specific(HashAlg::Sha256))),
            alg2: None,
        };

        let restricted = source.restrict(&wanted).unwrap();
        assert_eq!(restricted.usage, KeyUsage::new().with_sign_hash(true));
        assert_eq!(restricted.alg, wanted.alg);

        let incompatible = KeyPolicy {
            alg: Some(Algorithm::Ecdh),
            ..wanted
        };
        assert_eq!(
            source.restrict(&incompatible).unwrap_err(),
            KeyMgmtError::InvalidArgument
        );
    }

    #[test]
    fn test_reset() {
        let mut attrs = KeyAttributes::new(KeyType::Aes, 128)
            .with_id(5)
            .with_algorithm(Algorithm::Gcm);
        attrs.reset();
        assert_eq!(attrs, KeyAttributes::default());
        assert_eq!(attrs.require_type(), Err(KeyMgmtError::InvalidArgument));
    }
}
