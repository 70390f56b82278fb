// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Asset policy bits understood by the asset store.
//!
//! A policy is a 64-bit mask. The low bits describe the asset in general
//! (modifiable, secure source, private data); bits 13-14 select the crypto
//! domain; the remaining bits are interpreted per domain (symmetric use,
//! direction, primitive and mode, or asymmetric use, algorithm and hash).

use std::ops::BitAnd;
use std::ops::BitOr;
use std::ops::BitOrAssign;
use std::ops::BitXor;
use std::ops::Not;

/// Bitmask describing what an asset is and what it may be used for.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub struct AssetPolicy(u64);

impl AssetPolicy {
    /// Creates a policy from raw bits.
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Returns the raw bits.
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// The empty policy. Never valid for an asset.
    pub const NONE: Self = Self(0);

    /// Asset cannot be modified after load.
    pub const NON_MODIFIABLE: Self = Self(0x0000_0000_0000_0001);
    /// Asset content was supplied from the non-secure world.
    pub const SOURCE_NON_SECURE: Self = Self(0x0000_0000_0000_0100);
    /// Key operation crosses the domain.
    pub const CROSS_DOMAIN: Self = Self(0x0000_0000_0000_0200);
    /// Asset carries no domain information.
    pub const NO_DOMAIN: Self = Self(0x0000_0000_0000_0400);
    /// Asset holds public data.
    pub const PUBLIC_DATA: Self = Self(0);
    /// Asset holds private data.
    pub const PRIVATE_DATA: Self = Self(0x0000_0000_0000_0800);
    /// Asset is FIPS approved.
    pub const FIPS_APPROVED: Self = Self(0x0000_0000_0000_1000);
    /// Asset content may be exported wrapped.
    pub const EXPORTABLE: Self = Self(0x0000_0000_0000_0004);
    /// Asset content is updatable.
    pub const TEMPORARY: Self = Self(0x0000_0000_0000_0002);

    /// Symmetric crypto domain.
    pub const SYM_CRYPTO: Self = Self(0x0000_0000_0000_2000);
    /// Asymmetric crypto domain.
    pub const ASYM_CRYPTO: Self = Self(0x0000_0000_0000_4000);
    /// Mask selecting the crypto domain.
    pub const DOMAIN_MASK: Self = Self(0x0000_0000_0000_6000);

    /// Symmetric use: hash.
    pub const SCUI_HASH: Self = Self(0x0000_0000_0000_0000);
    /// Symmetric use: hash based MAC.
    pub const SCUI_MAC_HASH: Self = Self(0x0000_0000_0001_0000);
    /// Symmetric use: cipher based MAC.
    pub const SCUI_MAC_CIPHER: Self = Self(0x0000_0000_0002_0000);
    /// Symmetric use: bulk cipher.
    pub const SCUI_CIPHER_BULK: Self = Self(0x0000_0000_0003_0000);
    /// Symmetric use: authenticated cipher.
    pub const SCUI_CIPHER_AUTH: Self = Self(0x0000_0000_0004_0000);
    /// Symmetric use: key wrap.
    pub const SCUI_WRAP: Self = Self(0x0000_0000_0005_0000);
    /// Symmetric use: key derivation.
    pub const SCUI_DERIVE: Self = Self(0x0000_0000_0006_0000);
    /// Mask selecting the symmetric use.
    pub const SCUI_MASK: Self = Self(0x0000_0000_000F_0000);

    /// Direction: encrypt, generate or wrap.
    pub const DIR_ENC_GEN: Self = Self(0x0000_0000_0010_0000);
    /// Direction: decrypt, verify or unwrap.
    pub const DIR_DEC_VRFY: Self = Self(0x0000_0000_0020_0000);
    /// Mask covering both direction bits.
    pub const DIR_MASK: Self = Self(0x0000_0000_0030_0000);

    /// Symmetric hash SHA-1.
    pub const SCAH_SHA1: Self = Self(0x0000_0000_0040_0000);
    /// Symmetric hash SHA-224.
    pub const SCAH_SHA224: Self = Self(0x0000_0000_0100_0000);
    /// Symmetric hash SHA-256.
    pub const SCAH_SHA256: Self = Self(0x0000_0000_0140_0000);
    /// Symmetric hash SHA-384.
    pub const SCAH_SHA384: Self = Self(0x0000_0000_0180_0000);
    /// Symmetric hash SHA-512.
    pub const SCAH_SHA512: Self = Self(0x0000_0000_01C0_0000);
    /// Symmetric hash SHA3-224.
    pub const SCAH_SHA3_224: Self = Self(0x0000_0000_0200_0000);
    /// Symmetric hash SHA3-256.
    pub const SCAH_SHA3_256: Self = Self(0x0000_0000_0240_0000);
    /// Symmetric hash SHA3-384.
    pub const SCAH_SHA3_384: Self = Self(0x0000_0000_0280_0000);
    /// Symmetric hash SHA3-512.
    pub const SCAH_SHA3_512: Self = Self(0x0000_0000_02C0_0000);

    /// Symmetric cipher AES.
    pub const SCAC_AES: Self = Self(0x0000_0000_0000_0000);
    /// Symmetric cipher triple DES.
    pub const SCAC_TDES: Self = Self(0x0000_0000_0040_0000);
    /// Symmetric cipher ChaCha20.
    pub const SCAC_CHACHA20: Self = Self(0x0000_0000_0080_0000);
    /// Symmetric cipher ARIA.
    pub const SCAC_ARIA: Self = Self(0x0000_0000_0100_0000);

    /// Trusted key derivation key.
    pub const SCAD_TRUSTED: Self = Self(0x0000_0000_0000_0000);
    /// Normal key derivation key, CMAC based.
    pub const SCAD_NORMAL_CMAC: Self = Self(0x0000_0000_0020_0000);
    /// Normal key derivation key, HMAC based.
    pub const SCAD_NORMAL_HMAC: Self = Self(0x0000_0000_0030_0000);

    /// Bulk mode ECB.
    pub const SCMCB_ECB: Self = Self(0x0000_0000_0000_0000);
    /// Bulk mode CBC.
    pub const SCMCB_CBC: Self = Self(0x0000_0000_0800_0000);
    /// Bulk mode CTR with a 32-bit counter.
    pub const SCMCB_CTR32: Self = Self(0x0000_0000_1800_0000);
    /// Bulk mode XTS.
    pub const SCMCB_XTS: Self = Self(0x0000_0000_3000_0000);
    /// Authenticated mode CCM (also ChaCha20-Poly1305).
    pub const SCMCA_CCM: Self = Self(0x0000_0000_0000_0000);
    /// Authenticated mode GCM.
    pub const SCMCA_GCM: Self = Self(0x0000_0000_0800_0000);
    /// MAC mode CMAC.
    pub const SCMCM_CMAC: Self = Self(0x0000_0000_0000_0000);
    /// MAC mode CBC-MAC.
    pub const SCMCM_CBCMAC: Self = Self(0x0000_0000_0800_0000);

    /// Asymmetric use: sign and verify.
    pub const ACUI_SIGN_VERIFY: Self = Self(0x0000_0000_0000_0000);
    /// Asymmetric use: key exchange.
    pub const ACUI_KEY_EXCHANGE: Self = Self(0x0000_0000_0001_0000);
    /// Asymmetric use: decrypt and encrypt.
    pub const ACUI_DEC_ENC: Self = Self(0x0000_0000_0002_0000);
    /// Asymmetric use: domain parameters.
    pub const ACUI_PARAMETERS: Self = Self(0x0000_0000_000F_0000);

    /// ECDH based key.
    pub const ACA_ECDH: Self = Self(0x0000_0000_0020_0000);
    /// ECDSA based key.
    pub const ACA_ECDSA: Self = Self(0x0000_0000_0030_0000);
    /// Curve25519 based key.
    pub const ACA_CURVE25519: Self = Self(0x0000_0000_0040_0000);
    /// EdDSA based key.
    pub const ACA_EDDSA: Self = Self(0x0000_0000_0050_0000);
    /// RSA PKCS#1 v1.5 based key.
    pub const ACA_RSA_PKCS1V15: Self = Self(0x0000_0000_0080_0000);
    /// RSA-PSS based key.
    pub const ACA_RSA_PSS: Self = Self(0x0000_0000_0090_0000);
    /// RSA-OAEP based key.
    pub const ACA_RSA_OAEP: Self = Self(0x0000_0000_00A0_0000);

    /// Differential power analysis protection disabled.
    pub const AC_NDPA: Self = Self(0x0000_0000_0200_0000);
    /// Data may be stored in a public or exportable asset.
    pub const STANY: Self = Self(0x0000_0000_0400_0000);

    /// Asymmetric hash SHA-1.
    pub const ACH_SHA1: Self = Self(0x0000_0000_0800_0000);
    /// Asymmetric hash SHA-224.
    pub const ACH_SHA224: Self = Self(0x0000_0000_2000_0000);
    /// Asymmetric hash SHA-256.
    pub const ACH_SHA256: Self = Self(0x0000_0000_2800_0000);
    /// Asymmetric hash SHA-384.
    pub const ACH_SHA384: Self = Self(0x0000_0000_3000_0000);
    /// Asymmetric hash SHA-512.
    pub const ACH_SHA512: Self = Self(0x0000_0000_3800_0000);

    /// Base of every symmetric key policy.
    pub const SYM_BASE: Self =
        Self(Self::NON_MODIFIABLE.0 | Self::PRIVATE_DATA.0 | Self::SYM_CRYPTO.0);
    /// Symmetric hash based MAC key.
    pub const SYM_MAC_HASH: Self = Self(Self::SYM_BASE.0 | Self::SCUI_MAC_HASH.0);
    /// Symmetric cipher based MAC key.
    pub const SYM_MAC_CIPHER: Self = Self(Self::SYM_BASE.0 | Self::SCUI_MAC_CIPHER.0);
    /// Symmetric bulk cipher key.
    pub const SYM_CIPHER_BULK: Self = Self(Self::SYM_BASE.0 | Self::SCUI_CIPHER_BULK.0);
    /// Symmetric authenticated cipher key.
    pub const SYM_CIPHER_AUTH: Self = Self(Self::SYM_BASE.0 | Self::SCUI_CIPHER_AUTH.0);
    /// Symmetric key derivation key.
    pub const SYM_DERIVE: Self = Self(Self::SYM_BASE.0 | Self::SCUI_DERIVE.0);

    /// Base of every asymmetric key policy.
    pub const ASYM_BASE: Self = Self(Self::NON_MODIFIABLE.0 | Self::ASYM_CRYPTO.0);
    /// Asymmetric sign/verify key.
    pub const ASYM_SIGN_VERIFY: Self = Self(Self::ASYM_BASE.0 | Self::ACUI_SIGN_VERIFY.0);
    /// Asymmetric key exchange key.
    pub const ASYM_KEY_EXCHANGE: Self = Self(Self::ASYM_BASE.0 | Self::ACUI_KEY_EXCHANGE.0);
    /// Asymmetric decrypt/encrypt key.
    pub const ASYM_DEC_ENC: Self = Self(Self::ASYM_BASE.0 | Self::ACUI_DEC_ENC.0);
    /// Asymmetric domain parameters.
    pub const ASYM_KEY_PARAMS: Self =
        Self(Self::ASYM_BASE.0 | Self::NO_DOMAIN.0 | Self::ACUI_PARAMETERS.0);

    /// Returns `true` if every bit of `other` is set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns `true` if no bit is set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns `true` for symmetric crypto policies.
    pub const fn is_symmetric(self) -> bool {
        self.0 & Self::DOMAIN_MASK.0 == Self::SYM_CRYPTO.0
    }

    /// Returns `true` for asymmetric crypto policies.
    pub const fn is_asymmetric(self) -> bool {
        self.0 & Self::DOMAIN_MASK.0 == Self::ASYM_CRYPTO.0
    }

    /// Returns `true` if the asset holds private data.
    pub const fn is_private(self) -> bool {
        self.0 & Self::PRIVATE_DATA.0 != 0
    }

    /// Returns the policy with the bits of `other` cleared.
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Returns the public counterpart of a private asymmetric policy.
    ///
    /// Private-only bits are cleared and the public data marker is set.
    pub const fn to_public(self) -> Self {
        Self(
            self.without(Self(Self::PRIVATE_DATA.0 | Self::AC_NDPA.0 | Self::STANY.0))
                .0
                | Self::PUBLIC_DATA.0,
        )
    }
}

impl BitOr for AssetPolicy {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for AssetPolicy {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for AssetPolicy {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl BitXor for AssetPolicy {
    type Output = Self;

    fn bitxor(self, rhs: Self) -> Self {
        Self(self.0 ^ rhs.0)
    }
}

impl Not for AssetPolicy {
    type Output = Self;

    fn not(self) -> Self {
        Self(!self.0)
    }
}

impl std::fmt::Display for AssetPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_xor_swaps_direction() {
        let encrypt = AssetPolicy::SYM_CIPHER_AUTH | AssetPolicy::DIR_ENC_GEN;
        let decrypt = encrypt ^ AssetPolicy::DIR_MASK;

        assert!(decrypt.contains(AssetPolicy::DIR_DEC_VRFY));
        assert!(!decrypt.contains(AssetPolicy::DIR_ENC_GEN));
        assert_eq!(decrypt ^ AssetPolicy::DIR_MASK, encrypt);
    }

    #[test]
    fn to_public_clears_private_bits() {
        let private = AssetPolicy::ASYM_SIGN_VERIFY
            | AssetPolicy::ACA_ECDSA
            | AssetPolicy::PRIVATE_DATA
            | AssetPolicy::AC_NDPA;
        let public = private.to_public();

        assert!(!public.is_private());
        assert!(!public.contains(AssetPolicy::AC_NDPA));
        assert!(public.contains(AssetPolicy::ACA_ECDSA));
        assert!(public.is_asymmetric());
    }

    #[test]
    fn domain_predicates() {
        assert!(AssetPolicy::SYM_DERIVE.is_symmetric());
        assert!(!AssetPolicy::SYM_DERIVE.is_asymmetric());
        assert!(AssetPolicy::ASYM_KEY_PARAMS.is_asymmetric());
        assert!(AssetPolicy::NONE.is_empty());
    }
}
