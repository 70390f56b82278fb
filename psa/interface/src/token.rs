// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Public key token commands and curve domain descriptors.

use crate::AssetError;
use crate::AssetId;
use crate::AssetResult;

/// Curve family as known to the hardware.
///
/// The discriminant is the domain identifier stored in sub-vector headers
/// and curve descriptors.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
#[repr(u8)]
pub enum CurveFamily {
    /// NIST prime curves (secp-r1).
    NistP = 1,
    /// Brainpool r1 curves.
    Brainpool = 2,
    /// Curve25519 in Montgomery form.
    Montgomery = 3,
    /// Edwards25519.
    TwistedEdwards = 4,
}

impl CurveFamily {
    /// Number of components in a public key.
    pub const fn public_components(self) -> usize {
        match self {
            CurveFamily::NistP | CurveFamily::Brainpool => 2,
            CurveFamily::Montgomery | CurveFamily::TwistedEdwards => 1,
        }
    }

    /// Sub-vector domain/count byte of a private key.
    pub const fn private_items(self) -> u8 {
        match self {
            CurveFamily::NistP | CurveFamily::Montgomery => 0x01,
            CurveFamily::Brainpool | CurveFamily::TwistedEdwards => 0x11,
        }
    }

    /// Sub-vector domain/count byte of the first public key component.
    pub const fn public_items(self) -> u8 {
        match self {
            CurveFamily::NistP => 0x02,
            CurveFamily::Brainpool => 0x12,
            CurveFamily::Montgomery => 0x01,
            CurveFamily::TwistedEdwards => 0x11,
        }
    }

    /// Montgomery values are little-endian already and are never reversed.
    pub const fn is_little_endian(self) -> bool {
        matches!(self, CurveFamily::Montgomery)
    }
}

impl TryFrom<u8> for CurveFamily {
    type Error = AssetError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(CurveFamily::NistP),
            2 => Ok(CurveFamily::Brainpool),
            3 => Ok(CurveFamily::Montgomery),
            4 => Ok(CurveFamily::TwistedEdwards),
            _ => Err(AssetError::InvalidParameter),
        }
    }
}

/// Domain parameters loaded into a temporary parameters asset before a
/// public key token runs.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CurveDomain {
    /// Curve family.
    pub family: CurveFamily,
    /// Curve size in bits.
    pub bits: u16,
}

impl CurveDomain {
    /// Encoded size of a descriptor.
    pub const ENCODED_LEN: usize = 4;

    /// Encodes the descriptor as `[family, 0, bits_lo, bits_hi]`.
    pub fn to_bytes(self) -> [u8; Self::ENCODED_LEN] {
        let bits = self.bits.to_le_bytes();
        [self.family as u8, 0, bits[0], bits[1]]
    }

    /// Decodes a descriptor produced by [`CurveDomain::to_bytes`].
    pub fn from_bytes(data: &[u8]) -> AssetResult<Self> {
        let [family, _, lo, hi] = data else {
            return Err(AssetError::InvalidParameter);
        };

        Ok(Self {
            family: CurveFamily::try_from(*family)?,
            bits: u16::from_le_bytes([*lo, *hi]),
        })
    }
}

/// Public key token method.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PkMethod {
    /// ECDH/ECDSA on Weierstrass curves.
    EcdhEcdsa,
    /// X25519.
    Curve25519,
    /// Ed25519.
    EdDsa,
}

/// Public key token command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PkCommand {
    /// Generate a key pair into `private_key` and `public_key`.
    ///
    /// When `kek` is set the private key is also returned wrapped as
    /// [`PkResult::KeyBlob`].
    GenKeyPair {
        /// Token method.
        method: PkMethod,
        /// Curve size in bits.
        bits: u16,
        /// Domain parameters asset.
        domain: AssetId,
        /// Empty private key asset.
        private_key: AssetId,
        /// Empty public key asset.
        public_key: AssetId,
        /// Key encryption key for the private key blob.
        kek: Option<AssetId>,
    },

    /// Compute the public key of `private_key`.
    ///
    /// With `public_key` set the result lands in that asset and the token
    /// completes with [`PkResult::Complete`]; otherwise the public key is
    /// returned in sub-vector form as [`PkResult::PublicKey`].
    GenPublicKey {
        /// Token method.
        method: PkMethod,
        /// Curve size in bits.
        bits: u16,
        /// Domain parameters asset.
        domain: AssetId,
        /// Private key asset.
        private_key: AssetId,
        /// Optional empty public key asset.
        public_key: Option<AssetId>,
    },
}

/// Public key token result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PkResult {
    /// Token completed with no output data.
    Complete,
    /// Wrapped private key.
    KeyBlob(Vec<u8>),
    /// Public key in sub-vector form.
    PublicKey(Vec<u8>),
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn curve_domain_encoding() {
        for family in CurveFamily::iter() {
            let domain = CurveDomain { family, bits: 521 };
            assert_eq!(CurveDomain::from_bytes(&domain.to_bytes()), Ok(domain));
        }

        assert_eq!(
            CurveDomain::from_bytes(&[9, 0, 0, 1]),
            Err(AssetError::InvalidParameter)
        );
        assert_eq!(
            CurveDomain::from_bytes(&[1, 0, 0]),
            Err(AssetError::InvalidParameter)
        );
    }

    #[test]
    fn component_layout() {
        assert_eq!(CurveFamily::NistP.public_components(), 2);
        assert_eq!(CurveFamily::Montgomery.public_components(), 1);
        assert_eq!(CurveFamily::Brainpool.public_items() & 0x0F, 2);
        assert!(CurveFamily::Montgomery.is_little_endian());
        assert!(!CurveFamily::TwistedEdwards.is_little_endian());
    }
}
