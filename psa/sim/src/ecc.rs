// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Module for the simulated elliptic curve key pair operations.
//!
//! Values are exchanged in application byte order: big-endian scalars and
//! coordinates for Weierstrass curves, RFC 7748 / RFC 8032 encodings for the
//! 25519 curves.

use azihsm_psa_interface::AssetError;
use azihsm_psa_interface::AssetResult;
use azihsm_psa_interface::CurveFamily;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

/// A public key as one or two components.
pub(crate) type PublicComponents = Vec<Vec<u8>>;

fn unsupported(family: CurveFamily, bits: u16) -> AssetError {
    tracing::error!(%family, bits, "Curve not supported by the simulator");
    AssetError::Unsupported
}

fn x25519_prune(scalar: &mut [u8; 32]) {
    scalar[0] &= 0xF8;
    scalar[31] &= 0x7F;
    scalar[31] |= 0x40;
}

/// Generates a private key.
pub(crate) fn generate(family: CurveFamily, bits: u16) -> AssetResult<Zeroizing<Vec<u8>>> {
    let private = match (family, bits) {
        (CurveFamily::NistP, 256) => p256::SecretKey::random(&mut OsRng).to_bytes().to_vec(),
        (CurveFamily::NistP, 384) => p384::SecretKey::random(&mut OsRng).to_bytes().to_vec(),
        (CurveFamily::Montgomery, 255) => {
            let mut scalar = [0u8; 32];
            OsRng.fill_bytes(&mut scalar);
            x25519_prune(&mut scalar);
            scalar.to_vec()
        }
        (CurveFamily::TwistedEdwards, 255) => {
            let mut seed = [0u8; 32];
            OsRng.fill_bytes(&mut seed);
            seed.to_vec()
        }
        _ => Err(unsupported(family, bits))?,
    };

    Ok(Zeroizing::new(private))
}

/// Computes the public key of `private`.
///
/// # Errors
/// * `AssetError::InvalidParameter` - If `private` is not a valid key for the curve.
/// * `AssetError::Unsupported` - If the curve is not simulated.
pub(crate) fn public_key(
    family: CurveFamily,
    bits: u16,
    private: &[u8],
) -> AssetResult<PublicComponents> {
    match (family, bits) {
        (CurveFamily::NistP, 256) => {
            let secret =
                p256::SecretKey::from_slice(private).map_err(|_| AssetError::InvalidParameter)?;
            let point = secret.public_key().to_encoded_point(false);
            coordinates(point.x(), point.y())
        }
        (CurveFamily::NistP, 384) => {
            let secret =
                p384::SecretKey::from_slice(private).map_err(|_| AssetError::InvalidParameter)?;
            let point = secret.public_key().to_encoded_point(false);
            coordinates(point.x(), point.y())
        }
        (CurveFamily::Montgomery, 255) => {
            let scalar: [u8; 32] = private
                .try_into()
                .map_err(|_| AssetError::InvalidParameter)?;
            let secret = x25519_dalek::StaticSecret::from(scalar);
            Ok(vec![x25519_dalek::PublicKey::from(&secret).as_bytes().to_vec()])
        }
        (CurveFamily::TwistedEdwards, 255) => {
            let seed: [u8; 32] = private
                .try_into()
                .map_err(|_| AssetError::InvalidParameter)?;
            let signing = ed25519_dalek::SigningKey::from_bytes(&seed);
            Ok(vec![signing.verifying_key().to_bytes().to_vec()])
        }
        _ => Err(unsupported(family, bits)),
    }
}

fn coordinates<B: AsRef<[u8]>>(x: Option<&B>, y: Option<&B>) -> AssetResult<PublicComponents> {
    match (x, y) {
        (Some(x), Some(y)) => Ok(vec![x.as_ref().to_vec(), y.as_ref().to_vec()]),
        _ => Err(AssetError::InvalidParameter),
    }
}

#[cfg(test)]
mod tests {
    use test_with_tracing::test;

    use super::*;

    #[test]
    fn test_p256_public_key() {
        let private = generate(CurveFamily::NistP, 256).unwrap();
        let public = public_key(CurveFamily::NistP, 256, &private).unwrap();

        assert_eq!(public.len(), 2);
        assert_eq!(public[0].len(), 32);
        assert_eq!(public[1].len(), 32);
    }

    #[test]
    fn test_x25519_private_is_pruned() {
        let private = generate(CurveFamily::Montgomery, 255).unwrap();
        assert_eq!(private[0] & 0x07, 0);
        assert_eq!(private[31] & 0xC0, 0x40);

        let public = public_key(CurveFamily::Montgomery, 255, &private).unwrap();
        assert_eq!(public.len(), 1);
        assert_eq!(public[0].len(), 32);
    }

    #[test]
    fn test_ed25519_known_answer() {
        // RFC 8032 test 1
        let seed = [
            0x9d, 0x61, 0xb1, 0x9d, 0xef, 0xfd, 0x5a, 0x60, 0xba, 0x84, 0x4a, 0xf4, 0x92, 0xec,
            0x2c, 0xc4, 0x44, 0x49, 0xc5, 0x69, 0x7b, 0x32, 0x69, 0x19, 0x70, 0x3b, 0xac, 0x03,
            0x1c, 0xae, 0x7f, 0x60,
        ];
        let public = public_key(CurveFamily::TwistedEdwards, 255, &seed).unwrap();
        assert_eq!(public[0][..4], [0xd7, 0x5a, 0x98, 0x01]);
    }

    #[test]
    fn test_unsupported_curves() {
        assert_eq!(
            generate(CurveFamily::Brainpool, 256).unwrap_err(),
            AssetError::Unsupported
        );
        assert_eq!(
            public_key(CurveFamily::NistP, 521, &[1u8; 66]).unwrap_err(),
            AssetError::Unsupported
        );
        assert_eq!(
            public_key(CurveFamily::NistP, 256, &[0u8; 32]).unwrap_err(),
            AssetError::InvalidParameter
        );
    }
}
