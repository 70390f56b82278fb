// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Conversion of asymmetric key material between the application formats
//! and the hardware sub-vector layout.
//!
//! Application formats:
//!
//! | Key                  | Format                                        |
//! |----------------------|-----------------------------------------------|
//! | RSA key pair         | PKCS#1 `RSAPrivateKey` DER                    |
//! | RSA public key       | PKCS#1 `RSAPublicKey` DER                     |
//! | Weierstrass private  | big-endian scalar                             |
//! | Weierstrass public   | `0x04 ‖ X ‖ Y`, or a SubjectPublicKeyInfo DER  |
//! | Curve25519 private   | RFC 7748 / RFC 8032 32-byte string            |
//! | Curve25519 public    | RFC 7748 / RFC 8032 32-byte string, or DER    |
//!
//! The hardware holds every value as a sub-vector: a header followed by the
//! value in little-endian order, padded to a word boundary.

use azihsm_psa_interface::bits_to_bytes;
use azihsm_psa_interface::subvector_size;
use azihsm_psa_interface::subvector_value;
use azihsm_psa_interface::SubVectorHeader;
use azihsm_psa_interface::SUBVECTOR_HEADER_LEN;
use pkcs1::der::Decode;
use pkcs1::der::Encode;
use zeroize::Zeroizing;

use crate::algorithm::EccFamily;
use crate::algorithm::KeyType;
use crate::der::ec_public_from_spki;
use crate::der::ec_public_to_spki;
use crate::KeyMgmtError;
use crate::KeyMgmtResult;

/// Uncompressed point marker of two-component public keys.
pub const UNCOMPRESSED_POINT: u8 = 0x04;

const RSA_ITEMS: u8 = 0x02;
const DER_SEQUENCE: u8 = 0x30;

/// Key material in hardware layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMaterial {
    /// Sub-vectors.
    pub vector: Zeroizing<Vec<u8>>,

    /// Key size in bits.
    pub bits: usize,

    /// Size of the first component in bits.
    pub modulus_bits: usize,

    /// Size of the second component in bits.
    pub exponent_bits: usize,
}

/// Writes one sub-vector to the start of `out`.
///
/// Big-endian values are reversed; little-endian ones are copied as is.
///
/// # Returns
/// * The number of bytes written.
///
/// # Errors
/// * `KeyMgmtError::InvalidArgument` - If `value` does not fit in `header.bits`.
/// * `KeyMgmtError::BufferTooSmall` - If `out` cannot hold the sub-vector.
pub fn write_subvector(
    out: &mut [u8],
    header: SubVectorHeader,
    value: &[u8],
    little_endian: bool,
) -> KeyMgmtResult<usize> {
    let bits = header.bits as usize;
    if value.is_empty() || value.len() > bits_to_bytes(bits) {
        tracing::error!(len = value.len(), bits, "Value does not fit the sub-vector");
        Err(KeyMgmtError::InvalidArgument)?
    }

    let size = subvector_size(bits);
    let Some(out) = out.get_mut(..size) else {
        tracing::error!(size, available = out.len(), "Sub-vector output too small");
        return Err(KeyMgmtError::BufferTooSmall);
    };

    let (head, body) = out.split_at_mut(SUBVECTOR_HEADER_LEN);
    head.copy_from_slice(&header.to_bytes());
    body.fill(0);
    if little_endian {
        body[..value.len()].copy_from_slice(value);
    } else {
        for (dst, src) in body.iter_mut().zip(value.iter().rev()) {
            *dst = *src;
        }
    }

    Ok(size)
}

/// Reads one sub-vector and returns the value in application byte order and
/// the number of bytes consumed.
fn read_subvector(data: &[u8], little_endian: bool) -> KeyMgmtResult<(SubVectorHeader, Vec<u8>, usize)> {
    let (header, value) = subvector_value(data).map_err(|err| {
        tracing::error!(?err, "Malformed sub-vector");
        KeyMgmtError::InvalidArgument
    })?;

    let value = if little_endian {
        value.to_vec()
    } else {
        value.iter().rev().copied().collect()
    };
    Ok((header, value, subvector_size(header.bits as usize)))
}

/// Clamps a Curve25519 scalar held in little-endian order.
///
/// Clears the three low bits of the first byte, clears the top bit and sets
/// bit 6 of the last byte. The operation is idempotent.
pub fn prune_x25519(scalar: &mut [u8]) {
    if let [first, .., last] = scalar {
        *first &= 0xF8;
        *last &= 0x7F;
        *last |= 0x40;
    }
}

/// Curve size implied by the length of a private key or coordinate.
fn ecc_bits_from_len(family: EccFamily, len: usize) -> KeyMgmtResult<usize> {
    let bits = match (family, len) {
        (EccFamily::Montgomery | EccFamily::TwistedEdwards, 32) => 255,
        (EccFamily::SecpR1, 66) => 521,
        (_, len) => len * 8,
    };

    if !family.supports_bits(bits) {
        tracing::error!(%family, len, "No curve matches the key length");
        Err(KeyMgmtError::InvalidArgument)?
    }
    Ok(bits)
}

fn resolve_bits(requested: usize, actual: usize) -> KeyMgmtResult<usize> {
    if requested != 0 && requested != actual {
        tracing::error!(requested, actual, "Key size does not match the material");
        Err(KeyMgmtError::InvalidArgument)?
    }
    Ok(actual)
}

/// Size in bytes of an ECC public key in hardware layout.
pub fn ecc_public_size(family: EccFamily, bits: usize) -> usize {
    subvector_size(bits) * family.curve().public_components()
}

/// Size in bytes of an ECC private key in hardware layout.
pub fn ecc_private_size(bits: usize) -> usize {
    subvector_size(bits)
}

/// Converts an ECC private key to hardware layout.
///
/// Curve25519 scalars are pruned after conversion.
pub fn ecc_private_to_device(
    family: EccFamily,
    bits: usize,
    data: &[u8],
) -> KeyMgmtResult<DeviceMaterial> {
    let bits = resolve_bits(bits, ecc_bits_from_len(family, data.len())?)?;
    if data.len() != bits_to_bytes(bits) {
        tracing::error!(%family, bits, len = data.len(), "Private key length mismatch");
        Err(KeyMgmtError::InvalidArgument)?
    }

    let curve = family.curve();
    let header = SubVectorHeader {
        bits: bits as u16,
        index: 0,
        items: curve.private_items(),
    };
    let mut vector = Zeroizing::new(vec![0u8; ecc_private_size(bits)]);
    write_subvector(&mut vector, header, data, curve.is_little_endian())?;

    if family == EccFamily::Montgomery {
        let value = SUBVECTOR_HEADER_LEN..SUBVECTOR_HEADER_LEN + data.len();
        prune_x25519(&mut vector[value]);
    }

    Ok(DeviceMaterial {
        vector,
        bits,
        modulus_bits: bits,
        exponent_bits: bits,
    })
}

/// Converts an ECC public key in raw application format to hardware layout.
pub fn ecc_public_to_device(
    family: EccFamily,
    bits: usize,
    data: &[u8],
) -> KeyMgmtResult<DeviceMaterial> {
    let curve = family.curve();
    let components: Vec<&[u8]> = if curve.public_components() == 2 {
        match data.split_first() {
            Some((&UNCOMPRESSED_POINT, coords)) if !coords.is_empty() && coords.len() % 2 == 0 => {
                let (x, y) = coords.split_at(coords.len() / 2);
                vec![x, y]
            }
            _ => {
                tracing::error!(%family, len = data.len(), "Not an uncompressed point");
                Err(KeyMgmtError::InvalidArgument)?
            }
        }
    } else {
        vec![data]
    };

    let bits = resolve_bits(bits, ecc_bits_from_len(family, components[0].len())?)?;
    if components[0].len() != bits_to_bytes(bits) {
        tracing::error!(%family, bits, len = data.len(), "Public key length mismatch");
        Err(KeyMgmtError::InvalidArgument)?
    }

    let mut vector = Zeroizing::new(vec![0u8; ecc_public_size(family, bits)]);
    let mut offset = 0;
    for (index, component) in components.iter().enumerate() {
        let items = if index == 0 {
            curve.public_items()
        } else {
            curve.public_items() & 0x0F
        };
        let header = SubVectorHeader {
            bits: bits as u16,
            index: index as u8,
            items,
        };
        offset += write_subvector(
            &mut vector[offset..],
            header,
            component,
            curve.is_little_endian(),
        )?;
    }

    Ok(DeviceMaterial {
        vector,
        bits,
        modulus_bits: bits,
        exponent_bits: bits,
    })
}

/// Reads an elliptic curve public key in application format.
///
/// The key is either a DER SubjectPublicKeyInfo (first byte `0x30`) or the
/// raw point. The curve must match `family`; `bits` may be `0` to take the
/// size from the key.
///
/// # Returns
/// * The key in hardware layout.
///
/// # Errors
/// * `KeyMgmtError::InvalidArgument` - If the key is malformed or for another curve.
pub fn read_ec_public_key(
    data: &[u8],
    family: EccFamily,
    bits: usize,
) -> KeyMgmtResult<DeviceMaterial> {
    let raw_25519 = family.curve().public_components() == 1 && data.len() == 32;
    if data.first() != Some(&DER_SEQUENCE) || raw_25519 {
        return ecc_public_to_device(family, bits, data);
    }

    let info = ec_public_from_spki(data)?;
    if info.family != family {
        tracing::error!(expected = %family, actual = %info.family, "Public key curve mismatch");
        Err(KeyMgmtError::InvalidArgument)?
    }
    let bits = resolve_bits(bits, info.bits)?;
    ecc_public_to_device(family, bits, &info.point)
}

/// Converts an ECC public key from hardware layout to application format.
///
/// # Returns
/// * The raw point, or the SubjectPublicKeyInfo DER when `der` is set.
pub fn ecc_public_from_device(
    family: EccFamily,
    bits: usize,
    vector: &[u8],
    der: bool,
) -> KeyMgmtResult<Vec<u8>> {
    let curve = family.curve();
    let components = curve.public_components();

    let mut point = Vec::with_capacity(1 + components * bits_to_bytes(bits));
    if components == 2 {
        point.push(UNCOMPRESSED_POINT);
    }

    let mut offset = 0;
    for _ in 0..components {
        let (header, value, consumed) =
            read_subvector(vector.get(offset..).unwrap_or_default(), curve.is_little_endian())?;
        if header.bits as usize != bits {
            tracing::error!(bits, actual = header.bits, "Public key sub-vector size mismatch");
            Err(KeyMgmtError::InvalidArgument)?
        }
        point.extend_from_slice(&value);
        offset += consumed;
    }

    if der {
        ec_public_to_spki(family, bits, &point)
    } else {
        Ok(point)
    }
}

fn rsa_to_device(modulus: &[u8], exponent: &[u8]) -> KeyMgmtResult<DeviceMaterial> {
    let modulus_bits = modulus.len() * 8;
    let exponent_bits = exponent.len() * 8;
    if modulus.is_empty() || exponent.is_empty() || modulus_bits > u16::MAX as usize {
        tracing::error!(modulus_bits, exponent_bits, "Invalid RSA component sizes");
        Err(KeyMgmtError::InvalidArgument)?
    }

    let mut vector =
        Zeroizing::new(vec![0u8; subvector_size(modulus_bits) + subvector_size(exponent_bits)]);
    let written = write_subvector(
        &mut vector,
        SubVectorHeader {
            bits: modulus_bits as u16,
            index: 0,
            items: RSA_ITEMS,
        },
        modulus,
        false,
    )?;
    write_subvector(
        &mut vector[written..],
        SubVectorHeader {
            bits: exponent_bits as u16,
            index: 1,
            items: RSA_ITEMS,
        },
        exponent,
        false,
    )?;

    Ok(DeviceMaterial {
        vector,
        bits: modulus_bits,
        modulus_bits,
        exponent_bits,
    })
}

/// Converts a PKCS#1 RSA public key to hardware layout: modulus then public
/// exponent.
pub fn rsa_public_to_device(der: &[u8], bits: usize) -> KeyMgmtResult<DeviceMaterial> {
    let public_key = pkcs1::RsaPublicKey::from_der(der).map_err(|error_stack| {
        tracing::error!(?error_stack);
        KeyMgmtError::InvalidArgument
    })?;

    let material = rsa_to_device(
        public_key.modulus.as_bytes(),
        public_key.public_exponent.as_bytes(),
    )?;
    resolve_bits(bits, material.bits)?;
    Ok(material)
}

/// Converts a PKCS#1 RSA private key to hardware layout: modulus then
/// private exponent.
pub fn rsa_pair_to_device(der: &[u8], bits: usize) -> KeyMgmtResult<DeviceMaterial> {
    let private_key = pkcs1::RsaPrivateKey::from_der(der).map_err(|error_stack| {
        tracing::error!(?error_stack);
        KeyMgmtError::InvalidArgument
    })?;

    let material = rsa_to_device(
        private_key.modulus.as_bytes(),
        private_key.private_exponent.as_bytes(),
    )?;
    resolve_bits(bits, material.bits)?;
    Ok(material)
}

/// Converts an RSA public key from hardware layout to PKCS#1 DER.
pub fn rsa_public_from_device(vector: &[u8]) -> KeyMgmtResult<Vec<u8>> {
    let (_, modulus, consumed) = read_subvector(vector, false)?;
    let (_, exponent, _) = read_subvector(vector.get(consumed..).unwrap_or_default(), false)?;

    fn to_uint(value: &[u8]) -> KeyMgmtResult<pkcs1::UintRef<'_>> {
        pkcs1::UintRef::new(value).map_err(|error_stack| {
            tracing::error!(?error_stack);
            KeyMgmtError::InvalidArgument
        })
    }

    let public_key = pkcs1::RsaPublicKey {
        modulus: to_uint(&modulus)?,
        public_exponent: to_uint(&exponent)?,
    };

    public_key.to_der().map_err(|error_stack| {
        tracing::error!(?error_stack);
        KeyMgmtError::InvalidArgument
    })
}

/// Converts key material in application format to hardware layout.
///
/// # Arguments
/// * `key_type` - Asymmetric key type.
/// * `bits` - Requested key size, `0` to take it from the material.
/// * `data` - Material in application format.
///
/// # Errors
/// * `KeyMgmtError::InvalidArgument` - If the material is malformed or its size
///   does not match `bits`.
pub fn to_device(key_type: KeyType, bits: usize, data: &[u8]) -> KeyMgmtResult<DeviceMaterial> {
    match key_type {
        KeyType::RsaKeyPair => rsa_pair_to_device(data, bits),
        KeyType::RsaPublicKey => rsa_public_to_device(data, bits),
        KeyType::EccKeyPair(family) => ecc_private_to_device(family, bits, data),
        KeyType::EccPublicKey(family) => read_ec_public_key(data, family, bits),
        _ => {
            tracing::error!(%key_type, "Not an asymmetric key type");
            Err(KeyMgmtError::InvalidArgument)
        }
    }
}

/// Converts a public key from hardware layout to application format.
///
/// RSA keys are always PKCS#1 DER; ECC keys are wrapped in DER when `der` is set.
pub fn public_from_device(
    key_type: KeyType,
    bits: usize,
    vector: &[u8],
    der: bool,
) -> KeyMgmtResult<Vec<u8>> {
    match key_type {
        KeyType::RsaPublicKey => rsa_public_from_device(vector),
        KeyType::EccPublicKey(family) => ecc_public_from_device(family, bits, vector, der),
        _ => {
            tracing::error!(%key_type, "Not a public key type");
            Err(KeyMgmtError::NotSupported)
        }
    }
}
