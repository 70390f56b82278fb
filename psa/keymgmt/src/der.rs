// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! SubjectPublicKeyInfo wrapping of elliptic curve public keys.

use der::asn1::BitString;
use spki::der::Decode;
use spki::der::Encode;
use spki::ObjectIdentifier;

use crate::algorithm::EccFamily;
use crate::KeyMgmtError;
use crate::KeyMgmtResult;

const EC_OID: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");
const X25519_OID: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.101.110");
const ED25519_OID: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.101.112");

const CURVE_OIDS: [(EccFamily, usize, ObjectIdentifier); 12] = [
    (EccFamily::SecpR1, 192, ObjectIdentifier::new_unwrap("1.2.840.10045.3.1.1")),
    (EccFamily::SecpR1, 224, ObjectIdentifier::new_unwrap("1.3.132.0.33")),
    (EccFamily::SecpR1, 256, ObjectIdentifier::new_unwrap("1.2.840.10045.3.1.7")),
    (EccFamily::SecpR1, 384, ObjectIdentifier::new_unwrap("1.3.132.0.34")),
    (EccFamily::SecpR1, 521, ObjectIdentifier::new_unwrap("1.3.132.0.35")),
    (EccFamily::BrainpoolP1, 160, ObjectIdentifier::new_unwrap("1.3.36.3.3.2.8.1.1.1")),
    (EccFamily::BrainpoolP1, 192, ObjectIdentifier::new_unwrap("1.3.36.3.3.2.8.1.1.3")),
    (EccFamily::BrainpoolP1, 224, ObjectIdentifier::new_unwrap("1.3.36.3.3.2.8.1.1.5")),
    (EccFamily::BrainpoolP1, 256, ObjectIdentifier::new_unwrap("1.3.36.3.3.2.8.1.1.7")),
    (EccFamily::BrainpoolP1, 320, ObjectIdentifier::new_unwrap("1.3.36.3.3.2.8.1.1.9")),
    (EccFamily::BrainpoolP1, 384, ObjectIdentifier::new_unwrap("1.3.36.3.3.2.8.1.1.11")),
    (EccFamily::BrainpoolP1, 512, ObjectIdentifier::new_unwrap("1.3.36.3.3.2.8.1.1.13")),
];

/// Decoded elliptic curve SubjectPublicKeyInfo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EcPublicKeyInfo {
    pub(crate) family: EccFamily,
    pub(crate) bits: usize,
    pub(crate) point: Vec<u8>,
}

/// Wraps a public key in application format into a DER SubjectPublicKeyInfo.
pub(crate) fn ec_public_to_spki(family: EccFamily, bits: usize, point: &[u8]) -> KeyMgmtResult<Vec<u8>> {
    let (oid, parameters) = match family {
        EccFamily::Montgomery => (X25519_OID, None),
        EccFamily::TwistedEdwards => (ED25519_OID, None),
        EccFamily::SecpR1 | EccFamily::BrainpoolP1 => {
            let Some((_, _, curve_oid)) = CURVE_OIDS
                .iter()
                .find(|(f, b, _)| *f == family && *b == bits)
            else {
                tracing::error!(%family, bits, "No curve identifier for curve");
                return Err(KeyMgmtError::NotSupported);
            };
            let curve: der::Any = (*curve_oid).into();
            (EC_OID, Some(curve))
        }
    };

    let subject_public_key = BitString::from_bytes(point).map_err(|error_stack| {
        tracing::error!(?error_stack);
        KeyMgmtError::InvalidArgument
    })?;

    let info = spki::SubjectPublicKeyInfoOwned {
        algorithm: spki::AlgorithmIdentifier { oid, parameters },
        subject_public_key,
    };

    info.to_der().map_err(|error_stack| {
        tracing::error!(?error_stack);
        KeyMgmtError::InvalidArgument
    })
}

/// Parses a DER SubjectPublicKeyInfo holding an elliptic curve public key.
///
/// # Errors
/// * `KeyMgmtError::InvalidArgument` - If the DER is malformed or the curve is unknown.
pub(crate) fn ec_public_from_spki(der: &[u8]) -> KeyMgmtResult<EcPublicKeyInfo> {
    let info = spki::SubjectPublicKeyInfoRef::from_der(der).map_err(|error_stack| {
        tracing::error!(?error_stack);
        KeyMgmtError::InvalidArgument
    })?;

    let (alg_oid, param_oid) = info.algorithm.oids().map_err(|error_stack| {
        tracing::error!(?error_stack);
        KeyMgmtError::InvalidArgument
    })?;

    let (family, bits) = match param_oid {
        None if alg_oid == X25519_OID => (EccFamily::Montgomery, 255),
        None if alg_oid == ED25519_OID => (EccFamily::TwistedEdwards, 255),
        Some(curve) if alg_oid == EC_OID => CURVE_OIDS
            .iter()
            .find(|(_, _, oid)| *oid == curve)
            .map(|(family, bits, _)| (*family, *bits))
            .ok_or_else(|| {
                tracing::error!(%curve, "Unknown curve identifier");
                KeyMgmtError::InvalidArgument
            })?,
        _ => {
            tracing::error!(%alg_oid, "Unexpected public key algorithm");
            Err(KeyMgmtError::InvalidArgument)?
        }
    };

    Ok(EcPublicKeyInfo {
        family,
        bits,
        point: info.subject_public_key.raw_bytes().to_vec(),
    })
}
