// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Public key tokens: key pair generation and public key computation.
//!
//! Every token runs against a temporary domain parameters asset that is
//! allocated before the token and freed after it, whatever the outcome.

use azihsm_psa_interface::AssetId;
use azihsm_psa_interface::AssetPolicy;
use azihsm_psa_interface::AssetStore;
use azihsm_psa_interface::CurveDomain;
use azihsm_psa_interface::PkCommand;
use azihsm_psa_interface::PkMethod;
use azihsm_psa_interface::PkResult;

use crate::algorithm::EccFamily;
use crate::cleanup::settle;
use crate::format::ecc_public_from_device;
use crate::format::ecc_public_size;
use crate::KeyMgmtError;
use crate::KeyMgmtResult;

/// Token method of a curve family.
pub(crate) fn pk_method(family: EccFamily) -> PkMethod {
    match family {
        EccFamily::SecpR1 | EccFamily::BrainpoolP1 => PkMethod::EcdhEcdsa,
        EccFamily::Montgomery => PkMethod::Curve25519,
        EccFamily::TwistedEdwards => PkMethod::EdDsa,
    }
}

fn curve_bits(bits: usize) -> KeyMgmtResult<u16> {
    u16::try_from(bits).map_err(|_| {
        tracing::error!(bits, "Curve size out of range");
        KeyMgmtError::InvalidArgument
    })
}

/// Runs `token` with a domain parameters asset for the curve installed.
fn with_domain<T>(
    store: &dyn AssetStore,
    family: EccFamily,
    bits: usize,
    token: impl FnOnce(AssetId, u16) -> KeyMgmtResult<T>,
) -> KeyMgmtResult<T> {
    let bits = curve_bits(bits)?;
    let curve = CurveDomain {
        family: family.curve(),
        bits,
    };

    let domain = store.alloc(AssetPolicy::ASYM_KEY_PARAMS, CurveDomain::ENCODED_LEN)?;
    let result = store
        .load_plaintext(domain, &curve.to_bytes())
        .map_err(KeyMgmtError::from)
        .and_then(|_| token(domain, bits));
    let freed = store.free(domain).map_err(KeyMgmtError::from);
    settle(result, freed)
}

/// Generates a key pair into two empty assets.
///
/// # Arguments
/// * `store` - Asset store.
/// * `family` - Curve family.
/// * `bits` - Curve size.
/// * `private_key` - Empty private key asset.
/// * `public_key` - Empty public key asset.
/// * `kek` - Key blob KEK, to also receive the private key wrapped.
///
/// # Returns
/// * The wrapped private key when `kek` is set.
pub(crate) fn generate_key_pair(
    store: &dyn AssetStore,
    family: EccFamily,
    bits: usize,
    private_key: AssetId,
    public_key: AssetId,
    kek: Option<AssetId>,
) -> KeyMgmtResult<Option<Vec<u8>>> {
    with_domain(store, family, bits, |domain, bits| {
        let command = PkCommand::GenKeyPair {
            method: pk_method(family),
            bits,
            domain,
            private_key,
            public_key,
            kek,
        };

        match (store.exchange_token(&command)?, kek) {
            (PkResult::KeyBlob(blob), Some(_)) => Ok(Some(blob)),
            (PkResult::Complete, None) => Ok(None),
            (result, _) => {
                tracing::error!(?result, "Unexpected key pair token result");
                Err(KeyMgmtError::HardwareFailure)
            }
        }
    })
}

/// Computes the public key of `private_key` into the empty asset `public_key`.
pub(crate) fn public_key_to_asset(
    store: &dyn AssetStore,
    family: EccFamily,
    bits: usize,
    private_key: AssetId,
    public_key: AssetId,
) -> KeyMgmtResult<()> {
    with_domain(store, family, bits, |domain, bits| {
        let command = PkCommand::GenPublicKey {
            method: pk_method(family),
            bits,
            domain,
            private_key,
            public_key: Some(public_key),
        };

        match store.exchange_token(&command)? {
            PkResult::Complete => Ok(()),
            result => {
                tracing::error!(?result, "Unexpected public key token result");
                Err(KeyMgmtError::HardwareFailure)
            }
        }
    })
}

/// Computes the public key of `private_key` in hardware layout.
pub(crate) fn public_key_vector(
    store: &dyn AssetStore,
    family: EccFamily,
    bits: usize,
    private_key: AssetId,
) -> KeyMgmtResult<Vec<u8>> {
    let vector = with_domain(store, family, bits, |domain, bits| {
        let command = PkCommand::GenPublicKey {
            method: pk_method(family),
            bits,
            domain,
            private_key,
            public_key: None,
        };

        match store.exchange_token(&command)? {
            PkResult::PublicKey(vector) => Ok(vector),
            result => {
                tracing::error!(?result, "Unexpected public key token result");
                Err(KeyMgmtError::HardwareFailure)
            }
        }
    })?;

    if vector.len() != ecc_public_size(family, bits) {
        tracing::error!(len = vector.len(), %family, bits, "Public key of unexpected size");
        Err(KeyMgmtError::HardwareFailure)?
    }
    Ok(vector)
}

/// Computes the public key of `private_key` in application format, wrapped
/// in a SubjectPublicKeyInfo when `der` is set.
pub(crate) fn public_key_export(
    store: &dyn AssetStore,
    family: EccFamily,
    bits: usize,
    private_key: AssetId,
    der: bool,
) -> KeyMgmtResult<Vec<u8>> {
    let vector = public_key_vector(store, family, bits, private_key)?;
    ecc_public_from_device(family, bits, &vector, der)
}

/// Allocates a public key asset and fills it from `private_key`.
///
/// The asset carries the public counterpart of `policy` and is owned by the
/// caller on success.
pub(crate) fn ephemeral_public_asset(
    store: &dyn AssetStore,
    family: EccFamily,
    bits: usize,
    private_key: AssetId,
    policy: AssetPolicy,
) -> KeyMgmtResult<AssetId> {
    let public_key = store.alloc(policy.to_public(), ecc_public_size(family, bits))?;

    match public_key_to_asset(store, family, bits, private_key, public_key) {
        Ok(()) => Ok(public_key),
        Err(error) => {
            let freed = store.free(public_key).map_err(KeyMgmtError::from);
            settle(Err(error), freed)
        }
    }
}
