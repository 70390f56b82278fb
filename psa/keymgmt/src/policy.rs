// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Translation of key attributes into asset policies.
//!
//! The translator is a pure function of the key type, the permitted
//! algorithm, the usage flags and the key size. The result is either a
//! complete policy or `KeyMgmtError::InvalidArgument`; a partially valid
//! policy is never produced.

use azihsm_psa_interface::AssetPolicy;

use crate::algorithm::Algorithm;
use crate::algorithm::EccFamily;
use crate::algorithm::HashAlg;
use crate::algorithm::KeyType;
use crate::attributes::KeyPolicy;
use crate::attributes::KeyUsage;
use crate::KeyMgmtError;
use crate::KeyMgmtResult;

/// Smallest supported RSA modulus.
pub const RSA_MIN_BITS: usize = 1024;

/// Largest supported RSA modulus.
pub const RSA_MAX_BITS: usize = 4096;

/// Environment the translation runs in.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct PolicyContext {
    /// The caller runs in the non-secure world.
    pub non_secure: bool,

    /// Private asymmetric keys opt out of the DPA countermeasures.
    pub dpa_support: bool,
}

/// Symmetric key class.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum SymClass {
    HashMac(HashAlg),
    CipherMac,
    Cipher,
    Aead,
    DeriveCmac,
    DeriveHmac(HashAlg),
}

impl SymClass {
    fn of(alg: Algorithm) -> KeyMgmtResult<Self> {
        let class = match alg {
            Algorithm::Hmac(hash) => SymClass::HashMac(hash),
            Algorithm::Cmac | Algorithm::CbcMac => SymClass::CipherMac,
            Algorithm::Sp800108CounterCmac => SymClass::DeriveCmac,
            Algorithm::Sp800108CounterHmac(hash) => SymClass::DeriveHmac(hash),
            alg if alg.is_cipher() => SymClass::Cipher,
            alg if alg.is_aead() => SymClass::Aead,
            alg => {
                tracing::error!(%alg, "Algorithm is not a symmetric algorithm");
                Err(KeyMgmtError::InvalidArgument)?
            }
        };
        Ok(class)
    }

    fn is_mac(self) -> bool {
        matches!(self, SymClass::HashMac(_) | SymClass::CipherMac)
    }

    fn is_derive(self) -> bool {
        matches!(self, SymClass::DeriveCmac | SymClass::DeriveHmac(_))
    }
}

/// Returns the primary algorithm, or the secondary one if no primary is set.
pub fn effective_algorithm(policy: &KeyPolicy) -> KeyMgmtResult<Algorithm> {
    policy.alg.or(policy.alg2).ok_or_else(|| {
        tracing::error!(?policy, "Key has no permitted algorithm");
        KeyMgmtError::InvalidArgument
    })
}

/// Translates key attributes into an asset policy.
///
/// # Arguments
/// * `key_type` - Key type.
/// * `policy` - Usage flags and permitted algorithms.
/// * `bits` - Key size in bits, already resolved from the material.
/// * `context` - Translation environment.
///
/// # Returns
/// * The asset policy of the key. For a bidirectional key this is the
///   encrypt/generate policy; the decrypt/verify one is obtained by
///   flipping [`AssetPolicy::DIR_MASK`].
///
/// # Errors
/// * `KeyMgmtError::InvalidArgument` - If the combination is not valid.
pub fn translate(
    key_type: KeyType,
    policy: &KeyPolicy,
    bits: usize,
    context: PolicyContext,
) -> KeyMgmtResult<AssetPolicy> {
    let alg = effective_algorithm(policy)?;

    let mut asset_policy = if key_type.is_symmetric() {
        translate_symmetric(key_type, alg, policy.usage, bits)?
    } else {
        translate_asymmetric(key_type, alg, bits, context)?
    };

    if context.non_secure {
        asset_policy |= AssetPolicy::SOURCE_NON_SECURE;
    }

    tracing::debug!(%key_type, %alg, bits, policy = %asset_policy, "Policy translated");
    Ok(asset_policy)
}

/// Returns `true` if the key needs one asset per direction.
///
/// That is the case for symmetric cipher and AEAD keys allowed to both
/// encrypt and decrypt, and MAC keys allowed to both sign and verify.
pub fn is_bidirectional(key_type: KeyType, policy: &KeyPolicy) -> bool {
    if !key_type.is_symmetric() {
        return false;
    }

    let Ok(alg) = effective_algorithm(policy) else {
        return false;
    };

    let usage = policy.usage;
    if alg.is_cipher() || alg.is_aead() {
        usage.encrypt() && usage.decrypt()
    } else if alg.is_mac() {
        usage.sign_message() && usage.verify_message()
    } else {
        false
    }
}

fn sym_hash(hash: HashAlg) -> AssetPolicy {
    match hash {
        HashAlg::Sha1 => AssetPolicy::SCAH_SHA1,
        HashAlg::Sha224 => AssetPolicy::SCAH_SHA224,
        HashAlg::Sha256 => AssetPolicy::SCAH_SHA256,
        HashAlg::Sha384 => AssetPolicy::SCAH_SHA384,
        HashAlg::Sha512 => AssetPolicy::SCAH_SHA512,
        HashAlg::Sha3_224 => AssetPolicy::SCAH_SHA3_224,
        HashAlg::Sha3_256 => AssetPolicy::SCAH_SHA3_256,
        HashAlg::Sha3_384 => AssetPolicy::SCAH_SHA3_384,
        HashAlg::Sha3_512 => AssetPolicy::SCAH_SHA3_512,
    }
}

/// Permitted HMAC key sizes in bytes.
pub fn hmac_key_bounds(hash: HashAlg) -> (usize, usize) {
    match hash {
        HashAlg::Sha1 => (14, 64),
        HashAlg::Sha224 | HashAlg::Sha256 => (hash.digest_len() / 2, 64),
        HashAlg::Sha384 | HashAlg::Sha512 => (hash.digest_len() / 2, 128),
        HashAlg::Sha3_224 => (14, 144),
        HashAlg::Sha3_256 => (16, 136),
        HashAlg::Sha3_384 => (24, 104),
        HashAlg::Sha3_512 => (32, 72),
    }
}

fn check_sym_size(key_type: KeyType, alg: Algorithm, len: usize) -> KeyMgmtResult<()> {
    let valid = match (key_type, alg) {
        (_, Algorithm::Hmac(hash) | Algorithm::Sp800108CounterHmac(hash)) => {
            let (min, max) = hmac_key_bounds(hash);
            (min..=max).contains(&len)
        }
        (KeyType::Aes, Algorithm::Xts) => matches!(len, 32 | 64),
        (KeyType::Aes | KeyType::Aria, _) => matches!(len, 16 | 24 | 32),
        (KeyType::Des, _) => len == 24,
        (KeyType::ChaCha20, _) => len == 32,
        _ => false,
    };

    if !valid {
        tracing::error!(%key_type, %alg, len, "Invalid symmetric key size");
        Err(KeyMgmtError::InvalidArgument)?
    }
    Ok(())
}

fn cipher_primitive(key_type: KeyType) -> KeyMgmtResult<AssetPolicy> {
    match key_type {
        KeyType::Aes => Ok(AssetPolicy::SCAC_AES),
        KeyType::Aria => Ok(AssetPolicy::SCAC_ARIA),
        KeyType::Des => Ok(AssetPolicy::SCAC_TDES),
        KeyType::ChaCha20 => Ok(AssetPolicy::SCAC_CHACHA20),
        _ => {
            tracing::error!(%key_type, "Key type is not a block or stream cipher key");
            Err(KeyMgmtError::InvalidArgument)
        }
    }
}

fn translate_symmetric(
    key_type: KeyType,
    alg: Algorithm,
    usage: KeyUsage,
    bits: usize,
) -> KeyMgmtResult<AssetPolicy> {
    if bits == 0 || bits % 8 != 0 {
        tracing::error!(bits, "Symmetric key size is not a whole number of bytes");
        Err(KeyMgmtError::InvalidArgument)?
    }
    check_sym_size(key_type, alg, bits / 8)?;

    let class = SymClass::of(alg)?;
    let mut policy = match (key_type, class) {
        (KeyType::Hmac, SymClass::HashMac(hash)) => AssetPolicy::SYM_MAC_HASH | sym_hash(hash),
        (KeyType::Aes | KeyType::Aria | KeyType::Des, SymClass::CipherMac) => {
            let mode = if alg == Algorithm::CbcMac {
                AssetPolicy::SCMCM_CBCMAC
            } else {
                AssetPolicy::SCMCM_CMAC
            };
            AssetPolicy::SYM_MAC_CIPHER | cipher_primitive(key_type)? | mode
        }
        (KeyType::Aes | KeyType::Aria | KeyType::Des, SymClass::Cipher) => {
            let mode = match alg {
                Algorithm::EcbNoPadding => AssetPolicy::SCMCB_ECB,
                Algorithm::CbcNoPadding | Algorithm::CbcPkcs7 => AssetPolicy::SCMCB_CBC,
                Algorithm::Ctr => AssetPolicy::SCMCB_CTR32,
                Algorithm::Xts if key_type == KeyType::Aes => AssetPolicy::SCMCB_XTS,
                _ => {
                    tracing::error!(%key_type, %alg, "Unsupported cipher mode");
                    Err(KeyMgmtError::InvalidArgument)?
                }
            };
            AssetPolicy::SYM_CIPHER_BULK | cipher_primitive(key_type)? | mode
        }
        (KeyType::Aes | KeyType::Aria, SymClass::Aead) if alg != Algorithm::ChaCha20Poly1305 => {
            let mode = if alg == Algorithm::Gcm {
                AssetPolicy::SCMCA_GCM
            } else {
                AssetPolicy::SCMCA_CCM
            };
            AssetPolicy::SYM_CIPHER_AUTH | cipher_primitive(key_type)? | mode
        }
        (KeyType::ChaCha20, SymClass::Aead) if alg == Algorithm::ChaCha20Poly1305 => {
            AssetPolicy::SYM_CIPHER_AUTH | AssetPolicy::SCAC_CHACHA20 | AssetPolicy::SCMCA_CCM
        }
        (KeyType::Aes, SymClass::DeriveCmac) => {
            AssetPolicy::SYM_DERIVE | AssetPolicy::SCAD_NORMAL_CMAC
        }
        (KeyType::Derive | KeyType::Hmac, SymClass::DeriveHmac(hash)) => {
            AssetPolicy::SYM_DERIVE | AssetPolicy::SCAD_NORMAL_HMAC | sym_hash(hash)
        }
        _ => {
            tracing::error!(%key_type, %alg, "Algorithm not compatible with key type");
            Err(KeyMgmtError::InvalidArgument)?
        }
    };

    if !class.is_derive() {
        policy |= direction(class, usage)?;
    }

    Ok(policy)
}

fn direction(class: SymClass, usage: KeyUsage) -> KeyMgmtResult<AssetPolicy> {
    let (forward, backward) = if class.is_mac() {
        (usage.sign_message(), usage.verify_message())
    } else {
        (usage.encrypt(), usage.decrypt())
    };

    if forward {
        Ok(AssetPolicy::DIR_ENC_GEN)
    } else if backward {
        Ok(AssetPolicy::DIR_DEC_VRFY)
    } else {
        tracing::error!(?class, ?usage, "Usage selects no direction");
        Err(KeyMgmtError::InvalidArgument)
    }
}

fn asym_hash(hash: HashAlg, bits: usize, family: Option<EccFamily>) -> KeyMgmtResult<AssetPolicy> {
    let curve_25519 = family.is_some() && bits == 255;
    if hash.digest_bits() > bits && !(hash == HashAlg::Sha512 && curve_25519) {
        tracing::error!(%hash, bits, "Digest larger than the key");
        Err(KeyMgmtError::InvalidArgument)?
    }

    match hash {
        HashAlg::Sha1 => Ok(AssetPolicy::ACH_SHA1),
        HashAlg::Sha224 => Ok(AssetPolicy::ACH_SHA224),
        HashAlg::Sha256 => Ok(AssetPolicy::ACH_SHA256),
        HashAlg::Sha384 => Ok(AssetPolicy::ACH_SHA384),
        HashAlg::Sha512 => Ok(AssetPolicy::ACH_SHA512),
        _ => {
            tracing::error!(%hash, "Hash not supported for asymmetric keys");
            Err(KeyMgmtError::InvalidArgument)
        }
    }
}

fn check_asym_size(key_type: KeyType, bits: usize) -> KeyMgmtResult<()> {
    let valid = match key_type.ecc_family() {
        Some(family) => family.supports_bits(bits),
        None => (RSA_MIN_BITS..=RSA_MAX_BITS).contains(&bits) && bits % 8 == 0,
    };

    if !valid {
        tracing::error!(%key_type, bits, "Invalid asymmetric key size");
        Err(KeyMgmtError::InvalidArgument)?
    }
    Ok(())
}

fn translate_asymmetric(
    key_type: KeyType,
    alg: Algorithm,
    bits: usize,
    context: PolicyContext,
) -> KeyMgmtResult<AssetPolicy> {
    check_asym_size(key_type, bits)?;
    let family = key_type.ecc_family();

    let policy = match (family, alg) {
        (
            Some(EccFamily::SecpR1 | EccFamily::BrainpoolP1),
            Algorithm::Ecdsa(hash),
        ) => {
            let hash = hash.resolve(bits)?;
            AssetPolicy::ASYM_SIGN_VERIFY | AssetPolicy::ACA_ECDSA | asym_hash(hash, bits, family)?
        }
        (Some(EccFamily::TwistedEdwards), Algorithm::PureEdDsa) => {
            AssetPolicy::ASYM_SIGN_VERIFY
                | AssetPolicy::ACA_EDDSA
                | asym_hash(HashAlg::Sha512, bits, family)?
        }
        (Some(EccFamily::SecpR1 | EccFamily::BrainpoolP1), Algorithm::Ecdh) => {
            AssetPolicy::ASYM_KEY_EXCHANGE | AssetPolicy::ACA_ECDH
        }
        (Some(EccFamily::Montgomery), Algorithm::Ecdh) => {
            AssetPolicy::ASYM_KEY_EXCHANGE | AssetPolicy::ACA_CURVE25519
        }
        (None, Algorithm::RsaPkcs1v15Sign(hash)) => {
            let hash = hash.resolve(bits)?;
            AssetPolicy::ASYM_SIGN_VERIFY
                | AssetPolicy::ACA_RSA_PKCS1V15
                | asym_hash(hash, bits, None)?
        }
        (None, Algorithm::RsaPss(hash)) => {
            let hash = hash.resolve(bits)?;
            AssetPolicy::ASYM_SIGN_VERIFY | AssetPolicy::ACA_RSA_PSS | asym_hash(hash, bits, None)?
        }
        (None, Algorithm::RsaPkcs1v15Crypt) => {
            AssetPolicy::ASYM_DEC_ENC | AssetPolicy::ACA_RSA_PKCS1V15
        }
        (None, Algorithm::RsaOaep(hash)) => {
            AssetPolicy::ASYM_DEC_ENC | AssetPolicy::ACA_RSA_OAEP | asym_hash(hash, bits, None)?
        }
        _ => {
            tracing::error!(%key_type, %alg, "Algorithm not compatible with key type");
            Err(KeyMgmtError::InvalidArgument)?
        }
    };

    if key_type.is_key_pair() {
        let mut policy = policy | AssetPolicy::PRIVATE_DATA;
        if context.dpa_support {
            policy |= AssetPolicy::AC_NDPA;
        }
        Ok(policy)
    } else {
        Ok(policy | AssetPolicy::PUBLIC_DATA)
    }
}
