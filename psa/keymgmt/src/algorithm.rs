// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Key types and algorithms with their PSA encodings.

use azihsm_psa_interface::CurveFamily;

use crate::KeyMgmtError;
use crate::KeyMgmtResult;

/// Hash algorithm.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
pub enum HashAlg {
    /// SHA-1
    Sha1,
    /// SHA-224
    Sha224,
    /// SHA-256
    Sha256,
    /// SHA-384
    Sha384,
    /// SHA-512
    Sha512,
    /// SHA3-224
    Sha3_224,
    /// SHA3-256
    Sha3_256,
    /// SHA3-384
    Sha3_384,
    /// SHA3-512
    Sha3_512,
}

const PSA_HASH_ANY: u32 = 0xff;

impl HashAlg {
    /// Digest size in bits.
    pub const fn digest_bits(self) -> usize {
        match self {
            HashAlg::Sha1 => 160,
            HashAlg::Sha224 | HashAlg::Sha3_224 => 224,
            HashAlg::Sha256 | HashAlg::Sha3_256 => 256,
            HashAlg::Sha384 | HashAlg::Sha3_384 => 384,
            HashAlg::Sha512 | HashAlg::Sha3_512 => 512,
        }
    }

    /// Digest size in bytes.
    pub const fn digest_len(self) -> usize {
        self.digest_bits() / 8
    }

    const fn psa_code(self) -> u32 {
        match self {
            HashAlg::Sha1 => 0x05,
            HashAlg::Sha224 => 0x08,
            HashAlg::Sha256 => 0x09,
            HashAlg::Sha384 => 0x0a,
            HashAlg::Sha512 => 0x0b,
            HashAlg::Sha3_224 => 0x10,
            HashAlg::Sha3_256 => 0x11,
            HashAlg::Sha3_384 => 0x12,
            HashAlg::Sha3_512 => 0x13,
        }
    }

    fn from_psa_code(code: u32) -> Option<Self> {
        match code {
            0x05 => Some(HashAlg::Sha1),
            0x08 => Some(HashAlg::Sha224),
            0x09 => Some(HashAlg::Sha256),
            0x0a => Some(HashAlg::Sha384),
            0x0b => Some(HashAlg::Sha512),
            0x10 => Some(HashAlg::Sha3_224),
            0x11 => Some(HashAlg::Sha3_256),
            0x12 => Some(HashAlg::Sha3_384),
            0x13 => Some(HashAlg::Sha3_512),
            _ => None,
        }
    }

    /// Hash used with a curve of `bits` when a signature policy allows any hash.
    ///
    /// # Errors
    /// * `KeyMgmtError::InvalidArgument` - If the curve size has no matching hash.
    pub fn for_curve_bits(bits: usize) -> KeyMgmtResult<Self> {
        match bits {
            192 | 224 => Ok(HashAlg::Sha224),
            256 => Ok(HashAlg::Sha256),
            384 => Ok(HashAlg::Sha384),
            512 | 521 => Ok(HashAlg::Sha512),
            _ => {
                tracing::error!(bits, "No wildcard hash for key size");
                Err(KeyMgmtError::InvalidArgument)
            }
        }
    }
}

/// Hash selection of a hash-and-sign algorithm.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum HashSel {
    /// Any hash may be used with the key.
    Any,
    /// Only this hash may be used with the key.
    Specific(HashAlg),
}

impl HashSel {
    const fn psa_code(self) -> u32 {
        match self {
            HashSel::Any => PSA_HASH_ANY,
            HashSel::Specific(hash) => hash.psa_code(),
        }
    }

    fn from_psa_code(code: u32) -> Option<Self> {
        if code == PSA_HASH_ANY {
            Some(HashSel::Any)
        } else {
            HashAlg::from_psa_code(code).map(HashSel::Specific)
        }
    }

    /// Resolves the selection for a key of `bits`.
    pub fn resolve(self, bits: usize) -> KeyMgmtResult<HashAlg> {
        match self {
            HashSel::Any => HashAlg::for_curve_bits(bits),
            HashSel::Specific(hash) => Ok(hash),
        }
    }
}

/// Algorithm a key is permitted for.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Algorithm {
    /// HMAC
    Hmac(HashAlg),
    /// CMAC
    Cmac,
    /// CBC-MAC
    CbcMac,
    /// Counter mode stream cipher
    Ctr,
    /// XTS
    Xts,
    /// ECB without padding
    EcbNoPadding,
    /// CBC without padding
    CbcNoPadding,
    /// CBC with PKCS#7 padding
    CbcPkcs7,
    /// CCM
    Ccm,
    /// GCM
    Gcm,
    /// ChaCha20-Poly1305
    ChaCha20Poly1305,
    /// RSA PKCS#1 v1.5 signature
    RsaPkcs1v15Sign(HashSel),
    /// RSA-PSS signature
    RsaPss(HashSel),
    /// ECDSA
    Ecdsa(HashSel),
    /// EdDSA on the message
    PureEdDsa,
    /// RSA PKCS#1 v1.5 encryption
    RsaPkcs1v15Crypt,
    /// RSA-OAEP encryption
    RsaOaep(HashAlg),
    /// ECDH key agreement
    Ecdh,
    /// SP800-108 counter mode KDF with HMAC
    Sp800108CounterHmac(HashAlg),
    /// SP800-108 counter mode KDF with CMAC
    Sp800108CounterCmac,
}

const ALG_HMAC_BASE: u32 = 0x0380_0000;
const ALG_RSA_PKCS1V15_SIGN_BASE: u32 = 0x0600_0200;
const ALG_RSA_PSS_BASE: u32 = 0x0600_0300;
const ALG_ECDSA_BASE: u32 = 0x0600_0600;
const ALG_RSA_OAEP_BASE: u32 = 0x0700_0300;
const ALG_SP800_108_HMAC_BASE: u32 = 0x0800_0700;
const ALG_HASH_MASK: u32 = 0xff;

impl Algorithm {
    /// PSA encoding of the algorithm.
    pub const fn to_psa(self) -> u32 {
        match self {
            Algorithm::Hmac(hash) => ALG_HMAC_BASE | hash.psa_code(),
            Algorithm::Cmac => 0x03c0_0200,
            Algorithm::CbcMac => 0x03c0_0100,
            Algorithm::Ctr => 0x04c0_1000,
            Algorithm::Xts => 0x0440_ff00,
            Algorithm::EcbNoPadding => 0x0440_4400,
            Algorithm::CbcNoPadding => 0x0440_4000,
            Algorithm::CbcPkcs7 => 0x0440_4100,
            Algorithm::Ccm => 0x0550_0100,
            Algorithm::Gcm => 0x0550_0200,
            Algorithm::ChaCha20Poly1305 => 0x0510_0500,
            Algorithm::RsaPkcs1v15Sign(hash) => ALG_RSA_PKCS1V15_SIGN_BASE | hash.psa_code(),
            Algorithm::RsaPss(hash) => ALG_RSA_PSS_BASE | hash.psa_code(),
            Algorithm::Ecdsa(hash) => ALG_ECDSA_BASE | hash.psa_code(),
            Algorithm::PureEdDsa => 0x0600_0800,
            Algorithm::RsaPkcs1v15Crypt => 0x0700_0200,
            Algorithm::RsaOaep(hash) => ALG_RSA_OAEP_BASE | hash.psa_code(),
            Algorithm::Ecdh => 0x0902_0000,
            Algorithm::Sp800108CounterHmac(hash) => ALG_SP800_108_HMAC_BASE | hash.psa_code(),
            Algorithm::Sp800108CounterCmac => 0x0800_0800,
        }
    }

    /// Decodes a PSA algorithm. `0` decodes to `None`.
    ///
    /// # Errors
    /// * `KeyMgmtError::NotSupported` - If the encoding is not a supported algorithm.
    pub fn from_psa(value: u32) -> KeyMgmtResult<Option<Self>> {
        if value == 0 {
            return Ok(None);
        }

        let hash = value & ALG_HASH_MASK;
        let alg = match value & !ALG_HASH_MASK {
            ALG_HMAC_BASE => HashAlg::from_psa_code(hash).map(Algorithm::Hmac),
            ALG_RSA_PKCS1V15_SIGN_BASE => {
                HashSel::from_psa_code(hash).map(Algorithm::RsaPkcs1v15Sign)
            }
            ALG_RSA_PSS_BASE => HashSel::from_psa_code(hash).map(Algorithm::RsaPss),
            ALG_ECDSA_BASE => HashSel::from_psa_code(hash).map(Algorithm::Ecdsa),
            ALG_RSA_OAEP_BASE => HashAlg::from_psa_code(hash).map(Algorithm::RsaOaep),
            ALG_SP800_108_HMAC_BASE => {
                HashAlg::from_psa_code(hash).map(Algorithm::Sp800108CounterHmac)
            }
            _ => [
                Algorithm::Cmac,
                Algorithm::CbcMac,
                Algorithm::Ctr,
                Algorithm::Xts,
                Algorithm::EcbNoPadding,
                Algorithm::CbcNoPadding,
                Algorithm::CbcPkcs7,
                Algorithm::Ccm,
                Algorithm::Gcm,
                Algorithm::ChaCha20Poly1305,
                Algorithm::PureEdDsa,
                Algorithm::RsaPkcs1v15Crypt,
                Algorithm::Ecdh,
                Algorithm::Sp800108CounterCmac,
            ]
            .into_iter()
            .find(|alg| alg.to_psa() == value),
        };

        match alg {
            Some(alg) => Ok(Some(alg)),
            None => {
                tracing::error!(alg = format_args!("{value:#010x}"), "Unsupported algorithm");
                Err(KeyMgmtError::NotSupported)
            }
        }
    }

    /// Message authentication code.
    pub const fn is_mac(self) -> bool {
        matches!(self, Algorithm::Hmac(_) | Algorithm::Cmac | Algorithm::CbcMac)
    }

    /// Unauthenticated cipher.
    pub const fn is_cipher(self) -> bool {
        matches!(
            self,
            Algorithm::Ctr
                | Algorithm::Xts
                | Algorithm::EcbNoPadding
                | Algorithm::CbcNoPadding
                | Algorithm::CbcPkcs7
        )
    }

    /// Authenticated encryption with associated data.
    pub const fn is_aead(self) -> bool {
        matches!(
            self,
            Algorithm::Ccm | Algorithm::Gcm | Algorithm::ChaCha20Poly1305
        )
    }

    /// Asymmetric signature.
    pub const fn is_sign(self) -> bool {
        matches!(
            self,
            Algorithm::RsaPkcs1v15Sign(_)
                | Algorithm::RsaPss(_)
                | Algorithm::Ecdsa(_)
                | Algorithm::PureEdDsa
        )
    }

    /// Asymmetric encryption.
    pub const fn is_asymmetric_encryption(self) -> bool {
        matches!(self, Algorithm::RsaPkcs1v15Crypt | Algorithm::RsaOaep(_))
    }

    /// Key agreement.
    pub const fn is_key_agreement(self) -> bool {
        matches!(self, Algorithm::Ecdh)
    }

    /// Key derivation.
    pub const fn is_key_derivation(self) -> bool {
        matches!(
            self,
            Algorithm::Sp800108CounterHmac(_) | Algorithm::Sp800108CounterCmac
        )
    }

    /// Signature hash selection, for hash-and-sign algorithms.
    pub const fn sign_hash(self) -> Option<HashSel> {
        match self {
            Algorithm::RsaPkcs1v15Sign(hash) | Algorithm::RsaPss(hash) | Algorithm::Ecdsa(hash) => {
                Some(hash)
            }
            _ => None,
        }
    }

    fn with_sign_hash(self, hash: HashSel) -> Self {
        match self {
            Algorithm::RsaPkcs1v15Sign(_) => Algorithm::RsaPkcs1v15Sign(hash),
            Algorithm::RsaPss(_) => Algorithm::RsaPss(hash),
            Algorithm::Ecdsa(_) => Algorithm::Ecdsa(hash),
            other => other,
        }
    }

    /// Most permissive algorithm allowed by both `a` and `b`.
    ///
    /// Equal algorithms intersect to themselves. A hash-and-sign algorithm
    /// with any hash intersects with the same scheme bound to a specific hash
    /// to that specific variant. Everything else has no intersection.
    pub fn intersect(a: Option<Self>, b: Option<Self>) -> Option<Self> {
        let (a, b) = (a?, b?);
        if a == b {
            return Some(a);
        }

        match (a.sign_hash(), b.sign_hash()) {
            (Some(HashSel::Any), Some(hash @ HashSel::Specific(_)))
                if a.with_sign_hash(hash) == b =>
            {
                Some(b)
            }
            (Some(hash @ HashSel::Specific(_)), Some(HashSel::Any))
                if b.with_sign_hash(hash) == a =>
            {
                Some(a)
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} ({:#010x})", self, self.to_psa())
    }
}

/// Elliptic curve family.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
pub enum EccFamily {
    /// NIST secp-r1 curves
    SecpR1,
    /// Brainpool P r1 curves
    BrainpoolP1,
    /// Curve25519 in Montgomery form
    Montgomery,
    /// Edwards25519
    TwistedEdwards,
}

impl EccFamily {
    const fn psa_code(self) -> u16 {
        match self {
            EccFamily::SecpR1 => 0x12,
            EccFamily::BrainpoolP1 => 0x30,
            EccFamily::Montgomery => 0x41,
            EccFamily::TwistedEdwards => 0x42,
        }
    }

    fn from_psa_code(code: u16) -> Option<Self> {
        match code {
            0x12 => Some(EccFamily::SecpR1),
            0x30 => Some(EccFamily::BrainpoolP1),
            0x41 => Some(EccFamily::Montgomery),
            0x42 => Some(EccFamily::TwistedEdwards),
            _ => None,
        }
    }

    /// Hardware curve family.
    pub const fn curve(self) -> CurveFamily {
        match self {
            EccFamily::SecpR1 => CurveFamily::NistP,
            EccFamily::BrainpoolP1 => CurveFamily::Brainpool,
            EccFamily::Montgomery => CurveFamily::Montgomery,
            EccFamily::TwistedEdwards => CurveFamily::TwistedEdwards,
        }
    }

    /// Returns `true` if the family has a curve of `bits`.
    pub const fn supports_bits(self, bits: usize) -> bool {
        match self {
            EccFamily::SecpR1 => matches!(bits, 192 | 224 | 256 | 384 | 521),
            EccFamily::BrainpoolP1 => matches!(bits, 160 | 192 | 224 | 256 | 320 | 384 | 512),
            EccFamily::Montgomery | EccFamily::TwistedEdwards => bits == 255,
        }
    }
}

/// Key type.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum KeyType {
    /// HMAC key
    Hmac,
    /// Key derivation secret
    Derive,
    /// AES key
    Aes,
    /// ARIA key
    Aria,
    /// Triple DES key
    Des,
    /// ChaCha20 key
    ChaCha20,
    /// RSA public key
    RsaPublicKey,
    /// RSA key pair
    RsaKeyPair,
    /// Elliptic curve public key
    EccPublicKey(EccFamily),
    /// Elliptic curve key pair
    EccKeyPair(EccFamily),
}

const KEY_TYPE_ECC_PUBLIC_BASE: u16 = 0x4100;
const KEY_TYPE_ECC_PAIR_BASE: u16 = 0x7100;
const KEY_TYPE_ECC_FAMILY_MASK: u16 = 0x00ff;

impl KeyType {
    /// PSA encoding of the key type.
    pub const fn to_psa(self) -> u16 {
        match self {
            KeyType::Hmac => 0x1100,
            KeyType::Derive => 0x1200,
            KeyType::Aes => 0x2400,
            KeyType::Aria => 0x2406,
            KeyType::Des => 0x2301,
            KeyType::ChaCha20 => 0x2004,
            KeyType::RsaPublicKey => 0x4001,
            KeyType::RsaKeyPair => 0x7001,
            KeyType::EccPublicKey(family) => KEY_TYPE_ECC_PUBLIC_BASE | family.psa_code(),
            KeyType::EccKeyPair(family) => KEY_TYPE_ECC_PAIR_BASE | family.psa_code(),
        }
    }

    /// Decodes a PSA key type. `0` decodes to `None`.
    ///
    /// # Errors
    /// * `KeyMgmtError::NotSupported` - If the encoding is not a supported key type.
    pub fn from_psa(value: u16) -> KeyMgmtResult<Option<Self>> {
        let family = EccFamily::from_psa_code(value & KEY_TYPE_ECC_FAMILY_MASK);
        let key_type = match (value, value & !KEY_TYPE_ECC_FAMILY_MASK) {
            (0, _) => return Ok(None),
            (0x1100, _) => Some(KeyType::Hmac),
            (0x1200, _) => Some(KeyType::Derive),
            (0x2400, _) => Some(KeyType::Aes),
            (0x2406, _) => Some(KeyType::Aria),
            (0x2301, _) => Some(KeyType::Des),
            (0x2004, _) => Some(KeyType::ChaCha20),
            (0x4001, _) => Some(KeyType::RsaPublicKey),
            (0x7001, _) => Some(KeyType::RsaKeyPair),
            (_, KEY_TYPE_ECC_PUBLIC_BASE) => family.map(KeyType::EccPublicKey),
            (_, KEY_TYPE_ECC_PAIR_BASE) => family.map(KeyType::EccKeyPair),
            _ => None,
        };

        match key_type {
            Some(key_type) => Ok(Some(key_type)),
            None => {
                tracing::error!(key_type = format_args!("{value:#06x}"), "Unsupported key type");
                Err(KeyMgmtError::NotSupported)
            }
        }
    }

    /// Unstructured symmetric key.
    pub const fn is_symmetric(self) -> bool {
        matches!(
            self,
            KeyType::Hmac
                | KeyType::Derive
                | KeyType::Aes
                | KeyType::Aria
                | KeyType::Des
                | KeyType::ChaCha20
        )
    }

    /// RSA or ECC key.
    pub const fn is_asymmetric(self) -> bool {
        !self.is_symmetric()
    }

    /// Public key of an asymmetric pair.
    pub const fn is_public_key(self) -> bool {
        matches!(self, KeyType::RsaPublicKey | KeyType::EccPublicKey(_))
    }

    /// Asymmetric key pair.
    pub const fn is_key_pair(self) -> bool {
        matches!(self, KeyType::RsaKeyPair | KeyType::EccKeyPair(_))
    }

    /// RSA key.
    pub const fn is_rsa(self) -> bool {
        matches!(self, KeyType::RsaPublicKey | KeyType::RsaKeyPair)
    }

    /// Curve family of an ECC key.
    pub const fn ecc_family(self) -> Option<EccFamily> {
        match self {
            KeyType::EccPublicKey(family) | KeyType::EccKeyPair(family) => Some(family),
            _ => None,
        }
    }

    /// Public key type matching a key pair type.
    pub const fn to_public(self) -> Self {
        match self {
            KeyType::RsaKeyPair => KeyType::RsaPublicKey,
            KeyType::EccKeyPair(family) => KeyType::EccPublicKey(family),
            other => other,
        }
    }
}

impl std::fmt::Display for KeyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} ({:#06x})", self, self.to_psa())
    }
}
