// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Module for the key derivation operation.
//!
//! A derivation runs SP800-108 in counter mode with CMAC or HMAC-SHA256. The
//! fixed input is built from the label and context inputs:
//!
//! | KDK             | Fixed input                  | Label limit | Context       |
//! |-----------------|------------------------------|-------------|---------------|
//! | HUK, TKDK       | label                        | 204 bytes   | added by hardware, 13 bytes |
//! | other keys      | label, 0x00, context, length | 199 bytes   | label + context in 48..=199 bytes |

use tracing::instrument;
use zeroize::Zeroizing;

use crate::algorithm::Algorithm;
use crate::algorithm::HashAlg;
use crate::algorithm::KeyType;
use crate::attributes::*;
use crate::KeyMgmtError;
use crate::KeyMgmtResult;
use crate::KeyStore;

/// Capacity of a derivation that has not been limited.
pub const DERIVATION_MAX_CAPACITY: usize = 0x1FFF_FFFF;

const ROOT_LABEL_MAX: usize = 204;
const LABEL_MAX: usize = 199;
const ROOT_CONTEXT_LEN: usize = 13;
const FIXED_INPUT_MIN: usize = 53;
/// Separator byte and the 4-byte output length.
const FIXED_INPUT_RESERVED: usize = 5;

/// Input step of a key derivation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, strum::Display)]
pub enum DerivationStep {
    /// Key derivation key.
    Secret,
    /// Label of the fixed input.
    Label,
    /// Context of the fixed input.
    Context,
    /// Salt.
    Salt,
    /// Info.
    Info,
    /// Seed.
    Seed,
    /// Cost parameter.
    Cost,
    /// Password.
    Password,
}

/// Key derivation operation.
#[derive(Debug, Default)]
pub struct KeyDerivationOperation {
    alg: Option<Algorithm>,
    kdk: Option<KeyId>,
    fixed_input: Zeroizing<Vec<u8>>,
    label_len: usize,
    context_len: usize,
    can_derive: bool,
    capacity: usize,
    capacity_set: bool,
}

impl KeyDerivationOperation {
    /// Creates an inactive operation.
    pub fn new() -> Self {
        Self::default()
    }

    fn alg(&self) -> KeyMgmtResult<Algorithm> {
        self.alg.ok_or_else(|| {
            tracing::error!("Derivation operation not set up");
            KeyMgmtError::BadState
        })
    }

    fn from_root(&self) -> bool {
        self.kdk.is_some_and(is_hardware_root)
    }

    /// Starts a derivation.
    ///
    /// # Errors
    /// * `KeyMgmtError::BadState` - If the operation is already active.
    /// * `KeyMgmtError::InvalidArgument` - If `alg` is not a key derivation algorithm.
    /// * `KeyMgmtError::NotSupported` - If `alg` is not an SP800-108 counter mode
    ///   with CMAC or HMAC-SHA256.
    #[instrument(skip(self))]
    pub fn setup(&mut self, alg: Algorithm) -> KeyMgmtResult<()> {
        if self.alg.is_some() {
            tracing::error!("Derivation operation already active");
            Err(KeyMgmtError::BadState)?
        }
        if !alg.is_key_derivation() {
            tracing::error!(%alg, "Not a key derivation algorithm");
            Err(KeyMgmtError::InvalidArgument)?
        }
        if !matches!(
            alg,
            Algorithm::Sp800108CounterCmac | Algorithm::Sp800108CounterHmac(HashAlg::Sha256)
        ) {
            tracing::error!(%alg, "Key derivation algorithm not supported");
            Err(KeyMgmtError::NotSupported)?
        }

        *self = Self {
            alg: Some(alg),
            capacity: DERIVATION_MAX_CAPACITY,
            ..Default::default()
        };
        Ok(())
    }

    /// Remaining capacity in bytes.
    pub fn capacity(&self) -> KeyMgmtResult<usize> {
        self.alg()?;
        Ok(self.capacity)
    }

    /// Lowers the capacity. The capacity can be set once.
    ///
    /// # Errors
    /// * `KeyMgmtError::NotPermitted` - If the capacity was already set.
    /// * `KeyMgmtError::InvalidArgument` - If `capacity` exceeds the current capacity.
    pub fn set_capacity(&mut self, capacity: usize) -> KeyMgmtResult<()> {
        self.alg()?;
        if self.capacity_set {
            tracing::error!("Derivation capacity already set");
            Err(KeyMgmtError::NotPermitted)?
        }
        if capacity > self.capacity {
            tracing::error!(capacity, current = self.capacity, "Capacity can only be lowered");
            Err(KeyMgmtError::InvalidArgument)?
        }
        self.capacity = capacity;
        self.capacity_set = true;
        Ok(())
    }

    /// Provides the label or the context of the fixed input.
    ///
    /// The key derivation key must be set first, and the label before the context.
    #[instrument(skip(self, data), fields(len = data.len()))]
    pub fn input_bytes(&mut self, step: DerivationStep, data: &[u8]) -> KeyMgmtResult<()> {
        self.alg()?;
        if data.is_empty() {
            tracing::error!(%step, "Empty derivation input");
            Err(KeyMgmtError::InvalidArgument)?
        }
        if self.kdk.is_none() {
            tracing::error!(%step, "Derivation input before the key");
            Err(KeyMgmtError::BadState)?
        }

        match step {
            DerivationStep::Label => {
                let max = if self.from_root() { ROOT_LABEL_MAX } else { LABEL_MAX };
                if data.len() > max {
                    tracing::error!(len = data.len(), max, "Derivation label too long");
                    Err(KeyMgmtError::InvalidArgument)?
                }
                self.fixed_input = Zeroizing::new(data.to_vec());
                self.label_len = data.len();
                self.context_len = 0;
            }
            DerivationStep::Context => {
                if self.label_len == 0 {
                    tracing::error!("Derivation context before the label");
                    Err(KeyMgmtError::BadState)?
                }
                if self.from_root() {
                    self.context_len = ROOT_CONTEXT_LEN;
                    return Ok(());
                }

                let total = self.label_len + data.len();
                if total > LABEL_MAX || total + FIXED_INPUT_RESERVED < FIXED_INPUT_MIN {
                    tracing::error!(label = self.label_len, context = data.len(), "Invalid fixed input size");
                    Err(KeyMgmtError::InvalidArgument)?
                }
                self.fixed_input.truncate(self.label_len);
                self.fixed_input.push(0x00);
                self.fixed_input.extend_from_slice(data);
                self.context_len = data.len();
            }
            step => {
                tracing::error!(%step, "Unsupported derivation input");
                Err(KeyMgmtError::InvalidArgument)?
            }
        }
        Ok(())
    }

    /// Integer inputs are not used by the supported algorithms.
    pub fn input_integer(&mut self, step: DerivationStep, value: u64) -> KeyMgmtResult<()> {
        tracing::error!(%step, value, "Integer derivation input not supported");
        Err(KeyMgmtError::NotSupported)
    }

    /// Sets the key derivation key.
    ///
    /// # Arguments
    /// * `store` - Key store holding the key.
    /// * `step` - Must be [`DerivationStep::Secret`].
    /// * `id` - The HUK, the TKDK or a key with a matching algorithm.
    ///
    /// # Errors
    /// * `KeyMgmtError::NotSupported` - If `step` is not the secret.
    /// * `KeyMgmtError::InvalidArgument` - If the key does not match the algorithm.
    /// * `KeyMgmtError::NotPermitted` - If the key usage does not allow derivation.
    #[instrument(skip(self, store))]
    pub fn input_key(&mut self, store: &KeyStore, step: DerivationStep, id: KeyId) -> KeyMgmtResult<()> {
        let alg = self.alg()?;
        if step != DerivationStep::Secret {
            tracing::error!(%step, "Keys are only accepted as the secret");
            Err(KeyMgmtError::NotSupported)?
        }
        if self.kdk.is_some() {
            tracing::error!("Key derivation key already set");
            Err(KeyMgmtError::BadState)?
        }

        if id == KEY_ID_HUK {
            if alg != Algorithm::Sp800108CounterCmac {
                tracing::error!(%alg, "The HUK derives with CMAC only");
                Err(KeyMgmtError::InvalidArgument)?
            }
            self.kdk = Some(id);
            self.can_derive = true;
            return Ok(());
        }

        let attributes = store.get_key_attributes(id)?;
        let key_type = attributes.require_type()?;
        let matches = if id == KEY_ID_TKDK {
            let hmac = Algorithm::Sp800108CounterHmac(HashAlg::Sha256);
            alg == hmac
                && attributes.alg() == Some(hmac)
                && matches!(key_type, KeyType::Hmac | KeyType::Derive)
        } else {
            alg == Algorithm::Sp800108CounterCmac
                && attributes.alg() == Some(Algorithm::Sp800108CounterCmac)
                && key_type == KeyType::Aes
        };
        if !matches {
            tracing::error!(id, %alg, %key_type, "Key does not match the derivation algorithm");
            Err(KeyMgmtError::InvalidArgument)?
        }

        let usage = attributes.usage();
        if !usage.derive() && !usage.verify_derivation() {
            tracing::error!(id, ?usage, "Key usage does not allow derivation");
            Err(KeyMgmtError::NotPermitted)?
        }

        self.kdk = Some(id);
        self.can_derive = usage.derive();
        Ok(())
    }

    /// Derives a key into the asset store.
    ///
    /// # Returns
    /// * The identifier of the derived key.
    ///
    /// # Errors
    /// * `KeyMgmtError::InvalidArgument` - If the attributes are not valid for a derived key.
    /// * `KeyMgmtError::InsufficientData` - If the capacity does not cover the key.
    /// * `KeyMgmtError::BadState` - If the operation is not ready.
    /// * `KeyMgmtError::NotPermitted` - If the key only allows verifying derivations.
    #[instrument(skip(self, store), fields(id = attributes.id, bits = attributes.bits))]
    pub fn output_key(&mut self, store: &KeyStore, attributes: &KeyAttributes) -> KeyMgmtResult<KeyId> {
        if attributes.key_type.map_or(true, |key_type| key_type.is_public_key()) {
            tracing::error!(key_type = ?attributes.key_type, "Derived keys are private");
            Err(KeyMgmtError::InvalidArgument)?
        }

        let lifetime = attributes.lifetime;
        if !lifetime.is_secure_element() || !lifetime.is_asset_store() {
            tracing::error!(?lifetime, "Derived keys live in the asset store");
            Err(KeyMgmtError::InvalidArgument)?
        }

        let from_huk = self.kdk == Some(KEY_ID_HUK);
        if (from_huk && attributes.id != KEY_ID_TKDK)
            || attributes.id < KEY_ID_USER_MIN
            || (!from_huk && attributes.id >= KEY_ID_TKDK)
        {
            tracing::error!(id = attributes.id, kdk = ?self.kdk, "Identifier cannot be derived from the key");
            Err(KeyMgmtError::InvalidArgument)?
        }

        let bytes = attributes.bits.div_ceil(8);
        if bytes > self.capacity {
            tracing::error!(bytes, capacity = self.capacity, "Derivation capacity exhausted");
            Err(KeyMgmtError::InsufficientData)?
        }

        self.alg()?;
        let Some(kdk) = self.kdk else {
            tracing::error!("Key derivation key not set");
            return Err(KeyMgmtError::BadState);
        };
        if !self.can_derive {
            tracing::error!(kdk, "Key only verifies derivations");
            Err(KeyMgmtError::NotPermitted)?
        }

        let id = store.derive(attributes, kdk, &self.fixed_input)?;
        self.capacity -= bytes;
        Ok(id)
    }

    /// Byte output is not supported.
    pub fn output_bytes(&mut self, out: &mut [u8]) -> KeyMgmtResult<()> {
        tracing::error!(len = out.len(), "Derivation byte output not supported");
        Err(KeyMgmtError::NotSupported)
    }

    /// Derivation verification is not supported.
    pub fn verify_bytes(&mut self, expected: &[u8]) -> KeyMgmtResult<()> {
        tracing::error!(len = expected.len(), "Derivation verification not supported");
        Err(KeyMgmtError::NotSupported)
    }

    /// Key agreement inputs are not supported.
    pub fn key_agreement(&mut self, step: DerivationStep, private_key: KeyId, peer: &[u8]) -> KeyMgmtResult<()> {
        tracing::error!(%step, private_key, len = peer.len(), "Key agreement not supported");
        Err(KeyMgmtError::NotSupported)
    }

    /// Ends the operation and wipes its state.
    pub fn abort(&mut self) {
        *self = Self::default();
    }
}
