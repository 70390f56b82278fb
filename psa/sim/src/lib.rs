// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! In-memory simulation of the hardware asset store and the persistent
//! backing store.
//!
//! The simulator enforces the parts of the asset model the key management
//! engine relies on: assets are loaded exactly once, wrapped blobs only
//! unwrap into assets with the policy they were produced for, derivation
//! needs a key derivation key, and every dynamic asset must be freed.
//! Public key tokens produce real P-256, P-384, X25519 and Ed25519 keys.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod crypto;
mod ecc;
mod persist;
mod table;

use std::sync::Arc;

use azihsm_psa_interface::*;
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::instrument;
use zeroize::Zeroizing;

pub use crate::persist::SimPersistentStore;
use crate::table::AssetTable;

/// Default number of asset slots.
pub const DEFAULT_ASSET_CAPACITY: usize = 64;

/// Well-known asset number of the simulated key blob KEK.
pub const ASSET_NUMBER_KEK: u32 = 0x62;

const STATIC_KEY_SIZE: usize = 32;

/// Operations that can be made to fail once with [`SimAssetStore::inject_fault`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SimFault {
    /// `alloc`
    Alloc,
    /// `free`
    Free,
    /// `load_plaintext`
    LoadPlaintext,
    /// `load_import`
    LoadImport,
    /// `load_random`
    LoadRandom,
    /// `load_derive`
    LoadDerive,
    /// `load_plaintext_export`
    LoadPlaintextExport,
    /// `exchange_token`
    Token,
}

/// Result code reported for injected faults.
pub const SIM_FAULT_CODE: i32 = -1;

/// Simulated hardware asset store.
#[derive(Debug, Clone)]
pub struct SimAssetStore {
    inner: Arc<RwLock<SimInner>>,
}

impl SimAssetStore {
    /// Creates a simulator with [`DEFAULT_ASSET_CAPACITY`] asset slots.
    pub fn new() -> AssetResult<Self> {
        Self::with_capacity(DEFAULT_ASSET_CAPACITY)
    }

    /// Creates a simulator with room for `capacity` dynamic assets.
    ///
    /// The Hardware Unique Key and the key blob KEK are provisioned as static
    /// assets on top of that.
    ///
    /// # Errors
    /// * `AssetError::InvalidParameter` - If `capacity` is zero.
    pub fn with_capacity(capacity: usize) -> AssetResult<Self> {
        if capacity == 0 {
            Err(AssetError::InvalidParameter)?
        }

        tracing::debug!(capacity, "Creating simulated asset store");
        Ok(Self {
            inner: Arc::new(RwLock::new(SimInner::new(capacity)?)),
        })
    }

    /// Sets whether callers are reported as running in the secure world.
    pub fn set_access_secure(&self, secure: bool) {
        self.inner.write().secure = secure;
    }

    /// Sets whether [`AssetStore::key_blob_kek`] reports a KEK.
    pub fn set_kek_available(&self, available: bool) {
        self.inner.write().kek_available = available;
    }

    /// Makes the next call of `op` fail with a hardware error.
    pub fn inject_fault(&self, op: SimFault) {
        self.inner.write().faults.push(op);
    }

    /// Number of live dynamic assets.
    pub fn live_assets(&self) -> usize {
        self.inner.read().table.live_count()
    }

    /// Number of successful derivations.
    pub fn derive_count(&self) -> usize {
        self.inner.read().derive_count
    }

    /// Returns the policy of a live asset.
    pub fn asset_policy(&self, asset: AssetId) -> Option<AssetPolicy> {
        self.inner
            .read()
            .table
            .get(asset)
            .ok()
            .map(|entry| entry.policy())
    }

    /// Returns the content of a loaded asset.
    pub fn asset_content(&self, asset: AssetId) -> Option<Zeroizing<Vec<u8>>> {
        let inner = self.inner.read();
        let content = inner.table.get(asset).ok()?.content().ok()?;
        Some(Zeroizing::new(content.to_vec()))
    }
}

#[derive(Debug)]
struct SimInner {
    table: AssetTable,
    kek: AssetId,
    kek_available: bool,
    secure: bool,
    faults: Vec<SimFault>,
    derive_count: usize,
}

impl SimInner {
    fn new(capacity: usize) -> AssetResult<Self> {
        let mut table = AssetTable::new(capacity + 2);

        let huk = table.insert(
            AssetPolicy::SYM_DERIVE | AssetPolicy::SCAD_TRUSTED,
            STATIC_KEY_SIZE,
            Some(ASSET_NUMBER_HUK),
        )?;
        let kek = table.insert(
            AssetPolicy::SYM_BASE | AssetPolicy::SCUI_WRAP,
            STATIC_KEY_SIZE,
            Some(ASSET_NUMBER_KEK),
        )?;

        for asset in [huk, kek] {
            let mut secret = Zeroizing::new([0u8; STATIC_KEY_SIZE]);
            OsRng.fill_bytes(&mut secret[..]);
            table.get_mut(asset)?.load(&secret[..])?;
        }

        Ok(Self {
            table,
            kek,
            kek_available: true,
            secure: true,
            faults: Vec::new(),
            derive_count: 0,
        })
    }

    fn check_fault(&mut self, op: SimFault) -> AssetResult<()> {
        if let Some(pos) = self.faults.iter().position(|fault| *fault == op) {
            self.faults.remove(pos);
            tracing::error!(?op, "Injected fault");
            Err(AssetError::HardwareFailure(SIM_FAULT_CODE))?
        }
        Ok(())
    }

    fn wrapping_key(&self, kek: AssetId) -> AssetResult<Zeroizing<Vec<u8>>> {
        let entry = self.table.get(kek)?;
        let policy = entry.policy();
        if !policy.is_symmetric() || policy & AssetPolicy::SCUI_MASK != AssetPolicy::SCUI_WRAP {
            tracing::error!(%kek, %policy, "Asset is not a key wrap key");
            Err(AssetError::PolicyViolation)?
        }
        Ok(Zeroizing::new(entry.content()?.to_vec()))
    }

    fn derivation_key(&self, kdk: AssetId) -> AssetResult<Zeroizing<Vec<u8>>> {
        let entry = self.table.get(kdk)?;
        let policy = entry.policy();
        if !policy.is_symmetric() || policy & AssetPolicy::SCUI_MASK != AssetPolicy::SCUI_DERIVE {
            tracing::error!(%kdk, %policy, "Asset is not a key derivation key");
            Err(AssetError::PolicyViolation)?
        }
        Ok(Zeroizing::new(entry.content()?.to_vec()))
    }

    fn curve_domain(&self, domain: AssetId, bits: u16, method: PkMethod) -> AssetResult<CurveDomain> {
        let entry = self.table.get(domain)?;
        let policy = entry.policy();
        if !policy.is_asymmetric() || !policy.contains(AssetPolicy::ACUI_PARAMETERS) {
            tracing::error!(%domain, %policy, "Asset is not a domain parameters asset");
            Err(AssetError::PolicyViolation)?
        }

        let curve = CurveDomain::from_bytes(entry.content()?)?;
        let method_matches = match curve.family {
            CurveFamily::NistP | CurveFamily::Brainpool => method == PkMethod::EcdhEcdsa,
            CurveFamily::Montgomery => method == PkMethod::Curve25519,
            CurveFamily::TwistedEdwards => method == PkMethod::EdDsa,
        };
        if curve.bits != bits || !method_matches {
            tracing::error!(?curve, bits, ?method, "Token does not match the curve domain");
            Err(AssetError::InvalidParameter)?
        }
        Ok(curve)
    }

    fn check_key_asset(&self, asset: AssetId, size: usize) -> AssetResult<()> {
        let entry = self.table.get(asset)?;
        entry.check_empty()?;
        if !entry.policy().is_asymmetric() {
            Err(AssetError::PolicyViolation)?
        }
        if entry.size() != size {
            tracing::error!(%asset, expected = size, actual = entry.size(), "Key asset size mismatch");
            Err(AssetError::InvalidParameter)?
        }
        Ok(())
    }

    fn gen_key_pair(
        &mut self,
        bits: u16,
        curve: CurveDomain,
        private_key: AssetId,
        public_key: AssetId,
        kek: Option<AssetId>,
    ) -> AssetResult<PkResult> {
        let component_size = subvector_size(bits as usize);
        self.check_key_asset(private_key, component_size)?;
        self.check_key_asset(
            public_key,
            component_size * curve.family.public_components(),
        )?;

        let private = ecc::generate(curve.family, bits)?;
        let public = ecc::public_key(curve.family, bits, &private)?;
        let private_vector = encode_private(curve, &private)?;
        let public_vector = encode_public(curve, &public)?;

        let blob = match kek {
            Some(kek) => {
                let kek = self.wrapping_key(kek)?;
                let policy = self.table.get(private_key)?.policy();
                Some(crypto::wrap_key(&kek, policy, &private_vector))
            }
            None => None,
        };

        self.table.get_mut(private_key)?.load(&private_vector)?;
        self.table.get_mut(public_key)?.load(&public_vector)?;

        Ok(blob.map_or(PkResult::Complete, PkResult::KeyBlob))
    }

    fn gen_public_key(
        &mut self,
        bits: u16,
        curve: CurveDomain,
        private_key: AssetId,
        public_key: Option<AssetId>,
    ) -> AssetResult<PkResult> {
        let private = decode_private(curve, self.table.get(private_key)?.content()?)?;
        let public = ecc::public_key(curve.family, bits, &private)?;
        let public_vector = encode_public(curve, &public)?;

        match public_key {
            Some(asset) => {
                self.check_key_asset(asset, public_vector.len())?;
                self.table.get_mut(asset)?.load(&public_vector)?;
                Ok(PkResult::Complete)
            }
            None => Ok(PkResult::PublicKey(public_vector)),
        }
    }
}

fn encode_component(
    curve: CurveDomain,
    index: u8,
    items: u8,
    value: &[u8],
    out: &mut Vec<u8>,
) -> AssetResult<()> {
    let value_len = bits_to_bytes(curve.bits as usize);
    if value.len() > value_len {
        Err(AssetError::InvalidParameter)?
    }

    let header = SubVectorHeader {
        bits: curve.bits,
        index,
        items,
    };
    out.extend_from_slice(&header.to_bytes());

    let start = out.len();
    if curve.family.is_little_endian() {
        out.extend_from_slice(value);
    } else {
        out.extend(value.iter().rev());
    }
    out.resize(start + bits_to_word_bytes(curve.bits as usize), 0);
    Ok(())
}

fn encode_private(curve: CurveDomain, value: &[u8]) -> AssetResult<Zeroizing<Vec<u8>>> {
    let mut out = Zeroizing::new(Vec::with_capacity(subvector_size(curve.bits as usize)));
    encode_component(curve, 0, curve.family.private_items(), value, &mut out)?;
    Ok(out)
}

fn encode_public(curve: CurveDomain, components: &[Vec<u8>]) -> AssetResult<Vec<u8>> {
    let items = curve.family.public_items();
    let mut out = Vec::with_capacity(subvector_size(curve.bits as usize) * components.len());
    for (index, component) in components.iter().enumerate() {
        let items = if index == 0 { items } else { items & 0x0F };
        encode_component(curve, index as u8, items, component, &mut out)?;
    }
    Ok(out)
}

fn decode_private(curve: CurveDomain, data: &[u8]) -> AssetResult<Zeroizing<Vec<u8>>> {
    let (header, value) = subvector_value(data)?;
    if header.bits != curve.bits {
        Err(AssetError::InvalidParameter)?
    }

    let value = if curve.family.is_little_endian() {
        value.to_vec()
    } else {
        value.iter().rev().copied().collect()
    };
    Ok(Zeroizing::new(value))
}

impl AssetStore for SimAssetStore {
    #[instrument(skip(self))]
    fn alloc(&self, policy: AssetPolicy, size: usize) -> AssetResult<AssetId> {
        let mut inner = self.inner.write();
        inner.check_fault(SimFault::Alloc)?;
        let asset = inner.table.insert(policy, size, None)?;
        tracing::debug!(%asset, "Asset allocated");
        Ok(asset)
    }

    #[instrument(skip(self))]
    fn free(&self, asset: AssetId) -> AssetResult<()> {
        let mut inner = self.inner.write();
        inner.check_fault(SimFault::Free)?;
        inner.table.remove(asset)
    }

    #[instrument(skip(self, data))]
    fn load_plaintext(&self, asset: AssetId, data: &[u8]) -> AssetResult<()> {
        let mut inner = self.inner.write();
        inner.check_fault(SimFault::LoadPlaintext)?;
        inner.table.get_mut(asset)?.load(data)
    }

    #[instrument(skip(self, blob))]
    fn load_import(&self, asset: AssetId, kek: AssetId, blob: &[u8]) -> AssetResult<()> {
        let mut inner = self.inner.write();
        inner.check_fault(SimFault::LoadImport)?;

        let kek = inner.wrapping_key(kek)?;
        let entry = inner.table.get(asset)?;
        entry.check_empty()?;
        if blob.len() != key_blob_size(entry.size()) {
            tracing::error!(%asset, len = blob.len(), "Key blob size mismatch");
            Err(AssetError::InvalidParameter)?
        }

        let plaintext = crypto::unwrap_key(&kek, entry.policy(), blob)?;
        inner.table.get_mut(asset)?.load(&plaintext)
    }

    #[instrument(skip(self))]
    fn load_random(&self, asset: AssetId) -> AssetResult<()> {
        let mut inner = self.inner.write();
        inner.check_fault(SimFault::LoadRandom)?;

        let entry = inner.table.get_mut(asset)?;
        let mut data = Zeroizing::new(vec![0u8; entry.size()]);
        OsRng.fill_bytes(&mut data);
        entry.load(&data)
    }

    #[instrument(skip(self, context))]
    fn load_derive(
        &self,
        asset: AssetId,
        kdk: AssetId,
        context: &[u8],
        counter_mode: bool,
    ) -> AssetResult<()> {
        let mut inner = self.inner.write();
        inner.check_fault(SimFault::LoadDerive)?;

        let kdk = inner.derivation_key(kdk)?;
        let entry = inner.table.get_mut(asset)?;
        entry.check_empty()?;
        let derived = crypto::derive(&kdk, context, counter_mode, entry.size());
        entry.load(&derived)?;

        inner.derive_count += 1;
        Ok(())
    }

    #[instrument(skip(self, data))]
    fn load_plaintext_export(
        &self,
        asset: AssetId,
        data: &[u8],
        kek: AssetId,
    ) -> AssetResult<Vec<u8>> {
        let mut inner = self.inner.write();
        inner.check_fault(SimFault::LoadPlaintextExport)?;

        let kek = inner.wrapping_key(kek)?;
        let entry = inner.table.get_mut(asset)?;
        entry.load(data)?;
        Ok(crypto::wrap_key(&kek, entry.policy(), data))
    }

    fn key_blob_kek(&self) -> AssetResult<Option<AssetId>> {
        let inner = self.inner.read();
        Ok(inner.kek_available.then_some(inner.kek))
    }

    fn search(&self, asset_number: u32) -> AssetResult<AssetId> {
        self.inner
            .read()
            .table
            .find_number(asset_number)
            .ok_or(AssetError::InvalidParameter)
    }

    fn random(&self, buf: &mut [u8]) -> AssetResult<()> {
        OsRng.fill_bytes(buf);
        Ok(())
    }

    #[instrument(skip(self))]
    fn exchange_token(&self, command: &PkCommand) -> AssetResult<PkResult> {
        let mut inner = self.inner.write();
        inner.check_fault(SimFault::Token)?;

        match *command {
            PkCommand::GenKeyPair {
                method,
                bits,
                domain,
                private_key,
                public_key,
                kek,
            } => {
                let curve = inner.curve_domain(domain, bits, method)?;
                inner.gen_key_pair(bits, curve, private_key, public_key, kek)
            }
            PkCommand::GenPublicKey {
                method,
                bits,
                domain,
                private_key,
                public_key,
            } => {
                let curve = inner.curve_domain(domain, bits, method)?;
                inner.gen_public_key(bits, curve, private_key, public_key)
            }
        }
    }

    fn is_access_secure(&self) -> bool {
        self.inner.read().secure
    }
}

#[cfg(test)]
mod tests {
    use test_with_tracing::test;

    use super::*;

    fn p256_domain(sim: &SimAssetStore) -> AssetId {
        let curve = CurveDomain {
            family: CurveFamily::NistP,
            bits: 256,
        };
        let domain = sim
            .alloc(AssetPolicy::ASYM_KEY_PARAMS, CurveDomain::ENCODED_LEN)
            .unwrap();
        sim.load_plaintext(domain, &curve.to_bytes()).unwrap();
        domain
    }

    #[test]
    fn test_static_assets() {
        let sim = SimAssetStore::new().unwrap();
        let huk = sim.search(ASSET_NUMBER_HUK).unwrap();
        let kek = sim.key_blob_kek().unwrap().unwrap();

        assert_ne!(huk, kek);
        assert_eq!(sim.free(huk), Err(AssetError::PolicyViolation));
        assert_eq!(sim.live_assets(), 0);

        sim.set_kek_available(false);
        assert_eq!(sim.key_blob_kek(), Ok(None));
    }

    #[test]
    fn test_wrap_and_import() {
        let sim = SimAssetStore::new().unwrap();
        let kek = sim.key_blob_kek().unwrap().unwrap();
        let policy = AssetPolicy::SYM_CIPHER_BULK | AssetPolicy::DIR_ENC_GEN;

        let first = sim.alloc(policy, 16).unwrap();
        let blob = sim.load_plaintext_export(first, &[3u8; 16], kek).unwrap();
        assert_eq!(blob.len(), key_blob_size(16));

        let second = sim.alloc(policy, 16).unwrap();
        sim.load_import(second, kek, &blob).unwrap();
        assert_eq!(sim.asset_content(second).unwrap().as_slice(), &[3u8; 16]);

        let other = sim.alloc(policy ^ AssetPolicy::DIR_MASK, 16).unwrap();
        assert_eq!(
            sim.load_import(other, kek, &blob),
            Err(AssetError::AuthenticationFailed)
        );

        for asset in [first, second, other] {
            sim.free(asset).unwrap();
        }
        assert_eq!(sim.live_assets(), 0);
    }

    #[test]
    fn test_derive_requires_kdk() {
        let sim = SimAssetStore::new().unwrap();
        let huk = sim.search(ASSET_NUMBER_HUK).unwrap();
        let kek = sim.key_blob_kek().unwrap().unwrap();

        let target = sim.alloc(AssetPolicy::SYM_DERIVE, 32).unwrap();
        assert_eq!(
            sim.load_derive(target, kek, b"ctx", true),
            Err(AssetError::PolicyViolation)
        );
        sim.load_derive(target, huk, b"ctx", false).unwrap();
        assert_eq!(sim.derive_count(), 1);
        assert_eq!(
            sim.load_derive(target, huk, b"ctx", false),
            Err(AssetError::PolicyViolation)
        );
    }

    #[test]
    fn test_injected_fault_fires_once() {
        let sim = SimAssetStore::new().unwrap();
        sim.inject_fault(SimFault::Alloc);

        assert_eq!(
            sim.alloc(AssetPolicy::SYM_DERIVE, 32),
            Err(AssetError::HardwareFailure(SIM_FAULT_CODE))
        );
        assert!(sim.alloc(AssetPolicy::SYM_DERIVE, 32).is_ok());
    }

    #[test]
    fn test_gen_key_pair_p256() {
        let sim = SimAssetStore::new().unwrap();
        let domain = p256_domain(&sim);
        let policy = AssetPolicy::ASYM_SIGN_VERIFY
            | AssetPolicy::ACA_ECDSA
            | AssetPolicy::ACH_SHA256
            | AssetPolicy::PRIVATE_DATA;
        let private_key = sim.alloc(policy, subvector_size(256)).unwrap();
        let public_key = sim
            .alloc(policy.to_public(), 2 * subvector_size(256))
            .unwrap();
        let kek = sim.key_blob_kek().unwrap();

        let result = sim
            .exchange_token(&PkCommand::GenKeyPair {
                method: PkMethod::EcdhEcdsa,
                bits: 256,
                domain,
                private_key,
                public_key,
                kek,
            })
            .unwrap();
        let PkResult::KeyBlob(blob) = result else {
            panic!("expected a key blob, got {result:?}");
        };
        assert_eq!(blob.len(), key_blob_size(subvector_size(256)));

        let public = sim.asset_content(public_key).unwrap();
        assert_eq!(&public[..4], &[0x00, 0x01, 0x00, 0x02]);
        assert_eq!(&public[36..40], &[0x00, 0x01, 0x01, 0x02]);

        let derived = sim
            .exchange_token(&PkCommand::GenPublicKey {
                method: PkMethod::EcdhEcdsa,
                bits: 256,
                domain,
                private_key,
                public_key: None,
            })
            .unwrap();
        assert_eq!(derived, PkResult::PublicKey(public.to_vec()));
    }

    #[test]
    fn test_token_method_must_match_domain() {
        let sim = SimAssetStore::new().unwrap();
        let domain = p256_domain(&sim);
        let private_key = sim
            .alloc(AssetPolicy::ASYM_KEY_EXCHANGE, subvector_size(256))
            .unwrap();

        assert_eq!(
            sim.exchange_token(&PkCommand::GenPublicKey {
                method: PkMethod::Curve25519,
                bits: 256,
                domain,
                private_key,
                public_key: None,
            }),
            Err(AssetError::InvalidParameter)
        );
    }
}
