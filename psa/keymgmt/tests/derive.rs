// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

mod common;

use azihsm_psa_interface::PersistentStore;
use azihsm_psa_keymgmt::algorithm::*;
use azihsm_psa_keymgmt::attributes::*;
use azihsm_psa_keymgmt::DerivationStep;
use azihsm_psa_keymgmt::KeyDerivationOperation;
use azihsm_psa_keymgmt::KeyMgmtError;
use azihsm_psa_keymgmt::KeyStore;
use azihsm_psa_keymgmt::LoadRequest;
use azihsm_psa_keymgmt::LoadedKey;
use azihsm_psa_sim::SimFault;
use test_with_tracing::test;

use crate::common::*;

fn tkdk() -> KeyAttributes {
    KeyAttributes::new(KeyType::Derive, 256)
        .with_id(KEY_ID_TKDK)
        .with_lifetime(KeyPersistence::HsmAssetStore, KeyLocation::PrimarySecureElement)
        .with_usage(KeyUsage::new().with_derive(true))
        .with_algorithm(Algorithm::Sp800108CounterHmac(HashAlg::Sha256))
}

fn app_key(id: KeyId) -> KeyAttributes {
    aes_ctr(
        KeyPersistence::HsmAssetStore,
        KeyLocation::PrimarySecureElement,
        encrypt(),
    )
    .with_id(id)
}

fn derive_from_huk(store: &KeyStore) -> Result<KeyId, KeyMgmtError> {
    let mut op = KeyDerivationOperation::new();
    op.setup(Algorithm::Sp800108CounterCmac)?;
    op.input_key(store, DerivationStep::Secret, KEY_ID_HUK)?;
    op.input_bytes(DerivationStep::Label, b"trusted key derivation key")?;
    op.input_bytes(DerivationStep::Context, b"unused")?;
    op.output_key(store, &tkdk())
}

fn derive_from_tkdk(store: &KeyStore, label: &[u8], id: KeyId) -> Result<KeyId, KeyMgmtError> {
    let mut op = KeyDerivationOperation::new();
    op.setup(Algorithm::Sp800108CounterHmac(HashAlg::Sha256))?;
    op.input_key(store, DerivationStep::Secret, KEY_ID_TKDK)?;
    op.input_bytes(DerivationStep::Label, label)?;
    op.input_bytes(DerivationStep::Context, b"context")?;
    op.output_key(store, &app_key(id))
}

fn key_content(ctx: &TestContext, id: KeyId) -> Vec<u8> {
    let loaded = ctx
        .store
        .load_key(id, encrypt(), LoadRequest::Asset)
        .unwrap();
    let LoadedKey::Asset { asset, .. } = loaded else {
        panic!("unexpected load {loaded:?}");
    };
    let content = ctx.sim.asset_content(asset).unwrap().to_vec();
    ctx.store.release_key(id, &loaded).unwrap();
    content
}

#[test]
fn test_huk_into_stored_identifier() {
    let ctx = setup();
    ctx.storage.write(KEY_ID_TKDK, &[0u8; 64]).unwrap();

    assert_eq!(derive_from_huk(&ctx.store), Err(KeyMgmtError::AlreadyExists));
    assert_eq!(ctx.sim.derive_count(), 0);
    assert_eq!(ctx.sim.live_assets(), 0);
}

#[test]
fn test_derivation_chain() {
    let ctx = setup();
    assert_eq!(derive_from_huk(&ctx.store), Ok(KEY_ID_TKDK));
    assert_eq!(derive_from_huk(&ctx.store), Err(KeyMgmtError::AlreadyExists));

    let first = derive_from_tkdk(&ctx.store, b"app", 0x300).unwrap();
    let again = derive_from_tkdk(&ctx.store, b"app", 0x301).unwrap();
    let other = derive_from_tkdk(&ctx.store, b"other", 0x302).unwrap();
    assert_eq!(ctx.sim.derive_count(), 4);

    assert_eq!(key_content(&ctx, first), key_content(&ctx, again));
    assert_ne!(key_content(&ctx, first), key_content(&ctx, other));
    assert_unlocked(&ctx.store, &[KEY_ID_TKDK, first, again, other]);

    assert_eq!(
        derive_from_tkdk(&ctx.store, b"app", KEY_ID_TKDK),
        Err(KeyMgmtError::InvalidArgument)
    );
}

#[test]
fn test_derivation_from_volatile_kdk() {
    let ctx = setup();
    let kdk = ctx
        .store
        .import_key(
            &KeyAttributes::new(KeyType::Aes, 128)
                .with_lifetime(KeyPersistence::Volatile, KeyLocation::PrimarySecureElement)
                .with_usage(KeyUsage::new().with_derive(true))
                .with_algorithm(Algorithm::Sp800108CounterCmac),
            &[0x11; 16],
        )
        .unwrap();

    let mut op = KeyDerivationOperation::new();
    op.setup(Algorithm::Sp800108CounterCmac).unwrap();
    op.input_key(&ctx.store, DerivationStep::Secret, kdk).unwrap();
    op.input_bytes(DerivationStep::Label, &[b'L'; 32]).unwrap();
    op.input_bytes(DerivationStep::Context, &[b'C'; 32]).unwrap();
    op.set_capacity(32).unwrap();

    op.output_key(&ctx.store, &app_key(0x310)).unwrap();
    op.output_key(&ctx.store, &app_key(0x311)).unwrap();
    assert_eq!(
        op.output_key(&ctx.store, &app_key(0x312)),
        Err(KeyMgmtError::InsufficientData)
    );

    assert_eq!(
        op.output_key(&ctx.store, &app_key(KEY_ID_TKDK)),
        Err(KeyMgmtError::InvalidArgument)
    );
    assert_unlocked(&ctx.store, &[kdk]);
    assert_eq!(ctx.sim.live_assets(), 2, "transient KDK assets are freed");
}

#[test]
fn test_failed_kdk_release_rolls_back_derived_key() {
    let ctx = setup();
    let kdk = ctx
        .store
        .import_key(
            &KeyAttributes::new(KeyType::Aes, 128)
                .with_lifetime(KeyPersistence::Volatile, KeyLocation::PrimarySecureElement)
                .with_usage(KeyUsage::new().with_derive(true))
                .with_algorithm(Algorithm::Sp800108CounterCmac),
            &[0x22; 16],
        )
        .unwrap();

    let mut op = KeyDerivationOperation::new();
    op.setup(Algorithm::Sp800108CounterCmac).unwrap();
    op.input_key(&ctx.store, DerivationStep::Secret, kdk).unwrap();
    op.input_bytes(DerivationStep::Label, b"label").unwrap();
    op.input_bytes(DerivationStep::Context, b"context").unwrap();

    // The transient KDK asset is freed after the derived key is installed.
    ctx.sim.inject_fault(SimFault::Free);
    assert_eq!(
        op.output_key(&ctx.store, &app_key(0x400)),
        Err(KeyMgmtError::HardwareFailure)
    );
    assert_eq!(ctx.store.get_key(0x400), Err(KeyMgmtError::InvalidHandle));
    assert_eq!(ctx.sim.live_assets(), 1, "only the KDK asset that failed to free");
    assert_unlocked(&ctx.store, &[kdk]);

    assert_eq!(op.output_key(&ctx.store, &app_key(0x400)), Ok(0x400));
    assert!(ctx.store.get_key(0x400).unwrap().assets[0].is_some());
    assert_unlocked(&ctx.store, &[kdk, 0x400]);
}
