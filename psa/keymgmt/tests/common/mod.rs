// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![allow(dead_code)]

use std::sync::Arc;

use azihsm_psa_keymgmt::algorithm::*;
use azihsm_psa_keymgmt::attributes::*;
use azihsm_psa_keymgmt::config::KeyStoreConfig;
use azihsm_psa_keymgmt::KeyStore;
use azihsm_psa_sim::SimAssetStore;
use azihsm_psa_sim::SimPersistentStore;

pub struct TestContext {
    pub store: KeyStore,
    pub sim: SimAssetStore,
    pub storage: SimPersistentStore,
}

impl TestContext {
    /// Key store over the same hardware and backing store, as after a restart.
    pub fn restart(&self, config: KeyStoreConfig) -> KeyStore {
        KeyStore::new(
            config,
            Arc::new(self.sim.clone()),
            Arc::new(self.storage.clone()),
        )
        .expect("failed to create key store")
    }
}

pub fn setup() -> TestContext {
    setup_with(KeyStoreConfig::default())
}

pub fn setup_with(config: KeyStoreConfig) -> TestContext {
    let sim = SimAssetStore::new().expect("failed to create simulator");
    let storage = SimPersistentStore::new();
    let store = KeyStore::new(config, Arc::new(sim.clone()), Arc::new(storage.clone()))
        .expect("failed to create key store");
    TestContext {
        store,
        sim,
        storage,
    }
}

pub fn aes_ctr(persistence: KeyPersistence, location: KeyLocation, usage: KeyUsage) -> KeyAttributes {
    KeyAttributes::new(KeyType::Aes, 128)
        .with_lifetime(persistence, location)
        .with_usage(usage)
        .with_algorithm(Algorithm::Ctr)
}

pub fn encrypt() -> KeyUsage {
    KeyUsage::new().with_encrypt(true)
}

/// Asserts that no slot is left locked.
pub fn assert_unlocked(store: &KeyStore, ids: &[KeyId]) {
    for id in ids {
        let info = store.get_key(*id).expect("key should exist");
        assert!(!info.in_use, "key {id:#x} left in use");
    }
}
