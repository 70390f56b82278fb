// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! PSA key management over a hardware asset store.
//!
//! The [`KeyStore`] keeps key slots for volatile, persistent and asset store
//! keys. Depending on where a key lives its material is held as plaintext, as
//! blobs wrapped by the hardware key blob KEK, or only inside the asset store.
//! Keys are loaded into assets on demand for the cryptographic operations and
//! handed back when the operation ends.
//!
//! Keys derived from the hardware unique key or from other key derivation keys
//! are produced with a [`KeyDerivationOperation`].

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod algorithm;
pub mod attributes;
mod cleanup;
pub mod config;
mod der;
mod derivation;
mod error;
pub mod format;
mod keystore;
mod persist;
pub mod policy;
mod pubkey;
mod slot;
mod table;

pub use derivation::*;
pub use error::*;
pub use keystore::KeyInfo;
pub use keystore::KeyStore;
pub use keystore::LoadRequest;
pub use keystore::LoadedKey;
pub use slot::Direction;
