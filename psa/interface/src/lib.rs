// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Interface between the PSA key management engine and the hardware asset store.
//!
//! The engine never talks to the hardware directly. Everything it needs from
//! the secure element goes through the [`AssetStore`] trait, and everything it
//! needs from non-volatile storage goes through the [`PersistentStore`] trait.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod error;
mod policy;
mod store;
mod token;
mod vector;

pub use error::*;
pub use policy::*;
pub use store::*;
pub use token::*;
pub use vector::*;

/// Handle to an asset held by the hardware asset store.
///
/// The raw value `0` is reserved for "no asset" and can never be wrapped in an
/// `AssetId`; absence is expressed with `Option<AssetId>`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssetId(u32);

impl AssetId {
    /// Raw value the hardware uses for an invalid asset.
    pub const RAW_INVALID: u32 = 0;

    /// Creates an asset handle from its raw hardware value.
    ///
    /// # Returns
    /// * `None` - If `raw` is the invalid asset value.
    pub const fn from_raw(raw: u32) -> Option<Self> {
        if raw == Self::RAW_INVALID {
            None
        } else {
            Some(Self(raw))
        }
    }

    /// Returns the raw hardware value.
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for AssetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Well-known asset number of the Hardware Unique Key.
pub const ASSET_NUMBER_HUK: u32 = 0x61;

/// Bytes a wrapped key blob adds to the wrapped material.
pub const KEY_BLOB_OVERHEAD: usize = 16;

/// Size of the wrapped blob produced for `asset_size` bytes of material.
pub const fn key_blob_size(asset_size: usize) -> usize {
    KEY_BLOB_OVERHEAD + asset_size
}
