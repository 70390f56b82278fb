// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Capability traits for the hardware asset store and the backing store.

use crate::AssetId;
use crate::AssetPolicy;
use crate::AssetResult;
use crate::PkCommand;
use crate::PkResult;

/// Hardware asset store.
///
/// Every call may fail with a hardware or resource error. Implementations
/// are expected to be internally synchronized.
pub trait AssetStore: Send + Sync {
    /// Allocates an empty asset of `size` bytes governed by `policy`.
    fn alloc(&self, policy: AssetPolicy, size: usize) -> AssetResult<AssetId>;

    /// Releases an asset. The handle is invalid afterwards.
    fn free(&self, asset: AssetId) -> AssetResult<()>;

    /// Loads plaintext content into an empty asset.
    fn load_plaintext(&self, asset: AssetId, data: &[u8]) -> AssetResult<()>;

    /// Unwraps `blob` with `kek` into an empty asset.
    ///
    /// The blob must have been produced for an asset with the same policy.
    fn load_import(&self, asset: AssetId, kek: AssetId, blob: &[u8]) -> AssetResult<()>;

    /// Fills an empty asset with random content.
    fn load_random(&self, asset: AssetId) -> AssetResult<()>;

    /// Derives the content of an empty asset from the key derivation key
    /// `kdk` and the fixed input `context`.
    ///
    /// `counter_mode` selects SP800-108 counter mode; otherwise feedback mode
    /// is used.
    fn load_derive(
        &self,
        asset: AssetId,
        kdk: AssetId,
        context: &[u8],
        counter_mode: bool,
    ) -> AssetResult<()>;

    /// Loads plaintext content into an empty asset and returns the content
    /// wrapped with `kek`.
    fn load_plaintext_export(
        &self,
        asset: AssetId,
        data: &[u8],
        kek: AssetId,
    ) -> AssetResult<Vec<u8>>;

    /// Returns the key blob key encryption key, if the store provides one.
    fn key_blob_kek(&self) -> AssetResult<Option<AssetId>>;

    /// Looks up a static asset by its well-known number.
    fn search(&self, asset_number: u32) -> AssetResult<AssetId>;

    /// Fills `buf` with output of the hardware random number generator.
    fn random(&self, buf: &mut [u8]) -> AssetResult<()>;

    /// Runs a public key token.
    fn exchange_token(&self, command: &PkCommand) -> AssetResult<PkResult>;

    /// Returns `true` when the caller runs in the secure world.
    fn is_access_secure(&self) -> bool;
}

/// Non-volatile backing store for persistent keys.
///
/// Records are addressed by key identifier. Implementer is responsible for
/// atomicity of individual operations.
pub trait PersistentStore: Send + Sync {
    /// Reads the record for `uid`.
    ///
    /// Returns `Err(AssetError::NotFound)` when the record does not exist.
    fn read(&self, uid: u32) -> AssetResult<Vec<u8>>;

    /// Writes the record for `uid` (create or overwrite).
    fn write(&self, uid: u32, data: &[u8]) -> AssetResult<()>;

    /// Deletes the record for `uid`. No error if it doesn't exist.
    fn clear(&self, uid: u32) -> AssetResult<()>;

    /// Returns the size of the record for `uid`, or `None` if there is none.
    fn info(&self, uid: u32) -> AssetResult<Option<usize>>;
}
