// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Asset store error module

use thiserror::Error;

/// Errors reported by the asset store and the persistent backing store.
#[derive(Error, Debug, PartialEq, Eq, Copy, Clone)]
pub enum AssetError {
    /// A parameter of the request is invalid.
    #[error("invalid parameter")]
    InvalidParameter,

    /// The asset handle does not refer to a live asset.
    #[error("invalid asset")]
    InvalidAsset,

    /// The asset store has no room for another asset.
    #[error("asset store out of resources")]
    OutOfResources,

    /// The asset policy does not allow the requested operation.
    #[error("asset policy violation")]
    PolicyViolation,

    /// A wrapped blob failed to authenticate under the supplied key and policy.
    #[error("key blob authentication failed")]
    AuthenticationFailed,

    /// The request is valid but the hardware cannot perform it.
    #[error("operation not supported")]
    Unsupported,

    /// No persistent record exists for the identifier.
    #[error("record not found")]
    NotFound,

    /// A persistent record with the identifier already exists.
    #[error("record already exists")]
    AlreadyExists,

    /// The persistent backing store failed.
    #[error("storage failure")]
    StorageFailure,

    /// The hardware rejected a token with the given result code.
    #[error("hardware failure ({0})")]
    HardwareFailure(i32),
}

/// Result type for asset store operations.
pub type AssetResult<T> = Result<T, AssetError>;
