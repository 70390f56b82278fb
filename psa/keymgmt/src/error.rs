// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Key management error module

use azihsm_psa_interface::AssetError;
use thiserror::Error;

/// Key management error
#[derive(Error, Debug, PartialEq, Eq, Copy, Clone)]
pub enum KeyMgmtError {
    /// Invalid argument
    #[error("invalid argument")]
    InvalidArgument,

    /// Output buffer too small
    #[error("buffer too small")]
    BufferTooSmall,

    /// No free key slot or storage space
    #[error("insufficient storage")]
    InsufficientStorage,

    /// Memory or asset resources exhausted
    #[error("insufficient memory")]
    InsufficientMemory,

    /// Derivation capacity too low
    #[error("insufficient data")]
    InsufficientData,

    /// A key with the identifier already exists
    #[error("key already exists")]
    AlreadyExists,

    /// No key with the identifier exists
    #[error("key does not exist")]
    DoesNotExist,

    /// The key slot is locked by another operation
    #[error("key in use")]
    KeyInUse,

    /// Invalid or busy key handle
    #[error("invalid handle")]
    InvalidHandle,

    /// The key policy does not permit the operation
    #[error("operation not permitted")]
    NotPermitted,

    /// The operation is not supported
    #[error("operation not supported")]
    NotSupported,

    /// Operation called in the wrong order
    #[error("bad state")]
    BadState,

    /// Internal state is inconsistent
    #[error("corruption detected")]
    CorruptionDetected,

    /// Backing store failure
    #[error("storage failure")]
    StorageFailure,

    /// Hardware failure
    #[error("hardware failure")]
    HardwareFailure,
}

impl From<AssetError> for KeyMgmtError {
    fn from(err: AssetError) -> Self {
        match err {
            AssetError::InvalidParameter => KeyMgmtError::InvalidArgument,
            AssetError::OutOfResources => KeyMgmtError::InsufficientMemory,
            AssetError::NotFound => KeyMgmtError::DoesNotExist,
            AssetError::AlreadyExists => KeyMgmtError::AlreadyExists,
            AssetError::StorageFailure => KeyMgmtError::StorageFailure,
            AssetError::InvalidAsset
            | AssetError::PolicyViolation
            | AssetError::AuthenticationFailed
            | AssetError::Unsupported
            | AssetError::HardwareFailure(_) => KeyMgmtError::HardwareFailure,
        }
    }
}

/// Result type for key management operations.
pub type KeyMgmtResult<T> = Result<T, KeyMgmtError>;
