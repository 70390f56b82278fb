// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Key store configuration.

use crate::attributes::KEY_ID_VOLATILE_MAX;
use crate::attributes::KEY_ID_VOLATILE_MIN;
use crate::KeyMgmtError;
use crate::KeyMgmtResult;

/// Default number of slots caching persistent keys.
pub const DEFAULT_PERSISTENT_SLOTS: usize = 8;

/// Default number of slots holding asset store keys.
pub const DEFAULT_ASSET_STORE_SLOTS: usize = 8;

/// Default number of slots holding volatile keys.
pub const DEFAULT_VOLATILE_SLOTS: usize = 16;

/// Key store configuration.
///
/// # Validation rules
///
/// - Every region must hold at least one slot.
/// - The volatile region cannot be larger than the volatile identifier range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyStoreConfig {
    /// Number of slots caching persistent keys.
    pub persistent_slots: usize,

    /// Number of slots holding keys with asset store persistence.
    pub asset_store_slots: usize,

    /// Number of slots holding volatile keys.
    pub volatile_slots: usize,

    /// Export public keys in application format without the DER wrapping.
    pub der_bypass: bool,

    /// The hardware has differential power analysis countermeasures that
    /// private asymmetric keys must opt out of.
    pub dpa_support: bool,
}

impl Default for KeyStoreConfig {
    fn default() -> Self {
        Self {
            persistent_slots: DEFAULT_PERSISTENT_SLOTS,
            asset_store_slots: DEFAULT_ASSET_STORE_SLOTS,
            volatile_slots: DEFAULT_VOLATILE_SLOTS,
            der_bypass: true,
            dpa_support: false,
        }
    }
}

impl KeyStoreConfig {
    /// Checks the configuration.
    ///
    /// # Errors
    /// * `KeyMgmtError::InvalidArgument` - If a validation rule is broken.
    pub fn validate(&self) -> KeyMgmtResult<()> {
        let volatile_ids = (KEY_ID_VOLATILE_MAX - KEY_ID_VOLATILE_MIN) as usize + 1;

        if self.persistent_slots == 0 || self.asset_store_slots == 0 || self.volatile_slots == 0 {
            tracing::error!(config = ?self, "Key store regions must not be empty");
            Err(KeyMgmtError::InvalidArgument)?
        }

        if self.volatile_slots > volatile_ids {
            tracing::error!(
                volatile_slots = self.volatile_slots,
                volatile_ids,
                "Volatile region exceeds the volatile identifier range"
            );
            Err(KeyMgmtError::InvalidArgument)?
        }

        Ok(())
    }

    /// Total number of slots.
    pub fn total_slots(&self) -> usize {
        self.persistent_slots + self.asset_store_slots + self.volatile_slots
    }
}

#[cfg(test)]
mod tests {
    use test_with_tracing::test;

    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = KeyStoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.total_slots(), 32);
        assert!(config.der_bypass);
        assert!(!config.dpa_support);
    }

    #[test]
    fn test_rejects_empty_region() {
        let config = KeyStoreConfig {
            asset_store_slots: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(KeyMgmtError::InvalidArgument));
    }

    #[test]
    fn test_rejects_oversized_volatile_region() {
        let config = KeyStoreConfig {
            volatile_slots: 0x10001,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(KeyMgmtError::InvalidArgument));
    }
}
