// Copyright (C) Microsoft Corporation. All rights reserved.

//! Crate for defining tests that have tracing output.
//!
//! Use `test_with_tracing::test` in place of the built-in `#[test]` attribute.
//! The subscriber honors `RUST_LOG`; without it the PSA crates log at `DEBUG`
//! and everything else at `WARN`.

#[cfg(test)]
extern crate self as test_with_tracing;

pub use test_with_tracing_macro::test;
use tracing::metadata::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::prelude::*;

/// Crates whose events are shown at `DEBUG` when `RUST_LOG` is not set.
const DEFAULT_DEBUG_TARGETS: [&str; 3] = [
    "azihsm_psa_interface",
    "azihsm_psa_keymgmt",
    "azihsm_psa_sim",
];

fn default_targets() -> Targets {
    DEFAULT_DEBUG_TARGETS
        .iter()
        .fold(Targets::new().with_default(LevelFilter::WARN), |targets, name| {
            targets.with_target(*name, LevelFilter::DEBUG)
        })
}

#[doc(hidden)]
/// Initializes `tracing` for tests.
pub fn init() {
    static ONCE: std::sync::Once = std::sync::Once::new();

    ONCE.call_once(|| {
        let targets = match std::env::var("RUST_LOG") {
            Ok(var) => var.parse().unwrap_or_else(|_| default_targets()),
            Err(_) => default_targets(),
        };

        // Another harness may already own the global subscriber.
        let _ = tracing_subscriber::fmt()
            .pretty()
            .with_ansi(false) // avoid polluting logs with escape sequences
            .log_internal_errors(true)
            .with_test_writer()
            .with_max_level(LevelFilter::TRACE)
            .with_thread_ids(true)
            .finish()
            .with(targets)
            .try_init();
    });
}
