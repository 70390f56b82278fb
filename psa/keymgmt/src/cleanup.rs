// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Deferred cleanup of multi-step key operations.
//!
//! Every resource acquired by an operation registers how to release it.
//! When the operation ends the stack is unwound in reverse order: steps
//! registered with [`When::Always`] run on every exit, steps registered with
//! [`When::OnError`] only when the operation failed.
//!
//! The first cleanup step that fails replaces the error of the operation.
//! Later failing steps are logged and the unwind continues.

use azihsm_psa_interface::AssetId;

use crate::attributes::KeyId;
use crate::KeyMgmtError;
use crate::KeyMgmtResult;

/// Resource release step.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum CleanupAction {
    /// Free a hardware asset.
    FreeAsset(AssetId),
    /// Clear an allocated key slot.
    ClearSlot(usize),
    /// Delete the backing store record of a key.
    ClearRecord(KeyId),
    /// Clear the in-use flag of a slot.
    UnlockSlot(usize),
}

/// When a cleanup step runs.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum When {
    Always,
    OnError,
}

/// Owner of the resources released by cleanup steps.
pub(crate) trait CleanupTarget {
    fn free_asset(&mut self, asset: AssetId) -> KeyMgmtResult<()>;

    fn clear_slot(&mut self, index: usize) -> KeyMgmtResult<()>;

    fn clear_record(&mut self, id: KeyId) -> KeyMgmtResult<()>;

    fn unlock_slot(&mut self, index: usize) -> KeyMgmtResult<()>;
}

#[derive(Debug, Default)]
pub(crate) struct CleanupStack {
    steps: Vec<(When, CleanupAction)>,
}

impl CleanupStack {
    pub(crate) fn push(&mut self, when: When, action: CleanupAction) {
        self.steps.push((when, action));
    }

    pub(crate) fn always(&mut self, action: CleanupAction) {
        self.push(When::Always, action);
    }

    pub(crate) fn on_error(&mut self, action: CleanupAction) {
        self.push(When::OnError, action);
    }

    /// Runs the registered steps in reverse order.
    ///
    /// If the operation succeeded but an unconditional step fails, the
    /// error-only steps run afterwards and undo what the operation committed.
    ///
    /// # Arguments
    /// * `target` - Owner of the resources.
    /// * `failed` - Whether the operation failed.
    ///
    /// # Returns
    /// * The error of the first failing step, if any.
    pub(crate) fn unwind<C: CleanupTarget + ?Sized>(
        self,
        target: &mut C,
        failed: bool,
    ) -> KeyMgmtResult<()> {
        let mut first_error = self.run(target, |when| failed || when == When::Always);

        if !failed && first_error.is_some() {
            tracing::error!("Rolling back a committed operation");
            if let Some(error) = self.run(target, |when| when == When::OnError) {
                first_error.get_or_insert(error);
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn run<C: CleanupTarget + ?Sized>(
        &self,
        target: &mut C,
        selected: impl Fn(When) -> bool,
    ) -> Option<KeyMgmtError> {
        let mut first_error = None;

        for &(when, action) in self.steps.iter().rev() {
            if !selected(when) {
                continue;
            }

            let result = match action {
                CleanupAction::FreeAsset(asset) => target.free_asset(asset),
                CleanupAction::ClearSlot(index) => target.clear_slot(index),
                CleanupAction::ClearRecord(id) => target.clear_record(id),
                CleanupAction::UnlockSlot(index) => target.unlock_slot(index),
            };

            if let Err(error) = result {
                tracing::error!(?error, ?action, "Cleanup step failed");
                first_error.get_or_insert(error);
            }
        }

        first_error
    }
}

/// Combines the result of an operation with the result of its cleanup.
///
/// A cleanup failure wins over both success and the original error.
pub(crate) fn settle<T>(result: KeyMgmtResult<T>, cleanup: KeyMgmtResult<()>) -> KeyMgmtResult<T> {
    match (result, cleanup) {
        (result, Ok(())) => result,
        (Ok(_), Err(error)) => Err(error),
        (Err(original), Err(error)) => {
            tracing::error!(?original, ?error, "Cleanup failure replaces the original error");
            Err(error)
        }
    }
}

/// Runs `op` with a fresh cleanup stack and unwinds it afterwards.
pub(crate) fn transact<C, T, F>(target: &mut C, op: F) -> KeyMgmtResult<T>
where
    C: CleanupTarget,
    F: FnOnce(&mut C, &mut CleanupStack) -> KeyMgmtResult<T>,
{
    let mut cleanup = CleanupStack::default();
    let result = op(target, &mut cleanup);
    let unwound = cleanup.unwind(target, result.is_err());
    settle(result, unwound)
}

#[cfg(test)]
mod tests {
    use test_with_tracing::test;

    use super::*;

    #[derive(Debug, Default)]
    struct Recorder {
        log: Vec<CleanupAction>,
        fail: Vec<CleanupAction>,
    }

    impl Recorder {
        fn record(&mut self, action: CleanupAction) -> KeyMgmtResult<()> {
            self.log.push(action);
            if self.fail.contains(&action) {
                Err(KeyMgmtError::HardwareFailure)
            } else {
                Ok(())
            }
        }
    }

    impl CleanupTarget for Recorder {
        fn free_asset(&mut self, asset: AssetId) -> KeyMgmtResult<()> {
            self.record(CleanupAction::FreeAsset(asset))
        }

        fn clear_slot(&mut self, index: usize) -> KeyMgmtResult<()> {
            self.record(CleanupAction::ClearSlot(index))
        }

        fn clear_record(&mut self, id: KeyId) -> KeyMgmtResult<()> {
            self.record(CleanupAction::ClearRecord(id))
        }

        fn unlock_slot(&mut self, index: usize) -> KeyMgmtResult<()> {
            self.record(CleanupAction::UnlockSlot(index))
        }
    }

    fn asset(raw: u32) -> AssetId {
        AssetId::from_raw(raw).unwrap()
    }

    #[test]
    fn test_success_runs_only_always_steps() {
        let mut target = Recorder::default();
        let result = transact(&mut target, |_, cleanup| {
            cleanup.always(CleanupAction::UnlockSlot(1));
            cleanup.on_error(CleanupAction::ClearSlot(2));
            cleanup.always(CleanupAction::FreeAsset(asset(3)));
            Ok(7)
        });

        assert_eq!(result, Ok(7));
        assert_eq!(
            target.log,
            vec![
                CleanupAction::FreeAsset(asset(3)),
                CleanupAction::UnlockSlot(1),
            ]
        );
    }

    #[test]
    fn test_failure_unwinds_in_reverse() {
        let mut target = Recorder::default();
        let result: KeyMgmtResult<()> = transact(&mut target, |_, cleanup| {
            cleanup.always(CleanupAction::UnlockSlot(1));
            cleanup.on_error(CleanupAction::ClearSlot(2));
            cleanup.on_error(CleanupAction::FreeAsset(asset(3)));
            Err(KeyMgmtError::InsufficientMemory)
        });

        assert_eq!(result, Err(KeyMgmtError::InsufficientMemory));
        assert_eq!(
            target.log,
            vec![
                CleanupAction::FreeAsset(asset(3)),
                CleanupAction::ClearSlot(2),
                CleanupAction::UnlockSlot(1),
            ]
        );
    }

    #[test]
    fn test_failing_cleanup_replaces_error() {
        let mut target = Recorder {
            fail: vec![CleanupAction::FreeAsset(asset(3))],
            ..Default::default()
        };
        let result: KeyMgmtResult<()> = transact(&mut target, |_, cleanup| {
            cleanup.always(CleanupAction::UnlockSlot(1));
            cleanup.on_error(CleanupAction::FreeAsset(asset(3)));
            Err(KeyMgmtError::InvalidArgument)
        });

        assert_eq!(result, Err(KeyMgmtError::HardwareFailure));
        assert_eq!(target.log.len(), 2, "unwind continues after a failing step");
    }

    #[test]
    fn test_failing_cleanup_fails_success() {
        let mut target = Recorder {
            fail: vec![CleanupAction::UnlockSlot(1)],
            ..Default::default()
        };
        let result = transact(&mut target, |_, cleanup| {
            cleanup.always(CleanupAction::UnlockSlot(1));
            Ok(())
        });
        assert_eq!(result, Err(KeyMgmtError::HardwareFailure));
    }

    #[test]
    fn test_failing_cleanup_rolls_back_success() {
        let mut target = Recorder {
            fail: vec![CleanupAction::FreeAsset(asset(4))],
            ..Default::default()
        };
        let result = transact(&mut target, |_, cleanup| {
            cleanup.always(CleanupAction::UnlockSlot(1));
            cleanup.on_error(CleanupAction::ClearSlot(2));
            cleanup.on_error(CleanupAction::ClearRecord(0x10));
            cleanup.always(CleanupAction::FreeAsset(asset(4)));
            Ok(0x10)
        });

        assert_eq!(result, Err(KeyMgmtError::HardwareFailure));
        assert_eq!(
            target.log,
            vec![
                CleanupAction::FreeAsset(asset(4)),
                CleanupAction::UnlockSlot(1),
                CleanupAction::ClearRecord(0x10),
                CleanupAction::ClearSlot(2),
            ]
        );
    }

    #[test]
    fn test_settle() {
        assert_eq!(settle(Ok(1), Ok(())), Ok(1));
        assert_eq!(
            settle::<()>(Err(KeyMgmtError::BadState), Ok(())),
            Err(KeyMgmtError::BadState)
        );
        assert_eq!(
            settle(Ok(1), Err(KeyMgmtError::HardwareFailure)),
            Err(KeyMgmtError::HardwareFailure)
        );
    }
}
