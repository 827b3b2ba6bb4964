//! Test assertions for completion snapshots.

use std::fmt::Debug;

use crate::core::{AggregateStatus, ProcessStatus};

/// Asserts the error count and total of a stage snapshot.
pub fn assert_status_counts<T: Debug>(status: &ProcessStatus<T>, errors: usize, total: usize) {
    assert_eq!(
        (status.error_count(), status.total()),
        (errors, total),
        "Expected {{error: {errors}, total: {total}}}, got {status}"
    );
}

/// Asserts that no stage of the pass recorded a terminal failure.
pub fn assert_pass_clean<T: Debug>(pass: &AggregateStatus<T>) {
    assert!(pass.is_clean(), "Expected a clean pass, got:\n{pass}");
}

/// Asserts which payloads a stage reported as failed.
pub fn assert_stage_failed<T: Debug + PartialEq>(pass: &AggregateStatus<T>, stage: usize, expected: &[T]) {
    let status = pass
        .stage(stage)
        .unwrap_or_else(|| panic!("Stage {stage} did not report. Reported: {:?}", pass.stage_indices()));
    assert_eq!(
        status.failed_payloads(),
        expected,
        "Unexpected failed payloads at stage {stage}"
    );
}
