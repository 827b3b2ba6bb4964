//! Completion snapshots produced by stages and pipelines.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Snapshot of one stage's outcome at the moment it reported completion.
///
/// `total` counts succeeded, failed and still-pending items. The snapshot
/// owns clones of the failed payloads; call [`ProcessStatus::release`] to
/// drop them deterministically once consumed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessStatus<T> {
    error_count: usize,
    total: usize,
    failed_payloads: Vec<T>,
}

impl<T> ProcessStatus<T> {
    /// Creates a snapshot from the failed payloads and the total item count.
    pub fn new(failed_payloads: Vec<T>, total: usize) -> Self {
        Self {
            error_count: failed_payloads.len(),
            total,
            failed_payloads,
        }
    }

    /// Number of items that exhausted their retry budget.
    pub fn error_count(&self) -> usize {
        self.error_count
    }

    /// Number of items accounted for by the stage.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Number of items that did not fail terminally.
    pub fn success_count(&self) -> usize {
        self.total.saturating_sub(self.error_count)
    }

    /// Payloads that exhausted their retry budget, in failure order.
    pub fn failed_payloads(&self) -> &[T] {
        &self.failed_payloads
    }

    /// Returns true if nothing failed.
    pub fn is_clean(&self) -> bool {
        self.error_count == 0
    }

    /// Drops the held payloads. Counts are kept.
    pub fn release(&mut self) {
        self.failed_payloads.clear();
        self.failed_payloads.shrink_to_fit();
    }
}

impl<T: fmt::Debug> fmt::Display for ProcessStatus<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{error: {}, total: {}, failed: {:?}}}",
            self.error_count, self.total, self.failed_payloads
        )
    }
}

/// Per-pass result of a pipeline: one [`ProcessStatus`] per touched stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateStatus<T> {
    reports: BTreeMap<usize, ProcessStatus<T>>,
}

impl<T> AggregateStatus<T> {
    pub(crate) fn new(reports: BTreeMap<usize, ProcessStatus<T>>) -> Self {
        Self { reports }
    }

    /// The report of one stage, if that stage was touched during the pass.
    pub fn stage(&self, index: usize) -> Option<&ProcessStatus<T>> {
        self.reports.get(&index)
    }

    /// Iterates reports in stage order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &ProcessStatus<T>)> {
        self.reports.iter().map(|(index, status)| (*index, status))
    }

    /// Indices of the stages that reported.
    pub fn stage_indices(&self) -> Vec<usize> {
        self.reports.keys().copied().collect()
    }

    /// Number of stages that reported.
    pub fn len(&self) -> usize {
        self.reports.len()
    }

    /// Returns true if no stage reported.
    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }

    /// Sum of terminal failures across all stages.
    pub fn error_count(&self) -> usize {
        self.reports.values().map(ProcessStatus::error_count).sum()
    }

    /// Sum of item totals across all stages.
    pub fn total(&self) -> usize {
        self.reports.values().map(ProcessStatus::total).sum()
    }

    /// All failed payloads, concatenated in stage order.
    pub fn failed_payloads(&self) -> impl Iterator<Item = &T> {
        self.reports.values().flat_map(|status| status.failed_payloads.iter())
    }

    /// Returns true if no stage recorded a terminal failure.
    pub fn is_clean(&self) -> bool {
        self.reports.values().all(ProcessStatus::is_clean)
    }

    /// Releases the payloads held by every stage report.
    pub fn release(&mut self) {
        for status in self.reports.values_mut() {
            status.release();
        }
    }
}

impl<T: fmt::Debug> fmt::Display for AggregateStatus<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, status) in &self.reports {
            writeln!(f, "stage {index}: {status}")?;
        }
        Ok(())
    }
}
