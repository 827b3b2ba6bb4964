//! Testing utilities for stageloop pipelines.
//!
//! This module provides:
//! - A recording processor with scripted outcomes
//! - A completion probe to await passes and stage reports
//! - Assertions for completion snapshots

mod assertions;
mod mocks;
mod probe;

pub use assertions::{assert_pass_clean, assert_stage_failed, assert_status_counts};
pub use mocks::{ProcessCall, RecordingProcessor};
pub use probe::CompletionProbe;
