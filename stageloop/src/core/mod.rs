//! Core value types for stageloop.
//!
//! This module contains the data that flows through the engine:
//! - Work items and their payload bound
//! - Attempt outcome and operating mode enums
//! - Per-stage and per-pass completion snapshots

mod item;
mod report;
mod status;

pub use item::{Payload, WorkItem};
pub use report::{AggregateStatus, ProcessStatus};
pub use status::{Mode, Outcome};
