//! # Stageloop
//!
//! A staged retry pipeline: items flow through an ordered chain of stages,
//! each stage retries failed items up to a budget, and the caller receives a
//! per-stage summary once a batch has drained.
//!
//! Stageloop provides:
//!
//! - **Per-stage workers**: every stage owns a FIFO queue and a tokio task
//!   woken by cancellable delayed wakes
//! - **Retry with bounded attempts**: failed items re-join the tail of their
//!   stage until the budget is spent
//! - **Two operating modes**: `Auto` drains every stage concurrently,
//!   `SingleToken` keeps exactly one item circulating through the chain
//! - **Pass completion**: one aggregate per batch once every touched stage
//!   went idle
//! - **Forwarding queue**: a lighter chain that forwards every returned
//!   result without retrying
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stageloop::prelude::*;
//!
//! let pipeline = PipelineBuilder::new(FnProcessor::new(|stage, item: &WorkItem<String>| {
//!     Some(WorkItem::success(format!("{}_P{stage}", item.payload())))
//! }))
//! .stage_count(3)
//! .max_retry(2)
//! .on_complete(|status| println!("{status}"))
//! .build()?;
//!
//! pipeline.apply(["a", "b"].map(|p| WorkItem::new(p.to_string())))?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod observability;
pub mod pipeline;
pub mod stages;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{ForwardingConfig, PipelineConfig, DEFAULT_MAX_RETRY};
    pub use crate::core::{AggregateStatus, Mode, Outcome, Payload, ProcessStatus, WorkItem};
    pub use crate::errors::{Result, StageloopError};
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::pipeline::{
        ForwardReport, ForwardingQueue, ForwardingStage, Pipeline, PipelineBuilder,
    };
    pub use crate::stages::{
        AsyncFnProcessor, Disposition, FnProcessor, Processor, Stage, StageObserver,
        StageSettings,
    };
}
