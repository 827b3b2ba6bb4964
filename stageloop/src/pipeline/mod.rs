//! Pipeline coordination.
//!
//! This module provides:
//! - [`Pipeline`]: retrying stages chained by success, with pass completion
//! - [`PipelineBuilder`]: construction from a [`crate::config::PipelineConfig`]
//! - [`ForwardingQueue`]: stages chained by unconditional forwarding

mod builder;
mod coordinator;
mod forwarding;

pub use builder::PipelineBuilder;
pub use coordinator::{CompletionCallback, Pipeline};
pub use forwarding::{ForwardCallback, ForwardReport, ForwardingQueue, ForwardingStage};
