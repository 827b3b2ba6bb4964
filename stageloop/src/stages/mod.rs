//! Stages and their workers.
//!
//! A [`Stage`] is one step of a pipeline. It owns its queue and a worker task
//! that calls a [`Processor`] for one item per wake, retrying failures until
//! the retry budget is spent.

mod processor;
pub(crate) mod scheduler;
mod stage;

pub use processor::{AsyncFnProcessor, FnProcessor, Processor};
pub use stage::{Disposition, NoOpObserver, Stage, StageObserver, StageSettings};
