//! Event sink system for observability.
//!
//! Stages, pipelines and forwarding queues report what they do to an
//! [`EventSink`]. Sinks are passed explicitly at construction; when none is
//! given the engine uses [`NoOpEventSink`].

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use std::sync::Arc;

/// Returns the default sink used when none is configured.
pub fn default_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpEventSink)
}
