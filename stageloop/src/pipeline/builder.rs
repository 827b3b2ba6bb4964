//! Pipeline builder.

use super::coordinator::{CompletionCallback, Pipeline, PipelineInner, StageLink};
use crate::config::PipelineConfig;
use crate::core::{AggregateStatus, Mode, Payload};
use crate::errors::Result;
use crate::events::{default_sink, EventSink};
use crate::stages::{Processor, Stage, StageObserver, StageSettings};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::info;

/// Builder for creating pipelines.
pub struct PipelineBuilder<T: Payload> {
    config: PipelineConfig,
    processor: Arc<dyn Processor<T>>,
    on_complete: Option<CompletionCallback<T>>,
    observer: Option<Arc<dyn StageObserver<T>>>,
    events: Arc<dyn EventSink>,
}

impl<T: Payload> PipelineBuilder<T> {
    /// Creates a builder around the processing callback shared by all stages.
    #[must_use]
    pub fn new<P>(processor: P) -> Self
    where
        P: Processor<T> + 'static,
    {
        Self::from_arc(Arc::new(processor))
    }

    /// Same as [`Self::new`] for an already shared processor.
    #[must_use]
    pub fn from_arc(processor: Arc<dyn Processor<T>>) -> Self {
        Self {
            config: PipelineConfig::default(),
            processor,
            on_complete: None,
            observer: None,
            events: default_sink(),
        }
    }

    /// Replaces the whole configuration.
    #[must_use]
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the number of stages.
    #[must_use]
    pub fn stage_count(mut self, stage_count: usize) -> Self {
        self.config.stage_count = stage_count;
        self
    }

    /// Sets the operating mode.
    #[must_use]
    pub fn mode(mut self, mode: Mode) -> Self {
        self.config.mode = mode;
        self
    }

    /// Sets the retry budget of every stage.
    #[must_use]
    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.config.max_retry = max_retry;
        self
    }

    /// Sets the inter-item delay of every stage.
    #[must_use]
    pub fn delay(mut self, delay: Duration) -> Self {
        self.config = self.config.with_delay(delay);
        self
    }

    /// Sets the callback receiving each completed pass.
    #[must_use]
    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(AggregateStatus<T>) + Send + Sync + 'static,
    {
        self.on_complete = Some(Arc::new(callback));
        self
    }

    /// Adds an observer that sees every attempt and stage report.
    #[must_use]
    pub fn observer(mut self, observer: Arc<dyn StageObserver<T>>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Sets the event sink shared by the pipeline and its stages.
    #[must_use]
    pub fn event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Spawns the stages on the current tokio runtime.
    pub fn build(self) -> Result<Pipeline<T>> {
        let runtime = Handle::try_current()?;
        let config = self.config.clone().normalized();
        let settings = StageSettings::from(&config);
        let Self {
            processor,
            on_complete,
            observer,
            events,
            ..
        } = self;

        let inner = Arc::new_cyclic(|pipeline| {
            let stages = (0..config.stage_count)
                .map(|index| {
                    let link = StageLink::new(pipeline.clone(), observer.clone());
                    Stage::spawn_on(
                        &runtime,
                        index,
                        settings,
                        Arc::clone(&processor),
                        Arc::new(link),
                        Arc::clone(&events),
                    )
                })
                .collect();
            PipelineInner::new(config.mode, stages, on_complete, Arc::clone(&events))
        });

        info!(
            stages = config.stage_count,
            mode = %config.mode,
            max_retry = config.max_retry,
            delay_ms = config.inter_item_delay_ms,
            "Pipeline created"
        );
        Ok(Pipeline { inner })
    }
}

impl<T: Payload> fmt::Debug for PipelineBuilder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("config", &self.config)
            .field("on_complete", &self.on_complete.is_some())
            .field("observer", &self.observer.is_some())
            .finish_non_exhaustive()
    }
}

impl<T: Payload> Pipeline<T> {
    /// Spawns a pipeline from `config` with a completion callback.
    pub fn new<P, F>(config: PipelineConfig, processor: P, on_complete: F) -> Result<Self>
    where
        P: Processor<T> + 'static,
        F: Fn(AggregateStatus<T>) + Send + Sync + 'static,
    {
        PipelineBuilder::new(processor)
            .config(config)
            .on_complete(on_complete)
            .build()
    }

    /// Starts a builder.
    #[must_use]
    pub fn builder<P>(processor: P) -> PipelineBuilder<T>
    where
        P: Processor<T> + 'static,
    {
        PipelineBuilder::new(processor)
    }
}
