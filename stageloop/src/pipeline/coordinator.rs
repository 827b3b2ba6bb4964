//! Chains stages and aggregates their completion into passes.
//!
//! Successful results of stage `i` are handed to stage `i + 1` by the
//! after-process hook. Every stage that received work since the last pass
//! ended is "touched"; the pass completes once each touched stage reported an
//! idle snapshot, at which point the aggregate goes to the completion
//! callback and every stage is cleared.

use crate::core::{AggregateStatus, Mode, Payload, ProcessStatus, WorkItem};
use crate::errors::{Result, StageloopError};
use crate::events::EventSink;
use crate::observability::PassTimer;
use crate::stages::{Disposition, Stage, StageObserver};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info};

/// Receives the aggregate of every completed pass.
pub type CompletionCallback<T> = Arc<dyn Fn(AggregateStatus<T>) + Send + Sync>;

#[derive(Debug)]
struct PassState<T> {
    touched: BTreeSet<usize>,
    reports: BTreeMap<usize, ProcessStatus<T>>,
    circulating: bool,
    released: bool,
    timer: Option<PassTimer>,
}

impl<T> Default for PassState<T> {
    fn default() -> Self {
        Self {
            touched: BTreeSet::new(),
            reports: BTreeMap::new(),
            circulating: false,
            released: false,
            timer: None,
        }
    }
}

impl<T> PassState<T> {
    fn touch(&mut self, index: usize) {
        if self.touched.is_empty() {
            self.timer = Some(PassTimer::start());
        }
        self.reports.remove(&index);
        self.touched.insert(index);
    }

    fn reset(&mut self) {
        self.touched.clear();
        self.reports.clear();
        self.circulating = false;
        self.timer = None;
    }
}

pub(crate) struct PipelineInner<T: Payload> {
    pub(crate) mode: Mode,
    pub(crate) stages: Vec<Stage<T>>,
    pass: Mutex<PassState<T>>,
    on_complete: Option<CompletionCallback<T>>,
    events: Arc<dyn EventSink>,
}

impl<T: Payload> PipelineInner<T> {
    pub(crate) fn new(
        mode: Mode,
        stages: Vec<Stage<T>>,
        on_complete: Option<CompletionCallback<T>>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            mode,
            stages,
            pass: Mutex::new(PassState::default()),
            on_complete,
            events,
        }
    }

    fn last_index(&self) -> usize {
        self.stages.len().saturating_sub(1)
    }

    /// Lets Stage 0 pop the next item, or drains the chain when it is empty.
    fn pull_next_locked(&self, pass: &mut PassState<T>) {
        let Some(head) = self.stages.first() else {
            return;
        };
        if head.pending_count() > 0 {
            pass.circulating = true;
            head.loop_next(head.delay());
        } else {
            pass.circulating = false;
            for &index in &pass.touched {
                let stage = &self.stages[index];
                stage.loop_next(stage.delay());
            }
        }
    }

    fn route(&self, index: usize, result: &WorkItem<T>, disposition: Disposition) {
        let mut pass = self.pass.lock();
        if pass.released {
            return;
        }

        let mut forwarded = false;
        if disposition == Disposition::Succeeded {
            if let Some(next) = self.stages.get(index + 1) {
                match next.apply_one(result.clone()) {
                    Ok(accepted) if accepted > 0 => {
                        pass.touch(index + 1);
                        forwarded = true;
                    }
                    Ok(_) => {
                        debug!(stage = index + 1, payload = ?result.payload(), "Forwarded item rejected");
                    }
                    Err(err) => {
                        debug!(stage = index + 1, error = %err, "Forwarding skipped");
                    }
                }
            }
        }

        if self.mode == Mode::SingleToken {
            let token_left = disposition == Disposition::Exhausted
                || (disposition == Disposition::Succeeded && !forwarded);
            if token_left {
                self.pull_next_locked(&mut pass);
            }
        }
    }

    fn record(&self, index: usize, status: ProcessStatus<T>) {
        let (aggregate, elapsed_ms) = {
            let mut pass = self.pass.lock();
            if pass.released || !pass.touched.contains(&index) {
                return;
            }
            if !self.stages[index].is_idle() {
                debug!(stage = index, "Ignoring stale stage report");
                return;
            }
            pass.reports.insert(index, status);

            if self.mode == Mode::SingleToken
                && index == self.last_index()
                && !pass.circulating
                && self.stages[0].pending_count() > 0
            {
                self.pull_next_locked(&mut pass);
            }

            if pass.reports.len() < pass.touched.len() {
                return;
            }
            let reports = std::mem::take(&mut pass.reports);
            let elapsed_ms = pass.timer.map_or(0.0, |timer| timer.elapsed_ms());
            pass.reset();
            for stage in &self.stages {
                stage.clear();
            }
            (AggregateStatus::new(reports), elapsed_ms)
        };

        info!(
            stages = aggregate.len(),
            errors = aggregate.error_count(),
            total = aggregate.total(),
            duration_ms = elapsed_ms,
            "Pipeline pass completed"
        );
        debug!("Pass summary:\n{aggregate}");
        self.events.try_emit(
            "pipeline.completed",
            Some(json!({
                "stages": aggregate.stage_indices(),
                "errors": aggregate.error_count(),
                "total": aggregate.total(),
                "duration_ms": elapsed_ms,
            })),
        );
        if let Some(callback) = &self.on_complete {
            callback(aggregate);
        }
    }
}

/// Observer installed on every stage of a pipeline.
pub(crate) struct StageLink<T: Payload> {
    pipeline: Weak<PipelineInner<T>>,
    tap: Option<Arc<dyn StageObserver<T>>>,
}

impl<T: Payload> StageLink<T> {
    pub(crate) fn new(pipeline: Weak<PipelineInner<T>>, tap: Option<Arc<dyn StageObserver<T>>>) -> Self {
        Self { pipeline, tap }
    }
}

impl<T: Payload> StageObserver<T> for StageLink<T> {
    fn after_process(
        &self,
        stage: usize,
        executed: &WorkItem<T>,
        result: &WorkItem<T>,
        disposition: Disposition,
    ) {
        if let Some(tap) = &self.tap {
            tap.after_process(stage, executed, result, disposition);
        }
        if let Some(pipeline) = self.pipeline.upgrade() {
            pipeline.route(stage, result, disposition);
        }
    }

    fn on_complete(&self, stage: usize, status: ProcessStatus<T>) {
        if let Some(tap) = &self.tap {
            tap.on_complete(stage, status.clone());
        }
        if let Some(pipeline) = self.pipeline.upgrade() {
            pipeline.record(stage, status);
        }
    }
}

/// An ordered chain of retrying stages.
///
/// Cloning is cheap and every clone drives the same stages. The stages stop
/// once the last clone is dropped.
///
/// ```rust,ignore
/// let pipeline = PipelineBuilder::new(FnProcessor::new(|_stage, item: &WorkItem<u32>| {
///     Some(WorkItem::success(*item.payload()))
/// }))
/// .stage_count(2)
/// .on_complete(|status| println!("{status}"))
/// .build()?;
///
/// pipeline.apply([1, 2, 3].map(WorkItem::new))?;
/// ```
pub struct Pipeline<T: Payload> {
    pub(crate) inner: Arc<PipelineInner<T>>,
}

impl<T: Payload> Clone for Pipeline<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Payload> Pipeline<T> {
    /// Feeds items to Stage 0 and returns how many were accepted.
    pub fn apply<I>(&self, items: I) -> Result<usize>
    where
        I: IntoIterator<Item = WorkItem<T>>,
    {
        let inner = &self.inner;
        let mut pass = inner.pass.lock();
        if pass.released {
            return Err(StageloopError::Released { stage: 0 });
        }
        let head = &inner.stages[0];

        let accepted = match inner.mode {
            Mode::Auto => head.enqueue(items, true)?,
            Mode::SingleToken => head.enqueue(items, false)?,
        };
        if accepted > 0 {
            pass.touch(0);
        }
        if inner.mode == Mode::SingleToken && !pass.circulating && head.pending_count() > 0 {
            inner.pull_next_locked(&mut pass);
        }
        Ok(accepted)
    }

    /// Feeds a single item to Stage 0.
    pub fn apply_one(&self, item: WorkItem<T>) -> Result<usize> {
        self.apply(std::iter::once(item))
    }

    /// Pauses every stage. Items being processed run to completion.
    pub fn pause(&self) {
        for stage in &self.inner.stages {
            stage.pause_loop();
        }
    }

    /// Resumes every stage.
    pub fn resume(&self) {
        for stage in &self.inner.stages {
            stage.resume_loop();
        }
    }

    /// Clears every stage and forgets the current pass.
    pub fn clear(&self) {
        let mut pass = self.inner.pass.lock();
        for stage in &self.inner.stages {
            stage.clear();
        }
        pass.reset();
    }

    /// Releases every stage. Later applies fail.
    pub fn release(&self) {
        {
            let mut pass = self.inner.pass.lock();
            if pass.released {
                return;
            }
            pass.released = true;
            pass.reset();
        }
        for stage in &self.inner.stages {
            stage.release();
        }
        info!(stages = self.inner.stages.len(), "Pipeline released");
    }

    /// Sets the retry budget of every stage.
    pub fn set_max_retry(&self, max_retry: u32) {
        for stage in &self.inner.stages {
            stage.set_max_retry(max_retry);
        }
    }

    /// Sets the inter-item delay of every stage.
    pub fn set_delay(&self, delay: Duration) {
        for stage in &self.inner.stages {
            stage.set_delay(delay);
        }
    }

    /// Stage at `index`, if it exists.
    pub fn stage(&self, index: usize) -> Option<&Stage<T>> {
        self.inner.stages.get(index)
    }

    /// Number of stages.
    pub fn stage_count(&self) -> usize {
        self.inner.stages.len()
    }

    /// Operating mode.
    pub fn mode(&self) -> Mode {
        self.inner.mode
    }

    /// Indices of the stages that received work in the current pass.
    pub fn touched_stages(&self) -> Vec<usize> {
        self.inner.pass.lock().touched.iter().copied().collect()
    }

    /// Returns true once released.
    pub fn is_released(&self) -> bool {
        self.inner.pass.lock().released
    }
}

impl<T: Payload> fmt::Debug for Pipeline<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("mode", &self.inner.mode)
            .field("stages", &self.inner.stages)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::pipeline::PipelineBuilder;
    use crate::testing::{CompletionProbe, RecordingProcessor};
    use pretty_assertions::assert_eq;

    const WAIT: Duration = Duration::from_secs(5);

    fn build(
        config: PipelineConfig,
        processor: Arc<RecordingProcessor<u32>>,
    ) -> (Pipeline<u32>, Arc<CompletionProbe<u32>>) {
        let probe = CompletionProbe::new();
        let pipeline = PipelineBuilder::from_arc(processor)
            .config(config)
            .observer(probe.clone())
            .on_complete(probe.pipeline_callback())
            .build()
            .unwrap();
        (pipeline, probe)
    }

    #[test]
    fn test_touch_starts_timer_once() {
        let mut pass = PassState::<u32>::default();
        pass.touch(0);
        let started = pass.timer;
        pass.reports.insert(1, ProcessStatus::new(vec![], 0));
        pass.touch(1);
        assert!(started.is_some());
        assert!(pass.reports.is_empty());
        assert_eq!(pass.touched.iter().copied().collect::<Vec<_>>(), vec![0, 1]);

        pass.reset();
        assert!(pass.touched.is_empty());
        assert!(pass.timer.is_none());
    }

    #[tokio::test]
    async fn test_two_stage_auto_pass() {
        let processor = Arc::new(RecordingProcessor::always_succeed());
        let (pipeline, probe) = build(PipelineConfig::new(2), processor.clone());

        assert_eq!(pipeline.apply((1..=3).map(WorkItem::new)).unwrap(), 3);
        assert!(probe.wait_for_passes(1, WAIT).await);

        let pass = &probe.passes()[0];
        assert_eq!(pass.stage_indices(), vec![0, 1]);
        assert_eq!(pass.stage(0).map(ProcessStatus::total), Some(3));
        assert_eq!(pass.stage(1).map(ProcessStatus::total), Some(3));
        assert!(pass.is_clean());
        assert_eq!(processor.call_count(), 6);
        assert!(pipeline.touched_stages().is_empty());
        assert_eq!(pipeline.stage(0).map(Stage::success_count), Some(0));
    }

    #[tokio::test]
    async fn test_failure_stops_forwarding() {
        let processor = Arc::new(RecordingProcessor::always_fail());
        let (pipeline, probe) = build(PipelineConfig::new(3).with_max_retry(1), processor.clone());

        pipeline.apply_one(WorkItem::new(7)).unwrap();
        assert!(probe.wait_for_passes(1, WAIT).await);

        let pass = &probe.passes()[0];
        assert_eq!(pass.stage_indices(), vec![0]);
        assert_eq!(pass.error_count(), 1);
        assert_eq!(pass.failed_payloads().copied().collect::<Vec<_>>(), vec![7]);
        assert_eq!(processor.call_count(), 1);
    }

    #[tokio::test]
    async fn test_single_token_one_item_in_flight() {
        let processor = Arc::new(RecordingProcessor::always_succeed().with_latency(Duration::from_millis(10)));
        let config = PipelineConfig::new(3).with_mode(Mode::SingleToken);
        let (pipeline, probe) = build(config, processor.clone());

        pipeline.apply((1..=3).map(WorkItem::new)).unwrap();
        assert!(probe.wait_for_passes(1, WAIT).await);

        let order: Vec<(usize, u32)> = processor
            .calls()
            .iter()
            .map(|call| (call.stage, call.payload))
            .collect();
        assert_eq!(
            order,
            vec![(0, 1), (1, 1), (2, 1), (0, 2), (1, 2), (2, 2), (0, 3), (1, 3), (2, 3)]
        );
        assert_eq!(probe.passes().len(), 1);
        assert_eq!(probe.passes()[0].total(), 9);
    }

    #[tokio::test]
    async fn test_single_token_retry_queues_behind_next_item() {
        let processor = Arc::new(RecordingProcessor::fail_first(&[1]));
        let config = PipelineConfig::new(2).with_mode(Mode::SingleToken);
        let (pipeline, probe) = build(config, processor.clone());

        pipeline.apply(vec![WorkItem::new(1), WorkItem::new(2)]).unwrap();
        assert!(probe.wait_for_passes(1, WAIT).await);

        let order: Vec<(usize, u32)> = processor
            .calls()
            .iter()
            .map(|call| (call.stage, call.payload))
            .collect();
        assert_eq!(order, vec![(0, 1), (0, 2), (1, 2), (0, 1), (1, 1)]);
        assert!(probe.passes()[0].is_clean());
    }

    #[tokio::test]
    async fn test_apply_after_release_fails() {
        let processor = Arc::new(RecordingProcessor::always_succeed());
        let (pipeline, _probe) = build(PipelineConfig::new(2), processor);

        pipeline.release();
        assert!(pipeline.is_released());
        assert!(pipeline.apply_one(WorkItem::new(1)).unwrap_err().is_released());
        assert!(pipeline.stage(1).is_some_and(Stage::is_released));
    }

    #[tokio::test]
    async fn test_config_broadcast() {
        let processor = Arc::new(RecordingProcessor::always_succeed());
        let (pipeline, _probe) = build(PipelineConfig::new(3), processor);

        pipeline.set_max_retry(5);
        pipeline.set_delay(Duration::from_millis(3));
        for index in 0..pipeline.stage_count() {
            let stage = pipeline.stage(index).unwrap();
            assert_eq!(stage.max_retry(), 5);
            assert_eq!(stage.delay(), Duration::from_millis(3));
        }
        assert!(pipeline.stage(3).is_none());
        assert_eq!(pipeline.mode(), Mode::Auto);
    }
}
