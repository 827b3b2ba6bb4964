//! Per-stage execution engine.
//!
//! A [`Stage`] owns a FIFO of pending items, the item currently being
//! processed, and the sets of items that reached a terminal state in the
//! current pass. A dedicated worker pops one item per wake, runs the
//! processor, applies the retry policy and, once nothing is left, reports a
//! [`ProcessStatus`] to its observer.

use super::processor::Processor;
use super::scheduler::{run_worker, WakeScheduler, WakeTarget};
use crate::config::{PipelineConfig, DEFAULT_MAX_RETRY};
use crate::core::{Mode, Payload, ProcessStatus, WorkItem};
use crate::errors::{Result, StageloopError};
use crate::events::{default_sink, EventSink};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// What a stage did with an item after one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disposition {
    /// The attempt succeeded; the item is in the success set.
    Succeeded,
    /// The attempt failed and the item re-joined the tail of the queue.
    Retrying,
    /// The attempt failed with the retry budget spent; the item is in the error set.
    Exhausted,
}

/// Hooks a stage calls on its worker, outside of its own lock.
///
/// The pipeline uses them to route successful results downstream and to
/// aggregate completion.
pub trait StageObserver<T: Payload>: Send + Sync {
    /// Called after every attempt that produced a result.
    fn after_process(
        &self,
        _stage: usize,
        _executed: &WorkItem<T>,
        _result: &WorkItem<T>,
        _disposition: Disposition,
    ) {
    }

    /// Called once per idle transition with the stage's snapshot.
    fn on_complete(&self, _stage: usize, _status: ProcessStatus<T>) {}
}

/// An observer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpObserver;

impl<T: Payload> StageObserver<T> for NoOpObserver {}

/// Settings a stage is created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageSettings {
    /// Operating mode.
    pub mode: Mode,
    /// Maximum attempts per item.
    pub max_retry: u32,
    /// Delay before each pop.
    pub delay: Duration,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            mode: Mode::Auto,
            max_retry: DEFAULT_MAX_RETRY,
            delay: Duration::ZERO,
        }
    }
}

impl From<&PipelineConfig> for StageSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            mode: config.mode,
            max_retry: config.max_retry.max(1),
            delay: config.inter_item_delay(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Added,
    Replaced,
    Rejected,
}

struct StageState<T> {
    pending: VecDeque<WorkItem<T>>,
    executing: Option<WorkItem<T>>,
    success: Vec<WorkItem<T>>,
    errors: Vec<WorkItem<T>>,
    max_retry: u32,
    delay: Duration,
    reported: bool,
    released: bool,
}

impl<T: Payload> StageState<T> {
    fn new(settings: StageSettings) -> Self {
        Self {
            pending: VecDeque::new(),
            executing: None,
            success: Vec::new(),
            errors: Vec::new(),
            max_retry: settings.max_retry.max(1),
            delay: settings.delay,
            // nothing to report until the first admission
            reported: true,
            released: false,
        }
    }

    fn admit(&mut self, mut item: WorkItem<T>) -> Admission {
        if self.success.contains(&item) || self.executing.as_ref() == Some(&item) {
            return Admission::Rejected;
        }
        if let Some(pos) = self.errors.iter().position(|failed| failed == &item) {
            self.errors.remove(pos);
        }
        let admission = match self.pending.iter().position(|queued| queued == &item) {
            Some(pos) => {
                self.pending.remove(pos);
                Admission::Replaced
            }
            None => Admission::Added,
        };
        item.admit();
        self.pending.push_back(item);
        admission
    }

    fn settle(&mut self, mut item: WorkItem<T>, succeeded: bool) -> Disposition {
        item.clamp_attempts(self.max_retry);
        if succeeded {
            item.succeed();
            remove_item(&mut self.errors, &item);
            self.success.push(item);
            Disposition::Succeeded
        } else if item.attempts() < self.max_retry {
            item.fail();
            self.pending.push_back(item);
            Disposition::Retrying
        } else {
            item.fail();
            remove_item(&mut self.success, &item);
            self.errors.push(item);
            Disposition::Exhausted
        }
    }

    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.executing.is_none()
    }

    fn total(&self) -> usize {
        self.errors.len() + self.success.len() + self.pending.len()
    }

    fn snapshot(&self) -> ProcessStatus<T> {
        let failed = self.errors.iter().map(|item| item.payload().clone()).collect();
        ProcessStatus::new(failed, self.total())
    }

    fn clear(&mut self) {
        self.pending.clear();
        self.success.clear();
        self.errors.clear();
    }
}

fn remove_item<T: PartialEq>(items: &mut Vec<WorkItem<T>>, item: &WorkItem<T>) {
    if let Some(pos) = items.iter().position(|candidate| candidate == item) {
        items.remove(pos);
    }
}

struct StageCore<T: Payload> {
    index: usize,
    mode: Mode,
    state: Mutex<StageState<T>>,
    scheduler: WakeScheduler,
    processor: Arc<dyn Processor<T>>,
    observer: Arc<dyn StageObserver<T>>,
    events: Arc<dyn EventSink>,
}

impl<T: Payload> StageCore<T> {
    fn emit(&self, event_type: &str, data: serde_json::Value) {
        self.events.try_emit(event_type, Some(data));
    }

    fn complete(&self) {
        let status = {
            let mut state = self.state.lock();
            // an admission may have landed since the empty pop
            if state.reported || state.released || !state.is_idle() {
                return;
            }
            state.reported = true;
            state.snapshot()
        };

        info!(
            stage = self.index,
            errors = status.error_count(),
            total = status.total(),
            "Stage completed"
        );
        self.emit(
            "stage.completed",
            json!({"stage": self.index, "errors": status.error_count(), "total": status.total()}),
        );
        self.observer.on_complete(self.index, status);
    }

    async fn attempt(&self, item: WorkItem<T>) {
        debug!(
            stage = self.index,
            attempt = item.attempts(),
            payload = ?item.payload(),
            "Processing item"
        );

        let Some(result) = self.processor.process(self.index, &item).await else {
            error!(
                stage = self.index,
                payload = ?item.payload(),
                "Processor returned no result, stage will not advance"
            );
            self.emit("stage.anomaly", json!({"stage": self.index, "reason": "no_result"}));
            return;
        };

        let (executed, disposition, delay) = {
            let mut state = self.state.lock();
            if state.released {
                return;
            }
            state.executing = None;
            let disposition = state.settle(item, result.is_success());
            let executed = match disposition {
                Disposition::Succeeded => state.success.last().cloned(),
                Disposition::Retrying => state.pending.back().cloned(),
                Disposition::Exhausted => state.errors.last().cloned(),
            };
            (executed, disposition, state.delay)
        };
        let Some(executed) = executed else {
            return;
        };

        match disposition {
            Disposition::Succeeded => {
                debug!(stage = self.index, payload = ?executed.payload(), "Item succeeded");
                self.emit("stage.succeeded", json!({"stage": self.index}));
            }
            Disposition::Retrying => {
                debug!(
                    stage = self.index,
                    attempt = executed.attempts(),
                    payload = ?executed.payload(),
                    "Item failed, queued for retry"
                );
                self.emit(
                    "stage.retrying",
                    json!({"stage": self.index, "attempt": executed.attempts()}),
                );
            }
            Disposition::Exhausted => {
                warn!(
                    stage = self.index,
                    attempts = executed.attempts(),
                    payload = ?executed.payload(),
                    "Item failed after max retries"
                );
                self.emit(
                    "stage.exhausted",
                    json!({"stage": self.index, "attempts": executed.attempts()}),
                );
            }
        }

        self.observer.after_process(self.index, &executed, &result, disposition);

        let reschedule = match self.mode {
            Mode::Auto => true,
            Mode::SingleToken => disposition != Disposition::Succeeded || result.continuation(),
        };
        if reschedule {
            self.scheduler.schedule(delay);
        }
    }
}

#[async_trait]
impl<T: Payload> WakeTarget for StageCore<T> {
    fn index(&self) -> usize {
        self.index
    }

    fn scheduler(&self) -> &WakeScheduler {
        &self.scheduler
    }

    async fn on_wake(&self) {
        let popped = {
            let mut state = self.state.lock();
            if state.released {
                return;
            }
            let max_retry = state.max_retry;
            match state.pending.pop_front() {
                Some(mut item) => {
                    item.record_attempt(max_retry);
                    state.executing = Some(item.clone());
                    Some(item)
                }
                None => {
                    state.executing = None;
                    None
                }
            }
        };

        match popped {
            Some(item) => self.attempt(item).await,
            None => self.complete(),
        }
    }
}

/// One stage of a pipeline, with its own worker.
///
/// Dropping the stage stops its worker; an item that is being processed
/// still runs to completion.
pub struct Stage<T: Payload> {
    core: Arc<StageCore<T>>,
}

impl<T: Payload> Stage<T> {
    /// Spawns a standalone stage on the current tokio runtime.
    pub fn spawn(index: usize, settings: StageSettings, processor: Arc<dyn Processor<T>>) -> Result<Self> {
        let runtime = Handle::try_current()?;
        Ok(Self::spawn_on(
            &runtime,
            index,
            settings,
            processor,
            Arc::new(NoOpObserver),
            default_sink(),
        ))
    }

    /// Spawns a stage whose worker runs on `runtime`.
    pub fn spawn_on(
        runtime: &Handle,
        index: usize,
        settings: StageSettings,
        processor: Arc<dyn Processor<T>>,
        observer: Arc<dyn StageObserver<T>>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let core = Arc::new(StageCore {
            index,
            mode: settings.mode,
            state: Mutex::new(StageState::new(settings)),
            scheduler: WakeScheduler::new(runtime.clone(), tx),
            processor,
            observer,
            events,
        });
        runtime.spawn(run_worker(Arc::clone(&core), rx));
        Self { core }
    }

    /// Position of the stage in its pipeline.
    pub fn index(&self) -> usize {
        self.core.index
    }

    /// Operating mode.
    pub fn mode(&self) -> Mode {
        self.core.mode
    }

    /// Queues items and returns how many were newly accepted.
    ///
    /// Items already in the success set are rejected. Items in the error set
    /// get a fresh attempt budget. A payload that is already pending moves to
    /// the tail without being counted again.
    pub fn apply<I>(&self, items: I) -> Result<usize>
    where
        I: IntoIterator<Item = WorkItem<T>>,
    {
        self.enqueue(items, true)
    }

    /// Queues a single item.
    pub fn apply_one(&self, item: WorkItem<T>) -> Result<usize> {
        self.apply(std::iter::once(item))
    }

    pub(crate) fn enqueue<I>(&self, items: I, allow_wake: bool) -> Result<usize>
    where
        I: IntoIterator<Item = WorkItem<T>>,
    {
        let core = &self.core;
        let (surplus, accepted, replaced, pending, wake, delay) = {
            let mut state = core.state.lock();
            if state.released {
                return Err(StageloopError::Released { stage: core.index });
            }
            let surplus = state.pending.len();
            let mut accepted = 0;
            let mut replaced = 0;
            for item in items {
                match state.admit(item) {
                    Admission::Added => accepted += 1,
                    Admission::Replaced => replaced += 1,
                    Admission::Rejected => {}
                }
            }
            let changed = accepted + replaced > 0;
            if changed {
                state.reported = false;
            }
            let wake = allow_wake
                && changed
                && (state.executing.is_none() || core.mode != Mode::Auto);
            (surplus, accepted, replaced, state.pending.len(), wake, state.delay)
        };

        debug!(stage = core.index, surplus, accepted, replaced, pending, "Items applied");
        if accepted > 0 {
            core.emit(
                "stage.applied",
                json!({"stage": core.index, "accepted": accepted, "pending": pending}),
            );
        }
        if wake {
            core.scheduler.schedule(delay);
        }
        Ok(accepted)
    }

    /// Earliest pending item, without removing it.
    pub fn peek_next(&self) -> Option<WorkItem<T>> {
        self.core.state.lock().pending.front().cloned()
    }

    /// Removes a queued item before it is picked up.
    pub fn remove(&self, item: &WorkItem<T>) -> bool {
        let mut state = self.core.state.lock();
        match state.pending.iter().position(|queued| queued == item) {
            Some(pos) => state.pending.remove(pos).is_some(),
            None => false,
        }
    }

    /// Empties the pending queue and both terminal sets. The in-flight item
    /// is left alone.
    pub fn clear(&self) {
        self.core.state.lock().clear();
    }

    /// Number of pending items.
    pub fn pending_count(&self) -> usize {
        self.core.state.lock().pending.len()
    }

    /// Number of items in the success set.
    pub fn success_count(&self) -> usize {
        self.core.state.lock().success.len()
    }

    /// Number of items in the error set.
    pub fn error_count(&self) -> usize {
        self.core.state.lock().errors.len()
    }

    /// The item being processed, if any.
    pub fn executing(&self) -> Option<WorkItem<T>> {
        self.core.state.lock().executing.clone()
    }

    /// Returns true if nothing is pending and nothing is executing.
    pub fn is_idle(&self) -> bool {
        self.core.state.lock().is_idle()
    }

    /// Current snapshot of the stage's counts and failed payloads.
    pub fn process_status(&self) -> ProcessStatus<T> {
        self.core.state.lock().snapshot()
    }

    /// Retry budget per item.
    pub fn max_retry(&self) -> u32 {
        self.core.state.lock().max_retry
    }

    /// Sets the retry budget (at least 1). Pending attempt counts are capped
    /// to the new budget.
    pub fn set_max_retry(&self, max_retry: u32) {
        let mut state = self.core.state.lock();
        let max_retry = max_retry.max(1);
        state.max_retry = max_retry;
        for item in &mut state.pending {
            item.clamp_attempts(max_retry);
        }
    }

    /// Delay before each pop.
    pub fn delay(&self) -> Duration {
        self.core.state.lock().delay
    }

    /// Sets the delay before each pop.
    pub fn set_delay(&self, delay: Duration) {
        self.core.state.lock().delay = delay;
    }

    /// Re-arms the worker to pop after `delay`, replacing any pending wake.
    pub fn loop_next(&self, delay: Duration) -> bool {
        if self.core.state.lock().released {
            return false;
        }
        self.core.scheduler.schedule(delay)
    }

    /// Returns true if a wake is armed.
    pub fn is_scheduled(&self) -> bool {
        self.core.scheduler.is_armed()
    }

    /// Cancels the pending wake. An executing item is not affected.
    pub fn pause_loop(&self) {
        let core = &self.core;
        core.scheduler.pause();
        let (errors, total, executing) = {
            let state = core.state.lock();
            (state.errors.len(), state.total(), state.executing.is_some())
        };
        info!(stage = core.index, errors, total, executing, "Stage paused");
        core.emit("stage.paused", json!({"stage": core.index, "errors": errors, "total": total}));
    }

    /// Re-arms a wake with the configured delay.
    ///
    /// In single-token mode only a wake that the pause deferred is replayed,
    /// so resuming never admits an extra item.
    pub fn resume_loop(&self) {
        let core = &self.core;
        let delay = core.state.lock().delay;
        let rearmed = core.scheduler.resume(delay, core.mode == Mode::Auto);
        info!(stage = core.index, rearmed, "Stage resumed");
        core.emit("stage.resumed", json!({"stage": core.index}));
    }

    /// Returns true while paused.
    pub fn is_paused(&self) -> bool {
        self.core.scheduler.is_paused()
    }

    /// Clears everything and stops the worker. Later applies fail.
    pub fn release(&self) {
        let core = &self.core;
        {
            let mut state = core.state.lock();
            if state.released {
                return;
            }
            state.released = true;
            state.clear();
            state.executing = None;
        }
        core.scheduler.close();
        info!(stage = core.index, "Stage released");
        core.emit("stage.released", json!({"stage": core.index}));
    }

    /// Returns true once released.
    pub fn is_released(&self) -> bool {
        self.core.state.lock().released
    }
}

impl<T: Payload> Drop for Stage<T> {
    fn drop(&mut self) {
        self.core.scheduler.close();
    }
}

impl<T: Payload> fmt::Debug for Stage<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.core.state.lock();
        f.debug_struct("Stage")
            .field("index", &self.core.index)
            .field("mode", &self.core.mode)
            .field("pending", &state.pending.len())
            .field("executing", &state.executing.is_some())
            .field("success", &state.success.len())
            .field("errors", &state.errors.len())
            .field("released", &state.released)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Outcome;
    use crate::testing::{CompletionProbe, RecordingProcessor};
    use pretty_assertions::assert_eq;

    const WAIT: Duration = Duration::from_secs(5);

    fn settings(max_retry: u32) -> StageSettings {
        StageSettings {
            max_retry,
            ..StageSettings::default()
        }
    }

    fn observed_stage(
        settings: StageSettings,
        processor: Arc<RecordingProcessor<&'static str>>,
    ) -> (Stage<&'static str>, Arc<CompletionProbe<&'static str>>) {
        let probe = CompletionProbe::new();
        let stage = Stage::spawn_on(
            &Handle::current(),
            0,
            settings,
            processor,
            probe.clone(),
            default_sink(),
        );
        (stage, probe)
    }

    #[test]
    fn test_admit_rules() {
        let mut state = StageState::new(settings(2));
        assert_eq!(state.admit(WorkItem::new("a")), Admission::Added);
        assert_eq!(state.admit(WorkItem::new("b")), Admission::Added);
        assert_eq!(state.admit(WorkItem::new("a")), Admission::Replaced);
        let order: Vec<_> = state.pending.iter().map(|item| *item.payload()).collect();
        assert_eq!(order, vec!["b", "a"]);

        state.success.push(WorkItem::new("done"));
        assert_eq!(state.admit(WorkItem::new("done")), Admission::Rejected);

        let mut failed = WorkItem::new("failed");
        failed.record_attempt(2);
        failed.record_attempt(2);
        state.errors.push(failed);
        assert_eq!(state.admit(WorkItem::new("failed")), Admission::Added);
        assert!(state.errors.is_empty());
        assert_eq!(state.pending.back().map(WorkItem::attempts), Some(0));
    }

    #[test]
    fn test_settle_classification() {
        let mut state = StageState::new(settings(2));

        let mut item = WorkItem::new("a");
        item.record_attempt(2);
        assert_eq!(state.settle(item.clone(), false), Disposition::Retrying);
        assert_eq!(state.pending.len(), 1);

        let mut item = state.pending.pop_front().unwrap();
        item.record_attempt(2);
        assert_eq!(state.settle(item, false), Disposition::Exhausted);
        assert_eq!(state.errors[0].attempts(), 2);
        assert_eq!(state.errors[0].outcome(), Outcome::Failure);

        let mut item = WorkItem::new("a");
        item.record_attempt(2);
        assert_eq!(state.settle(item, true), Disposition::Succeeded);
        assert!(state.errors.is_empty());
        assert_eq!(state.success.len(), 1);
    }

    #[tokio::test]
    async fn test_always_failing_item_ends_in_error_set() {
        let processor = Arc::new(RecordingProcessor::always_fail());
        let (stage, probe) = observed_stage(settings(2), processor.clone());

        assert_eq!(stage.apply_one(WorkItem::new("a")).unwrap(), 1);
        assert!(probe.wait_for_stage_reports(1, WAIT).await);

        assert_eq!(processor.call_count(), 2);
        let status = &probe.stage_reports()[0].1;
        assert_eq!(status.error_count(), 1);
        assert_eq!(status.total(), 1);
        assert_eq!(status.failed_payloads(), &["a"]);
        assert_eq!(stage.error_count(), 1);
        assert!(stage.is_idle());
    }

    #[tokio::test]
    async fn test_attempts_never_exceed_max_retry() {
        let processor = Arc::new(RecordingProcessor::always_fail());
        let (stage, probe) = observed_stage(settings(3), processor.clone());

        stage.apply(vec![WorkItem::new("a"), WorkItem::new("b")]).unwrap();
        assert!(probe.wait_for_stage_reports(1, WAIT).await);

        let attempts: Vec<u32> = processor.calls().iter().map(|call| call.attempt).collect();
        assert_eq!(attempts, vec![1, 1, 2, 2, 3, 3]);
        assert!(probe
            .dispositions()
            .iter()
            .filter(|(_, _, disposition)| *disposition == Disposition::Exhausted)
            .all(|(_, attempts, _)| *attempts == 3));
    }

    #[tokio::test]
    async fn test_retry_joins_tail_after_newer_items() {
        let processor = Arc::new(RecordingProcessor::fail_first(&["a"]));
        let (stage, probe) = observed_stage(settings(2), processor.clone());

        stage.apply(vec![WorkItem::new("a"), WorkItem::new("b")]).unwrap();
        assert!(probe.wait_for_stage_reports(1, WAIT).await);

        let order: Vec<_> = processor.calls().iter().map(|call| call.payload).collect();
        assert_eq!(order, vec!["a", "b", "a"]);
        assert!(probe.stage_reports()[0].1.is_clean());
    }

    #[tokio::test]
    async fn test_duplicate_and_succeeded_payloads() {
        let processor = Arc::new(RecordingProcessor::always_succeed());
        let (stage, probe) = observed_stage(settings(2), processor.clone());

        stage.pause_loop();
        assert_eq!(stage.apply(vec![WorkItem::new("a"), WorkItem::new("a")]).unwrap(), 1);
        assert_eq!(stage.apply_one(WorkItem::new("a")).unwrap(), 0);
        assert_eq!(stage.pending_count(), 1);

        stage.resume_loop();
        assert!(probe.wait_for_stage_reports(1, WAIT).await);
        assert_eq!(processor.call_count(), 1);

        assert_eq!(stage.apply_one(WorkItem::new("a")).unwrap(), 0);
        assert_eq!(stage.success_count(), 1);
    }

    #[tokio::test]
    async fn test_reapply_failed_payload_gets_fresh_budget() {
        let processor = Arc::new(RecordingProcessor::always_fail());
        let (stage, probe) = observed_stage(settings(1), processor.clone());

        stage.apply_one(WorkItem::new("a")).unwrap();
        assert!(probe.wait_for_stage_reports(1, WAIT).await);
        assert_eq!(stage.error_count(), 1);

        assert_eq!(stage.apply_one(WorkItem::new("a")).unwrap(), 1);
        assert!(probe.wait_for_stage_reports(2, WAIT).await);
        assert_eq!(processor.call_count(), 2);
        assert_eq!(stage.error_count(), 1);
        assert!(processor.calls().iter().all(|call| call.attempt == 1));
    }

    #[tokio::test]
    async fn test_completion_signalled_once_per_idle_transition() {
        let processor = Arc::new(RecordingProcessor::always_succeed());
        let (stage, probe) = observed_stage(settings(2), processor);

        stage.apply_one(WorkItem::new("a")).unwrap();
        assert!(probe.wait_for_stage_reports(1, WAIT).await);

        stage.loop_next(Duration::ZERO);
        stage.pause_loop();
        stage.resume_loop();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(probe.stage_reports().len(), 1);

        stage.apply_one(WorkItem::new("b")).unwrap();
        assert!(probe.wait_for_stage_reports(2, WAIT).await);
        assert_eq!(probe.stage_reports()[1].1.total(), 2);
    }

    #[tokio::test]
    async fn test_fresh_stage_does_not_report() {
        let processor = Arc::new(RecordingProcessor::always_succeed());
        let (stage, probe) = observed_stage(settings(2), processor.clone());

        stage.pause_loop();
        stage.resume_loop();
        stage.loop_next(Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(probe.stage_reports().is_empty());
        assert_eq!(processor.call_count(), 0);
    }

    #[tokio::test]
    async fn test_completion_skipped_while_work_pending() {
        let processor = Arc::new(RecordingProcessor::always_succeed());
        let (stage, probe) = observed_stage(settings(2), processor.clone());

        stage.pause_loop();
        stage.apply_one(WorkItem::new("a")).unwrap();

        // an empty pop that lost the race against the admission above
        stage.core.complete();
        assert!(probe.stage_reports().is_empty());
        assert!(!stage.core.state.lock().reported);

        stage.resume_loop();
        assert!(probe.wait_for_stage_reports(1, WAIT).await);
        assert_eq!(probe.stage_reports().len(), 1);
        assert_eq!(probe.stage_reports()[0].1.total(), 1);
        assert_eq!(processor.call_count(), 1);
    }

    #[tokio::test]
    async fn test_pause_lets_in_flight_item_finish() {
        let processor = Arc::new(RecordingProcessor::always_succeed().with_latency(Duration::from_millis(100)));
        let (stage, probe) = observed_stage(settings(2), processor.clone());

        stage.apply(vec![WorkItem::new("a"), WorkItem::new("b")]).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(stage.executing().is_some());

        stage.pause_loop();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(processor.call_count(), 1);
        assert_eq!(stage.success_count(), 1);
        assert_eq!(stage.pending_count(), 1);
        assert!(probe.stage_reports().is_empty());

        stage.resume_loop();
        assert!(probe.wait_for_stage_reports(1, WAIT).await);
        assert_eq!(processor.call_count(), 2);
    }

    #[tokio::test]
    async fn test_remove_peek_and_clear() {
        let processor = Arc::new(RecordingProcessor::always_succeed());
        let (stage, _probe) = observed_stage(settings(2), processor.clone());

        stage.pause_loop();
        stage.apply(vec![WorkItem::new("a"), WorkItem::new("b")]).unwrap();
        assert_eq!(stage.peek_next().map(WorkItem::into_payload), Some("a"));

        assert!(stage.remove(&WorkItem::new("a")));
        assert!(!stage.remove(&WorkItem::new("a")));
        assert_eq!(stage.peek_next().map(WorkItem::into_payload), Some("b"));

        stage.clear();
        assert_eq!(stage.pending_count(), 0);
        assert!(stage.peek_next().is_none());
        assert_eq!(processor.call_count(), 0);
    }

    #[tokio::test]
    async fn test_absent_result_stalls_stage() {
        let processor = Arc::new(RecordingProcessor::new(|_stage, _item| None));
        let (stage, probe) = observed_stage(settings(2), processor.clone());

        stage.apply(vec![WorkItem::new("a"), WorkItem::new("b")]).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(processor.call_count(), 1);
        assert_eq!(stage.executing().map(WorkItem::into_payload), Some("a"));
        assert_eq!(stage.pending_count(), 1);
        assert!(probe.stage_reports().is_empty());
    }

    #[tokio::test]
    async fn test_release_rejects_apply() {
        let processor = Arc::new(RecordingProcessor::always_succeed());
        let (stage, _probe) = observed_stage(settings(2), processor);

        stage.pause_loop();
        stage.apply_one(WorkItem::new("a")).unwrap();
        stage.release();

        assert!(stage.is_released());
        assert_eq!(stage.pending_count(), 0);
        let err = stage.apply_one(WorkItem::new("b")).unwrap_err();
        assert!(err.is_released());
        assert!(!stage.loop_next(Duration::ZERO));
    }

    #[tokio::test]
    async fn test_inter_item_delay_spaces_attempts() {
        let processor = Arc::new(RecordingProcessor::always_succeed());
        let stage_settings = StageSettings {
            delay: Duration::from_millis(40),
            ..settings(2)
        };
        let (stage, probe) = observed_stage(stage_settings, processor.clone());

        let started = tokio::time::Instant::now();
        stage.apply(vec![WorkItem::new("a"), WorkItem::new("b")]).unwrap();
        assert!(probe.wait_for_stage_reports(1, WAIT).await);

        // one delay before each pop, including the final empty one
        assert!(started.elapsed() >= Duration::from_millis(120));
        assert_eq!(processor.call_count(), 2);
    }

    #[tokio::test]
    async fn test_set_max_retry_clamps() {
        let processor = Arc::new(RecordingProcessor::<u32>::always_fail());
        let stage = Stage::spawn(0, settings(3), processor).unwrap();
        stage.set_max_retry(0);
        assert_eq!(stage.max_retry(), 1);
        stage.set_delay(Duration::from_millis(5));
        assert_eq!(stage.delay(), Duration::from_millis(5));
    }
}
