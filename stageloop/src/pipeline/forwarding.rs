//! A lighter chain that forwards every returned result without retrying.
//!
//! Each [`ForwardingStage`] picks the head of its queue, runs the processor
//! and hands whatever came back to the next stage. There is no success or
//! failure bookkeeping. With `delete_on_forward` off the head stays queued,
//! so it is picked again on the next wake until the caller removes it.
//!
//! In a serial queue the stages never re-arm themselves. An item runs through
//! the whole chain before Stage 0 picks the next one, and once Stage 0 is empty
//! every idle stage reports.

use crate::config::ForwardingConfig;
use crate::core::{Payload, WorkItem};
use crate::errors::{Result, StageloopError};
use crate::events::{default_sink, EventSink};
use crate::stages::scheduler::{run_worker, WakeScheduler, WakeTarget};
use crate::stages::Processor;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// What a forwarding stage reports when it runs out of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ForwardReport {
    /// Index of the reporting stage.
    pub stage: usize,
    /// Items processed since the previous report.
    pub processed: usize,
    /// Items still queued.
    pub remaining: usize,
}

/// Receives every [`ForwardReport`].
pub type ForwardCallback = Arc<dyn Fn(ForwardReport) + Send + Sync>;

struct ForwardState<T> {
    queue: VecDeque<WorkItem<T>>,
    delay: Duration,
    processed: usize,
    reported: bool,
    released: bool,
}

struct ForwardCore<T: Payload> {
    index: usize,
    delete_on_forward: bool,
    serial: bool,
    state: Mutex<ForwardState<T>>,
    scheduler: WakeScheduler,
    processor: Arc<dyn Processor<T>>,
    queue: Weak<QueueInner<T>>,
    events: Arc<dyn EventSink>,
}

impl<T: Payload> ForwardCore<T> {
    fn report(&self) {
        let report = {
            let mut state = self.state.lock();
            if state.reported || state.released || !state.queue.is_empty() {
                return;
            }
            state.reported = true;
            ForwardReport {
                stage: self.index,
                processed: std::mem::take(&mut state.processed),
                remaining: state.queue.len(),
            }
        };

        info!(
            stage = report.stage,
            processed = report.processed,
            remaining = report.remaining,
            "Forwarding stage idle"
        );
        self.events
            .try_emit("queue.completed", serde_json::to_value(report).ok());
        if let Some(queue) = self.queue.upgrade() {
            if let Some(callback) = &queue.on_complete {
                callback(report);
            }
        }
    }

    /// Hands `result` to the next stage. Returns true if it was queued there.
    fn forward(&self, result: WorkItem<T>) -> bool {
        let Some(queue) = self.queue.upgrade() else {
            return false;
        };
        let Some(next) = queue.stages.get(self.index + 1) else {
            return false;
        };
        match next.apply_one(result) {
            Ok(accepted) => {
                debug!(stage = self.index, next = self.index + 1, accepted, "Result forwarded");
                self.events.try_emit(
                    "queue.forwarded",
                    Some(json!({"stage": self.index, "next": self.index + 1, "accepted": accepted})),
                );
                accepted > 0
            }
            Err(err) => {
                debug!(stage = self.index, error = %err, "Forwarding skipped");
                false
            }
        }
    }
}

#[async_trait]
impl<T: Payload> WakeTarget for ForwardCore<T> {
    fn index(&self) -> usize {
        self.index
    }

    fn scheduler(&self) -> &WakeScheduler {
        &self.scheduler
    }

    async fn on_wake(&self) {
        let picked = {
            let mut state = self.state.lock();
            if state.released {
                return;
            }
            if self.delete_on_forward {
                state.queue.pop_front()
            } else {
                state.queue.front().cloned()
            }
        };
        let Some(item) = picked else {
            match self.queue.upgrade() {
                // nothing left to carry, e.g. after a clear
                Some(queue) if self.serial => queue.recirculate(),
                _ => self.report(),
            }
            return;
        };

        let forwarded = match self.processor.process(self.index, &item).await {
            Some(result) => self.forward(result),
            None => false,
        };

        let delay = {
            let mut state = self.state.lock();
            if state.released {
                return;
            }
            state.processed += 1;
            state.delay
        };
        if !self.serial {
            self.scheduler.schedule(delay);
        } else if !forwarded {
            // the item left the chain here
            if let Some(queue) = self.queue.upgrade() {
                queue.recirculate();
            }
        }
    }
}

/// One stage of a [`ForwardingQueue`].
pub struct ForwardingStage<T: Payload> {
    core: Arc<ForwardCore<T>>,
}

impl<T: Payload> ForwardingStage<T> {
    /// Position of the stage in its queue.
    pub fn index(&self) -> usize {
        self.core.index
    }

    /// Queues items that are not already queued and wakes the worker if
    /// anything was added.
    pub fn apply<I>(&self, items: I) -> Result<usize>
    where
        I: IntoIterator<Item = WorkItem<T>>,
    {
        self.enqueue(items, true)
    }

    fn enqueue<I>(&self, items: I, allow_wake: bool) -> Result<usize>
    where
        I: IntoIterator<Item = WorkItem<T>>,
    {
        let core = &self.core;
        let (surplus, added, total) = {
            let mut state = core.state.lock();
            if state.released {
                return Err(StageloopError::Released { stage: core.index });
            }
            let surplus = state.queue.len();
            let mut added = 0;
            for item in items {
                if !state.queue.contains(&item) {
                    state.queue.push_back(item);
                    added += 1;
                }
            }
            if added > 0 {
                state.reported = false;
            }
            (surplus, added, state.queue.len())
        };
        debug!(stage = core.index, surplus, added, total, "Items applied");
        if allow_wake && added > 0 {
            core.scheduler.schedule(Duration::ZERO);
        }
        Ok(added)
    }

    /// Queues a single item.
    pub fn apply_one(&self, item: WorkItem<T>) -> Result<usize> {
        self.apply(std::iter::once(item))
    }

    /// Removes a queued item.
    pub fn remove(&self, item: &WorkItem<T>) -> bool {
        let mut state = self.core.state.lock();
        match state.queue.iter().position(|queued| queued == item) {
            Some(pos) => state.queue.remove(pos).is_some(),
            None => false,
        }
    }

    /// Empties the queue.
    pub fn clear(&self) {
        self.core.state.lock().queue.clear();
    }

    /// Number of queued items.
    pub fn pending_count(&self) -> usize {
        self.core.state.lock().queue.len()
    }

    /// Head of the queue, without removing it.
    pub fn peek_next(&self) -> Option<WorkItem<T>> {
        self.core.state.lock().queue.front().cloned()
    }

    /// Re-arms the worker to pick the head after `delay`.
    pub fn loop_next(&self, delay: Duration) -> bool {
        if self.core.state.lock().released {
            return false;
        }
        self.core.scheduler.schedule(delay)
    }

    /// Pauses or resumes the worker.
    ///
    /// Resuming re-arms a wake. A serial stage only replays a wake the pause
    /// deferred, so resuming never starts a second item.
    pub fn pause(&self, pause: bool) {
        if pause {
            self.core.scheduler.pause();
        } else {
            self.core.scheduler.resume(Duration::ZERO, !self.core.serial);
        }
    }

    /// Returns true while paused.
    pub fn is_paused(&self) -> bool {
        self.core.scheduler.is_paused()
    }

    /// Delay between two picks.
    pub fn delay(&self) -> Duration {
        self.core.state.lock().delay
    }

    /// Sets the delay between two picks.
    pub fn set_delay(&self, delay: Duration) {
        self.core.state.lock().delay = delay;
    }

    /// Clears the queue and stops the worker.
    pub fn release(&self) {
        {
            let mut state = self.core.state.lock();
            state.released = true;
            state.queue.clear();
        }
        self.core.scheduler.close();
    }
}

impl<T: Payload> Drop for ForwardingStage<T> {
    fn drop(&mut self) {
        self.core.scheduler.close();
    }
}

impl<T: Payload> fmt::Debug for ForwardingStage<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.core.state.lock();
        f.debug_struct("ForwardingStage")
            .field("index", &self.core.index)
            .field("queued", &state.queue.len())
            .field("delete_on_forward", &self.core.delete_on_forward)
            .field("serial", &self.core.serial)
            .finish()
    }
}

struct QueueInner<T: Payload> {
    stages: Vec<ForwardingStage<T>>,
    on_complete: Option<ForwardCallback>,
    serial: bool,
    /// Set while an item of a serial queue is somewhere in the chain.
    circulating: Mutex<bool>,
}

impl<T: Payload> QueueInner<T> {
    /// Lets Stage 0 pick the next item, or has every idle stage report once
    /// Stage 0 ran dry.
    fn recirculate(&self) {
        {
            let mut circulating = self.circulating.lock();
            let Some(head) = self.stages.first() else {
                return;
            };
            if head.pending_count() > 0 {
                *circulating = true;
                head.loop_next(head.delay());
                return;
            }
            *circulating = false;
        }
        for stage in &self.stages {
            stage.core.report();
        }
    }
}

/// A chain of [`ForwardingStage`]s sharing one processor.
pub struct ForwardingQueue<T: Payload> {
    inner: Arc<QueueInner<T>>,
}

impl<T: Payload> Clone for ForwardingQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Payload> ForwardingQueue<T> {
    /// Spawns a queue on the current tokio runtime.
    pub fn new<P, F>(config: ForwardingConfig, processor: P, on_complete: F) -> Result<Self>
    where
        P: Processor<T> + 'static,
        F: Fn(ForwardReport) + Send + Sync + 'static,
    {
        Self::spawn(config, Arc::new(processor), Some(Arc::new(on_complete)), default_sink())
    }

    /// Spawns a queue with an explicit callback and event sink.
    pub fn spawn(
        config: ForwardingConfig,
        processor: Arc<dyn Processor<T>>,
        on_complete: Option<ForwardCallback>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let runtime = Handle::try_current()?;
        let stage_count = config.stage_count.max(1);
        let delay = config.delay();

        let inner = Arc::new_cyclic(|queue: &Weak<QueueInner<T>>| {
            let stages = (0..stage_count)
                .map(|index| {
                    let (tx, rx) = mpsc::unbounded_channel();
                    let core = Arc::new(ForwardCore {
                        index,
                        delete_on_forward: config.delete_on_forward,
                        serial: config.serial,
                        state: Mutex::new(ForwardState {
                            queue: VecDeque::new(),
                            delay,
                            processed: 0,
                            reported: true,
                            released: false,
                        }),
                        scheduler: WakeScheduler::new(runtime.clone(), tx),
                        processor: Arc::clone(&processor),
                        queue: queue.clone(),
                        events: Arc::clone(&events),
                    });
                    runtime.spawn(run_worker(Arc::clone(&core), rx));
                    ForwardingStage { core }
                })
                .collect();
            QueueInner {
                stages,
                on_complete,
                serial: config.serial,
                circulating: Mutex::new(false),
            }
        });

        info!(
            stages = stage_count,
            delete_on_forward = config.delete_on_forward,
            serial = config.serial,
            delay_ms = config.delay_ms,
            "Forwarding queue created"
        );
        Ok(Self { inner })
    }

    /// Feeds items to the first stage.
    ///
    /// A serial queue only starts Stage 0 if no item is in the chain.
    pub fn apply<I>(&self, items: I) -> Result<usize>
    where
        I: IntoIterator<Item = WorkItem<T>>,
    {
        let inner = &self.inner;
        let head = &inner.stages[0];
        if !inner.serial {
            return head.apply(items);
        }

        let mut circulating = inner.circulating.lock();
        let added = head.enqueue(items, false)?;
        if !*circulating && head.pending_count() > 0 {
            *circulating = true;
            head.loop_next(Duration::ZERO);
        }
        Ok(added)
    }

    /// Feeds a single item to the first stage.
    pub fn apply_one(&self, item: WorkItem<T>) -> Result<usize> {
        self.apply(std::iter::once(item))
    }

    /// Pauses or resumes every stage.
    pub fn pause(&self, pause: bool) {
        for stage in &self.inner.stages {
            stage.pause(pause);
        }
    }

    /// Empties every stage's queue.
    pub fn clear(&self) {
        for stage in &self.inner.stages {
            stage.clear();
        }
    }

    /// Releases every stage. Later applies fail.
    pub fn release(&self) {
        for stage in &self.inner.stages {
            stage.release();
        }
        info!(stages = self.inner.stages.len(), "Forwarding queue released");
    }

    /// Stage at `index`, if it exists.
    pub fn stage(&self, index: usize) -> Option<&ForwardingStage<T>> {
        self.inner.stages.get(index)
    }

    /// Number of stages.
    pub fn stage_count(&self) -> usize {
        self.inner.stages.len()
    }
}

impl<T: Payload> fmt::Debug for ForwardingQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwardingQueue")
            .field("stages", &self.inner.stages)
            .finish_non_exhaustive()
    }
}
