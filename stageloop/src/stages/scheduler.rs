//! Cancellable delayed wakes for stage workers.
//!
//! A worker sleeps on an unbounded channel. Scheduling a wake starts a timer
//! task that posts `Signal::Wake(generation)` once the delay elapsed. Every
//! schedule, pause or close bumps the generation, so a wake that was already in
//! flight when it got superseded is recognized as stale and dropped by the
//! worker. At most one wake is ever live.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Messages delivered to a stage worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signal {
    /// Pop and process the next item, if this generation is still current.
    Wake(u64),
    /// Exit the worker loop.
    Shutdown,
}

#[derive(Debug, Default)]
struct SchedulerState {
    generation: u64,
    timer: Option<JoinHandle<()>>,
    armed: bool,
    paused: bool,
    deferred: bool,
    closed: bool,
}

impl SchedulerState {
    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.generation = self.generation.wrapping_add(1);
        self.armed = false;
    }
}

/// Owned wake handle of one worker.
#[derive(Debug)]
pub(crate) struct WakeScheduler {
    runtime: Handle,
    tx: mpsc::UnboundedSender<Signal>,
    state: Mutex<SchedulerState>,
}

impl WakeScheduler {
    pub(crate) fn new(runtime: Handle, tx: mpsc::UnboundedSender<Signal>) -> Self {
        Self {
            runtime,
            tx,
            state: Mutex::new(SchedulerState::default()),
        }
    }

    /// Replaces any live wake with one firing after `delay`.
    ///
    /// While paused the request is remembered and replayed by [`Self::resume`].
    /// Returns true if a wake was armed.
    pub(crate) fn schedule(&self, delay: Duration) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.disarm();
        if state.paused {
            state.deferred = true;
            return false;
        }

        let generation = state.generation;
        state.armed = true;
        if delay.is_zero() {
            let _ = self.tx.send(Signal::Wake(generation));
        } else {
            let tx = self.tx.clone();
            state.timer = Some(self.runtime.spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(Signal::Wake(generation));
            }));
        }
        true
    }

    /// Stops arming wakes. A wake that was live is remembered as deferred.
    pub(crate) fn pause(&self) {
        let mut state = self.state.lock();
        state.paused = true;
        if state.armed {
            state.deferred = true;
        }
        state.disarm();
    }

    /// Leaves the paused state and re-arms a wake.
    ///
    /// With `force` a wake is always armed; otherwise only a wake deferred by
    /// the pause (or requested during it) is replayed.
    pub(crate) fn resume(&self, delay: Duration, force: bool) -> bool {
        let replay = {
            let mut state = self.state.lock();
            state.paused = false;
            std::mem::take(&mut state.deferred) || force
        };
        replay && self.schedule(delay)
    }

    /// Called by the worker for every received wake. Returns false if the
    /// wake was superseded or the scheduler is closed.
    pub(crate) fn accept(&self, generation: u64) -> bool {
        let mut state = self.state.lock();
        if state.closed || !state.armed || state.generation != generation {
            return false;
        }
        state.armed = false;
        state.timer = None;
        true
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.state.lock().armed
    }

    /// Cancels everything and tells the worker to exit.
    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.disarm();
        state.closed = true;
        state.deferred = false;
        let _ = self.tx.send(Signal::Shutdown);
    }
}

/// Something a worker loop drives: it owns a scheduler and does one unit of
/// work per accepted wake.
#[async_trait]
pub(crate) trait WakeTarget: Send + Sync + 'static {
    fn index(&self) -> usize;

    fn scheduler(&self) -> &WakeScheduler;

    async fn on_wake(&self);
}

/// The long-lived worker of one stage.
pub(crate) async fn run_worker<W: WakeTarget>(target: Arc<W>, mut rx: mpsc::UnboundedReceiver<Signal>) {
    while let Some(signal) = rx.recv().await {
        match signal {
            Signal::Wake(generation) => {
                if target.scheduler().accept(generation) {
                    target.on_wake().await;
                }
            }
            Signal::Shutdown => break,
        }
    }
    debug!(stage = target.index(), "Stage worker stopped");
}
