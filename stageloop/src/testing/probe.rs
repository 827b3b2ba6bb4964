//! Completion collector for asynchronous tests.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use crate::core::{AggregateStatus, Payload, ProcessStatus, WorkItem};
use crate::pipeline::ForwardReport;
use crate::stages::{Disposition, StageObserver};

/// Collects pass aggregates, stage reports and attempt dispositions.
///
/// Install it as a stage observer and, through [`Self::pipeline_callback`]
/// or [`Self::forward_callback`], as a completion callback. Every `wait_for_*`
/// method returns false if the count was not reached before the timeout.
#[derive(Debug)]
pub struct CompletionProbe<T> {
    passes: Mutex<Vec<AggregateStatus<T>>>,
    stage_reports: Mutex<Vec<(usize, ProcessStatus<T>)>>,
    dispositions: Mutex<Vec<(usize, u32, Disposition)>>,
    forward_reports: Mutex<Vec<ForwardReport>>,
    notify: Notify,
}

impl<T: Payload> CompletionProbe<T> {
    /// Creates a shared probe.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            passes: Mutex::new(Vec::new()),
            stage_reports: Mutex::new(Vec::new()),
            dispositions: Mutex::new(Vec::new()),
            forward_reports: Mutex::new(Vec::new()),
            notify: Notify::new(),
        })
    }

    /// Callback recording pipeline passes.
    pub fn pipeline_callback(self: &Arc<Self>) -> impl Fn(AggregateStatus<T>) + Send + Sync + 'static {
        let probe = Arc::clone(self);
        move |status| {
            probe.passes.lock().push(status);
            probe.notify.notify_waiters();
        }
    }

    /// Callback recording forwarding-queue reports.
    pub fn forward_callback(self: &Arc<Self>) -> impl Fn(ForwardReport) + Send + Sync + 'static {
        let probe = Arc::clone(self);
        move |report| {
            probe.forward_reports.lock().push(report);
            probe.notify.notify_waiters();
        }
    }

    /// Completed passes in order.
    #[must_use]
    pub fn passes(&self) -> Vec<AggregateStatus<T>> {
        self.passes.lock().clone()
    }

    /// Stage reports in arrival order, including ones the pipeline ignored.
    #[must_use]
    pub fn stage_reports(&self) -> Vec<(usize, ProcessStatus<T>)> {
        self.stage_reports.lock().clone()
    }

    /// `(stage, attempts, disposition)` of every attempt with a result.
    #[must_use]
    pub fn dispositions(&self) -> Vec<(usize, u32, Disposition)> {
        self.dispositions.lock().clone()
    }

    /// Forwarding-queue reports in arrival order.
    #[must_use]
    pub fn forward_reports(&self) -> Vec<ForwardReport> {
        self.forward_reports.lock().clone()
    }

    /// Waits for at least `count` passes.
    pub async fn wait_for_passes(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(|probe| probe.passes.lock().len() >= count, timeout)
            .await
    }

    /// Waits for at least `count` stage reports.
    pub async fn wait_for_stage_reports(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(|probe| probe.stage_reports.lock().len() >= count, timeout)
            .await
    }

    /// Waits for at least `count` forwarding-queue reports.
    pub async fn wait_for_forward_reports(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(|probe| probe.forward_reports.lock().len() >= count, timeout)
            .await
    }

    async fn wait_until<F>(&self, reached: F, timeout: Duration) -> bool
    where
        F: Fn(&Self) -> bool,
    {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                if reached(self) {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

impl<T: Payload> StageObserver<T> for CompletionProbe<T> {
    fn after_process(
        &self,
        stage: usize,
        executed: &WorkItem<T>,
        _result: &WorkItem<T>,
        disposition: Disposition,
    ) {
        self.dispositions
            .lock()
            .push((stage, executed.attempts(), disposition));
        self.notify.notify_waiters();
    }

    fn on_complete(&self, stage: usize, status: ProcessStatus<T>) {
        self.stage_reports.lock().push((stage, status));
        self.notify.notify_waiters();
    }
}
