//! Mock processors for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::time::Duration;
use tokio::sync::Notify;

use crate::core::{Payload, WorkItem};
use crate::stages::Processor;

/// One recorded call of a [`RecordingProcessor`].
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessCall<T> {
    /// Index of the calling stage.
    pub stage: usize,
    /// Payload of the processed item.
    pub payload: T,
    /// Attempt number as seen by the processor.
    pub attempt: u32,
}

type Decide<T> = dyn Fn(usize, &WorkItem<T>) -> Option<WorkItem<T>> + Send + Sync;

/// A processor that records every call and answers with a scripted result.
pub struct RecordingProcessor<T> {
    decide: Box<Decide<T>>,
    latency: Option<Duration>,
    calls: Mutex<Vec<ProcessCall<T>>>,
    notify: Notify,
}

impl<T: Payload> RecordingProcessor<T> {
    /// Creates a processor answering with `decide`.
    pub fn new<F>(decide: F) -> Self
    where
        F: Fn(usize, &WorkItem<T>) -> Option<WorkItem<T>> + Send + Sync + 'static,
    {
        Self {
            decide: Box::new(decide),
            latency: None,
            calls: Mutex::new(Vec::new()),
            notify: Notify::new(),
        }
    }

    /// Succeeds every attempt, passing the payload through.
    #[must_use]
    pub fn always_succeed() -> Self {
        Self::new(|_stage, item| Some(WorkItem::success(item.payload().clone())))
    }

    /// Fails every attempt.
    #[must_use]
    pub fn always_fail() -> Self {
        Self::new(|_stage, item| Some(WorkItem::failure(item.payload().clone())))
    }

    /// Fails the first attempt ever made for each listed payload, at
    /// whichever stage it happens, and succeeds otherwise.
    #[must_use]
    pub fn fail_first(payloads: &[T]) -> Self {
        let armed = Mutex::new(payloads.to_vec());
        Self::new(move |_stage, item| {
            let mut armed = armed.lock();
            match armed.iter().position(|payload| payload == item.payload()) {
                Some(pos) => {
                    armed.remove(pos);
                    Some(WorkItem::failure(item.payload().clone()))
                }
                None => Some(WorkItem::success(item.payload().clone())),
            }
        })
    }

    /// Sleeps for `latency` before answering.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Returns the recorded calls in order.
    #[must_use]
    pub fn calls(&self) -> Vec<ProcessCall<T>> {
        self.calls.lock().clone()
    }

    /// Returns the number of recorded calls.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Waits until at least `count` calls were recorded.
    pub async fn wait_for_calls(&self, count: usize, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                if self.call_count() >= count {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

impl<T> fmt::Debug for RecordingProcessor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingProcessor")
            .field("latency", &self.latency)
            .field("calls", &self.calls.lock().len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<T: Payload> Processor<T> for RecordingProcessor<T> {
    async fn process(&self, stage: usize, item: &WorkItem<T>) -> Option<WorkItem<T>> {
        self.calls.lock().push(ProcessCall {
            stage,
            payload: item.payload().clone(),
            attempt: item.attempts(),
        });
        self.notify.notify_waiters();

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        (self.decide)(stage, item)
    }
}
