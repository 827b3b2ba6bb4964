//! The unit of work flowing through a pipeline.

use super::Outcome;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Bounds every payload carried by a [`WorkItem`] must satisfy.
///
/// Payload equality is the identity of a work item: queues de-duplicate and
/// terminal sets look items up by comparing payloads.
pub trait Payload: Clone + PartialEq + Debug + Send + Sync + 'static {}

impl<T> Payload for T where T: Clone + PartialEq + Debug + Send + Sync + 'static {}

/// A payload plus the bookkeeping a stage needs to process it.
///
/// Two items are equal when their payloads are equal, regardless of attempt
/// count or outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem<T> {
    payload: T,
    attempts: u32,
    outcome: Outcome,
    continuation: bool,
}

impl<T> WorkItem<T> {
    /// Creates a pending item with no attempts recorded.
    pub fn new(payload: T) -> Self {
        Self {
            payload,
            attempts: 0,
            outcome: Outcome::Pending,
            continuation: false,
        }
    }

    /// Creates an item whose outcome is already [`Outcome::Success`].
    ///
    /// Processors return these as the result of a successful attempt.
    pub fn success(payload: T) -> Self {
        Self::new(payload).with_outcome(Outcome::Success)
    }

    /// Creates an item whose outcome is already [`Outcome::Failure`].
    pub fn failure(payload: T) -> Self {
        Self::new(payload).with_outcome(Outcome::Failure)
    }

    /// Sets the outcome.
    #[must_use]
    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = outcome;
        self
    }

    /// Sets the continuation flag (single-token mode only).
    #[must_use]
    pub fn with_continuation(mut self, continuation: bool) -> Self {
        self.continuation = continuation;
        self
    }

    /// Returns the payload.
    pub fn payload(&self) -> &T {
        &self.payload
    }

    /// Consumes the item and returns the payload.
    pub fn into_payload(self) -> T {
        self.payload
    }

    /// Number of attempts made by the stage currently holding the item.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Outcome of the most recent attempt.
    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    /// Whether the holding stage should keep advancing after this attempt.
    pub fn continuation(&self) -> bool {
        self.continuation
    }

    /// Returns true if the last attempt succeeded.
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }

    /// Marks the current attempt as succeeded.
    pub fn succeed(&mut self) {
        self.outcome = Outcome::Success;
    }

    /// Marks the current attempt as failed.
    pub fn fail(&mut self) {
        self.outcome = Outcome::Failure;
    }

    /// Resets bookkeeping when the item is admitted by a stage.
    pub(crate) fn admit(&mut self) {
        self.attempts = 0;
        self.outcome = Outcome::Pending;
    }

    /// Records one more attempt, never exceeding `max_retry`.
    pub(crate) fn record_attempt(&mut self, max_retry: u32) {
        if self.attempts < max_retry {
            self.attempts += 1;
        }
    }

    /// Caps the attempt count after the retry budget was lowered.
    pub(crate) fn clamp_attempts(&mut self, max_retry: u32) {
        self.attempts = self.attempts.min(max_retry);
    }
}

impl<T: PartialEq> PartialEq for WorkItem<T> {
    fn eq(&self, other: &Self) -> bool {
        self.payload == other.payload
    }
}

impl<T: Eq> Eq for WorkItem<T> {}

impl<T> From<T> for WorkItem<T> {
    fn from(payload: T) -> Self {
        Self::new(payload)
    }
}
