//! Error types for the stageloop engine.
//!
//! Item-level failures never show up here: a failed attempt is data carried
//! by [`crate::core::Outcome`]. These errors cover lifecycle misuse and
//! configuration parsing only.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StageloopError>;

/// The main error type for stageloop operations.
#[derive(Debug, Error)]
pub enum StageloopError {
    /// The stage (or the pipeline owning it) has been released.
    #[error("Stage {stage} has been released")]
    Released {
        /// Index of the released stage.
        stage: usize,
    },

    /// Stage workers need a tokio runtime to run on.
    #[error("No tokio runtime available: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StageloopError {
    /// Returns true if the error was caused by using a released stage.
    #[must_use]
    pub fn is_released(&self) -> bool {
        matches!(self, Self::Released { .. })
    }
}
