//! Attempt outcome and operating mode enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The outcome of the most recent processing attempt of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Not processed yet, or re-admitted since the last attempt.
    #[default]
    Pending,
    /// The attempt succeeded.
    Success,
    /// The attempt failed.
    Failure,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
        }
    }
}

impl Outcome {
    /// Returns true if the attempt succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Returns true if the attempt failed.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure)
    }
}

/// How stages advance through their queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Every stage drains its own queue continuously and independently.
    #[default]
    Auto,
    /// Exactly one payload circulates through the whole chain at a time.
    SingleToken,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::SingleToken => write!(f, "single_token"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_display() {
        assert_eq!(Outcome::Pending.to_string(), "pending");
        assert_eq!(Outcome::Success.to_string(), "success");
        assert_eq!(Outcome::Failure.to_string(), "failure");
    }

    #[test]
    fn test_outcome_predicates() {
        assert!(Outcome::Success.is_success());
        assert!(!Outcome::Pending.is_success());
        assert!(Outcome::Failure.is_failure());
        assert!(!Outcome::Success.is_failure());
    }

    #[test]
    fn test_mode_default_and_serialize() {
        assert_eq!(Mode::default(), Mode::Auto);

        let json = serde_json::to_string(&Mode::SingleToken).unwrap();
        assert_eq!(json, r#""single_token""#);

        let mode: Mode = serde_json::from_str(r#""auto""#).unwrap();
        assert_eq!(mode, Mode::Auto);
    }
}
