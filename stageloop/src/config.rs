//! Construction-time configuration for pipelines and forwarding queues.

use crate::core::Mode;
use crate::errors::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Attempts per item and stage when nothing else is configured.
pub const DEFAULT_MAX_RETRY: u32 = 2;

/// Configuration for a [`crate::pipeline::Pipeline`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Number of stages. Values below 1 are clamped to 1.
    #[serde(default = "default_stage_count")]
    pub stage_count: usize,
    /// Operating mode.
    #[serde(default)]
    pub mode: Mode,
    /// Maximum attempts per item and stage, applied pipeline-wide.
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,
    /// Delay between two items of the same stage, in milliseconds.
    #[serde(default)]
    pub inter_item_delay_ms: u64,
}

fn default_stage_count() -> usize {
    1
}

fn default_max_retry() -> u32 {
    DEFAULT_MAX_RETRY
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage_count: default_stage_count(),
            mode: Mode::default(),
            max_retry: default_max_retry(),
            inter_item_delay_ms: 0,
        }
    }
}

impl PipelineConfig {
    /// Creates a configuration for `stage_count` stages with defaults.
    #[must_use]
    pub fn new(stage_count: usize) -> Self {
        Self {
            stage_count,
            ..Self::default()
        }
    }

    /// Parses a configuration from JSON; missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str::<Self>(json)?.normalized())
    }

    /// Sets the operating mode.
    #[must_use]
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the retry budget.
    #[must_use]
    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    /// Sets the inter-item delay.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.inter_item_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Gets the inter-item delay as a Duration.
    #[must_use]
    pub fn inter_item_delay(&self) -> Duration {
        Duration::from_millis(self.inter_item_delay_ms)
    }

    /// Clamps out-of-range values: at least one stage and one attempt.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.stage_count = self.stage_count.max(1);
        self.max_retry = self.max_retry.max(1);
        self
    }
}

/// Configuration for a [`crate::pipeline::ForwardingQueue`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardingConfig {
    /// Number of stages. Values below 1 are clamped to 1.
    #[serde(default = "default_stage_count")]
    pub stage_count: usize,
    /// Remove an item from its stage's queue when it is picked up.
    #[serde(default)]
    pub delete_on_forward: bool,
    /// Run one item at a time through the whole chain: stages do not pick
    /// their next item on their own, and Stage 0 starts the next item only
    /// once the previous one left the chain.
    #[serde(default)]
    pub serial: bool,
    /// Delay between two items of the same stage, in milliseconds.
    #[serde(default)]
    pub delay_ms: u64,
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            stage_count: default_stage_count(),
            delete_on_forward: false,
            serial: false,
            delay_ms: 0,
        }
    }
}

impl ForwardingConfig {
    /// Creates a configuration for `stage_count` stages.
    #[must_use]
    pub fn new(stage_count: usize, delete_on_forward: bool) -> Self {
        Self {
            stage_count: stage_count.max(1),
            delete_on_forward,
            serial: false,
            delay_ms: 0,
        }
    }

    /// Switches between the free-running and the serial chain.
    #[must_use]
    pub fn with_serial(mut self, serial: bool) -> Self {
        self.serial = serial;
        self
    }

    /// Sets the inter-item delay.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Gets the inter-item delay as a Duration.
    #[must_use]
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_pipeline_config_default() {
        let config = PipelineConfig::default();
        assert_eq!(config.stage_count, 1);
        assert_eq!(config.mode, Mode::Auto);
        assert_eq!(config.max_retry, 2);
        assert_eq!(config.inter_item_delay(), Duration::ZERO);
    }

    #[test]
    fn test_pipeline_config_builder() {
        let config = PipelineConfig::new(3)
            .with_mode(Mode::SingleToken)
            .with_max_retry(4)
            .with_delay(Duration::from_millis(200));

        assert_eq!(config.stage_count, 3);
        assert_eq!(config.mode, Mode::SingleToken);
        assert_eq!(config.max_retry, 4);
        assert_eq!(config.inter_item_delay_ms, 200);
    }

    #[test]
    fn test_normalized_clamps() {
        let config = PipelineConfig::new(0).with_max_retry(0).normalized();
        assert_eq!(config.stage_count, 1);
        assert_eq!(config.max_retry, 1);
    }

    #[test]
    fn test_from_json_partial() {
        let config = PipelineConfig::from_json(r#"{"stage_count": 0, "mode": "single_token"}"#).unwrap();
        assert_eq!(
            config,
            PipelineConfig {
                stage_count: 1,
                mode: Mode::SingleToken,
                max_retry: 2,
                inter_item_delay_ms: 0,
            }
        );
    }

    #[test]
    fn test_from_json_invalid() {
        let result = PipelineConfig::from_json(r#"{"mode": "sideways"}"#);
        tokio_test::assert_err!(result);
    }

    #[test]
    fn test_forwarding_config() {
        let config = ForwardingConfig::new(0, true).with_delay(Duration::from_millis(5));
        assert_eq!(config.stage_count, 1);
        assert!(config.delete_on_forward);
        assert!(!config.serial);
        assert_eq!(config.delay(), Duration::from_millis(5));
        assert!(config.with_serial(true).serial);
    }

    #[test]
    fn test_forwarding_config_from_json() {
        let config: ForwardingConfig = serde_json::from_str(r#"{"stage_count": 2, "serial": true}"#).unwrap();
        assert_eq!(config, ForwardingConfig::new(2, false).with_serial(true));
    }
}
