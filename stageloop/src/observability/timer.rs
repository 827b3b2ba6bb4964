//! Wall-clock timing of pipeline passes.

use std::time::{Duration, Instant};

/// Measures one pass, from the first admitted item to completion.
#[derive(Debug, Clone, Copy)]
pub struct PassTimer {
    start: Instant,
}

impl PassTimer {
    /// Starts a new timer.
    #[must_use]
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Time since the timer started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Returns the elapsed time in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed().as_secs_f64() * 1000.0
    }
}

impl Default for PassTimer {
    fn default() -> Self {
        Self::start()
    }
}
