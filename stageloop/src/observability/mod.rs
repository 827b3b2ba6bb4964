//! Observability utilities.

mod logging;
mod timer;

pub use logging::{init_logging, init_logging_with, LogFormat};
pub use timer::PassTimer;
