//! Core types, configuration, and utilities for the Carbon Karma engine.

mod clock;
mod config;
mod error;
mod logging;
mod paths;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{Config, DEFAULT_LOG_LEVEL};
pub use error::{CoreError, CoreResult};
pub use logging::{init_logging, init_logging_with, parse_level, LogConfig};
pub use paths::Paths;
