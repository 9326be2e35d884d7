//! Utilities module for logging, metrics, events and error handling
//!
//! This module provides:
//! - Structured logging with tracing (rank-aware)
//! - Loss running averages and mean-IoU accumulation
//! - A JSON-lines scalar event stream for epoch metrics
//! - Error handling types

pub mod error;
pub mod events;
pub mod logging;
pub mod metrics;

// Re-export main types for convenience
pub use error::{Result, SegMixError};
pub use logging::{init_logging, LogConfig};
pub use metrics::{EpochAccumulator, IouAccumulator, RunningAverage};

/// Format a duration in a human-readable way
pub fn format_duration(seconds: f64) -> String {
    if seconds < 60.0 {
        format!("{:.1}s", seconds)
    } else if seconds < 3600.0 {
        let minutes = (seconds / 60.0).floor();
        let secs = seconds % 60.0;
        format!("{}m {:.0}s", minutes as u32, secs)
    } else {
        let hours = (seconds / 3600.0).floor();
        let minutes = ((seconds % 3600.0) / 60.0).floor();
        format!("{}h {}m", hours as u32, minutes as u32)
    }
}
