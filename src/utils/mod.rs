//! Utility functions and helpers

pub mod logging;

use tracing_subscriber::EnvFilter;

/// Initialize logging based on configuration
pub fn init_logging(level: &str, format: &str) {
    logging::init_structured_logging(level, format, false);
}

/// Build the filter used by every log format
pub(crate) fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Format hashrate for display
pub fn format_hashrate(hashrate: f64) -> String {
    if hashrate >= 1e12 {
        format!("{:.2} TH/s", hashrate / 1e12)
    } else if hashrate >= 1e9 {
        format!("{:.2} GH/s", hashrate / 1e9)
    } else if hashrate >= 1e6 {
        format!("{:.2} MH/s", hashrate / 1e6)
    } else if hashrate >= 1e3 {
        format!("{:.2} KH/s", hashrate / 1e3)
    } else {
        format!("{:.0} H/s", hashrate)
    }
}

/// Format a difficulty with a metric suffix
pub fn format_difficulty(difficulty: f64) -> String {
    if !difficulty.is_finite() {
        return "inf".to_string();
    }
    const UNITS: [(f64, &str); 4] = [(1e12, "T"), (1e9, "G"), (1e6, "M"), (1e3, "K")];
    for (scale, suffix) in UNITS {
        if difficulty >= scale {
            return format!("{:.2}{}", difficulty / scale, suffix);
        }
    }
    format!("{:.2}", difficulty)
}
