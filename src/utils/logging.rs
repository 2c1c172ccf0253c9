//! Structured logging with device context
//!
//! Every pipeline thread runs inside a span carrying the device serial and
//! chain parameters, so events from concurrent devices stay attributable.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tracing::{Level, Span, field, span};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::fmt;

use super::{env_filter, format_difficulty};

/// Context tags for one device
#[derive(Debug, Clone, Default)]
pub struct DeviceContext {
    /// USB serial number
    pub serial: String,
    /// Product name
    pub model: Option<String>,
    /// Chips on the chain
    pub chips: Option<usize>,
    /// Operating frequency (MHz)
    pub frequency: Option<f64>,
}

impl DeviceContext {
    /// Create a context for a device serial
    pub fn for_device(serial: &str) -> Self {
        Self {
            serial: serial.to_string(),
            ..Self::default()
        }
    }

    /// Add the product name
    pub fn with_model(mut self, model: &str) -> Self {
        self.model = Some(model.to_string());
        self
    }

    /// Add the chip count
    pub fn with_chips(mut self, chips: usize) -> Self {
        self.chips = Some(chips);
        self
    }

    /// Add the operating frequency
    pub fn with_frequency(mut self, frequency: f64) -> Self {
        self.frequency = Some(frequency);
        self
    }

    /// Create a tracing span with this context
    pub fn span(&self, name: &str) -> Span {
        let span = span!(
            Level::INFO,
            "device",
            name = %name,
            serial = %self.serial,
            model = field::Empty,
            chips = field::Empty,
            frequency = field::Empty
        );

        if let Some(ref model) = self.model {
            span.record("model", field::display(model));
        }
        if let Some(chips) = self.chips {
            span.record("chips", chips);
        }
        if let Some(frequency) = self.frequency {
            span.record("frequency", frequency);
        }

        span
    }
}

/// Install the global subscriber
pub fn init_structured_logging(level: &str, format: &str, include_target: bool) {
    let filter = env_filter(level);

    // A subscriber may already be installed (tests, embedding); keep it.
    let _ = match format {
        "json" => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(include_target)
                    .with_thread_names(true),
            )
            .try_init(),
        "pretty" => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .pretty()
                    .with_target(include_target)
                    .with_thread_names(true),
            )
            .try_init(),
        _ => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(include_target))
            .try_init(),
    };
}

/// Log a controller lifecycle transition
#[macro_export]
macro_rules! log_controller_state {
    ($serial:expr, $old_state:expr, $new_state:expr $(, $key:ident = $value:expr)*) => {{
        tracing::info!(
            serial = %$serial,
            old_state = %$old_state,
            new_state = %$new_state,
            $($key = %$value,)*
            "Controller state changed"
        );
    }};
}

/// Counters shared by the three pipeline loops
#[derive(Debug)]
pub struct PipelineMetrics {
    start_time: Instant,
    frames_written: AtomicU64,
    responses: AtomicU64,
    busy_echoes: AtomicU64,
    stale: AtomicU64,
    dropped: AtomicU64,
    verified: AtomicU64,
    shares: AtomicU64,
    best_difficulty: AtomicU64,
}

/// Point-in-time copy of [`PipelineMetrics`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsSnapshot {
    /// Work frames transmitted
    pub frames_written: u64,
    /// Responses parsed
    pub responses: u64,
    /// Keep-alive echoes filtered out
    pub busy_echoes: u64,
    /// Responses for superseded work
    pub stale: u64,
    /// Candidates dropped because the verify queue was full
    pub dropped: u64,
    /// Candidates hashed by the verifier
    pub verified: u64,
    /// Shares submitted
    pub shares: u64,
    /// Best difficulty seen this session
    pub best_difficulty: f64,
}

impl PipelineMetrics {
    /// Create a zeroed set of counters
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            frames_written: AtomicU64::new(0),
            responses: AtomicU64::new(0),
            busy_echoes: AtomicU64::new(0),
            stale: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            verified: AtomicU64::new(0),
            shares: AtomicU64::new(0),
            best_difficulty: AtomicU64::new(0),
        }
    }

    /// Record a transmitted frame
    pub fn record_frame(&self) {
        self.frames_written.fetch_add(1, Ordering::Relaxed);
    }

    /// Record parsed responses
    pub fn record_responses(&self, count: u64) {
        self.responses.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a keep-alive echo
    pub fn record_busy(&self) {
        self.busy_echoes.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a stale response
    pub fn record_stale(&self) {
        self.stale.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a candidate dropped by backpressure
    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a verified candidate and its difficulty
    pub fn record_verified(&self, difficulty: f64) {
        self.verified.fetch_add(1, Ordering::Relaxed);
        if difficulty >= 0.0 {
            // Non-negative floats order the same as their bit patterns.
            self.best_difficulty
                .fetch_max(difficulty.to_bits(), Ordering::Relaxed);
        }
    }

    /// Record a submitted share
    pub fn record_share(&self) {
        self.shares.fetch_add(1, Ordering::Relaxed);
    }

    /// Best difficulty seen this session
    pub fn best_difficulty(&self) -> f64 {
        f64::from_bits(self.best_difficulty.load(Ordering::Relaxed))
    }

    /// Copy the counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_written: self.frames_written.load(Ordering::Relaxed),
            responses: self.responses.load(Ordering::Relaxed),
            busy_echoes: self.busy_echoes.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            verified: self.verified.load(Ordering::Relaxed),
            shares: self.shares.load(Ordering::Relaxed),
            best_difficulty: self.best_difficulty(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self, context: &DeviceContext) {
        let snapshot = self.snapshot();
        let span = context.span("metrics");
        let _enter = span.enter();

        tracing::info!(
            uptime_secs = self.start_time.elapsed().as_secs(),
            frames = snapshot.frames_written,
            responses = snapshot.responses,
            busy = snapshot.busy_echoes,
            stale = snapshot.stale,
            dropped = snapshot.dropped,
            verified = snapshot.verified,
            shares = snapshot.shares,
            best_difficulty = %format_difficulty(snapshot.best_difficulty),
            "Pipeline metrics"
        );
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}
