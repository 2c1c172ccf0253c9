//! Loop cadence derived from chain throughput
//!
//! A chain of `n` chips at `f` MHz with `c` cores each exhausts the 32-bit
//! nonce range of one work item in a fixed "fullscan" time. The write loop
//! ticks at that rate and the read loop polls at a fraction of it.

use std::time::Duration;

use crate::error::{Error, Result};

/// Size of the nonce space swept by one frame
const NONCE_SPACE: f64 = 4_294_967_296.0;

/// Shortest read interval
const MIN_TASK_WAIT: Duration = Duration::from_micros(1);

/// Fullscans without a share before the verifier asks for fresh entropy
const STALL_FULLSCANS: u32 = 64;

/// Derived timing of one chain
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timing {
    /// Hashes per second of the whole chain
    pub hash_rate: f64,
    /// Time to sweep the full nonce range
    pub fullscan: Duration,
    /// Read loop interval
    pub max_task_wait: Duration,
}

impl Timing {
    /// Compute fullscan and task wait together.
    ///
    /// `max_task_wait` is `wait_factor * fullscan`, clamped to
    /// `[1µs, 3 * fullscan]`.
    pub fn new(
        chip_count: usize,
        frequency_mhz: f64,
        cores_per_chip: u32,
        wait_factor: f64,
    ) -> Result<Self> {
        let hash_rate = chip_count as f64 * frequency_mhz * cores_per_chip as f64 * 1e6;
        if !hash_rate.is_finite() || hash_rate <= 0.0 {
            return Err(Error::config(format!(
                "cannot derive timing for {} chips at {} MHz with {} cores",
                chip_count, frequency_mhz, cores_per_chip
            )));
        }
        if !wait_factor.is_finite() || wait_factor <= 0.0 {
            return Err(Error::config(format!("invalid wait factor {}", wait_factor)));
        }

        let fullscan_micros = 1e6 * (NONCE_SPACE / hash_rate);
        let fullscan = Duration::from_nanos((fullscan_micros * 1000.0) as u64);

        let wait = Duration::from_nanos((wait_factor * fullscan.as_nanos() as f64) as u64);
        let max_task_wait = wait.clamp(MIN_TASK_WAIT, (fullscan * 3).max(MIN_TASK_WAIT));

        Ok(Self {
            hash_rate,
            fullscan,
            max_task_wait,
        })
    }

    /// Consecutive empty reads that mean the chain stopped answering
    pub fn silence_threshold(&self, max_response_timeout: Duration) -> u32 {
        let reads = max_response_timeout.as_nanos() / self.max_task_wait.as_nanos().max(1);
        reads.clamp(1, u32::MAX as u128) as u32
    }

    /// Interval of the verifier's stall ticker
    pub fn stall_period(&self) -> Duration {
        self.fullscan * STALL_FULLSCANS
    }
}
