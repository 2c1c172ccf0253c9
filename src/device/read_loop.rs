//! Collects nonce reports and routes them to the verifier

use crossbeam::channel::{Receiver, Sender, TrySendError, select, tick};
use tracing::{debug, error, trace};

use super::pipeline::Pipeline;
use crate::error::{Error, Result};
use crate::protocol::response::READ_BUFFER_SIZE;
use crate::protocol::{ResponseBlock, strip_separators};

/// Counts consecutive empty reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SilenceMonitor {
    threshold: u32,
    silent_reads: u32,
}

impl SilenceMonitor {
    /// Trip after `threshold` consecutive empty reads (at least one)
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            silent_reads: 0,
        }
    }

    /// Count an empty read; `true` once the threshold is reached
    pub fn record_empty(&mut self) -> bool {
        self.silent_reads = self.silent_reads.saturating_add(1);
        self.silent_reads >= self.threshold
    }

    /// The chain answered
    pub fn reset(&mut self) {
        self.silent_reads = 0;
    }

    /// Consecutive empty reads so far
    pub fn silent_reads(&self) -> u32 {
        self.silent_reads
    }
}

/// Match parsed responses to their slots and queue them for verification
fn route(pipeline: &Pipeline, block: &ResponseBlock, verify_tx: &Sender<usize>) -> Result<()> {
    let metrics = &pipeline.metrics;
    let active = pipeline.active_job_id();

    for response in block.iter() {
        if response.is_busy() {
            metrics.record_busy();
            continue;
        }
        let Some(index) = response.slot() else {
            continue;
        };
        let Some(active) = active.as_deref() else {
            metrics.record_stale();
            continue;
        };
        let Some(slot) = pipeline.tasks.lock(index) else {
            continue;
        };
        if !slot.is_current(active) || response.midstate_index() >= slot.midstate_count() {
            metrics.record_stale();
            continue;
        }
        // Single producer: once there is room, the send below cannot fail
        // with Full, so the cursor only moves for queued candidates.
        if verify_tx.is_full() {
            metrics.record_dropped();
            continue;
        }

        let entry = pipeline.ring.next_index();
        {
            let mut result = pipeline.ring.lock(entry);
            slot.fill_result(response.midstate_index(), response.nonce, &mut result);
        }
        drop(slot);

        trace!(job_id = response.job_id, nonce = response.nonce, "candidate");
        match verify_tx.try_send(entry) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => metrics.record_dropped(),
            Err(TrySendError::Disconnected(_)) => {
                return Err(Error::channel_send("verify queue closed"));
            }
        }
    }
    Ok(())
}

/// Run until `quit` disconnects, a read fails or the chain goes silent
pub fn run(pipeline: &Pipeline, quit: Receiver<()>, verify_tx: Sender<usize>) -> Result<()> {
    let ticker = tick(pipeline.timing.max_task_wait);
    let mut buf = [0u8; READ_BUFFER_SIZE];
    let mut monitor = SilenceMonitor::new(pipeline.silence_threshold);

    loop {
        select! {
            recv(quit) -> _ => return Ok(()),
            recv(ticker) -> _ => {
                let read = match pipeline.transport.read(&mut buf) {
                    Ok(read) => read,
                    Err(err) => {
                        error!(error = %err, "read failed");
                        return Err(err);
                    }
                };

                if read == 0 {
                    // Nothing is owed before the first frame goes out.
                    if pipeline.is_transmitting() && monitor.record_empty() {
                        error!(silent_reads = monitor.silent_reads(), "chain stopped answering");
                        return Err(Error::Unresponsive {
                            silent_reads: monitor.silent_reads(),
                        });
                    }
                    continue;
                }
                monitor.reset();

                let block = ResponseBlock::parse(&strip_separators(&buf[..read]));
                if block.remainder() > 0 {
                    debug!(bytes = block.remainder(), "discarded partial response");
                }
                pipeline.metrics.record_responses(block.count() as u64);
                route(pipeline, &block, &verify_tx)?;
            }
        }
    }
}
