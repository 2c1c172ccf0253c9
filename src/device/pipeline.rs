//! State shared by the write, read and verify loops of one controller

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam::channel::Sender;
use parking_lot::RwLock;

use super::transport::Transport;
use crate::core::{ResultRing, Submit, Target, Work};
use crate::error::{Error, Result};
use crate::protocol::{MIDSTATE_COUNT, SLOT_COUNT, TaskTable, Timing};
use crate::utils::logging::{DeviceContext, PipelineMetrics};

/// Slots of the result ring; outlives anything the verify queue can hold
pub const RESULT_RING_SIZE: usize = MIDSTATE_COUNT * SLOT_COUNT;

/// What the read and verify loops need to know about the current pool job
#[derive(Debug, Clone)]
pub struct ActiveJob {
    /// Pool job id
    pub job_id: Arc<str>,
    /// Share target
    pub target: Target,
    /// Base header version of the job
    pub pool_version: u32,
    /// Whether rolled versions are reported as a mask
    pub version_rolling: bool,
    /// Where shares go
    pub submit: Sender<Submit>,
}

impl ActiveJob {
    /// Capture the job fields of `work`
    pub fn from_work(work: &Work) -> Self {
        Self {
            job_id: Arc::clone(&work.job_id),
            target: work.target.clone(),
            pool_version: work.version,
            version_rolling: work.version_rolling,
            submit: work.submit.clone(),
        }
    }
}

/// Everything the three loops of one controller share
pub struct Pipeline {
    /// Device serial
    pub serial: String,
    /// Logging context of the device
    pub context: DeviceContext,
    /// Link to the chain
    pub transport: Arc<dyn Transport>,
    /// Work frames, one per job id
    pub tasks: TaskTable,
    /// Candidates waiting for verification
    pub ring: ResultRing,
    /// Loop cadence
    pub timing: Timing,
    /// Consecutive empty reads before the chain counts as unresponsive
    pub silence_threshold: u32,
    /// Pipeline counters
    pub metrics: Arc<PipelineMetrics>,
    active: RwLock<Option<ActiveJob>>,
    transmitting: AtomicBool,
}

impl Pipeline {
    /// Allocate the slot table and the result ring
    pub fn new(
        context: DeviceContext,
        transport: Arc<dyn Transport>,
        timing: Timing,
        silence_threshold: u32,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            serial: context.serial.clone(),
            context,
            transport,
            tasks: TaskTable::new(),
            ring: ResultRing::new(RESULT_RING_SIZE),
            timing,
            silence_threshold,
            metrics,
            active: RwLock::new(None),
            transmitting: AtomicBool::new(false),
        }
    }

    /// Make `job` the one responses are matched against
    pub fn set_active(&self, job: ActiveJob) {
        *self.active.write() = Some(job);
    }

    /// Current job
    pub fn active(&self) -> Option<ActiveJob> {
        self.active.read().clone()
    }

    /// Current job id
    pub fn active_job_id(&self) -> Option<Arc<str>> {
        self.active.read().as_ref().map(|job| Arc::clone(&job.job_id))
    }

    /// Send a frame, treating a short write as a failure
    pub fn transmit(&self, frame: &[u8]) -> Result<()> {
        let written = self.transport.write(frame)?;
        if written != frame.len() {
            return Err(Error::transport(format!(
                "short write: {} of {} bytes",
                written,
                frame.len()
            )));
        }
        self.transmitting.store(true, Ordering::Release);
        self.metrics.record_frame();
        Ok(())
    }

    /// Whether any work frame has gone out
    pub fn is_transmitting(&self) -> bool {
        self.transmitting.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("serial", &self.serial)
            .field("timing", &self.timing)
            .field("silence_threshold", &self.silence_threshold)
            .finish_non_exhaustive()
    }
}
