//! Rehashes candidates and submits the ones that meet the share target

use crossbeam::channel::{Receiver, Sender, TrySendError, select, tick};
use tracing::{debug, info, warn};

use super::pipeline::Pipeline;
use crate::core::target::hash_difficulty;
use crate::error::{Error, Result};
use crate::utils::format_difficulty;

/// Verify the candidate in ring entry `index`; `true` if a share was submitted.
///
/// A consumer that stops draining submits cannot hold up shutdown: the send
/// gives up once `quit` disconnects.
fn verify(pipeline: &Pipeline, index: usize, quit: &Receiver<()>) -> bool {
    let candidate = pipeline.ring.lock(index).clone();
    let Some(active) = pipeline.active() else {
        return false;
    };
    if candidate.job_id.as_deref() != Some(&*active.job_id) {
        pipeline.metrics.record_stale();
        return false;
    }

    let hash = candidate.hash();
    let difficulty = hash_difficulty(&hash);
    if difficulty > pipeline.metrics.best_difficulty() {
        debug!(difficulty = %format_difficulty(difficulty), "best difficulty");
    }
    pipeline.metrics.record_verified(difficulty);

    if !active.target.is_met_by(&hash) {
        return false;
    }

    let version_mask = if active.version_rolling {
        candidate.version ^ active.pool_version
    } else {
        0
    };
    let Some(submit) = candidate.to_submit(version_mask) else {
        return false;
    };

    info!(
        job_id = %submit.job_id,
        extranonce2 = %format!("{:016x}", submit.extranonce2),
        ntime = %format!("{:08x}", submit.ntime),
        nonce = %format!("{:08x}", submit.nonce),
        version = %format!("{:08x}", candidate.version),
        difficulty = %format_difficulty(difficulty),
        "share found"
    );
    select! {
        send(active.submit, submit) -> sent => {
            if sent.is_err() {
                warn!(job_id = %active.job_id, "submit channel closed, share dropped");
                return false;
            }
        }
        recv(quit) -> _ => {
            debug!(job_id = %active.job_id, "shutting down, share dropped");
            return false;
        }
    }
    pipeline.metrics.record_share();
    true
}

/// Run until `quit` disconnects or the verify queue closes
pub fn run(
    pipeline: &Pipeline,
    quit: Receiver<()>,
    verify_rx: Receiver<usize>,
    stall_tx: Sender<()>,
) -> Result<()> {
    let period = pipeline.timing.stall_period();
    let mut stall = tick(period);
    let mut found = false;

    loop {
        select! {
            recv(quit) -> _ => return Ok(()),
            recv(verify_rx) -> msg => {
                let Ok(index) = msg else {
                    return Ok(());
                };
                found = verify(pipeline, index, &quit);
            }
            recv(stall) -> _ => match stall_tx.try_send(()) {
                Ok(()) => debug!(period = ?period, "no shares, requesting fresh entropy"),
                Err(TrySendError::Full(_)) => {}
                Err(TrySendError::Disconnected(_)) => {
                    return Err(Error::channel_send("stall signal closed"));
                }
            },
        }

        // A share restarts the stall countdown.
        if found {
            stall = tick(period);
            found = false;
        }
    }
}
