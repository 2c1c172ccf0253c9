//! Feeds work frames to the chain at fullscan cadence
//!
//! The first pass over the table sends every slot once, mostly keep-alive
//! frames. After that the loop only visits every fourth slot, refilling the
//! next one with a fresh extranonce2 and rolled versions just ahead of
//! sending it.

use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{Receiver, never, select, tick};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, error, info};

use super::pipeline::{ActiveJob, Pipeline};
use crate::core::Work;
use crate::error::Result;
use crate::protocol::task::MAX_FRAME_SIZE;
use crate::protocol::{MIDSTATE_COUNT, SLOT_COUNT};

/// How often the rolled version order is reshuffled
pub const RESHUFFLE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Transmission order over the slot table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Scheduler {
    next_pos: usize,
    warmed_up: bool,
}

impl Scheduler {
    /// Slot sent on the next tick
    pub fn next_pos(&self) -> usize {
        self.next_pos
    }

    /// Whether the first full pass is done
    pub fn warmed_up(&self) -> bool {
        self.warmed_up
    }

    /// Move past the slot just sent
    pub fn advance(&mut self) {
        self.next_pos += if self.warmed_up { MIDSTATE_COUNT } else { 1 };
        if self.next_pos >= SLOT_COUNT {
            self.next_pos = 0;
            self.warmed_up = true;
        }
    }
}

/// Rewrite slot `slot` with a random extranonce2 and the next rolled versions
fn refill<R: Rng>(pipeline: &Pipeline, work: &mut Work, slot: usize, rng: &mut R) {
    let extranonce2 = rng.random::<u64>() & work.extranonce2_mask();
    let header = work.header(extranonce2);
    let mut versions = [0u32; MIDSTATE_COUNT];
    work.versions.retrieve(&mut versions);
    pipeline
        .tasks
        .update(slot, Arc::clone(&work.job_id), &versions, extranonce2, &header);
}

/// Make `next` the active job.
///
/// Once warmed up, the slot due on the next tick is refilled right away so the
/// first frame after a job change already carries the new work.
fn accept_work<R: Rng>(pipeline: &Pipeline, scheduler: &Scheduler, mut next: Work, rng: &mut R) -> Work {
    info!(job_id = %next.job_id, target = %next.target, "new work");
    pipeline.set_active(ActiveJob::from_work(&next));
    if scheduler.warmed_up() {
        refill(pipeline, &mut next, scheduler.next_pos(), rng);
    }
    next
}

/// Run until `quit` disconnects or a write fails
pub fn run(
    pipeline: &Pipeline,
    quit: Receiver<()>,
    work_rx: Receiver<Work>,
    mut stall: Receiver<()>,
) -> Result<()> {
    let ticker = tick(pipeline.timing.fullscan);
    let reshuffle = tick(RESHUFFLE_INTERVAL);
    let mut rng = StdRng::from_os_rng();
    let mut scheduler = Scheduler::default();
    let mut work: Option<Work> = None;
    let mut frame = Vec::with_capacity(MAX_FRAME_SIZE);
    let mut stall_closed = false;

    loop {
        select! {
            recv(quit) -> _ => return Ok(()),
            recv(work_rx) -> msg => {
                let Ok(next) = msg else {
                    return Ok(());
                };
                work = Some(accept_work(pipeline, &scheduler, next, &mut rng));
            }
            recv(ticker) -> _ => {
                let Some(current) = work.as_mut() else {
                    continue;
                };
                pipeline.tasks.copy_frame(scheduler.next_pos(), &mut frame);
                if let Err(err) = pipeline.transmit(&frame) {
                    error!(error = %err, slot = scheduler.next_pos(), "write failed");
                    return Err(err);
                }

                let was_warm = scheduler.warmed_up();
                scheduler.advance();
                if !was_warm && scheduler.warmed_up() {
                    debug!("slot table warmed up");
                }
                if scheduler.warmed_up() {
                    refill(pipeline, current, scheduler.next_pos(), &mut rng);
                }
            }
            recv(reshuffle) -> _ => {
                if let Some(current) = work.as_mut() {
                    current.versions.shuffle(&mut rng);
                    debug!("reshuffled rolled versions");
                }
            }
            recv(stall) -> msg => match msg {
                Ok(()) => {
                    rng = StdRng::from_os_rng();
                    if let Some(current) = work.as_mut() {
                        current.versions.shuffle(&mut rng);
                    }
                    debug!("reseeded after stall");
                }
                Err(_) => stall_closed = true,
            },
        }

        if stall_closed {
            stall = never();
            stall_closed = false;
        }
    }
}
