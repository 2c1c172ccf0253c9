//! Task slots and the work frames they render
//!
//! The chain addresses work through 127 job ids. Each id owns one [`TaskSlot`]
//! holding a pre-rendered keep-alive frame and a real frame that is rewritten
//! in place whenever new work lands in the slot.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::core::hash::midstate;
use crate::core::result::TaskResult;
use crate::core::work::{HEADER_SIZE, header_ntime};

use super::crc;

/// Number of job ids the chain understands
pub const SLOT_COUNT: usize = 0x7f;

/// Midstates carried by one real frame
pub const MIDSTATE_COUNT: usize = 4;

/// Work frame opcode
pub const TASK_OPCODE: u8 = 0x21;

/// Bytes before the first midstate
const PREAMBLE_SIZE: usize = 20;

/// Unchecked trailer after the last midstate
const TRAILER_SIZE: usize = 2;

/// Size of one midstate block
const MIDSTATE_SIZE: usize = 32;

/// Header bytes copied into the frame preamble (merkle tail, ntime, nbits, nonce seed)
const TAIL_RANGE: std::ops::Range<usize> = 64..HEADER_SIZE;

/// Largest frame a slot can render
pub const MAX_FRAME_SIZE: usize = frame_len(MIDSTATE_COUNT);

/// Length of a work frame carrying `midstates` midstates
pub const fn frame_len(midstates: usize) -> usize {
    PREAMBLE_SIZE + MIDSTATE_SIZE * midstates + TRAILER_SIZE
}

/// Slot a job id reported by the chain belongs to.
///
/// Each base slot carries up to four midstates, and the chip reports which
/// one matched by adding its index to the slot's job id.
pub fn base_slot(job_id: u8) -> usize {
    let job_id = job_id as usize;
    job_id - job_id % MIDSTATE_COUNT
}

/// One job id worth of work
#[derive(Debug, Clone)]
pub struct TaskSlot {
    job_id: u8,
    busy: Vec<u8>,
    real: Vec<u8>,
    is_real: bool,
    work_job: Option<Arc<str>>,
    versions: [u32; MIDSTATE_COUNT],
    midstate_count: usize,
    extranonce2: u64,
    header: [u8; HEADER_SIZE],
}

impl TaskSlot {
    /// Allocate both frames for `job_id`; the slot starts as keep-alive
    pub fn new(job_id: u8) -> Self {
        let job_id = job_id & 0x7f;

        let mut busy = vec![0u8; frame_len(1)];
        busy[0] = TASK_OPCODE;
        busy[1] = frame_len(1) as u8;
        busy[2] = job_id;
        busy[3] = 1;
        crc::stamp(&mut busy);

        let mut real = vec![0u8; MAX_FRAME_SIZE];
        real[0] = TASK_OPCODE;
        real[2] = job_id;

        Self {
            job_id,
            busy,
            real,
            is_real: false,
            work_job: None,
            versions: [0; MIDSTATE_COUNT],
            midstate_count: 0,
            extranonce2: 0,
            header: [0; HEADER_SIZE],
        }
    }

    /// Rewrite the real frame with new work.
    ///
    /// `versions` holds up to four candidate versions; the first zero ends the
    /// list. `midstates` must hold the matching midstate for each non-zero
    /// version. An all-zero version list leaves the slot as keep-alive.
    pub fn update(
        &mut self,
        work_job: Arc<str>,
        versions: &[u32; MIDSTATE_COUNT],
        midstates: &[[u8; MIDSTATE_SIZE]; MIDSTATE_COUNT],
        extranonce2: u64,
        header: &[u8; HEADER_SIZE],
    ) {
        let count = versions.iter().take_while(|&&v| v != 0).count();
        if count == 0 {
            return;
        }
        let len = frame_len(count);

        self.real[1] = len as u8;
        self.real[2] = self.job_id;
        self.real[3] = count as u8;
        self.real[4..PREAMBLE_SIZE].copy_from_slice(&header[TAIL_RANGE]);
        for (index, state) in midstates.iter().take(count).enumerate() {
            let start = PREAMBLE_SIZE + index * MIDSTATE_SIZE;
            self.real[start..start + MIDSTATE_SIZE].copy_from_slice(state);
        }
        self.real[len - TRAILER_SIZE..len].fill(0);

        self.versions = *versions;
        self.midstate_count = count;
        self.extranonce2 = extranonce2;
        self.header = *header;
        self.work_job = Some(work_job);
        self.is_real = true;
    }

    /// Frame to transmit: the real one once work has landed, keep-alive before
    pub fn marshal(&self) -> &[u8] {
        if self.is_real {
            &self.real[..self.real[1] as usize]
        } else {
            &self.busy
        }
    }

    /// Job id of the slot
    pub fn job_id(&self) -> u8 {
        self.job_id
    }

    /// Whether the slot carries real work
    pub fn is_real(&self) -> bool {
        self.is_real
    }

    /// Active midstates in the real frame
    pub fn midstate_count(&self) -> usize {
        self.midstate_count
    }

    /// Pool job the slot was last filled from
    pub fn work_job(&self) -> Option<&Arc<str>> {
        self.work_job.as_ref()
    }

    /// Whether the slot still carries work for `active_job`
    pub fn is_current(&self, active_job: &str) -> bool {
        self.is_real && self.work_job.as_deref() == Some(active_job)
    }

    /// Copy what the verifier needs into `entry`.
    ///
    /// Returns `false` when the slot holds no work or the midstate index is
    /// beyond the active midstates.
    pub fn fill_result(&self, midstate: usize, nonce: u32, entry: &mut TaskResult) -> bool {
        let Some(work_job) = self.work_job.as_ref() else {
            return false;
        };
        if midstate >= self.midstate_count {
            return false;
        }

        entry.job_id = Some(Arc::clone(work_job));
        entry.slot = self.job_id;
        entry.midstate = midstate;
        entry.version = self.versions[midstate];
        entry.extranonce2 = self.extranonce2;
        entry.ntime = header_ntime(&self.header);
        entry.nonce = nonce;
        entry.header = self.header;
        true
    }
}

/// The full set of slots, shared between the write and read loops
#[derive(Debug)]
pub struct TaskTable {
    slots: Box<[Mutex<TaskSlot>]>,
}

impl TaskTable {
    /// Allocate all 127 slots as keep-alive frames
    pub fn new() -> Self {
        let slots = (0..SLOT_COUNT)
            .map(|job_id| Mutex::new(TaskSlot::new(job_id as u8)))
            .collect();
        Self { slots }
    }

    /// Number of slots
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the table has no slots
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Lock one slot
    pub fn lock(&self, index: usize) -> Option<MutexGuard<'_, TaskSlot>> {
        self.slots.get(index).map(|slot| slot.lock())
    }

    /// Copy the frame of slot `index` into `out`
    pub fn copy_frame(&self, index: usize, out: &mut Vec<u8>) -> bool {
        match self.lock(index) {
            Some(slot) => {
                out.clear();
                out.extend_from_slice(slot.marshal());
                true
            }
            None => false,
        }
    }

    /// Fill slot `index` with work built from `header`.
    ///
    /// Midstates are computed before the slot lock is taken.
    pub fn update(
        &self,
        index: usize,
        work_job: Arc<str>,
        versions: &[u32; MIDSTATE_COUNT],
        extranonce2: u64,
        header: &[u8; HEADER_SIZE],
    ) -> bool {
        let mut midstates = [[0u8; MIDSTATE_SIZE]; MIDSTATE_COUNT];
        let mut block = [0u8; 64];
        block.copy_from_slice(&header[..64]);
        for (version, state) in versions.iter().take_while(|&&v| v != 0).zip(midstates.iter_mut()) {
            block[..4].copy_from_slice(&version.to_le_bytes());
            *state = midstate(&block);
        }

        match self.lock(index) {
            Some(mut slot) => {
                slot.update(work_job, versions, &midstates, extranonce2, header);
                true
            }
            None => false,
        }
    }
}

impl Default for TaskTable {
    fn default() -> Self {
        Self::new()
    }
}
