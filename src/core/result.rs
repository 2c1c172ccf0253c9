//! Nonce candidates on their way to the verifier
//!
//! Candidates live in a fixed arena of [`TaskResult`] entries addressed by a
//! wrapping cursor. The read loop fills an entry and passes its index along;
//! the verifier reads it back before the cursor comes around again.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::{Mutex, MutexGuard};

use super::hash::double_sha256;
use super::work::{HEADER_SIZE, Submit};

/// One nonce candidate with the header it belongs to
#[derive(Debug, Clone)]
pub struct TaskResult {
    /// Pool job the slot was filled from
    pub job_id: Option<Arc<str>>,
    /// Slot that carried the work
    pub slot: u8,
    /// Midstate index that produced the nonce
    pub midstate: usize,
    /// Header version of that midstate
    pub version: u32,
    /// Extranonce2 the header was built with
    pub extranonce2: u64,
    /// Header timestamp
    pub ntime: u32,
    /// Nonce reported by the chip
    pub nonce: u32,
    /// Template header the slot was built from
    pub header: [u8; HEADER_SIZE],
}

impl Default for TaskResult {
    fn default() -> Self {
        Self {
            job_id: None,
            slot: 0,
            midstate: 0,
            version: 0,
            extranonce2: 0,
            ntime: 0,
            nonce: 0,
            header: [0; HEADER_SIZE],
        }
    }
}

impl TaskResult {
    /// Header with version, ntime and nonce applied
    pub fn full_header(&self) -> [u8; HEADER_SIZE] {
        let mut header = self.header;
        LittleEndian::write_u32(&mut header[0..4], self.version);
        LittleEndian::write_u32(&mut header[68..72], self.ntime);
        LittleEndian::write_u32(&mut header[76..80], self.nonce);
        header
    }

    /// Double SHA256 of the full header
    pub fn hash(&self) -> [u8; 32] {
        double_sha256(&self.full_header())
    }

    /// Share for the pool, or `None` if the entry was never filled
    pub fn to_submit(&self, version_mask: u32) -> Option<Submit> {
        let job_id = self.job_id.as_ref()?;
        Some(Submit {
            job_id: Arc::clone(job_id),
            extranonce2: self.extranonce2,
            ntime: self.ntime,
            nonce: self.nonce,
            version_mask,
        })
    }
}

/// Preallocated arena of candidates with a wrapping cursor
#[derive(Debug)]
pub struct ResultRing {
    entries: Box<[Mutex<TaskResult>]>,
    cursor: AtomicUsize,
}

impl ResultRing {
    /// Allocate `capacity` entries (at least one)
    pub fn new(capacity: usize) -> Self {
        let entries = (0..capacity.max(1))
            .map(|_| Mutex::new(TaskResult::default()))
            .collect();
        Self {
            entries,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Number of entries
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Claim the next entry, wrapping around at the end
    pub fn next_index(&self) -> usize {
        self.cursor.fetch_add(1, Ordering::Relaxed) % self.entries.len()
    }

    /// Lock an entry
    pub fn lock(&self, index: usize) -> MutexGuard<'_, TaskResult> {
        self.entries[index % self.entries.len()].lock()
    }
}
