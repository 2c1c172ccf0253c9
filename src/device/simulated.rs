//! In-memory BM1387 chain
//!
//! [`SimulatedChain`] answers the chip bus the way a real chain does: it
//! checks command checksums, reports its chips, acknowledges PLL writes and
//! echoes nonces for work frames. Tests script it; the binary uses it to run
//! the pipeline without hardware.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, trace};

use super::transport::{BitMode, Buffer, FlowControl, LineProperties, Transport};
use crate::error::{Error, Result};
use crate::protocol::command::{BM1387_CHIP_ID, CHIP_RECORD_SIZE};
use crate::protocol::response::SEPARATOR;
use crate::protocol::task::TASK_OPCODE;
use crate::protocol::{BUSY_NONCES, TaskResponse, crc};

const COUNT_CHIPS_OPCODE: u8 = 0x54;
const SET_FREQUENCY_OPCODE: u8 = 0x48;

/// Work frame bytes that are zero in a keep-alive frame
const PAYLOAD_RANGE: std::ops::Range<usize> = 4..52;

/// One operation observed by the simulated chain
#[derive(Debug, Clone, PartialEq)]
pub enum TransportOp {
    /// Bridge reset
    Reset,
    /// Line framing change
    LineProperties(LineProperties),
    /// Line rate change
    BaudRate(u32),
    /// Flow control change
    FlowControl(FlowControl),
    /// Buffer purge
    Purge(Buffer),
    /// Pin mode change
    BitMode(u8, BitMode),
    /// Latency timer change
    LatencyTimer(u8),
    /// Command frame received
    Command(Vec<u8>),
    /// Device released
    Close,
}

#[derive(Debug)]
struct ChainState {
    ops: Vec<TransportOp>,
    pending: VecDeque<u8>,
    baud: u32,
    script: VecDeque<u32>,
    nonce_probability: f64,
    rng: StdRng,
    task_frames: u64,
    crc_errors: u64,
    closed: bool,
}

/// A chain of BM1387 chips behind an in-memory transport
#[derive(Debug)]
pub struct SimulatedChain {
    chips: usize,
    state: Mutex<ChainState>,
    silent: AtomicBool,
    failing: AtomicBool,
}

impl SimulatedChain {
    /// Create a chain of `chips` chips that only reports scripted nonces
    pub fn new(chips: usize) -> Self {
        Self {
            chips,
            state: Mutex::new(ChainState {
                ops: Vec::new(),
                pending: VecDeque::new(),
                baud: 115_200,
                script: VecDeque::new(),
                nonce_probability: 0.0,
                rng: StdRng::from_os_rng(),
                task_frames: 0,
                crc_errors: 0,
                closed: false,
            }),
            silent: AtomicBool::new(false),
            failing: AtomicBool::new(false),
        }
    }

    /// Report a random nonce for a work frame with probability `probability`
    pub fn with_nonce_probability(self, probability: f64) -> Self {
        self.state.lock().nonce_probability = probability.clamp(0.0, 1.0);
        self
    }

    /// Use a fixed seed for random nonces
    pub fn with_seed(self, seed: u64) -> Self {
        self.state.lock().rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Report `nonce` for the next work frame that carries real work
    pub fn script_nonce(&self, nonce: u32) {
        self.state.lock().script.push_back(nonce);
    }

    /// Queue `response` for the next read, as if a chip reported it late
    pub fn inject_response(&self, response: TaskResponse) {
        self.state.lock().pending.extend(response.to_frame());
    }

    /// Stop answering anything
    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }

    /// Fail every read and write
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Operations observed so far
    pub fn ops(&self) -> Vec<TransportOp> {
        self.state.lock().ops.clone()
    }

    /// Command frames received, in order
    pub fn commands(&self) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .ops
            .iter()
            .filter_map(|op| match op {
                TransportOp::Command(frame) => Some(frame.clone()),
                _ => None,
            })
            .collect()
    }

    /// Work frames received
    pub fn task_frames(&self) -> u64 {
        self.state.lock().task_frames
    }

    /// Command frames rejected for a bad checksum
    pub fn crc_errors(&self) -> u64 {
        self.state.lock().crc_errors
    }

    /// Current line rate
    pub fn baud_rate(&self) -> u32 {
        self.state.lock().baud
    }

    /// Whether the device was released
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn check_io(&self, state: &ChainState) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "simulated transport failure",
            )));
        }
        if state.closed {
            return Err(Error::transport("device closed"));
        }
        Ok(())
    }

    fn handle_task(&self, state: &mut ChainState, frame: &[u8]) {
        state.task_frames += 1;
        if frame.len() < 4 || self.silent.load(Ordering::SeqCst) {
            return;
        }
        let slot = frame[2] & 0x7f;
        let midstates = frame[3].max(1);

        let busy = frame
            .get(PAYLOAD_RANGE)
            .is_some_and(|payload| payload.iter().all(|&b| b == 0));
        let response = if busy {
            Some(TaskResponse {
                nonce: BUSY_NONCES[0],
                job_id: slot,
            })
        } else if let Some(nonce) = state.script.pop_front() {
            Some(TaskResponse {
                nonce,
                job_id: slot,
            })
        } else if state.nonce_probability > 0.0 && state.rng.random_bool(state.nonce_probability) {
            let midstate = state.rng.random_range(0..midstates);
            Some(TaskResponse {
                nonce: state.rng.random(),
                job_id: slot.wrapping_add(midstate),
            })
        } else {
            None
        };

        if let Some(response) = response {
            trace!(nonce = response.nonce, job_id = response.job_id, "echo");
            state.pending.extend(response.to_frame());
        }
    }

    fn handle_command(&self, state: &mut ChainState, frame: &[u8]) {
        state.ops.push(TransportOp::Command(frame.to_vec()));
        if !crc::is_valid(frame) {
            state.crc_errors += 1;
            debug!(frame = %hex::encode(frame), "command rejected: bad checksum");
            return;
        }
        if self.silent.load(Ordering::SeqCst) {
            return;
        }

        match frame[0] {
            COUNT_CHIPS_OPCODE => {
                state.pending.extend(SEPARATOR);
                for _ in 0..self.chips {
                    let mut record = [0u8; CHIP_RECORD_SIZE];
                    record[..2].copy_from_slice(&BM1387_CHIP_ID);
                    record[2] = 0x90;
                    record[6] = 0x07;
                    state.pending.extend(record);
                }
            }
            SET_FREQUENCY_OPCODE => {
                let mut ack = [0u8; CHIP_RECORD_SIZE];
                ack[..2].copy_from_slice(&BM1387_CHIP_ID);
                ack[2] = frame.get(2).copied().unwrap_or(0);
                state.pending.extend(ack);
            }
            _ => {}
        }
    }
}

impl Transport for SimulatedChain {
    fn write(&self, data: &[u8]) -> Result<usize> {
        let mut state = self.state.lock();
        self.check_io(&state)?;
        match data.first() {
            Some(&TASK_OPCODE) => self.handle_task(&mut state, data),
            Some(_) => self.handle_command(&mut state, data),
            None => {}
        }
        Ok(data.len())
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.state.lock();
        self.check_io(&state)?;
        if self.silent.load(Ordering::SeqCst) {
            return Ok(0);
        }
        let count = buf.len().min(state.pending.len());
        for (dst, src) in buf.iter_mut().zip(state.pending.drain(..count)) {
            *dst = src;
        }
        Ok(count)
    }

    fn reset(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.pending.clear();
        state.ops.push(TransportOp::Reset);
        Ok(())
    }

    fn set_baud_rate(&self, baud: u32) -> Result<()> {
        let mut state = self.state.lock();
        state.baud = baud;
        state.ops.push(TransportOp::BaudRate(baud));
        Ok(())
    }

    fn set_line_properties(&self, properties: LineProperties) -> Result<()> {
        self.state.lock().ops.push(TransportOp::LineProperties(properties));
        Ok(())
    }

    fn set_flow_control(&self, flow: FlowControl) -> Result<()> {
        self.state.lock().ops.push(TransportOp::FlowControl(flow));
        Ok(())
    }

    fn purge(&self, buffer: Buffer) -> Result<()> {
        let mut state = self.state.lock();
        if buffer == Buffer::Read {
            state.pending.clear();
        }
        state.ops.push(TransportOp::Purge(buffer));
        Ok(())
    }

    fn set_bit_mode(&self, mask: u8, mode: BitMode) -> Result<()> {
        self.state.lock().ops.push(TransportOp::BitMode(mask, mode));
        Ok(())
    }

    fn set_latency_timer(&self, millis: u8) -> Result<()> {
        self.state.lock().ops.push(TransportOp::LatencyTimer(millis));
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.closed = true;
        state.ops.push(TransportOp::Close);
        Ok(())
    }
}
