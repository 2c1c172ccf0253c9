//! Byte transport to a chip chain
//!
//! The controller talks to hardware through [`Transport`]: plain byte reads
//! and writes plus the bridge operations the bring-up sequence needs. An
//! FTDI-style USB bridge and the in-memory [`SimulatedChain`] both implement
//! it.
//!
//! [`SimulatedChain`]: super::simulated::SimulatedChain

use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::Result;

/// Serial line framing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineProperties {
    /// Data bits per character
    pub data_bits: u8,
    /// Stop bits per character
    pub stop_bits: u8,
    /// Parity
    pub parity: Parity,
}

impl LineProperties {
    /// 8 data bits, no parity, 1 stop bit
    pub const EIGHT_N_ONE: Self = Self {
        data_bits: 8,
        stop_bits: 1,
        parity: Parity::None,
    };
}

impl Default for LineProperties {
    fn default() -> Self {
        Self::EIGHT_N_ONE
    }
}

/// Parity setting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    /// No parity bit
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

/// Hardware flow control
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControl {
    /// No flow control
    None,
    /// RTS/CTS handshake
    RtsCts,
    /// DTR/DSR handshake
    DtrDsr,
}

/// Bridge buffer selector for purges
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Buffer {
    /// Receive buffer
    Read,
    /// Transmit buffer
    Write,
}

/// Bridge pin mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitMode {
    /// Normal UART operation
    Reset,
    /// Drive the CBUS pins directly
    Cbus,
}

impl fmt::Display for BitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BitMode::Reset => write!(f, "reset"),
            BitMode::Cbus => write!(f, "cbus"),
        }
    }
}

/// Byte-oriented link to one chip chain.
///
/// Methods take `&self` so the write and read loops can share one
/// transport; implementations serialize access internally. `read` never
/// blocks for long: it returns `Ok(0)` when nothing is pending.
pub trait Transport: Send + Sync {
    /// Write a frame, returning the bytes accepted
    fn write(&self, data: &[u8]) -> Result<usize>;

    /// Read whatever is pending into `buf`
    fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Hard-reset the bridge
    fn reset(&self) -> Result<()>;

    /// Change the line rate
    fn set_baud_rate(&self, baud: u32) -> Result<()>;

    /// Set character framing
    fn set_line_properties(&self, properties: LineProperties) -> Result<()>;

    /// Set flow control
    fn set_flow_control(&self, flow: FlowControl) -> Result<()>;

    /// Drop buffered bytes
    fn purge(&self, buffer: Buffer) -> Result<()>;

    /// Switch pin mode; `mask` carries pin direction and level
    fn set_bit_mode(&self, mask: u8, mode: BitMode) -> Result<()>;

    /// Set the bridge latency timer (ms)
    fn set_latency_timer(&self, millis: u8) -> Result<()>;

    /// Release the device
    fn close(&self) -> Result<()>;
}

/// Read until a reply has arrived and the line went quiet, or `timeout` passes.
///
/// Returns whatever was collected; an empty vector means no reply.
pub fn read_reply<T: Transport + ?Sized>(transport: &T, timeout: Duration) -> Result<Vec<u8>> {
    let deadline = Instant::now() + timeout;
    let mut reply = Vec::new();
    let mut chunk = [0u8; 64];

    loop {
        let read = transport.read(&mut chunk)?;
        if read > 0 {
            reply.extend_from_slice(&chunk[..read]);
            continue;
        }
        if !reply.is_empty() || Instant::now() >= deadline {
            return Ok(reply);
        }
        thread::sleep(Duration::from_millis(1));
    }
}
