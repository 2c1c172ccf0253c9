//! BM1387 chip bus protocol
//!
//! Command frames with their 5-bit checksum, work frames and the task slot
//! table that renders them, nonce responses, and the timing model that sets
//! the pipeline's cadence.

pub mod command;
pub mod crc;
pub mod response;
pub mod task;
pub mod timing;

pub use command::{ChipCommand, FrequencyCode, FrequencyRange, parse_chip_count};
pub use response::{BUSY_NONCES, ResponseBlock, TaskResponse, strip_separators};
pub use task::{MIDSTATE_COUNT, SLOT_COUNT, TaskSlot, TaskTable, base_slot};
pub use timing::Timing;
