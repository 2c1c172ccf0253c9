//! Chip configuration commands
//!
//! Every command is a short fixed template, optionally parametrized by chip
//! address, baud divisor or frequency, and stamped with the 5-bit checksum.

use super::crc;
use super::response::strip_separators;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Size of a chip record in a count-chips reply
pub const CHIP_RECORD_SIZE: usize = 7;

/// Chip id every BM1387 reports in its count-chips record
pub const BM1387_CHIP_ID: [u8; 2] = [0x13, 0x87];

/// Frequency step the PLL can be programmed in (MHz)
pub const FREQUENCY_STEP_MHZ: f64 = 6.25;

/// Below this frequency the PLL runs in its low range
const LOW_RANGE_LIMIT_MHZ: f64 = 400.0;

const COUNT_CHIPS: [u8; 5] = [0x54, 0x05, 0x00, 0x00, 0x00];
const CHAIN_INACTIVE: [u8; 5] = [0x55, 0x05, 0x00, 0x00, 0x00];
const CHAIN_INACTIVE_CHIP: [u8; 5] = [0x41, 0x05, 0x00, 0x00, 0x00];
const SET_BAUD_A: [u8; 9] = [0x58, 0x09, 0x00, 0x1c, 0x00, 0x20, 0x00, 0x00, 0x00];
const SET_BAUD_B: [u8; 9] = [0x58, 0x09, 0x00, 0x1c, 0x40, 0x20, 0x80, 0x80, 0x01];
const SET_FREQUENCY: [u8; 9] = [0x48, 0x09, 0x00, 0x0c, 0x00, 0x00, 0x02, 0x00, 0x00];

/// Allowed operating frequency range of a chain (MHz)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrequencyRange {
    /// Lowest frequency
    pub min: f64,
    /// Highest frequency
    pub max: f64,
}

impl FrequencyRange {
    /// Create a new range
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Clamp a requested frequency into the range
    pub fn clamp(&self, mhz: f64) -> f64 {
        mhz.clamp(self.min, self.max)
    }
}

/// PLL encoding of an operating frequency
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrequencyCode {
    /// Frequency the chip will actually run at (MHz)
    pub mhz: f64,
    /// Divider byte
    pub value: u8,
    /// PLL range byte
    pub mode: u8,
}

impl FrequencyCode {
    /// Clamp to `range`, round up to the next 6.25 MHz step and encode.
    pub fn encode(requested_mhz: f64, range: FrequencyRange) -> Self {
        let clamped = range.clamp(requested_mhz);
        let mhz = (clamped / FREQUENCY_STEP_MHZ).ceil() * FREQUENCY_STEP_MHZ;

        if mhz < LOW_RANGE_LIMIT_MHZ {
            Self {
                mhz,
                value: (mhz * 8.0 / 25.0).round() as u8,
                mode: 0x41,
            }
        } else {
            Self {
                mhz,
                value: (mhz * 4.0 / 25.0).round() as u8,
                mode: 0x21,
            }
        }
    }
}

/// Address byte of a chip in a chain of `chip_count` chips.
///
/// Addresses are spread evenly over the 8-bit space.
pub fn chip_address(chip: usize, chip_count: usize) -> u8 {
    if chip_count == 0 {
        return 0;
    }
    ((0x100 / chip_count) * chip) as u8
}

/// A configuration command addressed to the chain
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChipCommand {
    /// Ask every chip to report itself
    CountChips,
    /// Put every chip in the chain into inactive mode
    ChainInactive,
    /// Assign an address to one chip and make it inactive
    ChainInactiveChip {
        /// Position of the chip in the chain
        chip: usize,
        /// Number of chips in the chain
        chip_count: usize,
    },
    /// First phase of the baud negotiation, sent at the low rate
    SetBaudA {
        /// Chip-side baud divisor
        divisor: u8,
    },
    /// Second phase of the baud negotiation, sent at the new rate
    SetBaudB {
        /// Chip-side baud divisor
        divisor: u8,
    },
    /// Program one chip's PLL
    SetFrequency {
        /// Position of the chip in the chain
        chip: usize,
        /// Number of chips in the chain
        chip_count: usize,
        /// Encoded frequency
        code: FrequencyCode,
    },
}

impl ChipCommand {
    /// Render the checksum-stamped frame
    pub fn encode(&self) -> Vec<u8> {
        let mut frame = match *self {
            ChipCommand::CountChips => COUNT_CHIPS.to_vec(),
            ChipCommand::ChainInactive => CHAIN_INACTIVE.to_vec(),
            ChipCommand::ChainInactiveChip { chip, chip_count } => {
                let mut frame = CHAIN_INACTIVE_CHIP.to_vec();
                frame[2] = chip_address(chip, chip_count);
                frame
            }
            ChipCommand::SetBaudA { divisor } => {
                let mut frame = SET_BAUD_A.to_vec();
                frame[6] = divisor;
                frame
            }
            ChipCommand::SetBaudB { divisor } => {
                let mut frame = SET_BAUD_B.to_vec();
                frame[6] = 0x80 | divisor;
                frame
            }
            ChipCommand::SetFrequency {
                chip,
                chip_count,
                code,
            } => {
                let mut frame = SET_FREQUENCY.to_vec();
                frame[2] = chip_address(chip, chip_count);
                frame[5] = code.value;
                frame[7] = code.mode;
                frame
            }
        };
        crc::stamp(&mut frame);
        frame
    }

    /// Opcode byte of the command
    pub fn opcode(&self) -> u8 {
        match self {
            ChipCommand::CountChips => COUNT_CHIPS[0],
            ChipCommand::ChainInactive => CHAIN_INACTIVE[0],
            ChipCommand::ChainInactiveChip { .. } => CHAIN_INACTIVE_CHIP[0],
            ChipCommand::SetBaudA { .. } | ChipCommand::SetBaudB { .. } => SET_BAUD_A[0],
            ChipCommand::SetFrequency { .. } => SET_FREQUENCY[0],
        }
    }
}

/// Parse a count-chips reply and return how many chips answered.
///
/// Separator noise is stripped first. The remaining bytes must be whole
/// 7-byte records, each starting with the BM1387 chip id.
pub fn parse_chip_count(reply: &[u8]) -> Result<usize> {
    let cleaned = strip_separators(reply);
    if cleaned.len() % CHIP_RECORD_SIZE != 0 {
        return Err(Error::protocol(format!(
            "count-chips reply of {} bytes is not a multiple of {}",
            cleaned.len(),
            CHIP_RECORD_SIZE
        )));
    }

    for (index, record) in cleaned.chunks_exact(CHIP_RECORD_SIZE).enumerate() {
        if record[..2] != BM1387_CHIP_ID {
            return Err(Error::protocol(format!(
                "chip record {} reports foreign id {}",
                index,
                hex::encode(&record[..2])
            )));
        }
    }

    Ok(cleaned.len() / CHIP_RECORD_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test]
    fn test_fixed_templates() {
        assert_eq!(ChipCommand::CountChips.encode(), vec![0x54, 0x05, 0x00, 0x00, 0x19]);
        assert_eq!(ChipCommand::ChainInactive.encode(), vec![0x55, 0x05, 0x00, 0x00, 0x10]);
    }

    #[test_case(0, 0x00, 0x15; "first_chip")]
    #[test_case(1, 0x15, 0x05; "second_chip")]
    #[test_case(11, 0xe7, 0x02; "last_chip")]
    fn test_chain_inactive_chip(chip: usize, address: u8, last: u8) {
        let frame = ChipCommand::ChainInactiveChip {
            chip,
            chip_count: 12,
        }
        .encode();
        assert_eq!(frame, vec![0x41, 0x05, address, 0x00, last]);
    }

    #[test]
    fn test_set_baud_phases() {
        let a = ChipCommand::SetBaudA { divisor: 1 }.encode();
        assert_eq!(a, vec![0x58, 0x09, 0x00, 0x1c, 0x00, 0x20, 0x01, 0x00, 0x1b]);

        let b = ChipCommand::SetBaudB { divisor: 1 }.encode();
        assert_eq!(b, vec![0x58, 0x09, 0x00, 0x1c, 0x40, 0x20, 0x81, 0x80, 0x09]);
    }

    #[test_case(700.0, 700.0, 112, 0x21; "high_range")]
    #[test_case(333.0, 337.5, 108, 0x41; "low_range_rounds_up")]
    #[test_case(396.0, 400.0, 64, 0x21; "rounding_crosses_range")]
    #[test_case(50.0, 100.0, 32, 0x41; "clamped_to_min")]
    #[test_case(5000.0, 750.0, 120, 0x21; "clamped_to_max")]
    fn test_frequency_encoding(requested: f64, mhz: f64, value: u8, mode: u8) {
        let code = FrequencyCode::encode(requested, FrequencyRange::new(100.0, 750.0));
        assert_eq!(code.mhz, mhz);
        assert_eq!(code.value, value);
        assert_eq!(code.mode, mode);
    }

    #[test]
    fn test_set_frequency_frame() {
        let code = FrequencyCode::encode(700.0, FrequencyRange::new(100.0, 750.0));
        let frame = ChipCommand::SetFrequency {
            chip: 0,
            chip_count: 12,
            code,
        }
        .encode();
        assert_eq!(frame, vec![0x48, 0x09, 0x00, 0x0c, 0x00, 0x70, 0x02, 0x21, 0x05]);

        let code = FrequencyCode::encode(300.0, FrequencyRange::new(100.0, 750.0));
        let frame = ChipCommand::SetFrequency {
            chip: 1,
            chip_count: 12,
            code,
        }
        .encode();
        assert_eq!(frame, vec![0x48, 0x09, 0x15, 0x0c, 0x00, 0x60, 0x02, 0x41, 0x0f]);
    }

    #[test]
    fn test_parse_chip_count() {
        let record = [0x13, 0x87, 0x90, 0x00, 0x00, 0x00, 0x07];
        let mut reply = vec![0x01, 0x60];
        for _ in 0..12 {
            reply.extend_from_slice(&record);
        }
        assert_eq!(parse_chip_count(&reply).unwrap(), 12);
        assert_eq!(parse_chip_count(&[]).unwrap(), 0);
    }

    #[test]
    fn test_parse_chip_count_malformed() {
        let short = [0x13, 0x87, 0x90, 0x00];
        assert!(matches!(parse_chip_count(&short), Err(Error::Protocol(_))));

        let foreign = [0x13, 0x97, 0x90, 0x00, 0x00, 0x00, 0x07];
        assert!(matches!(parse_chip_count(&foreign), Err(Error::Protocol(_))));
    }
}
