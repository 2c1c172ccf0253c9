//! Bit-serial 5-bit checksum used by BM1387 command frames
//!
//! The checksum covers every bit of a frame except the final byte, processed
//! MSB-first through a five-stage shift register seeded with ones. The result
//! lands in the low five bits of the final byte.

/// Register seed
const CRC5_INIT: [u8; 5] = [1, 1, 1, 1, 1];

/// Mask of the bits the checksum occupies in the final byte
pub const CRC5_MASK: u8 = 0x1f;

/// Compute the 5-bit checksum over all but the last byte of `frame`.
pub fn crc5(frame: &[u8]) -> u8 {
    let mut c = CRC5_INIT;
    let covered = frame.len().saturating_sub(1);

    for &byte in &frame[..covered] {
        for shift in (0..8).rev() {
            let bit = (byte >> shift) & 1;
            let c1 = c[1];
            c[1] = c[0];
            c[0] = c[4] ^ bit;
            c[4] = c[3];
            c[3] = c[2];
            c[2] = c1 ^ c[0];
        }
    }

    (c[4] << 4) | (c[3] << 3) | (c[2] << 2) | (c[1] << 1) | c[0]
}

/// OR the checksum into the low five bits of the last byte.
///
/// The top three bits of the last byte are left untouched, so templates that
/// carry flags there keep them.
pub fn stamp(frame: &mut [u8]) {
    if frame.is_empty() {
        return;
    }
    let crc = crc5(frame);
    let last = frame.len() - 1;
    frame[last] |= crc;
}

/// Check that the low five bits of the last byte hold the checksum.
pub fn is_valid(frame: &[u8]) -> bool {
    match frame.last() {
        Some(last) => last & CRC5_MASK == crc5(frame),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_count_chips_checksum() {
        let mut frame = [0x54, 0x05, 0x00, 0x00, 0x00];
        stamp(&mut frame);
        assert_eq!(frame[4], 0x19);
    }

    #[test_case(&[0x54, 0x05, 0x00, 0x00, 0x19]; "count_chips")]
    #[test_case(&[0x55, 0x05, 0x00, 0x00, 0x10]; "chain_inactive")]
    #[test_case(&[0x41, 0x05, 0x15, 0x00, 0x05]; "chain_inactive_chip_1")]
    #[test_case(&[0x58, 0x09, 0x00, 0x1c, 0x00, 0x20, 0x01, 0x00, 0x1b]; "set_baud_a")]
    #[test_case(&[0x48, 0x09, 0x00, 0x0c, 0x00, 0x70, 0x02, 0x21, 0x05]; "set_frequency_700")]
    fn test_known_frames_validate(frame: &[u8]) {
        assert!(is_valid(frame));
    }

    #[test]
    fn test_stamp_preserves_high_bits() {
        let mut frame = [0x55, 0x05, 0x00, 0x00, 0xe0];
        stamp(&mut frame);
        assert_eq!(frame[4] & 0xe0, 0xe0);
        assert_eq!(frame[4] & CRC5_MASK, 0x10);
    }

    #[test]
    fn test_corruption_detected() {
        let mut frame = [0x54, 0x05, 0x00, 0x00, 0x19];
        frame[2] = 0x01;
        assert!(!is_valid(&frame));
        assert!(!is_valid(&[]));
    }

    #[test]
    fn test_single_byte_frame() {
        // Nothing is covered, so the register seed comes out unchanged.
        assert_eq!(crc5(&[0x00]), 0x1f);
    }
}
