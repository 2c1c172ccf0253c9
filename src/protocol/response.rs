//! Nonce responses coming back from the chain
//!
//! The chain answers with fixed 7-byte frames. The raw byte stream can carry a
//! two-byte `0x01 0x60` marker as noise, which is stripped before framing.

use byteorder::{ByteOrder, LittleEndian};

use super::task::{MIDSTATE_COUNT, SLOT_COUNT, base_slot};

/// Noise marker that shows up in the raw response stream
pub const SEPARATOR: [u8; 2] = [0x01, 0x60];

/// Size of a single response frame
pub const RESPONSE_SIZE: usize = 7;

/// Most responses parsed out of one read
pub const MAX_RESPONSES: usize = 64;

/// Size of the read buffer that holds one block of responses
pub const READ_BUFFER_SIZE: usize = RESPONSE_SIZE * MAX_RESPONSES;

/// Nonces the chain reports while hashing keep-alive frames
pub const BUSY_NONCES: [u32; 2] = [0x83ea_0372, 0x09f8_6be1];

/// Remove every separator marker, keeping the other bytes in order.
///
/// Removal is applied until no marker is left, so a marker that only appears
/// once an inner one is gone (`01 01 60 60`) is removed too. That makes the
/// operation idempotent.
pub fn strip_separators(data: &[u8]) -> Vec<u8> {
    let mut cleaned = Vec::with_capacity(data.len());
    for &byte in data {
        if byte == SEPARATOR[1] && cleaned.last() == Some(&SEPARATOR[0]) {
            cleaned.pop();
        } else {
            cleaned.push(byte);
        }
    }
    cleaned
}

/// A single nonce report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskResponse {
    /// Nonce found by the chip
    pub nonce: u32,
    /// Job id echoed by the chip (base slot plus midstate index)
    pub job_id: u8,
}

impl TaskResponse {
    /// Parse a 7-byte frame: nonce (LE), pad, job id, trailer
    pub fn from_frame(frame: &[u8; RESPONSE_SIZE]) -> Self {
        Self {
            nonce: LittleEndian::read_u32(&frame[..4]),
            job_id: frame[5],
        }
    }

    /// Render the response as the chip would send it
    pub fn to_frame(&self) -> [u8; RESPONSE_SIZE] {
        let mut frame = [0u8; RESPONSE_SIZE];
        LittleEndian::write_u32(&mut frame[..4], self.nonce);
        frame[5] = self.job_id;
        frame
    }

    /// Whether this is an echo of a keep-alive frame
    pub fn is_busy(&self) -> bool {
        BUSY_NONCES.contains(&self.nonce)
    }

    /// Slot that carried the work this nonce belongs to, if in range
    pub fn slot(&self) -> Option<usize> {
        let base = base_slot(self.job_id);
        (base < SLOT_COUNT).then_some(base)
    }

    /// Which midstate of the slot produced the nonce
    pub fn midstate_index(&self) -> usize {
        self.job_id as usize % MIDSTATE_COUNT
    }
}

/// Responses parsed out of one read
#[derive(Debug, Clone, Default)]
pub struct ResponseBlock {
    responses: Vec<TaskResponse>,
    remainder: usize,
}

impl ResponseBlock {
    /// Consume whole 7-byte frames from `data`.
    ///
    /// A trailing fragment shorter than a frame is left unparsed and only
    /// reported through [`ResponseBlock::remainder`].
    pub fn parse(data: &[u8]) -> Self {
        let chunks = data.chunks_exact(RESPONSE_SIZE);
        let remainder = chunks.remainder().len();
        let responses = chunks
            .take(MAX_RESPONSES)
            .filter_map(|chunk| <&[u8; RESPONSE_SIZE]>::try_from(chunk).ok())
            .map(TaskResponse::from_frame)
            .collect();

        Self {
            responses,
            remainder,
        }
    }

    /// Number of responses parsed
    pub fn count(&self) -> usize {
        self.responses.len()
    }

    /// Bytes of the trailing fragment
    pub fn remainder(&self) -> usize {
        self.remainder
    }

    /// Iterate over the parsed responses
    pub fn iter(&self) -> impl Iterator<Item = &TaskResponse> {
        self.responses.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_strip_separators() {
        assert_eq!(strip_separators(&[0x01, 0x60, 0x02, 0x03]), vec![0x02, 0x03]);
        assert_eq!(strip_separators(&[0x01]), vec![0x01]);
        assert_eq!(strip_separators(&[0x01, 0x02]), vec![0x01, 0x02]);
        assert_eq!(strip_separators(&[0x13, 0x01, 0x01, 0x60, 0x60]), vec![0x13]);
        assert!(strip_separators(&[]).is_empty());
    }

    #[test]
    fn test_response_frame() {
        let frame = [0x72, 0x03, 0xea, 0x83, 0x00, 0x17, 0x87];
        let response = TaskResponse::from_frame(&frame);
        assert_eq!(response.nonce, 0x83ea_0372);
        assert_eq!(response.job_id, 0x17);
        assert!(response.is_busy());
        assert_eq!(response.slot(), Some(0x14));
        assert_eq!(response.midstate_index(), 3);
    }

    #[test]
    fn test_out_of_range_slot() {
        let response = TaskResponse {
            nonce: 1,
            job_id: 0x80,
        };
        assert_eq!(response.slot(), None);
    }

    #[test]
    fn test_response_block_fragment() {
        let mut data = Vec::new();
        for job_id in 0..3u8 {
            data.extend_from_slice(
                &TaskResponse {
                    nonce: 0x1234_5678,
                    job_id,
                }
                .to_frame(),
            );
        }
        data.extend_from_slice(&[0xaa, 0xbb, 0xcc]);

        let block = ResponseBlock::parse(&data);
        assert_eq!(block.count(), 3);
        assert_eq!(block.remainder(), 3);
        assert_eq!(ResponseBlock::parse(&[]).count(), 0);
    }

    #[test]
    fn test_response_block_cap() {
        let data = vec![0u8; RESPONSE_SIZE * (MAX_RESPONSES + 2)];
        assert_eq!(ResponseBlock::parse(&data).count(), MAX_RESPONSES);
    }

    proptest! {
        #[test]
        fn strip_is_idempotent(data in prop::collection::vec(prop_oneof![Just(0x01u8), Just(0x60u8), any::<u8>()], 0..256)) {
            let once = strip_separators(&data);
            let twice = strip_separators(&once);
            prop_assert_eq!(&once, &twice);
            prop_assert!(!once.windows(2).any(|w| w == SEPARATOR));
        }

        #[test]
        fn strip_preserves_order(data in prop::collection::vec(2u8..0x60, 0..128)) {
            // No separator bytes at all, so nothing may change.
            prop_assert_eq!(strip_separators(&data), data);
        }

        #[test]
        fn block_counts_whole_frames(frames in 0usize..MAX_RESPONSES, tail in 0usize..RESPONSE_SIZE) {
            let data = vec![0x42u8; frames * RESPONSE_SIZE + tail];
            let block = ResponseBlock::parse(&data);
            prop_assert_eq!(block.count(), frames);
            prop_assert_eq!(block.remainder(), tail);
        }
    }
}
