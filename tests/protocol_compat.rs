//! Wire compatibility with BM1387 chains

use std::time::Duration;

use gekko_miner::device::transport::read_reply;
use gekko_miner::device::{SimulatedChain, Transport};
use gekko_miner::protocol::{
    BUSY_NONCES, ChipCommand, FrequencyCode, FrequencyRange, ResponseBlock, SLOT_COUNT, TaskResponse,
    TaskTable, Timing, base_slot, crc, parse_chip_count, strip_separators,
};
use pretty_assertions::assert_eq;

#[test]
fn test_command_frames_carry_valid_checksums() {
    let code = FrequencyCode::encode(700.0, FrequencyRange::new(200.0, 1200.0));
    let commands = [
        ChipCommand::CountChips,
        ChipCommand::ChainInactive,
        ChipCommand::ChainInactiveChip {
            chip: 5,
            chip_count: 12,
        },
        ChipCommand::SetBaudA { divisor: 1 },
        ChipCommand::SetBaudB { divisor: 1 },
        ChipCommand::SetFrequency {
            chip: 3,
            chip_count: 12,
            code,
        },
    ];
    for command in commands {
        let frame = command.encode();
        assert!(crc::is_valid(&frame), "{:?} -> {}", command, hex::encode(&frame));
        assert_eq!(frame[0], command.opcode());
        assert_eq!(frame[1] as usize, frame.len());
    }
    assert_eq!(ChipCommand::CountChips.encode(), vec![0x54, 0x05, 0x00, 0x00, 0x19]);
}

#[test]
fn test_keep_alive_frames_are_checksummed() {
    let table = TaskTable::new();
    let mut frame = Vec::new();
    for slot in [0, 0x20, 0x74, SLOT_COUNT - 1] {
        assert!(table.copy_frame(slot, &mut frame));
        assert_eq!(frame.len(), 54);
        assert_eq!(frame[2] as usize, slot);
        assert!(crc::is_valid(&frame));
    }
}

#[test]
fn test_response_stream_with_separator_noise() {
    let report = TaskResponse {
        nonce: 0x1234_5678,
        job_id: 0x75,
    };
    let busy = TaskResponse {
        nonce: BUSY_NONCES[1],
        job_id: 0x10,
    };

    let mut stream = vec![0x01, 0x60];
    stream.extend_from_slice(&report.to_frame());
    stream.extend_from_slice(&[0x01, 0x01, 0x60, 0x60]);
    stream.extend_from_slice(&busy.to_frame());
    stream.extend_from_slice(&[0xaa, 0xbb]);

    let cleaned = strip_separators(&stream);
    assert_eq!(strip_separators(&cleaned), cleaned);

    let block = ResponseBlock::parse(&cleaned);
    assert_eq!(block.count(), 2);
    assert_eq!(block.remainder(), 2);

    let parsed: Vec<TaskResponse> = block.iter().copied().collect();
    assert_eq!(parsed, vec![report, busy]);
    assert_eq!(parsed[0].slot(), Some(0x74));
    assert_eq!(parsed[0].midstate_index(), 1);
    assert!(!parsed[0].is_busy());
    assert!(parsed[1].is_busy());
}

#[test]
fn test_job_ids_outside_the_table() {
    assert_eq!(base_slot(0x7f), 0x7c);
    let beyond = TaskResponse {
        nonce: 1,
        job_id: 0x80,
    };
    assert_eq!(beyond.slot(), None);
}

#[test]
fn test_chain_enumeration_over_transport() {
    let chain = SimulatedChain::new(12);
    chain.write(&ChipCommand::CountChips.encode()).unwrap();
    let reply = read_reply(&chain, Duration::from_millis(100)).unwrap();
    assert_eq!(reply.len(), 2 + 12 * 7);
    assert_eq!(parse_chip_count(&reply).unwrap(), 12);
}

#[test]
fn test_keep_alive_echo_over_transport() {
    let chain = SimulatedChain::new(2);
    let table = TaskTable::new();
    let mut frame = Vec::new();
    table.copy_frame(0x20, &mut frame);
    chain.write(&frame).unwrap();

    let reply = read_reply(&chain, Duration::from_millis(50)).unwrap();
    let block = ResponseBlock::parse(&strip_separators(&reply));
    let responses: Vec<&TaskResponse> = block.iter().collect();
    assert_eq!(responses.len(), 1);
    assert!(responses[0].is_busy());
    assert_eq!(responses[0].slot(), Some(0x20));
}

#[test]
fn test_newpac_timing() {
    let timing = Timing::new(2, 550.0, 114, 0.5).unwrap();
    assert_eq!(timing.fullscan, Duration::from_nanos(34_250_137));
    assert_eq!(timing.max_task_wait, Duration::from_nanos(17_125_068));
    assert_eq!(timing.silence_threshold(Duration::from_secs(1)), 58);
}
