//! Controller lifecycle and pipeline flow against a simulated chain

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use std::collections::HashSet;

use crossbeam::channel::{Receiver, unbounded};
use gekko_miner::core::hash::double_sha256;
use gekko_miner::core::{Submit, Target, Work};
use gekko_miner::device::controller::{INITIAL_BAUD, OPERATING_BAUD};
use gekko_miner::device::{
    BitMode, Buffer, ChainSettings, ControllerState, DeviceModel, DeviceRegistry, FlowControl,
    LineProperties, SimulatedChain, TransportOp,
};
use gekko_miner::error::Error;
use gekko_miner::protocol::{ChipCommand, SLOT_COUNT, TaskResponse};

const SERIAL: &str = "NP-TEST";

/// NewPac settings with enough cores that a fullscan takes microseconds
fn fast_settings(serial: &str) -> ChainSettings {
    ChainSettings {
        cores_per_chip: 114_000,
        max_response_timeout: Duration::from_secs(10),
        ..ChainSettings::for_model(serial, DeviceModel::NewPac)
    }
}

fn sample_work(job_id: &str, target: Target) -> (Work, Receiver<Submit>) {
    let (submit, submits) = unbounded();
    let work = Work::new(
        job_id,
        [0x11; 32],
        vec![0x01, 0x00, 0x00, 0x00],
        vec![0xff, 0xff, 0xff, 0xff],
        0x2000_0000,
        0x1705_ae3a,
        0x6512_3456,
        target,
        submit,
    );
    (work, submits)
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Rebuild the header a share commits to
fn share_header(work: &Work, submit: &Submit) -> [u8; 80] {
    let mut header = work.header(submit.extranonce2);
    header[0..4].copy_from_slice(&(work.version ^ submit.version_mask).to_le_bytes());
    header[68..72].copy_from_slice(&submit.ntime.to_le_bytes());
    header[76..80].copy_from_slice(&submit.nonce.to_le_bytes());
    header
}
#[test]
fn test_bring_up_sequence() {
    let registry = DeviceRegistry::new();
    let chain = Arc::new(SimulatedChain::new(2));
    let controller = registry.claim(fast_settings(SERIAL), chain.clone()).unwrap();

    controller.reset().unwrap();
    assert_eq!(controller.state(), ControllerState::Running);
    assert_eq!(controller.chip_count(), Some(2));
    assert_eq!(chain.baud_rate(), OPERATING_BAUD);
    assert_eq!(chain.crc_errors(), 0);

    let ops = chain.ops();
    assert_eq!(
        ops[..10].to_vec(),
        vec![
            TransportOp::Reset,
            TransportOp::LineProperties(LineProperties::EIGHT_N_ONE),
            TransportOp::BaudRate(INITIAL_BAUD),
            TransportOp::FlowControl(FlowControl::None),
            TransportOp::Purge(Buffer::Write),
            TransportOp::Purge(Buffer::Read),
            TransportOp::LatencyTimer(1),
            TransportOp::BitMode(0xf2, BitMode::Cbus),
            TransportOp::BitMode(0xf0, BitMode::Cbus),
            TransportOp::BitMode(0xf2, BitMode::Cbus),
        ]
    );

    let commands = chain.commands();
    let expected = vec![
        ChipCommand::CountChips.encode(),
        ChipCommand::ChainInactive.encode(),
        ChipCommand::ChainInactive.encode(),
        ChipCommand::ChainInactive.encode(),
        ChipCommand::ChainInactiveChip { chip: 0, chip_count: 2 }.encode(),
        ChipCommand::ChainInactiveChip { chip: 1, chip_count: 2 }.encode(),
        ChipCommand::SetBaudA { divisor: 1 }.encode(),
        ChipCommand::SetBaudB { divisor: 1 }.encode(),
    ];
    assert_eq!(commands[..expected.len()].to_vec(), expected);
    assert_eq!(commands.iter().filter(|c| c[0] == 0x48).count(), 2);

    // The line switches to the fast rate between the two baud phases.
    let baud_a = ChipCommand::SetBaudA { divisor: 1 }.encode();
    let position = ops
        .iter()
        .position(|op| *op == TransportOp::Command(baud_a.clone()))
        .unwrap();
    assert_eq!(ops[position + 1], TransportOp::BaudRate(OPERATING_BAUD));

    controller.close().unwrap();
}

#[test]
fn test_share_submitted_once() {
    let registry = DeviceRegistry::new();
    let chain = Arc::new(SimulatedChain::new(2));
    chain.script_nonce(0x9546_a142);
    let controller = registry.claim(fast_settings(SERIAL), chain.clone()).unwrap();
    controller.reset().unwrap();

    let (work, submits) = sample_work("job-1", Target::max());
    controller.update_work(work).unwrap();

    let submit = submits.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(&*submit.job_id, "job-1");
    assert_eq!(submit.nonce, 0x9546_a142);
    assert_eq!(submit.ntime, 0x6512_3456);
    assert_eq!(submit.version_mask, 0);
    assert!(submits.recv_timeout(Duration::from_millis(200)).is_err());
    assert_eq!(controller.active_job_id().as_deref(), Some("job-1"));
    assert_eq!(controller.metrics().snapshot().shares, 1);

    controller.close().unwrap();
    assert!(chain.is_closed());
}

#[test]
fn test_random_shares_meet_target() {
    let registry = DeviceRegistry::new();
    let chain = Arc::new(SimulatedChain::new(2).with_nonce_probability(1.0).with_seed(11));
    let controller = registry.claim(fast_settings(SERIAL), chain).unwrap();
    controller.reset().unwrap();

    let target = Target::from_difficulty(1e-9).unwrap();
    assert_ne!(target, Target::max());
    let (work, submits) = sample_work("job-1", target.clone());
    let work = work.with_version_rolling(0x1fff_e000);
    controller.update_work(work.clone()).unwrap();

    let shares: Vec<Submit> = (0..8)
        .map(|_| submits.recv_timeout(Duration::from_secs(10)).unwrap())
        .collect();
    let mut seen = HashSet::new();
    for share in &shares {
        assert_eq!(&*share.job_id, "job-1");
        assert_eq!(share.ntime, work.ntime);
        assert_eq!(share.version_mask & !work.version_mask, 0);
        assert_eq!(share.extranonce2 & !work.extranonce2_mask(), 0);
        let hash = double_sha256(&share_header(&work, share));
        assert!(target.is_met_by(&hash), "share {:?} misses the target", share);
        assert!(seen.insert((share.extranonce2, share.nonce, share.version_mask)));
    }
    let metrics = controller.metrics().snapshot();
    assert!(metrics.verified > metrics.shares);

    controller.close().unwrap();
}

#[test]
fn test_hard_target_submits_nothing() {
    let registry = DeviceRegistry::new();
    let chain = Arc::new(SimulatedChain::new(2).with_nonce_probability(1.0).with_seed(12));
    let controller = registry.claim(fast_settings(SERIAL), chain).unwrap();
    controller.reset().unwrap();

    let (work, submits) = sample_work("job-1", Target::from_difficulty(1e12).unwrap());
    controller.update_work(work.with_version_rolling(0x1fff_e000)).unwrap();

    assert!(wait_until(Duration::from_secs(10), || {
        controller.metrics().snapshot().verified > 0
    }));
    assert!(submits.recv_timeout(Duration::from_millis(300)).is_err());
    assert_eq!(controller.metrics().snapshot().shares, 0);
    controller.close().unwrap();
}

#[test]
fn test_late_nonces_for_replaced_work_are_dropped() {
    let registry = DeviceRegistry::new();
    let chain = Arc::new(SimulatedChain::new(2));
    chain.script_nonce(0x9546_a142);
    // A fullscan of a few milliseconds, polled much faster than that
    let settings = ChainSettings {
        cores_per_chip: 800,
        wait_factor: 0.02,
        ..fast_settings(SERIAL)
    };
    let controller = registry.claim(settings, chain.clone()).unwrap();
    controller.reset().unwrap();

    let (old, old_submits) = sample_work("old", Target::max());
    controller.update_work(old).unwrap();
    let share = old_submits.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(&*share.job_id, "old");

    let unreachable = Target::from_biguint(0u32.into()).unwrap();
    let (new, new_submits) = sample_work("new", unreachable);
    controller.update_work(new).unwrap();
    assert!(wait_until(Duration::from_secs(10), || {
        controller.active_job_id().as_deref() == Some("new")
    }));

    // Nonces reported for frames sent before the switch
    let stale_before = controller.metrics().snapshot().stale;
    for slot in (0..SLOT_COUNT).step_by(4) {
        chain.inject_response(TaskResponse {
            nonce: 0x1000 + slot as u32,
            job_id: slot as u8,
        });
    }
    assert!(wait_until(Duration::from_secs(10), || {
        controller.metrics().snapshot().stale >= stale_before + 16
    }));
    assert!(old_submits.recv_timeout(Duration::from_millis(200)).is_err());
    assert!(new_submits.try_recv().is_err());

    controller.close().unwrap();
}

#[test]
fn test_work_before_reset_is_delivered() {
    let registry = DeviceRegistry::new();
    let chain = Arc::new(SimulatedChain::new(2));
    chain.script_nonce(7);
    let controller = registry.claim(fast_settings(SERIAL), chain).unwrap();

    let (work, submits) = sample_work("early", Target::max());
    controller.update_work(work).unwrap();
    controller.reset().unwrap();

    let submit = submits.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(&*submit.job_id, "early");
    controller.close().unwrap();
}

#[test]
fn test_silent_chain_is_retired() {
    let registry = DeviceRegistry::new();
    let chain = Arc::new(SimulatedChain::new(2));
    let settings = ChainSettings {
        max_response_timeout: Duration::from_millis(50),
        ..fast_settings(SERIAL)
    };
    let controller = registry.claim(settings, chain.clone()).unwrap();
    controller.reset().unwrap();

    let (work, _submits) = sample_work("job-1", Target::max());
    controller.update_work(work).unwrap();
    chain.set_silent(true);

    assert!(wait_until(Duration::from_secs(10), || !registry.in_use(SERIAL)));
    assert_eq!(controller.state(), ControllerState::Closed);
    assert!(chain.is_closed());
}

#[test]
fn test_idle_chain_is_not_silent() {
    let registry = DeviceRegistry::new();
    let chain = Arc::new(SimulatedChain::new(2));
    let settings = ChainSettings {
        max_response_timeout: Duration::from_millis(20),
        ..fast_settings(SERIAL)
    };
    let controller = registry.claim(settings, chain.clone()).unwrap();
    controller.reset().unwrap();
    chain.set_silent(true);

    // Nothing has been sent yet, so quiet reads do not count.
    thread::sleep(Duration::from_millis(200));
    assert!(registry.in_use(SERIAL));
    assert_eq!(controller.state(), ControllerState::Running);
    controller.close().unwrap();
}

#[test]
fn test_chip_count_mismatch_fails_bring_up() {
    let registry = DeviceRegistry::new();
    let chain = Arc::new(SimulatedChain::new(3));
    let controller = registry.claim(fast_settings(SERIAL), chain.clone()).unwrap();

    let err = controller.reset().unwrap_err();
    assert!(matches!(err, Error::ChipCountMismatch { expected: 2, found: 3 }));
    assert_eq!(controller.state(), ControllerState::Closed);
    assert!(!registry.in_use(SERIAL));
    assert!(chain.is_closed());
}

#[test]
fn test_unanswered_count_fails_bring_up() {
    let registry = DeviceRegistry::new();
    let chain = Arc::new(SimulatedChain::new(2));
    chain.set_silent(true);
    let controller = registry.claim(fast_settings(SERIAL), chain).unwrap();

    let err = controller.reset().unwrap_err();
    assert!(matches!(err, Error::ChipCountMismatch { expected: 2, found: 0 }));
    assert!(registry.is_empty());
}

#[test]
fn test_transport_failure_retires_device() {
    let registry = DeviceRegistry::new();
    let chain = Arc::new(SimulatedChain::new(2));
    let controller = registry.claim(fast_settings(SERIAL), chain.clone()).unwrap();
    controller.reset().unwrap();

    let (work, _submits) = sample_work("job-1", Target::max());
    controller.update_work(work).unwrap();
    chain.set_failing(true);

    assert!(wait_until(Duration::from_secs(10), || !registry.in_use(SERIAL)));
    assert_eq!(controller.state(), ControllerState::Closed);
    assert!(controller.update_work(sample_work("job-2", Target::max()).0).is_err());
}

#[test]
fn test_close_is_idempotent() {
    let registry = DeviceRegistry::new();
    let chain = Arc::new(SimulatedChain::new(2));
    let controller = registry.claim(fast_settings(SERIAL), chain.clone()).unwrap();
    controller.reset().unwrap();

    controller.close().unwrap();
    controller.close().unwrap();
    controller.exit();
    assert_eq!(controller.state(), ControllerState::Closed);
    let closes = chain
        .ops()
        .into_iter()
        .filter(|op| *op == TransportOp::Close)
        .count();
    assert_eq!(closes, 1);
}

#[test]
fn test_serial_claimed_once() {
    let registry = DeviceRegistry::new();
    registry
        .claim(fast_settings(SERIAL), Arc::new(SimulatedChain::new(2)))
        .unwrap();
    let err = registry
        .claim(fast_settings(SERIAL), Arc::new(SimulatedChain::new(2)))
        .unwrap_err();
    assert!(matches!(err, Error::DeviceInUse(_)));

    registry.close_all();
    assert!(registry.is_empty());
    assert!(
        registry
            .claim(fast_settings(SERIAL), Arc::new(SimulatedChain::new(2)))
            .is_ok()
    );
}
