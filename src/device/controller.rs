//! Bring-up and supervision of one BM1387 chain
//!
//! A [`Controller`] owns the transport of one device. [`Controller::reset`]
//! walks the chain through power-cycle, enumeration, baud negotiation and PLL
//! setup, then starts the write, read and verify loops on their own threads.
//! A supervisor thread watches the loops and retires the device when one of
//! them fails.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, bounded, unbounded};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::catalog::{BM1387_BAUD_DIVISOR, BM1387_CORES, BM1387_WAIT_FACTOR, DeviceModel};
use super::pipeline::Pipeline;
use super::registry::DeviceRegistry;
use super::transport::{BitMode, Buffer, FlowControl, LineProperties, Transport, read_reply};
use super::{read_loop, verify_loop, write_loop};
use crate::core::Work;
use crate::error::{Error, Result};
use crate::log_controller_state;
use crate::protocol::{ChipCommand, FrequencyCode, FrequencyRange, SLOT_COUNT, Timing, parse_chip_count};
use crate::utils::format_hashrate;
use crate::utils::logging::{DeviceContext, PipelineMetrics};

/// Line rate the chain powers up at
pub const INITIAL_BAUD: u32 = 115_200;

/// Line rate after negotiation
pub const OPERATING_BAUD: u32 = 1_500_000;

/// Bridge latency timer (ms)
const LATENCY_TIMER_MS: u8 = 1;

/// CBUS pin levels for the power-cycle toggle
const CBUS_HIGH: u8 = 0xf2;
const CBUS_LOW: u8 = 0xf0;

const COUNT_CHIPS_TIMEOUT: Duration = Duration::from_millis(100);
const FREQUENCY_ACK_TIMEOUT: Duration = Duration::from_millis(50);

/// Lifecycle of a controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Created, not yet reset
    Idle,
    /// Resetting the bridge and power-cycling the chain
    Resetting,
    /// Enumerating chips
    CountingChips,
    /// Setting addresses, baud rate and frequency
    Configuring,
    /// Loops running
    Running,
    /// Shutting down after a failure
    Exiting,
    /// Transport released
    Closed,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControllerState::Idle => "idle",
            ControllerState::Resetting => "resetting",
            ControllerState::CountingChips => "counting_chips",
            ControllerState::Configuring => "configuring",
            ControllerState::Running => "running",
            ControllerState::Exiting => "exiting",
            ControllerState::Closed => "closed",
        };
        write!(f, "{}", name)
    }
}

/// Everything the controller needs to know about one chain
#[derive(Debug, Clone, PartialEq)]
pub struct ChainSettings {
    /// USB serial number
    pub serial: String,
    /// Product
    pub model: DeviceModel,
    /// Chips the chain must report
    pub expected_chips: usize,
    /// Requested frequency (MHz)
    pub frequency: f64,
    /// Allowed frequency range
    pub range: FrequencyRange,
    /// Hashing cores per chip
    pub cores_per_chip: u32,
    /// Read interval as a fraction of a fullscan
    pub wait_factor: f64,
    /// Chip-side baud divisor
    pub baud_divisor: u8,
    /// Longest silence tolerated once work is flowing
    pub max_response_timeout: Duration,
}

impl ChainSettings {
    /// Factory settings of `model`
    pub fn for_model(serial: impl Into<String>, model: DeviceModel) -> Self {
        let defaults = model.defaults();
        Self {
            serial: serial.into(),
            model,
            expected_chips: defaults.chips,
            frequency: defaults.frequency,
            range: defaults.range,
            cores_per_chip: BM1387_CORES,
            wait_factor: BM1387_WAIT_FACTOR,
            baud_divisor: BM1387_BAUD_DIVISOR,
            max_response_timeout: Duration::from_millis(defaults.max_response_timeout_ms),
        }
    }
}

/// Outcome of one loop thread
#[derive(Debug)]
struct LoopExit {
    name: &'static str,
    outcome: Result<()>,
}

#[derive(Default)]
struct Lifecycle {
    quit: Option<Sender<()>>,
    work: Option<Sender<Work>>,
    work_drain: Option<Receiver<Work>>,
    pending_work: Option<Work>,
    handles: Vec<JoinHandle<()>>,
}

/// Controller of one BM1387 chain
pub struct Controller {
    settings: ChainSettings,
    transport: Arc<dyn Transport>,
    registry: Mutex<Weak<DeviceRegistry>>,
    state: RwLock<ControllerState>,
    lifecycle: Mutex<Lifecycle>,
    pipeline: RwLock<Option<Arc<Pipeline>>>,
    shutting_down: AtomicBool,
    metrics: Arc<PipelineMetrics>,
}

impl Controller {
    /// Create an idle controller that owns `transport`
    pub fn new(settings: ChainSettings, transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self {
            settings,
            transport,
            registry: Mutex::new(Weak::new()),
            state: RwLock::new(ControllerState::Idle),
            lifecycle: Mutex::new(Lifecycle::default()),
            pipeline: RwLock::new(None),
            shutting_down: AtomicBool::new(false),
            metrics: Arc::new(PipelineMetrics::new()),
        })
    }

    pub(crate) fn attach(&self, registry: Weak<DeviceRegistry>) {
        *self.registry.lock() = registry;
    }

    /// Device serial
    pub fn serial(&self) -> &str {
        &self.settings.serial
    }

    /// Chain settings
    pub fn settings(&self) -> &ChainSettings {
        &self.settings
    }

    /// Current lifecycle state
    pub fn state(&self) -> ControllerState {
        *self.state.read()
    }

    /// Whether close has begun
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Chips found during bring-up
    pub fn chip_count(&self) -> Option<usize> {
        self.pipeline.read().as_ref().and_then(|p| p.context.chips)
    }

    /// Operating frequency after rounding (MHz)
    pub fn frequency(&self) -> Option<f64> {
        self.pipeline.read().as_ref().and_then(|p| p.context.frequency)
    }

    /// Loop cadence
    pub fn timing(&self) -> Option<Timing> {
        self.pipeline.read().as_ref().map(|p| p.timing)
    }

    /// Job responses are currently matched against
    pub fn active_job_id(&self) -> Option<Arc<str>> {
        self.pipeline.read().as_ref().and_then(|p| p.active_job_id())
    }

    /// Best difficulty seen this session
    pub fn best_difficulty(&self) -> f64 {
        self.metrics.best_difficulty()
    }

    /// Pipeline counters
    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// Logging context of the device
    pub fn context(&self) -> DeviceContext {
        match self.pipeline.read().as_ref() {
            Some(pipeline) => pipeline.context.clone(),
            None => DeviceContext::for_device(&self.settings.serial)
                .with_model(&self.settings.model.to_string()),
        }
    }

    fn transition(&self, next: ControllerState) {
        let mut state = self.state.write();
        let previous = *state;
        if previous == next || previous == ControllerState::Closed {
            return;
        }
        *state = next;
        log_controller_state!(self.settings.serial, previous, next);
    }

    fn send(&self, command: ChipCommand) -> Result<()> {
        let frame = command.encode();
        let written = self.transport.write(&frame)?;
        if written != frame.len() {
            return Err(Error::transport(format!(
                "short write: {} of {} bytes",
                written,
                frame.len()
            )));
        }
        Ok(())
    }

    /// Bring the chain up and start the loops.
    ///
    /// Any failure retires the controller.
    pub fn reset(self: &Arc<Self>) -> Result<()> {
        if self.state() != ControllerState::Idle {
            return Err(Error::other(format!(
                "{} cannot reset from state {}",
                self.settings.serial,
                self.state()
            )));
        }

        let span = DeviceContext::for_device(&self.settings.serial)
            .with_model(&self.settings.model.to_string())
            .span("reset");
        let _enter = span.enter();

        match self.bring_up() {
            Ok(()) => Ok(()),
            Err(err) => {
                error!(error = %err, "bring-up failed");
                self.exit();
                Err(err)
            }
        }
    }

    fn bring_up(self: &Arc<Self>) -> Result<()> {
        self.transition(ControllerState::Resetting);
        self.reset_transport()?;
        self.power_cycle()?;

        self.transition(ControllerState::CountingChips);
        let chips = self.count_chips()?;
        info!(chips, "chain enumerated");

        self.transition(ControllerState::Configuring);
        self.chain_inactive(chips)?;
        self.negotiate_baud()?;
        let code = self.set_frequency(chips)?;

        let timing = Timing::new(chips, code.mhz, self.settings.cores_per_chip, self.settings.wait_factor)?;
        info!(
            hashrate = %format_hashrate(timing.hash_rate),
            fullscan = ?timing.fullscan,
            max_task_wait = ?timing.max_task_wait,
            "timing"
        );

        self.start_loops(chips, code.mhz, timing)?;
        self.transition(ControllerState::Running);
        Ok(())
    }

    fn reset_transport(&self) -> Result<()> {
        let transport = &self.transport;
        transport.reset()?;
        transport.set_line_properties(LineProperties::EIGHT_N_ONE)?;
        transport.set_baud_rate(INITIAL_BAUD)?;
        transport.set_flow_control(FlowControl::None)?;
        transport.purge(Buffer::Write)?;
        transport.purge(Buffer::Read)?;
        transport.set_latency_timer(LATENCY_TIMER_MS)?;
        Ok(())
    }

    fn power_cycle(&self) -> Result<()> {
        self.transport.set_bit_mode(CBUS_HIGH, BitMode::Cbus)?;
        thread::sleep(Duration::from_millis(30));
        self.transport.set_bit_mode(CBUS_LOW, BitMode::Cbus)?;
        thread::sleep(Duration::from_millis(30));
        self.transport.set_bit_mode(CBUS_HIGH, BitMode::Cbus)?;
        thread::sleep(Duration::from_millis(200));
        Ok(())
    }

    fn count_chips(&self) -> Result<usize> {
        self.send(ChipCommand::CountChips)?;
        thread::sleep(Duration::from_millis(10));
        let reply = read_reply(&*self.transport, COUNT_CHIPS_TIMEOUT)?;

        let found = match parse_chip_count(&reply) {
            Ok(found) => found,
            Err(err) => {
                warn!(error = %err, reply = %hex::encode(&reply), "unreadable count-chips reply");
                0
            }
        };
        if found != self.settings.expected_chips {
            return Err(Error::ChipCountMismatch {
                expected: self.settings.expected_chips,
                found,
            });
        }
        Ok(found)
    }

    fn chain_inactive(&self, chips: usize) -> Result<()> {
        for attempt in 0..3 {
            if attempt > 0 {
                thread::sleep(Duration::from_millis(5));
            }
            self.send(ChipCommand::ChainInactive)?;
        }
        for chip in 0..chips {
            thread::sleep(Duration::from_millis(5));
            self.send(ChipCommand::ChainInactiveChip {
                chip,
                chip_count: chips,
            })?;
        }
        thread::sleep(Duration::from_millis(10));
        Ok(())
    }

    fn negotiate_baud(&self) -> Result<()> {
        let divisor = self.settings.baud_divisor;
        self.send(ChipCommand::SetBaudA { divisor })?;
        thread::sleep(Duration::from_millis(10));
        self.transport.set_baud_rate(OPERATING_BAUD)?;
        self.send(ChipCommand::SetBaudB { divisor })?;
        thread::sleep(Duration::from_millis(10));
        debug!(baud = OPERATING_BAUD, "baud negotiated");
        Ok(())
    }

    fn set_frequency(&self, chips: usize) -> Result<FrequencyCode> {
        let code = FrequencyCode::encode(self.settings.frequency, self.settings.range);
        for chip in 0..chips {
            self.send(ChipCommand::SetFrequency {
                chip,
                chip_count: chips,
                code,
            })?;
            let ack = read_reply(&*self.transport, FREQUENCY_ACK_TIMEOUT)?;
            if ack.is_empty() {
                debug!(chip, "no frequency ack");
            }
        }
        info!(requested = self.settings.frequency, frequency = code.mhz, "frequency set");
        Ok(code)
    }

    fn start_loops(self: &Arc<Self>, chips: usize, frequency: f64, timing: Timing) -> Result<()> {
        let context = DeviceContext::for_device(&self.settings.serial)
            .with_model(&self.settings.model.to_string())
            .with_chips(chips)
            .with_frequency(frequency);
        let silence_threshold = timing.silence_threshold(self.settings.max_response_timeout);
        let pipeline = Arc::new(Pipeline::new(
            context,
            Arc::clone(&self.transport),
            timing,
            silence_threshold,
            Arc::clone(&self.metrics),
        ));

        let (quit_tx, quit_rx) = bounded::<()>(0);
        let (work_tx, work_rx) = bounded::<Work>(1);
        let (verify_tx, verify_rx) = bounded::<usize>(SLOT_COUNT);
        let (stall_tx, stall_rx) = bounded::<()>(1);
        let (exit_tx, exit_rx) = unbounded::<LoopExit>();

        let mut lifecycle = self.lifecycle.lock();
        if self.is_shutting_down() {
            return Err(Error::other("controller closed during bring-up"));
        }
        *self.pipeline.write() = Some(Arc::clone(&pipeline));

        self.spawn_supervisor(exit_rx)?;
        let work_drain = work_rx.clone();
        let handles = vec![
            self.spawn_loop("write", &pipeline, &exit_tx, {
                let quit = quit_rx.clone();
                move |p: &Pipeline| write_loop::run(p, quit, work_rx, stall_rx)
            })?,
            self.spawn_loop("read", &pipeline, &exit_tx, {
                let quit = quit_rx.clone();
                move |p: &Pipeline| read_loop::run(p, quit, verify_tx)
            })?,
            self.spawn_loop("verify", &pipeline, &exit_tx, move |p: &Pipeline| {
                verify_loop::run(p, quit_rx, verify_rx, stall_tx)
            })?,
        ];

        lifecycle.quit = Some(quit_tx);
        lifecycle.handles = handles;
        if let Some(work) = lifecycle.pending_work.take() {
            if work_tx.try_send(work).is_err() {
                warn!("pending work not delivered");
            }
        }
        lifecycle.work = Some(work_tx);
        lifecycle.work_drain = Some(work_drain);

        info!(silence_threshold, "pipeline started");
        Ok(())
    }

    fn spawn_loop<F>(
        &self,
        name: &'static str,
        pipeline: &Arc<Pipeline>,
        exits: &Sender<LoopExit>,
        body: F,
    ) -> Result<JoinHandle<()>>
    where
        F: FnOnce(&Pipeline) -> Result<()> + Send + 'static,
    {
        let pipeline = Arc::clone(pipeline);
        let exits = exits.clone();
        let handle = thread::Builder::new()
            .name(format!("{}-{}", self.settings.serial, name))
            .spawn(move || {
                let span = pipeline.context.span(name);
                let _enter = span.enter();
                debug!("loop started");

                let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(&pipeline)))
                    .unwrap_or_else(|payload| Err(Error::LoopPanic(panic_message(&*payload))));
                let _ = exits.send(LoopExit { name, outcome });
            })?;
        Ok(handle)
    }

    fn spawn_supervisor(self: &Arc<Self>, exits: Receiver<LoopExit>) -> Result<()> {
        let controller = Arc::downgrade(self);
        let serial = self.settings.serial.clone();
        thread::Builder::new()
            .name(format!("{}-supervisor", serial))
            .spawn(move || {
                for exit in exits.iter() {
                    let Some(controller) = controller.upgrade() else {
                        return;
                    };
                    let shutting_down = controller.is_shutting_down();
                    match exit.outcome {
                        Ok(()) => debug!(serial = %serial, worker = exit.name, "loop finished"),
                        Err(Error::ChannelSend(_)) if shutting_down => {
                            debug!(serial = %serial, worker = exit.name, "loop stopped during shutdown");
                        }
                        Err(err) if shutting_down => {
                            warn!(serial = %serial, worker = exit.name, error = %err, "loop failed during shutdown");
                        }
                        Err(err) => {
                            error!(serial = %serial, worker = exit.name, error = %err, "loop failed, retiring device");
                            controller.exit();
                        }
                    }
                }
            })?;
        Ok(())
    }

    /// Hand new work to the write loop.
    ///
    /// Work that has not been picked up yet is replaced. Before the loops
    /// start, the latest work is held and delivered once they do.
    pub fn update_work(&self, work: Work) -> Result<()> {
        work.validate()?;
        let mut lifecycle = self.lifecycle.lock();
        if self.is_shutting_down() {
            return Err(Error::channel_send(format!("{} is closed", self.settings.serial)));
        }

        let Some(sender) = lifecycle.work.clone() else {
            lifecycle.pending_work = Some(work);
            return Ok(());
        };
        if let Some(drain) = lifecycle.work_drain.as_ref() {
            while drain.try_recv().is_ok() {}
        }
        sender
            .try_send(work)
            .map_err(|err| Error::channel_send(err.to_string()))
    }

    /// Stop the loops and release the transport. Safe to call repeatedly.
    pub fn close(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        if self.state() == ControllerState::Closed {
            return Ok(());
        }
        self.shutting_down.store(true, Ordering::SeqCst);

        lifecycle.quit = None;
        lifecycle.work = None;
        lifecycle.work_drain = None;
        lifecycle.pending_work = None;
        for handle in lifecycle.handles.drain(..) {
            if handle.join().is_err() {
                warn!(serial = %self.settings.serial, "loop thread panicked outside its guard");
            }
        }

        let result = self.transport.close();
        self.transition(ControllerState::Closed);
        info!(serial = %self.settings.serial, "controller closed");
        result
    }

    /// Close and leave the registry
    pub fn exit(&self) {
        if self.state() == ControllerState::Closed {
            return;
        }
        self.transition(ControllerState::Exiting);
        if let Err(err) = self.close() {
            warn!(serial = %self.settings.serial, error = %err, "close failed");
        }
        let registry = self.registry.lock().upgrade();
        if let Some(registry) = registry {
            registry.unregister(&self.settings.serial);
        }
    }
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("serial", &self.settings.serial)
            .field("model", &self.settings.model)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::simulated::{SimulatedChain, TransportOp};

    fn settings(chips: usize) -> ChainSettings {
        ChainSettings {
            expected_chips: chips,
            ..ChainSettings::for_model("ctrl-test", DeviceModel::NewPac)
        }
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ControllerState::CountingChips.to_string(), "counting_chips");
        assert_eq!(ControllerState::Closed.to_string(), "closed");
    }

    #[test]
    fn test_settings_for_model() {
        let settings = ChainSettings::for_model("GS1", DeviceModel::R606);
        assert_eq!(settings.expected_chips, 12);
        assert_eq!(settings.cores_per_chip, 114);
        assert_eq!(settings.wait_factor, 0.5);
        assert_eq!(settings.max_response_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_panic_message() {
        let payload = panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(&*payload), "boom");
        let payload = panic::catch_unwind(|| panic!("{}", 7)).unwrap_err();
        assert_eq!(panic_message(&*payload), "7");
    }

    #[test]
    fn test_close_before_reset() {
        let chain = Arc::new(SimulatedChain::new(2));
        let controller = Controller::new(settings(2), chain.clone());
        controller.close().unwrap();
        controller.close().unwrap();
        assert_eq!(controller.state(), ControllerState::Closed);
        assert_eq!(chain.ops(), vec![TransportOp::Close]);
        assert!(controller.reset().is_err());
    }

    #[test]
    fn test_pending_work_kept_until_running() {
        let chain = Arc::new(SimulatedChain::new(2));
        let controller = Controller::new(settings(2), chain);
        let (submit, _submits) = unbounded();
        let work = Work::new(
            "job-1",
            [0; 32],
            vec![1],
            vec![2],
            0x2000_0000,
            0x1d00_ffff,
            0,
            crate::core::Target::max(),
            submit,
        );
        controller.update_work(work).unwrap();
        assert!(controller.lifecycle.lock().pending_work.is_some());
        controller.close().unwrap();
        assert!(controller.lifecycle.lock().pending_work.is_none());
    }
}
