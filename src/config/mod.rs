//! Configuration management for the miner

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::device::catalog::{BM1387_BAUD_DIVISOR, BM1387_CORES, BM1387_WAIT_FACTOR};
use crate::device::{ChainSettings, DeviceModel};
use crate::error::{Error, Result};
use crate::protocol::FrequencyRange;

/// Largest chain the protocol can address
pub const MAX_CHIPS: usize = 128;

/// Log formats understood by the logging setup
pub const LOG_FORMATS: &[&str] = &["plain", "pretty", "json"];

/// Command-line arguments
#[derive(Parser, Debug, Default)]
#[clap(
    name = "gekko-miner",
    about = "BM1387 task pipeline driver for GekkoScience miners",
    version,
    author
)]
pub struct Args {
    /// Configuration file path
    #[clap(short, long, value_name = "FILE", env = "GEKKO_CONFIG")]
    pub config: Option<PathBuf>,

    /// Device serial number
    #[clap(short, long, env = "GEKKO_SERIAL")]
    pub serial: Option<String>,

    /// Device model (r606, newpac)
    #[clap(short, long, env = "GEKKO_MODEL")]
    pub model: Option<String>,

    /// Expected chip count
    #[clap(long, env = "GEKKO_CHIPS")]
    pub chips: Option<usize>,

    /// Operating frequency in MHz
    #[clap(short, long, env = "GEKKO_FREQUENCY")]
    pub frequency: Option<f64>,

    /// Share difficulty of the synthetic work
    #[clap(short, long, env = "GEKKO_DIFFICULTY")]
    pub difficulty: Option<f64>,

    /// Seconds between synthetic work updates
    #[clap(long, env = "GEKKO_WORK_INTERVAL")]
    pub work_interval: Option<u64>,

    /// Stop after this many seconds
    #[clap(long, env = "GEKKO_RUN_FOR")]
    pub run_for: Option<u64>,

    /// Log level
    #[clap(short, long, env = "GEKKO_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log format (plain, pretty, json)
    #[clap(long, env = "GEKKO_LOG_FORMAT")]
    pub log_format: Option<String>,

    /// Print the effective configuration and exit
    #[clap(long)]
    pub print_config: bool,
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Device configuration
    #[serde(default)]
    pub device: DeviceConfig,

    /// Simulated chain and synthetic work
    #[serde(default)]
    pub simulation: SimulationConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// One device and its chain parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// USB serial number
    #[serde(default = "default_serial")]
    pub serial: String,

    /// Product
    #[serde(default = "default_model")]
    pub model: DeviceModel,

    /// Chips the chain must report (model default if unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_chips: Option<usize>,

    /// Operating frequency in MHz (model default if unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency: Option<f64>,

    /// Lowest allowed frequency (model default if unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_frequency: Option<f64>,

    /// Highest allowed frequency (model default if unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_frequency: Option<f64>,

    /// Hashing cores per chip
    #[serde(default = "default_cores_per_chip")]
    pub cores_per_chip: u32,

    /// Read interval as a fraction of a fullscan
    #[serde(default = "default_wait_factor")]
    pub wait_factor: f64,

    /// Chip-side baud divisor
    #[serde(default = "default_baud_divisor")]
    pub baud_divisor: u8,

    /// Silence tolerated before the device is retired (model default if unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_response_timeout_ms: Option<u64>,

    /// Per-serial operating frequency in MHz
    #[serde(default)]
    pub frequency_overrides: BTreeMap<String, f64>,
}

/// Simulated chain and synthetic work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Share difficulty of the synthetic work
    #[serde(default = "default_share_difficulty")]
    pub share_difficulty: f64,

    /// Seconds between synthetic work updates
    #[serde(default = "default_work_interval")]
    pub work_interval_secs: u64,

    /// Chance that a work frame produces a nonce report
    #[serde(default = "default_nonce_probability")]
    pub nonce_probability: f64,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (plain, pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_serial() -> String {
    "GSR6-SIM-0001".to_string()
}

fn default_model() -> DeviceModel {
    DeviceModel::R606
}

fn default_cores_per_chip() -> u32 {
    BM1387_CORES
}

fn default_wait_factor() -> f64 {
    BM1387_WAIT_FACTOR
}

fn default_baud_divisor() -> u8 {
    BM1387_BAUD_DIVISOR
}

fn default_share_difficulty() -> f64 {
    1e-7
}

fn default_work_interval() -> u64 {
    30
}

fn default_nonce_probability() -> f64 {
    1.0
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "plain".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            serial: default_serial(),
            model: default_model(),
            expected_chips: None,
            frequency: None,
            min_frequency: None,
            max_frequency: None,
            cores_per_chip: default_cores_per_chip(),
            wait_factor: default_wait_factor(),
            baud_divisor: default_baud_divisor(),
            max_response_timeout_ms: None,
            frequency_overrides: BTreeMap::new(),
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            share_difficulty: default_share_difficulty(),
            work_interval_secs: default_work_interval(),
            nonce_probability: default_nonce_probability(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl DeviceConfig {
    /// Allowed frequency range, model defaults filling the gaps
    pub fn frequency_range(&self) -> FrequencyRange {
        let defaults = self.model.defaults();
        FrequencyRange::new(
            self.min_frequency.unwrap_or(defaults.range.min),
            self.max_frequency.unwrap_or(defaults.range.max),
        )
    }

    /// Requested frequency: the serial's override, then the configured value,
    /// then the model default
    pub fn effective_frequency(&self) -> f64 {
        self.frequency_overrides
            .get(&self.serial)
            .copied()
            .or(self.frequency)
            .unwrap_or_else(|| self.model.defaults().frequency)
    }

    /// Settings handed to the controller
    pub fn chain_settings(&self) -> ChainSettings {
        let defaults = self.model.defaults();
        ChainSettings {
            serial: self.serial.clone(),
            model: self.model,
            expected_chips: self.expected_chips.unwrap_or(defaults.chips),
            frequency: self.effective_frequency(),
            range: self.frequency_range(),
            cores_per_chip: self.cores_per_chip,
            wait_factor: self.wait_factor,
            baud_divisor: self.baud_divisor,
            max_response_timeout: Duration::from_millis(
                self.max_response_timeout_ms
                    .unwrap_or(defaults.max_response_timeout_ms),
            ),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("Failed to read config file: {}", e)))?;

        let config: Self = toml::from_str(&contents)
            .map_err(|e| Error::config(format!("Failed to parse config file: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Build configuration from an optional file plus command-line overrides
    pub fn from_args(args: &Args) -> Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        if let Some(serial) = &args.serial {
            config.device.serial = serial.clone();
        }
        if let Some(model) = &args.model {
            config.device.model = model.parse()?;
        }
        if let Some(chips) = args.chips {
            config.device.expected_chips = Some(chips);
        }
        if let Some(frequency) = args.frequency {
            // An explicit frequency beats the per-serial override.
            config.device.frequency = Some(frequency);
            let serial = config.device.serial.clone();
            config.device.frequency_overrides.remove(&serial);
        }
        if let Some(difficulty) = args.difficulty {
            config.simulation.share_difficulty = difficulty;
        }
        if let Some(interval) = args.work_interval {
            config.simulation.work_interval_secs = interval;
        }
        if let Some(level) = &args.log_level {
            config.logging.level = level.clone();
        }
        if let Some(format) = &args.log_format {
            config.logging.format = format.clone();
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let device = &self.device;
        if device.serial.trim().is_empty() {
            return Err(Error::config("Device serial must not be empty"));
        }

        let chips = device.expected_chips.unwrap_or(device.model.defaults().chips);
        if chips == 0 || chips > MAX_CHIPS {
            return Err(Error::config(format!(
                "Chip count must be between 1 and {}, got {}",
                MAX_CHIPS, chips
            )));
        }

        let range = device.frequency_range();
        if !(range.min > 0.0 && range.max.is_finite()) {
            return Err(Error::config("Frequency range must be positive"));
        }
        if range.min > range.max {
            return Err(Error::config(format!(
                "Frequency range is inverted: {} > {}",
                range.min, range.max
            )));
        }
        let frequencies = device
            .frequency
            .iter()
            .chain(device.frequency_overrides.values());
        for frequency in frequencies {
            if !(frequency.is_finite() && *frequency > 0.0) {
                return Err(Error::config(format!("Invalid frequency: {}", frequency)));
            }
        }

        if device.cores_per_chip == 0 {
            return Err(Error::config("Cores per chip must be greater than 0"));
        }
        if !(device.wait_factor > 0.0 && device.wait_factor <= 3.0) {
            return Err(Error::config(format!(
                "Wait factor must be in (0, 3], got {}",
                device.wait_factor
            )));
        }
        if device.max_response_timeout_ms == Some(0) {
            return Err(Error::config("Response timeout must be greater than 0"));
        }

        let simulation = &self.simulation;
        if !(simulation.share_difficulty.is_finite() && simulation.share_difficulty > 0.0) {
            return Err(Error::config(format!(
                "Share difficulty must be positive, got {}",
                simulation.share_difficulty
            )));
        }
        if simulation.work_interval_secs == 0 {
            return Err(Error::config("Work interval must be greater than 0"));
        }
        if !(0.0..=1.0).contains(&simulation.nonce_probability) {
            return Err(Error::config(format!(
                "Nonce probability must be in [0, 1], got {}",
                simulation.nonce_probability
            )));
        }

        if !LOG_FORMATS.contains(&self.logging.format.as_str()) {
            return Err(Error::config(format!(
                "Unknown log format: {}",
                self.logging.format
            )));
        }

        Ok(())
    }
}
