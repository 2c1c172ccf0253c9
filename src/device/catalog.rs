//! Supported GekkoScience products

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::FrequencyRange;

/// FTDI vendor id shared by every supported device
pub const VENDOR_ID: u16 = 0x0403;

/// FT230X product id shared by every supported device
pub const PRODUCT_ID: u16 = 0x6015;

/// Hashing cores in one BM1387
pub const BM1387_CORES: u32 = 114;

/// Fraction of a fullscan the read loop waits between polls
pub const BM1387_WAIT_FACTOR: f64 = 0.5;

/// Chip-side baud divisor for the 1.5 Mbaud link
pub const BM1387_BAUD_DIVISOR: u8 = 1;

/// Known BM1387 products
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceModel {
    /// Twelve-chip R606 pod
    R606,
    /// Two-chip NewPac stick
    NewPac,
}

/// Factory settings of a model
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelDefaults {
    /// Chips on the chain
    pub chips: usize,
    /// Frequency used when no override applies (MHz)
    pub frequency: f64,
    /// Allowed frequency range
    pub range: FrequencyRange,
    /// Longest silence tolerated before the device is retired (ms)
    pub max_response_timeout_ms: u64,
}

impl DeviceModel {
    /// All supported models
    pub fn all() -> &'static [DeviceModel] {
        &[DeviceModel::R606, DeviceModel::NewPac]
    }

    /// Product string reported over USB
    pub fn product(&self) -> &'static str {
        match self {
            DeviceModel::R606 => "R606 Bitcoin Miner",
            DeviceModel::NewPac => "NewPac Bitcoin Miner",
        }
    }

    /// USB vendor and product id
    pub fn usb_id(&self) -> (u16, u16) {
        (VENDOR_ID, PRODUCT_ID)
    }

    /// Factory settings
    pub fn defaults(&self) -> ModelDefaults {
        match self {
            DeviceModel::R606 => ModelDefaults {
                chips: 12,
                frequency: 700.0,
                range: FrequencyRange::new(200.0, 1200.0),
                max_response_timeout_ms: 1000,
            },
            DeviceModel::NewPac => ModelDefaults {
                chips: 2,
                frequency: 550.0,
                range: FrequencyRange::new(100.0, 700.0),
                max_response_timeout_ms: 1000,
            },
        }
    }
}

impl fmt::Display for DeviceModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceModel::R606 => write!(f, "R606"),
            DeviceModel::NewPac => write!(f, "NewPac"),
        }
    }
}

impl FromStr for DeviceModel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "r606" => Ok(DeviceModel::R606),
            "newpac" => Ok(DeviceModel::NewPac),
            _ => Err(Error::config(format!("Unknown device model: {}", s))),
        }
    }
}
