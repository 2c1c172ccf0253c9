//! # Gekko Miner
//!
//! Task pipeline driver for BM1387 SHA256d chip chains as found in the
//! GekkoScience R606 and NewPac USB miners.
//!
//! ## Architecture
//!
//! A [`device::Controller`] claims one chain through the
//! [`device::DeviceRegistry`], brings it up over a [`device::Transport`] and
//! runs three threads against it: a write loop that keeps the chips fed with
//! work frames, a read loop that matches nonce reports to the task slots they
//! came from, and a verify loop that rehashes candidates and hands shares to
//! the pool layer. Work arrives as [`core::Work`] and shares leave as
//! [`core::Submit`] on the channel the work carries.

#![warn(
    missing_docs,
    rust_2018_idioms,
    unused_lifetimes,
    unused_qualifications,
    clippy::all
)]
#![forbid(unsafe_code)]

pub mod config;
pub mod core;
pub mod device;
pub mod error;
pub mod protocol;
pub mod utils;

pub use crate::error::{Error, Result};
pub use config::Config;
pub use core::{Submit, Target, Work};
pub use device::{Controller, DeviceModel, DeviceRegistry, Transport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::{
        config::Config,
        core::{Submit, Target, Work},
        device::{ChainSettings, Controller, DeviceModel, DeviceRegistry, Transport},
        error::{Error, Result},
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
