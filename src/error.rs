//! Error types for the chip pipeline
//!
//! This module provides a single crate-wide error enum built with `thiserror`.
//! Loop failures travel through it to the controller's supervisor.

use thiserror::Error;

/// Main error type for the miner
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors, including transport read/write failures
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Transport bring-up or capability errors
    #[error("Transport error: {0}")]
    Transport(String),

    /// Chip bus protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The chain reported a different number of chips than expected
    #[error("Chip count mismatch: expected {expected}, found {found}")]
    ChipCountMismatch {
        /// Chips the device model should have
        expected: usize,
        /// Chips that answered the count command
        found: usize,
    },

    /// A controller for this serial number is already registered
    #[error("Device already in use: {0}")]
    DeviceInUse(String),

    /// The chain stopped answering
    #[error("Device unresponsive after {silent_reads} empty reads")]
    Unresponsive {
        /// Consecutive empty reads observed
        silent_reads: u32,
    },

    /// Invalid work supplied by the pool layer
    #[error("Invalid work: {0}")]
    InvalidWork(String),

    /// Invalid target or difficulty
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    /// Channel send errors
    #[error("Channel send error: {0}")]
    ChannelSend(String),

    /// A pipeline loop panicked
    #[error("Loop panicked: {0}")]
    LoopPanic(String),

    /// Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for the miner
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create an invalid work error
    pub fn invalid_work(msg: impl Into<String>) -> Self {
        Self::InvalidWork(msg.into())
    }

    /// Create an invalid target error
    pub fn invalid_target(msg: impl Into<String>) -> Self {
        Self::InvalidTarget(msg.into())
    }

    /// Create a channel send error
    pub fn channel_send(msg: impl Into<String>) -> Self {
        Self::ChannelSend(msg.into())
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}
