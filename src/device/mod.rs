//! BM1387 device drivers
//!
//! A [`Controller`] brings one chain up over a [`Transport`] and runs its
//! task pipeline: the write loop feeds work frames, the read loop matches
//! nonce reports to slots, and the verify loop turns candidates into shares.
//! Controllers are claimed through a [`DeviceRegistry`].

pub mod catalog;
pub mod controller;
pub mod pipeline;
pub mod read_loop;
pub mod registry;
pub mod simulated;
pub mod transport;
pub mod verify_loop;
pub mod write_loop;

pub use catalog::DeviceModel;
pub use controller::{ChainSettings, Controller, ControllerState};
pub use registry::DeviceRegistry;
pub use simulated::{SimulatedChain, TransportOp};
pub use transport::{BitMode, Buffer, FlowControl, LineProperties, Parity, Transport};
