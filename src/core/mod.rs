//! Core mining types
//!
//! Work and shares exchanged with the pool layer, share targets, rolled
//! versions, hashing, and the candidate arena used by the verifier.

pub mod hash;
pub mod result;
pub mod target;
pub mod version;
pub mod work;

pub use result::{ResultRing, TaskResult};
pub use target::Target;
pub use version::VersionSource;
pub use work::{Submit, Work};
