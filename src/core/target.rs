//! Share targets and difficulty
//!
//! Targets are arbitrary-precision integers. Hashes are compared as 256-bit
//! little-endian numbers, the way Bitcoin interprets them.

use std::fmt;
use std::sync::LazyLock;

use num_bigint::BigUint;
use num_traits::{FromPrimitive, One, ToPrimitive, Zero};

use crate::error::{Error, Result};

/// Target at difficulty 1: `0xffff << 208`
static DIFF1_TARGET: LazyLock<BigUint> = LazyLock::new(|| BigUint::from(0xffffu32) << 208);

/// Largest 256-bit value
static MAX_TARGET: LazyLock<BigUint> = LazyLock::new(|| (BigUint::one() << 256) - BigUint::one());

/// Fixed-point scale used to divide by fractional difficulties
const DIFFICULTY_SCALE: f64 = 4_294_967_296.0;

/// Interpret a hash as a little-endian 256-bit integer
pub fn hash_to_big(hash: &[u8; 32]) -> BigUint {
    BigUint::from_bytes_le(hash)
}

/// Difficulty a hash achieves, `diff1 / hash`
pub fn hash_difficulty(hash: &[u8; 32]) -> f64 {
    let value = hash_to_big(hash);
    if value.is_zero() {
        return f64::INFINITY;
    }
    ratio(&DIFF1_TARGET, &value)
}

fn ratio(numerator: &BigUint, denominator: &BigUint) -> f64 {
    match (numerator.to_f64(), denominator.to_f64()) {
        (Some(n), Some(d)) if d > 0.0 => n / d,
        _ => 0.0,
    }
}

/// A share target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target(BigUint);

impl Target {
    /// Target for a pool difficulty, `diff1 / difficulty`, capped at 2^256-1
    pub fn from_difficulty(difficulty: f64) -> Result<Self> {
        if !difficulty.is_finite() || difficulty <= 0.0 {
            return Err(Error::invalid_target(format!("difficulty {}", difficulty)));
        }
        let scaled = match BigUint::from_f64(difficulty * DIFFICULTY_SCALE) {
            Some(scaled) if !scaled.is_zero() => scaled,
            _ => return Ok(Self::max()),
        };

        let numerator = &*DIFF1_TARGET * BigUint::from(DIFFICULTY_SCALE as u64);
        Ok(Self((numerator / scaled).min(MAX_TARGET.clone())))
    }

    /// Target every hash meets
    pub fn max() -> Self {
        Self(MAX_TARGET.clone())
    }

    /// Wrap a raw value, rejecting anything wider than 256 bits
    pub fn from_biguint(value: BigUint) -> Result<Self> {
        if value.bits() > 256 {
            return Err(Error::invalid_target("value exceeds 256 bits"));
        }
        Ok(Self(value))
    }

    /// Raw target value
    pub fn value(&self) -> &BigUint {
        &self.0
    }

    /// Whether `hash` is at or below the target
    pub fn is_met_by(&self, hash: &[u8; 32]) -> bool {
        hash_to_big(hash) <= self.0
    }

    /// Difficulty this target corresponds to
    pub fn difficulty(&self) -> f64 {
        if self.0.is_zero() {
            return f64::INFINITY;
        }
        ratio(&DIFF1_TARGET, &self.0)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:064x}", self.0)
    }
}
