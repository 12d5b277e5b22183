//! Hybrid logical timestamps used for start, commit and lock ordering.
//!
//! A timestamp packs the physical clock (milliseconds since the Unix epoch)
//! into the high bits and a logical counter into the low
//! [`Timestamp::LOGICAL_BITS`] bits, so plain integer comparison gives the
//! total order required by the commit protocol.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Packed hybrid logical timestamp.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Number of low bits reserved for the logical counter.
    pub const LOGICAL_BITS: u32 = 18;

    /// Largest logical value that fits before the physical part must advance.
    pub const MAX_LOGICAL: u64 = (1 << Self::LOGICAL_BITS) - 1;

    /// The zero timestamp, older than anything an authority hands out.
    pub const ZERO: Timestamp = Timestamp(0);

    /// Build a timestamp from its physical and logical components.
    pub const fn compose(physical_ms: u64, logical: u64) -> Self {
        Self((physical_ms << Self::LOGICAL_BITS) | (logical & Self::MAX_LOGICAL))
    }

    /// Wrap an already packed value.
    pub const fn from_u64(raw: u64) -> Self {
        Self(raw)
    }

    /// Packed representation.
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Physical component in milliseconds.
    pub const fn physical_ms(&self) -> u64 {
        self.0 >> Self::LOGICAL_BITS
    }

    /// Logical counter component.
    pub const fn logical(&self) -> u64 {
        self.0 & Self::MAX_LOGICAL
    }

    /// The smallest timestamp strictly greater than this one.
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Shift the physical component forward, keeping the logical part.
    pub const fn add_physical_ms(&self, delta_ms: u64) -> Self {
        Self(self.0 + (delta_ms << Self::LOGICAL_BITS))
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.physical_ms(), self.logical())
    }
}

impl From<u64> for Timestamp {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}
