//! Half-open shard key ranges

use crate::error::{Error, ErrorCode, Result};
use crate::key::{ShardKey, ShardKeyType};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Key range `[low, high)`; `high` may be the `Max` sentinel
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardRange {
    low: ShardKey,
    high: ShardKey,
}

impl ShardRange {
    /// Create a range, enforcing `low < high` and matching key types
    pub fn new(low: ShardKey, high: ShardKey) -> Result<Self> {
        if low.key_type() != high.key_type() {
            return Err(Error::new(
                ErrorCode::KeyTypeMismatch,
                format!(
                    "range bounds have different key types ({} and {})",
                    low.key_type(),
                    high.key_type()
                ),
            ));
        }
        if low.is_max() {
            return Err(Error::invalid_argument("range low bound cannot be Max"));
        }
        if low >= high {
            return Err(Error::invalid_argument(format!(
                "range low bound {low} must be below high bound {high}"
            )));
        }
        Ok(Self { low, high })
    }

    /// Range covering every key of the given type
    #[must_use]
    pub fn full(key_type: ShardKeyType) -> Self {
        Self {
            low: ShardKey::min(key_type),
            high: ShardKey::max(key_type),
        }
    }

    /// Range holding exactly one key
    pub fn point(key: &ShardKey) -> Result<Self> {
        Self::new(key.clone(), key.next()?)
    }

    /// Inclusive lower bound
    #[must_use]
    pub const fn low(&self) -> &ShardKey {
        &self.low
    }

    /// Exclusive upper bound
    #[must_use]
    pub const fn high(&self) -> &ShardKey {
        &self.high
    }

    /// Key type of both bounds
    #[must_use]
    pub const fn key_type(&self) -> ShardKeyType {
        self.low.key_type()
    }

    #[must_use]
    pub fn contains(&self, key: &ShardKey) -> bool {
        &self.low <= key && key < &self.high
    }

    /// Whether `other` lies entirely within this range
    #[must_use]
    pub fn contains_range(&self, other: &Self) -> bool {
        self.low <= other.low && other.high <= self.high
    }

    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        self.low < other.high && other.low < self.high
    }

    /// Whether the ranges touch without overlapping
    #[must_use]
    pub fn is_adjacent_to(&self, other: &Self) -> bool {
        self.high == other.low || other.high == self.low
    }

    /// Overlapping part of two ranges, if any
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Option<Self> {
        if !self.intersects(other) {
            return None;
        }
        let low = std::cmp::max(&self.low, &other.low).clone();
        let high = std::cmp::min(&self.high, &other.high).clone();
        Some(Self { low, high })
    }
}

impl fmt::Display for ShardRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.low, self.high)
    }
}
