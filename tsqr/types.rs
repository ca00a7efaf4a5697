// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// This file is ONLY for types that are SHARED BETWEEN FILES, not types that only are used in one file.

use serde::Deserialize;
use std::fmt;
use std::hash::BuildHasher;
use std::num::NonZeroUsize;
use std::str::FromStr;
use thiserror::Error;

/// Number of `n`-row blocks a compressor buffers before it runs a local QR.
pub const DEFAULT_BLOCK_FACTOR: usize = 3;

/// Emitted group keys are drawn from `[0, GROUP_KEY_BOUND)`, i.e. 31 bits.
pub const GROUP_KEY_BOUND: u32 = 1 << 31;

// Fixed seeds so that opaque keys route identically in every task and on every retry.
const OPAQUE_KEY_SEEDS: (u64, u64, u64, u64) = (
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
);

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("block factor must be at least 2, but was {0}")]
pub struct InvalidBlockFactor(pub usize);

/// How many `n`-row blocks a compressor holds before compressing (the `k` of a
/// `(k·n)×n` buffer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "usize")]
pub struct BlockFactor(usize);

impl BlockFactor {
    pub fn new(value: usize) -> Result<Self, InvalidBlockFactor> {
        if value < 2 {
            return Err(InvalidBlockFactor(value));
        }
        Ok(Self(value))
    }

    #[inline]
    pub fn get(self) -> usize {
        self.0
    }

    /// Row capacity of the buffer for a matrix with `ncols` columns.
    #[inline]
    pub fn buffer_rows(self, ncols: usize) -> usize {
        self.0 * ncols
    }

    /// Bytes held by a compressor's block buffer once `ncols` is known.
    pub fn buffer_bytes(self, ncols: usize) -> u64 {
        (self.buffer_rows(ncols) as u64)
            .saturating_mul(ncols as u64)
            .saturating_mul(std::mem::size_of::<f64>() as u64)
    }
}

impl Default for BlockFactor {
    fn default() -> Self {
        Self(DEFAULT_BLOCK_FACTOR)
    }
}

impl TryFrom<usize> for BlockFactor {
    type Error = InvalidBlockFactor;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl fmt::Display for BlockFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The 31-bit key attached to every emitted row so the substrate can scatter
/// partial Rs across the next stage's reducers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKey(u32);

impl GroupKey {
    /// Wraps `value` into the 31-bit key space.
    #[inline]
    pub fn new(value: u32) -> Self {
        Self(value % GROUP_KEY_BOUND)
    }

    #[inline]
    pub fn get(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn reducer_index(self, fan_in: NonZeroUsize) -> usize {
        self.0 as usize % fan_in.get()
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The key of a record read back from storage. Keys are opaque to the math;
/// they only decide which reducer receives the row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordKey {
    Int(i64),
    /// The raw typed-bytes encoding of a key of any other type.
    Opaque(Vec<u8>),
}

impl RecordKey {
    pub fn reducer_index(&self, fan_in: NonZeroUsize) -> usize {
        let buckets = fan_in.get() as u64;
        match self {
            Self::Int(value) => value.rem_euclid(buckets as i64) as usize,
            Self::Opaque(bytes) => {
                let (a, b, c, d) = OPAQUE_KEY_SEEDS;
                let hasher = ahash::RandomState::with_seeds(a, b, c, d);
                (BuildHasher::hash_one(&hasher, bytes.as_slice()) % buckets) as usize
            }
        }
    }
}

impl From<GroupKey> for RecordKey {
    fn from(key: GroupKey) -> Self {
        Self::Int(i64::from(key.get()))
    }
}

/// One keyed row as delivered by a partition reader.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub key: RecordKey,
    pub row: Vec<f64>,
}

/// Which strategy a compressor uses to draw the keys of the rows it emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyPolicy {
    /// Uniform keys in `[0, 2^31)`.
    #[default]
    Random,
    /// A running counter offset by the task index.
    RoundRobin,
}

impl fmt::Display for KeyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Random => f.write_str("random"),
            Self::RoundRobin => f.write_str("round_robin"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown key policy '{0}', expected 'random' or 'round_robin'")]
pub struct UnknownKeyPolicy(pub String);

impl FromStr for KeyPolicy {
    type Err = UnknownKeyPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "random" => Ok(Self::Random),
            "round_robin" | "roundrobin" => Ok(Self::RoundRobin),
            _ => Err(UnknownKeyPolicy(s.to_string())),
        }
    }
}
