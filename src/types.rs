//! Crate-wide primitive types shared by every tier of the engine.

use serde::{Deserialize, Serialize};

/// Series identifier.
pub type Id = u32;
/// Millisecond-precision timestamp.
pub type Time = u64;
/// Sample value.
pub type Value = f64;
/// User-defined sideband flag.
pub type Flag = u32;

pub const MIN_TIME: Time = Time::MIN;
pub const MAX_TIME: Time = Time::MAX;

/// Reserved flag value marking the absence of data at a grid point.
pub const NO_DATA: Flag = Flag::MAX;

/// Immutable tuple accepted by the write path and returned by queries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub id: Id,
    pub time: Time,
    pub value: Value,
    pub flag: Flag,
}

impl Measurement {
    #[must_use]
    pub fn new(id: Id, time: Time, value: Value, flag: Flag) -> Self {
        Self { id, time, value, flag }
    }

    /// Build a `NO_DATA` placeholder for `id` at `time`.
    #[must_use]
    pub fn no_data(id: Id, time: Time) -> Self {
        Self { id, time, value: 0.0, flag: NO_DATA }
    }

    #[must_use]
    pub fn is_no_data(&self) -> bool {
        self.flag == NO_DATA
    }

    #[must_use]
    pub fn in_flag(&self, flag: Flag) -> bool {
        flag == 0 || flag == self.flag
    }

    #[must_use]
    pub fn in_ids(&self, ids: &[Id]) -> bool {
        ids.is_empty() || ids.contains(&self.id)
    }

    #[must_use]
    pub fn in_interval(&self, from: Time, to: Time) -> bool {
        self.time >= from && self.time <= to
    }
}

/// Selects which storage tiers participate in the write/read pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strategy {
    /// Writes only ever land in the WAL; no compaction into pages.
    WalOnly,
    /// Default: WAL overflow is compacted into compressed, immutable pages.
    WalToPage,
    /// Writes land only in the in-memory chunk table; nothing touches disk.
    MemoryOnly,
    /// In-memory chunk table backed by page spill on eviction (cache mode).
    MemoryPlusPage,
}

impl Default for Strategy {
    fn default() -> Self {
        Self::WalToPage
    }
}

/// Fixed grid step for the by-step tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepKind {
    Ms,
    Sec,
    Min,
    Hour,
}

impl StepKind {
    #[must_use]
    pub fn step_ms(self) -> u64 {
        match self {
            Self::Ms => 1,
            Self::Sec => 1_000,
            Self::Min => 60_000,
            Self::Hour => 3_600_000,
        }
    }

    /// Number of slots held by a single period for this step.
    #[must_use]
    pub fn slots_per_period(self) -> u64 {
        match self {
            Self::Ms => 1_000,
            Self::Sec => 60 * 60 * 24,
            Self::Min => 60 * 24,
            Self::Hour => 24,
        }
    }

    #[must_use]
    pub fn period_ms(self) -> u64 {
        self.step_ms() * self.slots_per_period()
    }

    #[must_use]
    pub fn round(self, time: Time) -> Time {
        let step = self.step_ms();
        (time / step) * step
    }
}
