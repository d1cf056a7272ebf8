//! The in-memory grid held by a single series for one period, plus its
//! durable (de)serialization.

use serde::{Deserialize, Serialize};

use crate::types::{Flag, StepKind, Value};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grid {
    pub slots: Vec<Option<(Value, Flag)>>,
}

impl Grid {
    #[must_use]
    pub fn empty(step: StepKind) -> Self {
        Self { slots: vec![None; step.slots_per_period() as usize] }
    }

    pub fn set(&mut self, idx: usize, value: Value, flag: Flag) {
        if let Some(slot) = self.slots.get_mut(idx) {
            *slot = Some((value, flag));
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serde::encode_to_vec(self, bincode::config::standard()).unwrap_or_default()
    }

    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        bincode::serde::decode_from_slice(bytes, bincode::config::standard()).ok().map(|(g, _)| g)
    }
}

pub(super) struct Track {
    pub step: StepKind,
    pub period: u64,
    pub grid: Grid,
}

impl Track {
    pub fn new(step: StepKind, period: u64) -> Self {
        Self { step, period, grid: Grid::empty(step) }
    }
}
