//! In-memory chunk tier: one writable chunk per series plus a time-ordered
//! list of sealed chunks, with byte-budgeted eviction.

use std::collections::HashMap;

use crate::chunk::{OpenChunk, SealedChunk};
use crate::errors::{EngineError, Result};
use crate::types::{Flag, Id, Measurement, Time};

/// What happens to a chunk evicted for exceeding `memory_limit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// CACHE mode: spill the chunk's bytes out before dropping it from memory.
    SpillToPage,
    /// MEMORY mode: the chunk and its data are simply discarded.
    Drop,
}

/// Per-series sealed chunk and the writable chunk currently accepting
/// appends for that series.
struct SeriesChunks {
    open: OpenChunk,
    sealed: Vec<SealedChunk>,
}

pub struct MemChunkTable {
    chunk_bytes: usize,
    memory_limit: usize,
    policy: EvictionPolicy,
    series: HashMap<Id, SeriesChunks>,
    bytes_used: usize,
}

impl MemChunkTable {
    #[must_use]
    pub fn new(chunk_bytes: usize, memory_limit: usize, policy: EvictionPolicy) -> Self {
        Self { chunk_bytes, memory_limit, policy, series: HashMap::new(), bytes_used: 0 }
    }

    /// Append `m`, rolling to a fresh chunk if the current one is full, and
    /// sweeping the oldest full chunks if `memory_limit` is now exceeded.
    /// Returns chunks spilled for the caller to persist (CACHE mode only).
    ///
    /// # Errors
    /// Returns `DropFailed` if `m` alone doesn't fit in a freshly rolled
    /// chunk (`chunk_bytes` too small for a single measurement).
    pub fn append(&mut self, m: Measurement) -> Result<Vec<SealedChunk>> {
        let entry = self
            .series
            .entry(m.id)
            .or_insert_with(|| SeriesChunks { open: OpenChunk::new(m.id, self.chunk_bytes), sealed: Vec::new() });

        if !entry.open.append(m) {
            let sealed = std::mem::replace(&mut entry.open, OpenChunk::new(m.id, self.chunk_bytes)).pack();
            self.bytes_used += sealed.header.size_bytes as usize;
            entry.sealed.push(sealed);
            if !entry.open.append(m) {
                return Err(EngineError::DropFailed {
                    reason: format!("single measurement for id {} exceeds chunk_bytes", m.id),
                });
            }
        }

        if self.bytes_used <= self.memory_limit {
            return Ok(Vec::new());
        }
        Ok(self.evict())
    }

    /// Sweep the oldest-by-`max_time` fraction of full chunks until back
    /// under budget.
    fn evict(&mut self) -> Vec<SealedChunk> {
        let mut candidates: Vec<(Id, usize, Time)> = Vec::new();
        for (&id, sc) in &self.series {
            for (idx, chunk) in sc.sealed.iter().enumerate() {
                candidates.push((id, idx, chunk.header.last_time));
            }
        }
        candidates.sort_by_key(|&(_, _, max_time)| max_time);
        let target = candidates.len() / 4 + 1;

        let mut spilled = Vec::new();
        let mut removed_per_series: HashMap<Id, Vec<usize>> = HashMap::new();
        for &(id, idx, _) in candidates.iter().take(target) {
            removed_per_series.entry(id).or_default().push(idx);
        }
        for (id, mut idxs) in removed_per_series {
            idxs.sort_unstable_by(|a, b| b.cmp(a)); // remove back-to-front
            if let Some(sc) = self.series.get_mut(&id) {
                for idx in idxs {
                    let removed = sc.sealed.remove(idx);
                    self.bytes_used -= removed.header.size_bytes as usize;
                    if self.policy == EvictionPolicy::SpillToPage {
                        spilled.push(removed);
                    }
                }
            }
        }
        spilled
    }

    #[must_use]
    pub fn min_max_time(&self, id: Id) -> Option<(Time, Time)> {
        let sc = self.series.get(&id)?;
        let mut acc: Option<(Time, Time)> = sc.open.min_max_time();
        for chunk in &sc.sealed {
            let pair = (chunk.header.first_time, chunk.header.last_time);
            acc = Some(match acc {
                None => pair,
                Some((lo, hi)) => (lo.min(pair.0), hi.max(pair.1)),
            });
        }
        acc
    }

    #[must_use]
    pub fn known_ids(&self) -> Vec<Id> {
        let mut ids: Vec<Id> = self.series.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Closed-interval scan over every in-memory chunk (sealed, then the
    /// still-open tail) for the requested ids.
    #[must_use]
    pub fn interval(&self, ids: &[Id], flag: Flag, from: Time, to: Time) -> Vec<Measurement> {
        let wanted: Vec<Id> = if ids.is_empty() { self.known_ids() } else { ids.to_vec() };
        let mut out = Vec::new();
        for id in wanted {
            let Some(sc) = self.series.get(&id) else { continue };
            for chunk in &sc.sealed {
                if chunk.header.first_time > to || chunk.header.last_time < from {
                    continue;
                }
                if let Ok(samples) = chunk.reader("mem") {
                    out.extend(samples.into_iter().filter(|m| m.in_interval(from, to) && m.in_flag(flag)));
                }
            }
            out.extend(sc.open.decode_current().into_iter().filter(|m| m.in_interval(from, to) && m.in_flag(flag)));
        }
        out
    }

    /// Latest sample per id with `time <= tp`.
    #[must_use]
    pub fn time_point(&self, ids: &[Id], flag: Flag, tp: Time) -> HashMap<Id, Measurement> {
        let wanted: Vec<Id> = if ids.is_empty() { self.known_ids() } else { ids.to_vec() };
        let mut out = HashMap::new();
        for id in wanted {
            let mut candidates = self.interval(&[id], flag, 0, tp);
            if let Some(best) = candidates.drain(..).max_by_key(|m| m.time) {
                out.insert(id, best);
            }
        }
        out
    }

    #[must_use]
    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    /// Every accepted measurement currently held in memory, across every
    /// series, sealed chunks and the still-open tail alike. Used by
    /// `flush()` under the CACHE strategy to spill the whole table to a
    /// page without disturbing what's cached.
    #[must_use]
    pub fn snapshot_all(&self) -> Vec<Measurement> {
        self.interval(&[], 0, Time::MIN, Time::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolls_to_new_chunk_and_preserves_order() {
        let mut table = MemChunkTable::new(64, usize::MAX, EvictionPolicy::Drop);
        for i in 0..2000u64 {
            table.append(Measurement::new(1, i, i as f64, 0)).unwrap();
        }
        let got = table.interval(&[1], 0, 0, 2000);
        assert_eq!(got.len(), 2000);
        for w in got.windows(2) {
            assert!(w[0].time < w[1].time);
        }
    }

    #[test]
    fn eviction_respects_memory_limit() {
        let mut table = MemChunkTable::new(64, 256, EvictionPolicy::Drop);
        for i in 0..5000u64 {
            table.append(Measurement::new(1, i, i as f64, 0)).unwrap();
        }
        assert!(table.bytes_used() <= 256 + 64);
    }

    #[test]
    fn time_point_sees_open_chunk_tail() {
        let mut table = MemChunkTable::new(4096, usize::MAX, EvictionPolicy::Drop);
        table.append(Measurement::new(1, 10, 1.0, 0)).unwrap();
        table.append(Measurement::new(1, 20, 2.0, 0)).unwrap();
        let got = table.time_point(&[1], 0, 15);
        assert_eq!(got.get(&1).unwrap().time, 10);
    }

    #[test]
    fn append_fails_when_chunk_bytes_cant_hold_one_measurement() {
        let mut table = MemChunkTable::new(1, usize::MAX, EvictionPolicy::Drop);
        let err = table.append(Measurement::new(1, 0, 1.0, 0)).unwrap_err();
        assert!(matches!(err, EngineError::DropFailed { .. }));
    }
}
