//! Fixed-step grid mode: values aligned to a regular step, sparse periods
//! filled with an explicit `NO_DATA` marker on read.

mod io_adapter;
mod track;

use std::collections::HashMap;
use std::path::Path;

pub use io_adapter::IOAdapter;

use parking_lot::RwLock;
use track::{Grid, Track};

use crate::errors::{EngineError, Result};
use crate::types::{Flag, Id, Measurement, StepKind, Time, NO_DATA};

pub struct ByStepEngine {
    steps: RwLock<HashMap<Id, StepKind>>,
    tracks: RwLock<HashMap<Id, Track>>,
    io: IOAdapter,
}

impl ByStepEngine {
    /// # Errors
    /// Returns `IOError` if the backing store cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self { steps: RwLock::new(HashMap::new()), tracks: RwLock::new(HashMap::new()), io: IOAdapter::open(path)? })
    }

    pub fn set_steps(&self, steps: HashMap<Id, StepKind>) {
        self.steps.write().extend(steps);
    }

    fn period_of(step: StepKind, time: Time) -> (Time, u64, usize) {
        let rounded = step.round(time);
        let period = rounded / step.period_ms();
        let period_start = period * step.period_ms();
        let idx = ((rounded - period_start) / step.step_ms()) as usize;
        (rounded, period, idx)
    }

    /// Append one measurement to its series' grid, rolling or loading
    /// periods as needed.
    ///
    /// # Errors
    /// Returns `UnknownSeries` if `m.id` has no registered step.
    pub fn append(&self, m: Measurement) -> Result<()> {
        let step = *self.steps.read().get(&m.id).ok_or(EngineError::UnknownSeries { id: m.id })?;
        let (_, period, idx) = Self::period_of(step, m.time);

        let mut tracks = self.tracks.write();
        let track = tracks.entry(m.id).or_insert_with(|| Track::new(step, period));

        if period > track.period {
            self.io.put(track.period, m.id, track.grid.to_bytes());
            *track = Track::new(step, period);
            track.grid.set(idx, m.value, m.flag);
        } else if period < track.period {
            let mut grid = self.io.get(period, m.id)?.and_then(|b| Grid::from_bytes(&b)).unwrap_or_else(|| Grid::empty(step));
            grid.set(idx, m.value, m.flag);
            self.io.put(period, m.id, grid.to_bytes());
        } else {
            track.grid.set(idx, m.value, m.flag);
        }
        Ok(())
    }

    fn load_grid(&self, id: Id, step: StepKind, period: u64) -> Result<Option<Grid>> {
        if let Some(track) = self.tracks.read().get(&id) {
            if track.period == period {
                return Ok(Some(track.grid.clone()));
            }
        }
        Ok(self.io.get(period, id)?.and_then(|b| Grid::from_bytes(&b)))
    }

    /// Emit one sample per step-aligned slot touching `[from, to]`, for
    /// every period that has ever been written. Periods with no recorded
    /// data at all (never touched) contribute nothing, so an unbounded
    /// query range doesn't manufacture unbounded `NO_DATA` output.
    ///
    /// # Errors
    /// Returns `UnknownSeries` if `id` has no registered step.
    pub fn interval(&self, ids: &[Id], flag: Flag, from: Time, to: Time) -> Result<Vec<Measurement>> {
        let wanted: Vec<Id> = if ids.is_empty() { self.steps.read().keys().copied().collect() } else { ids.to_vec() };
        let mut out = Vec::new();
        for id in wanted {
            let Some(step) = self.steps.read().get(&id).copied() else { continue };
            let (_, from_period, _) = Self::period_of(step, from);
            let (_, to_period, _) = Self::period_of(step, to);
            for period in from_period..=to_period {
                let Some(grid) = self.load_grid(id, step, period)? else { continue };
                let period_start = period * step.period_ms();
                for (idx, slot) in grid.slots.iter().enumerate() {
                    let time = period_start + idx as u64 * step.step_ms();
                    if time < from || time > to {
                        continue;
                    }
                    let m = match slot {
                        Some((value, f)) => Measurement::new(id, time, *value, *f),
                        None => Measurement::no_data(id, time),
                    };
                    if m.in_flag(flag) {
                        out.push(m);
                    }
                }
            }
        }
        Ok(out)
    }

    /// Latest recorded sample with `time <= tp` within `tp`'s own period;
    /// `NO_DATA` if the period was never written or has no earlier slot.
    ///
    /// # Errors
    /// Returns `UnknownSeries` if `id` has no registered step.
    pub fn time_point(&self, id: Id, flag: Flag, tp: Time) -> Result<Measurement> {
        let step = *self.steps.read().get(&id).ok_or(EngineError::UnknownSeries { id })?;
        let (_, period, idx) = Self::period_of(step, tp);
        let Some(grid) = self.load_grid(id, step, period)? else {
            return Ok(Measurement::new(id, tp, 0.0, NO_DATA));
        };
        let period_start = period * step.period_ms();
        for i in (0..=idx).rev() {
            if let Some((value, f)) = grid.slots[i] {
                if flag == 0 || f == flag {
                    let time = period_start + i as u64 * step.step_ms();
                    return Ok(Measurement::new(id, time, value, f));
                }
            }
        }
        Ok(Measurement::new(id, tp, 0.0, NO_DATA))
    }

    /// Persist every in-memory track then block until durable.
    pub fn flush(&self) {
        for (id, track) in self.tracks.read().iter() {
            self.io.put(track.period, *id, track.grid.to_bytes());
        }
        self.io.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn engine() -> (tempfile::TempDir, ByStepEngine) {
        let dir = tempdir().unwrap();
        let eng = ByStepEngine::open(dir.path().join("bystep.db")).unwrap();
        (dir, eng)
    }

    #[test]
    fn unknown_series_is_rejected() {
        let (_d, eng) = engine();
        let err = eng.append(Measurement::new(9, 1000, 1.0, 0)).unwrap_err();
        assert!(matches!(err, EngineError::UnknownSeries { id: 9 }));
    }

    #[test]
    fn sparse_fill_emits_no_data_between_writes() {
        let (_d, eng) = engine();
        let mut steps = HashMap::new();
        steps.insert(9, StepKind::Sec);
        eng.set_steps(steps);
        eng.append(Measurement::new(9, 1000, 1.0, 0)).unwrap();
        eng.append(Measurement::new(9, 3000, 2.0, 0)).unwrap();

        let got = eng.interval(&[9], 0, 1000, 3000).unwrap();
        let at = |t: u64| got.iter().find(|m| m.time == t).unwrap();
        assert!((at(1000).value - 1.0).abs() < f64::EPSILON);
        assert!(at(2000).is_no_data());
        assert!((at(3000).value - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn historical_period_overwrite_is_durable() {
        let (_d, eng) = engine();
        let mut steps = HashMap::new();
        steps.insert(1, StepKind::Hour);
        eng.set_steps(steps);
        let day_ms = StepKind::Hour.period_ms();
        eng.append(Measurement::new(1, 0, 1.0, 0)).unwrap();
        eng.append(Measurement::new(1, day_ms, 2.0, 0)).unwrap(); // rolls to next period
        eng.append(Measurement::new(1, 3_600_000, 9.0, 0)).unwrap(); // back into the first, historical period
        eng.flush();

        let got = eng.interval(&[1], 0, 0, day_ms).unwrap();
        let at = |t: u64| got.iter().find(|m| m.time == t).unwrap();
        assert!((at(3_600_000).value - 9.0).abs() < f64::EPSILON);
    }
}
