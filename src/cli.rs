//! Benchmark CLI surface: write/read throughput probes plus `fsck` and
//! `compact`. Kept thin and external to the engine; no core module imports
//! this.

use std::time::Instant;

use crate::engine::Engine;
use crate::errors::Result;
use crate::types::{Measurement, Time};

pub enum Command {
    /// Append `count` synthetic measurements for `series` ids, one-by-one.
    BenchWrite { count: u64, series: u32 },
    /// Run `runs` interval scans of width `window_ms` over whatever is
    /// already stored.
    BenchRead { runs: u32, window_ms: Time },
    Fsck,
    Compact { from: Time, to: Time },
}

#[derive(Debug)]
pub struct CommandReport {
    pub summary: String,
    pub elapsed_ms: u128,
}

/// # Errors
/// Propagates whatever the dispatched `Engine` operation returns.
pub fn run(engine: &Engine, command: Command) -> Result<CommandReport> {
    let start = Instant::now();
    let summary = match command {
        Command::BenchWrite { count, series } => {
            let written = (0..count)
                .map(|i| engine.append(Measurement::new((i % u64::from(series)) as u32, i, i as f64, 0)))
                .collect::<Result<Vec<_>>>()?
                .iter()
                .map(|o| o.written)
                .sum::<u64>();
            engine.flush()?;
            format!("wrote {written} measurements across {series} series")
        }
        Command::BenchRead { runs, window_ms } => {
            let mut total = 0usize;
            for i in 0..runs {
                let from = u64::from(i) * window_ms;
                let got = engine.interval(&[], 0, from, from + window_ms)?;
                total += got.len();
            }
            format!("{runs} interval scans returned {total} samples total")
        }
        Command::Fsck => {
            engine.fsck()?;
            "manifest rebuilt from directory scan".to_string()
        }
        Command::Compact { from, to } => match engine.compact_by_time(from, to)? {
            Some(name) => format!("compacted into {name}"),
            None => "no overlapping pages to compact".to_string(),
        },
    };
    Ok(CommandReport { summary, elapsed_ms: start.elapsed().as_millis() })
}
