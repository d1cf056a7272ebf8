//! Property-based invariants that must hold for any accepted sequence of
//! appends, independent of how many of them land in a given tier.

use std::collections::HashMap;

use chronodb::{Engine, EngineConfig, Measurement, Strategy};
use proptest::prelude::*;
use tempfile::tempdir;

fn open(strategy: Strategy, chunk_bytes: usize) -> (tempfile::TempDir, Engine) {
    let dir = tempdir().unwrap();
    let cfg = EngineConfig { root: dir.path().to_path_buf(), strategy, chunk_bytes, ..EngineConfig::default() };
    let engine = Engine::open(cfg).unwrap();
    (dir, engine)
}

fn dedup_by_id_time(raw: Vec<(u32, u64, f64)>) -> Vec<Measurement> {
    let mut seen: HashMap<(u32, u64), Measurement> = HashMap::new();
    for (id, time, value) in raw {
        seen.insert((id, time), Measurement::new(id, time, value, 0));
    }
    let mut out: Vec<Measurement> = seen.into_values().collect();
    out.sort_by_key(|m| (m.id, m.time));
    out
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Every distinct `(id, time)` pair appended is retrievable unchanged,
    /// and an interval scan returns them ordered by `(id, time)`, no matter
    /// which tiers the strategy actually populates.
    #[test]
    fn interval_roundtrips_every_distinct_sample(
        raw in prop::collection::vec((0u32..8, 0u64..2_000, -1.0e6f64..1.0e6f64), 0..200),
        strategy_idx in 0..4u8,
    ) {
        let strategy = match strategy_idx {
            0 => Strategy::WalOnly,
            1 => Strategy::WalToPage,
            2 => Strategy::MemoryOnly,
            _ => Strategy::MemoryPlusPage,
        };
        let expected = dedup_by_id_time(raw);
        let (_dir, engine) = open(strategy, 256);

        for m in &expected {
            engine.append(*m).unwrap();
        }
        engine.flush().unwrap();

        let got = engine.interval(&[], 0, 0, 2_000).unwrap();
        prop_assert_eq!(got.len(), expected.len());
        for (g, e) in got.iter().zip(expected.iter()) {
            prop_assert_eq!(g.id, e.id);
            prop_assert_eq!(g.time, e.time);
            prop_assert!((g.value - e.value).abs() < 1e-9);
        }
    }

    /// `time_point` always returns the latest sample at or before the query
    /// time, never a later one.
    #[test]
    fn time_point_never_looks_into_the_future(
        raw in prop::collection::vec((0u64..2_000, -1.0e6f64..1.0e6f64), 1..100),
        tp in 0u64..2_000,
    ) {
        let measurements: Vec<Measurement> =
            raw.into_iter().map(|(time, value)| Measurement::new(1, time, value, 0)).collect();
        let (_dir, engine) = open(Strategy::WalToPage, 256);
        for m in &measurements {
            engine.append(*m).unwrap();
        }
        engine.flush().unwrap();

        let result = engine.time_point(&[1], 0, tp).unwrap();
        let m = result.get(&1).unwrap();
        if m.is_no_data() {
            prop_assert!(measurements.iter().all(|s| s.time > tp));
        } else {
            prop_assert!(m.time <= tp);
            let expected_time = measurements.iter().filter(|s| s.time <= tp).map(|s| s.time).max().unwrap();
            prop_assert_eq!(m.time, expected_time);
        }
    }
}
