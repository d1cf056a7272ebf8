//! Background conversion of sealed WAL files into pages, and compaction of
//! overlapping pages into one. Both are single-writer-per-tier operations
//! that hold the PAGE write lock for their whole commit.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::errors::{EngineError, Result};
use crate::lock::{LockKind, LockManager, Resource};
use crate::manifest::ManifestStore;
use crate::page::{write_page, Page};
use crate::types::{Id, Measurement, Time};
use crate::wal::Wal;

pub struct Dropper {
    root: PathBuf,
    chunk_bytes: usize,
}

impl Dropper {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, chunk_bytes: usize) -> Self {
        Self { root: root.into(), chunk_bytes }
    }

    fn page_paths(&self, stem: &str) -> (PathBuf, PathBuf, String) {
        let page_name = format!("{stem}.page");
        (self.root.join(&page_name), self.root.join(format!("{stem}.pagei")), page_name)
    }

    /// Convert one sealed WAL file into a page: read its measurements, sort
    /// by `(id, time)`, write the page and index, commit the manifest swap,
    /// then delete the WAL file.
    ///
    /// # Errors
    /// Returns `IOError` on read/write failure, or propagates a manifest
    /// persist failure; the WAL is left untouched if the page write fails.
    pub fn drop_wal(&self, wal_path: &Path, manifest: &mut ManifestStore, locks: &LockManager) -> Result<()> {
        let _guard = locks.lock(LockKind::Write, &[Resource::Page]);

        let wal_name = wal_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| EngineError::DropFailed { reason: "wal path has no file name".into() })?
            .to_string();
        let stem = wal_path.file_stem().and_then(|s| s.to_str()).unwrap_or(&wal_name).to_string();

        let mut wal = Wal::open(wal_path, usize::MAX, 1)?;
        let mut measurements = wal.read_all()?;
        measurements.sort_by_key(|m| (m.id, m.time));
        if measurements.is_empty() {
            return Ok(());
        }

        let (page_path, index_path, page_name) = self.page_paths(&stem);
        write_page(&page_path, &index_path, &measurements, self.chunk_bytes, 1)?;

        manifest.replace_wal_with_page(&wal_name, page_name)?;
        drop(wal);
        std::fs::remove_file(wal_path).map_err(|e| EngineError::io(wal_path.display().to_string(), "remove", e))?;
        Ok(())
    }

    /// Merge every page in `page_names` whose time range overlaps
    /// `[from, to]` into one new page, keeping the newest value at equal
    /// `(id, time)` (later entries in `page_names` win). Idempotent under
    /// crash: the manifest swap is the only commit point.
    ///
    /// # Errors
    /// Returns `IOError` on read/write failure.
    pub fn compact(
        &self,
        page_names: &[String],
        from: Time,
        to: Time,
        manifest: &mut ManifestStore,
        locks: &LockManager,
    ) -> Result<Option<String>> {
        let _guard = locks.lock(LockKind::Write, &[Resource::Page]);

        let mut overlapping = Vec::new();
        let mut merged: BTreeMap<(Id, Time), Measurement> = BTreeMap::new();
        for name in page_names {
            let stem = name.trim_end_matches(".page");
            let (page_path, index_path, _) = self.page_paths(stem);
            let page = Page::open(&page_path, &index_path)?;
            let (min_t, max_t) = page.min_max_time();
            if min_t > to || max_t < from {
                continue;
            }
            overlapping.push((name.clone(), page_path, index_path));
            for m in page.interval(&[], 0, crate::types::MIN_TIME, crate::types::MAX_TIME)? {
                merged.insert((m.id, m.time), m);
            }
        }
        if overlapping.len() < 2 {
            return Ok(None);
        }

        let all: Vec<Measurement> = merged.into_values().collect();
        let new_stem = format!("{}-compact", overlapping[0].0.trim_end_matches(".page"));
        let (new_page_path, new_index_path, new_page_name) = self.page_paths(&new_stem);
        write_page(&new_page_path, &new_index_path, &all, self.chunk_bytes, 1)?;

        let old_names: Vec<String> = overlapping.iter().map(|(n, _, _)| n.clone()).collect();
        manifest.replace_pages(&old_names, new_page_name.clone())?;

        for (_, page_path, index_path) in &overlapping {
            let _ = std::fs::remove_file(page_path);
            let _ = std::fs::remove_file(index_path);
        }
        Ok(Some(new_page_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Measurement;
    use tempfile::tempdir;

    #[test]
    fn drop_wal_converts_to_page_and_updates_manifest() {
        let dir = tempdir().unwrap();
        let wal_path = dir.path().join("000001.wal");
        {
            let mut wal = Wal::open(&wal_path, usize::MAX, 1).unwrap();
            for i in 0..50u64 {
                wal.append(&Measurement::new(3, i, i as f64, 0)).unwrap();
            }
        }
        let mut manifest = ManifestStore::open(dir.path().join("MANIFEST")).unwrap();
        manifest.add_wal("000001.wal").unwrap();
        let locks = LockManager::new();
        let dropper = Dropper::new(dir.path(), 4096);
        dropper.drop_wal(&wal_path, &mut manifest, &locks).unwrap();

        assert!(manifest.state().wal_files.is_empty());
        assert_eq!(manifest.state().page_files.len(), 1);
        assert!(!wal_path.exists());

        let page = Page::open(dir.path().join("000001.page"), dir.path().join("000001.pagei")).unwrap();
        let got = page.interval(&[3], 0, 0, 100).unwrap();
        assert_eq!(got.len(), 50);
    }

    #[test]
    fn compact_merges_overlapping_pages_keeping_later_value() {
        let dir = tempdir().unwrap();
        let dropper = Dropper::new(dir.path(), 4096);

        write_page(dir.path().join("a.page"), dir.path().join("a.pagei"), &[Measurement::new(1, 10, 1.0, 0)], 4096, 1).unwrap();
        write_page(dir.path().join("b.page"), dir.path().join("b.pagei"), &[Measurement::new(1, 10, 2.0, 0)], 4096, 1).unwrap();

        let mut manifest = ManifestStore::open(dir.path().join("MANIFEST")).unwrap();
        manifest.add_page("a.page").unwrap();
        manifest.add_page("b.page").unwrap();
        let locks = LockManager::new();

        let new_name = dropper.compact(&["a.page".to_string(), "b.page".to_string()], 0, 100, &mut manifest, &locks).unwrap().unwrap();
        assert!(manifest.state().page_files.contains(&new_name));
        assert!(!dir.path().join("a.page").exists());
        assert!(!dir.path().join("b.page").exists());

        let page = Page::open(dir.path().join(&new_name), dir.path().join(new_name.replace(".page", ".pagei"))).unwrap();
        let got = page.interval(&[1], 0, 0, 100).unwrap();
        assert_eq!(got.len(), 1);
        assert!((got[0].value - 2.0).abs() < f64::EPSILON);
    }
}
