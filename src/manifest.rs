//! Manifest: the durable record of which WAL and page files currently make
//! up the engine's on-disk state.
//!
//! The format is a line-oriented text file rather than a binary page layout:
//! `schema_version=N`, then one `wal=<name>` or `page=<name>` line per file,
//! in the order they were added. Updates are atomic: the new content is
//! written to a sibling `.tmp` file, fsynced, then renamed over the live
//! manifest so a reader never observes a half-written file.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::errors::{EngineError, Result};

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Default)]
pub struct ManifestState {
    pub schema_version: u32,
    pub wal_files: Vec<String>,
    pub page_files: Vec<String>,
}

impl ManifestState {
    fn to_text(&self) -> String {
        let mut out = format!("schema_version={}\n", self.schema_version);
        for w in &self.wal_files {
            out.push_str(&format!("wal={w}\n"));
        }
        for p in &self.page_files {
            out.push_str(&format!("page={p}\n"));
        }
        out
    }

    fn from_text(text: &str) -> Result<Self> {
        let mut state = Self { schema_version: 0, wal_files: vec![], page_files: vec![] };
        let mut seen_version = false;
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| EngineError::Manifest(format!("line {}: missing '='", lineno + 1)))?;
            match key {
                "schema_version" => {
                    state.schema_version = value
                        .parse()
                        .map_err(|_| EngineError::Manifest(format!("line {}: bad version", lineno + 1)))?;
                    seen_version = true;
                }
                "wal" => state.wal_files.push(value.to_string()),
                "page" => state.page_files.push(value.to_string()),
                other => return Err(EngineError::Manifest(format!("line {}: unknown key {other}", lineno + 1))),
            }
        }
        if !seen_version {
            return Err(EngineError::Manifest("missing schema_version".into()));
        }
        if state.schema_version > SCHEMA_VERSION {
            return Err(EngineError::VersionMismatch { stored: state.schema_version, code: SCHEMA_VERSION });
        }
        Ok(state)
    }
}

/// Owns the manifest file on disk plus the last state written or read.
pub struct ManifestStore {
    path: PathBuf,
    state: ManifestState,
}

impl ManifestStore {
    /// Open (creating a fresh manifest if absent) the manifest at `path`.
    ///
    /// # Errors
    /// Returns an error on I/O failure or a malformed existing manifest.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            let fresh = ManifestState { schema_version: SCHEMA_VERSION, wal_files: vec![], page_files: vec![] };
            let mut store = Self { path, state: fresh };
            store.persist()?;
            return Ok(store);
        }
        let mut file = File::open(&path).map_err(|e| EngineError::io(path.display().to_string(), "open", e))?;
        let mut text = String::new();
        file.read_to_string(&mut text).map_err(|e| EngineError::io(path.display().to_string(), "read", e))?;
        let state = ManifestState::from_text(&text)?;
        Ok(Self { path, state })
    }

    #[must_use]
    pub fn state(&self) -> &ManifestState {
        &self.state
    }

    pub fn add_wal(&mut self, name: impl Into<String>) -> Result<()> {
        self.state.wal_files.push(name.into());
        self.persist()
    }

    pub fn remove_wal(&mut self, name: &str) -> Result<()> {
        self.state.wal_files.retain(|w| w != name);
        self.persist()
    }

    pub fn add_page(&mut self, name: impl Into<String>) -> Result<()> {
        self.state.page_files.push(name.into());
        self.persist()
    }

    pub fn remove_pages(&mut self, names: &[String]) -> Result<()> {
        self.state.page_files.retain(|p| !names.contains(p));
        self.persist()
    }

    /// Dropper's commit point: add the produced page and remove the
    /// consumed WAL in a single atomic persist.
    pub fn replace_wal_with_page(&mut self, wal_name: &str, page_name: impl Into<String>) -> Result<()> {
        self.state.wal_files.retain(|w| w != wal_name);
        self.state.page_files.push(page_name.into());
        self.persist()
    }

    /// Compactor's commit point: add the merged page and remove the pages
    /// it was built from in a single atomic persist.
    pub fn replace_pages(&mut self, old_names: &[String], new_name: impl Into<String>) -> Result<()> {
        self.state.page_files.retain(|p| !old_names.contains(p));
        self.state.page_files.push(new_name.into());
        self.persist()
    }

    /// Replace the whole manifest state at once, used by `fsck` after a
    /// rebuild from a directory scan.
    pub fn replace(&mut self, state: ManifestState) -> Result<()> {
        self.state = state;
        self.persist()
    }

    /// Write-then-rename: the manifest is never observed half-written.
    fn persist(&self) -> Result<()> {
        let tmp_path = self.path.with_extension("tmp");
        let mut tmp = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(|e| EngineError::io(tmp_path.display().to_string(), "open", e))?;
        tmp.write_all(self.state.to_text().as_bytes())
            .map_err(|e| EngineError::io(tmp_path.display().to_string(), "write", e))?;
        tmp.sync_data().map_err(|e| EngineError::io(tmp_path.display().to_string(), "fsync", e))?;
        drop(tmp);
        fs::rename(&tmp_path, &self.path)
            .map_err(|e| EngineError::io(self.path.display().to_string(), "rename", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("MANIFEST");
        {
            let mut store = ManifestStore::open(&path).unwrap();
            store.add_wal("000001.wal").unwrap();
            store.add_page("000001.page").unwrap();
        }
        let store = ManifestStore::open(&path).unwrap();
        assert_eq!(store.state().wal_files, vec!["000001.wal".to_string()]);
        assert_eq!(store.state().page_files, vec!["000001.page".to_string()]);
    }

    #[test]
    fn remove_wal_drops_only_named_entry() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("MANIFEST");
        let mut store = ManifestStore::open(&path).unwrap();
        store.add_wal("a.wal").unwrap();
        store.add_wal("b.wal").unwrap();
        store.remove_wal("a.wal").unwrap();
        assert_eq!(store.state().wal_files, vec!["b.wal".to_string()]);
    }

    #[test]
    fn rejects_malformed_manifest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("MANIFEST");
        fs::write(&path, "not a real manifest\n").unwrap();
        assert!(ManifestStore::open(&path).is_err());
    }

    #[test]
    fn rejects_newer_schema_version() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("MANIFEST");
        fs::write(&path, format!("schema_version={}\n", SCHEMA_VERSION + 1)).unwrap();
        assert!(ManifestStore::open(&path).is_err());
    }
}
