//! Write-ahead log: the durable landing zone for writes.
//!
//! Each WAL file holds up to `cap` raw measurements, packed little-endian
//! with no padding (`{id:u32, time:u64, value:f64, flag:u32}`, 24 bytes).
//! Writes accumulate in a batch buffer; the batch is flushed (ordered write
//! + fsync) when it fills, and the file seals once its on-disk record count
//! reaches `cap`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::errors::{EngineError, Result};
use crate::types::{Flag, Id, Measurement, Time, Value};

pub const RECORD_LEN: usize = 24;

fn encode_record(m: &Measurement) -> [u8; RECORD_LEN] {
    let mut out = [0u8; RECORD_LEN];
    out[0..4].copy_from_slice(&m.id.to_le_bytes());
    out[4..12].copy_from_slice(&m.time.to_le_bytes());
    out[12..20].copy_from_slice(&m.value.to_le_bytes());
    out[20..24].copy_from_slice(&m.flag.to_le_bytes());
    out
}

fn decode_record(b: &[u8]) -> Option<Measurement> {
    if b.len() < RECORD_LEN {
        return None;
    }
    let id = Id::from_le_bytes(b[0..4].try_into().ok()?);
    let time = Time::from_le_bytes(b[4..12].try_into().ok()?);
    let value = Value::from_le_bytes(b[12..20].try_into().ok()?);
    let flag = Flag::from_le_bytes(b[20..24].try_into().ok()?);
    Some(Measurement::new(id, time, value, flag))
}

/// A single append-only log file.
pub struct Wal {
    path: PathBuf,
    file: File,
    batch: Vec<u8>,
    batch_size_records: usize,
    on_disk_count: usize,
    cap: usize,
    sealed: bool,
}

impl Wal {
    /// Open (creating if absent) a WAL file at `path` with seal threshold
    /// `cap` records and an in-memory batch flushed every `batch_size_records`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened, or if a torn tail is
    /// detected and cannot be truncated.
    pub fn open(path: impl AsRef<Path>, cap: usize, batch_size_records: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| EngineError::io(path.display().to_string(), "open", e))?;

        let len = file
            .metadata()
            .map_err(|e| EngineError::io(path.display().to_string(), "stat", e))?
            .len() as usize;
        let remainder = len % RECORD_LEN;
        if remainder != 0 {
            let truncated = (len - remainder) as u64;
            file.set_len(truncated)
                .map_err(|e| EngineError::io(path.display().to_string(), "truncate-tail", e))?;
            log::warn!("wal {}: torn tail of {remainder} bytes truncated", path.display());
        }
        let on_disk_count = (len - remainder) / RECORD_LEN;
        file.seek(SeekFrom::End(0))
            .map_err(|e| EngineError::io(path.display().to_string(), "seek", e))?;

        Ok(Self {
            path,
            file,
            batch: Vec::with_capacity(batch_size_records * RECORD_LEN),
            batch_size_records: batch_size_records.max(1),
            on_disk_count,
            cap,
            sealed: on_disk_count >= cap,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    #[must_use]
    pub fn on_disk_count(&self) -> usize {
        self.on_disk_count
    }

    /// Append one measurement. Fails (without mutating any in-memory state)
    /// if the file is already sealed; the caller is expected to have rolled
    /// to a new WAL before calling this.
    ///
    /// # Errors
    /// Returns `IOError` on flush/fsync failure.
    pub fn append(&mut self, m: &Measurement) -> Result<()> {
        if self.sealed {
            return Err(EngineError::DropFailed { reason: "wal is sealed".into() });
        }
        self.batch.extend_from_slice(&encode_record(m));
        self.on_disk_count += 1;
        if self.batch.len() >= self.batch_size_records * RECORD_LEN
            || self.on_disk_count >= self.cap
        {
            self.flush()?;
        }
        if self.on_disk_count >= self.cap {
            self.sealed = true;
        }
        Ok(())
    }

    /// Flush the in-memory batch to disk and fsync.
    ///
    /// # Errors
    /// Returns `IOError` on write/flush/fsync failure.
    pub fn flush(&mut self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        self.file
            .write_all(&self.batch)
            .map_err(|e| EngineError::io(self.path.display().to_string(), "write", e))?;
        self.file
            .sync_data()
            .map_err(|e| EngineError::io(self.path.display().to_string(), "fsync", e))?;
        self.batch.clear();
        Ok(())
    }

    /// Read every well-formed record in append order.
    ///
    /// # Errors
    /// Returns `IOError` on read failure.
    pub fn read_all(&mut self) -> Result<Vec<Measurement>> {
        self.flush()?;
        self.file
            .seek(SeekFrom::Start(0))
            .map_err(|e| EngineError::io(self.path.display().to_string(), "seek", e))?;
        let mut buf = Vec::new();
        self.file
            .read_to_end(&mut buf)
            .map_err(|e| EngineError::io(self.path.display().to_string(), "read", e))?;
        self.file
            .seek(SeekFrom::End(0))
            .map_err(|e| EngineError::io(self.path.display().to_string(), "seek", e))?;
        let mut out = Vec::with_capacity(buf.len() / RECORD_LEN);
        for chunk in buf.chunks_exact(RECORD_LEN) {
            if let Some(m) = decode_record(chunk) {
                out.push(m);
            }
        }
        Ok(out)
    }

    /// Linear scan filtered by series set, time range, and flag match.
    ///
    /// # Errors
    /// Returns `IOError` on read failure.
    pub fn scan(
        &mut self,
        ids: &[Id],
        flag: Flag,
        from: Time,
        to: Time,
    ) -> Result<Vec<Measurement>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|m| m.in_ids(ids) && m.in_flag(flag) && m.in_interval(from, to))
            .collect())
    }

    /// Minimum and maximum observed time for `id`, if any.
    ///
    /// # Errors
    /// Returns `IOError` on read failure.
    pub fn min_max_time(&mut self, id: Id) -> Result<Option<(Time, Time)>> {
        let all = self.read_all()?;
        let mut acc: Option<(Time, Time)> = None;
        for m in all.into_iter().filter(|m| m.id == id) {
            acc = Some(match acc {
                None => (m.time, m.time),
                Some((lo, hi)) => (lo.min(m.time), hi.max(m.time)),
            });
        }
        Ok(acc)
    }

    /// Delete the WAL's backing file. Called by the Dropper once the file
    /// has been fully converted into a page and removed from the manifest.
    ///
    /// # Errors
    /// Returns `IOError` if the file cannot be removed.
    pub fn delete_file(self) -> Result<()> {
        std::fs::remove_file(&self.path)
            .map_err(|e| EngineError::io(self.path.display().to_string(), "remove", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_and_read_all_roundtrips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.wal");
        let mut wal = Wal::open(&path, 1000, 4).unwrap();
        for i in 0..10u64 {
            wal.append(&Measurement::new(1, i, i as f64, 0)).unwrap();
        }
        wal.flush().unwrap();
        let all = wal.read_all().unwrap();
        assert_eq!(all.len(), 10);
        assert_eq!(all[3].time, 3);
    }

    #[test]
    fn seals_at_cap() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("b.wal");
        let mut wal = Wal::open(&path, 5, 2).unwrap();
        for i in 0..5u64 {
            wal.append(&Measurement::new(1, i, 0.0, 0)).unwrap();
        }
        assert!(wal.is_sealed());
        assert!(wal.append(&Measurement::new(1, 99, 0.0, 0)).is_err());
    }

    #[test]
    fn torn_tail_is_truncated_on_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c.wal");
        {
            let mut wal = Wal::open(&path, 1000, 1).unwrap();
            wal.append(&Measurement::new(1, 1, 1.0, 0)).unwrap();
            wal.append(&Measurement::new(1, 2, 2.0, 0)).unwrap();
        }
        // Corrupt: append a torn half-record.
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0xAA; 10]).unwrap();
        }
        let mut wal = Wal::open(&path, 1000, 1).unwrap();
        let all = wal.read_all().unwrap();
        assert_eq!(all.len(), 2);
    }
}
