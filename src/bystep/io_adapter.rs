//! Keyed log-structured store backing the by-step tier: `(period, meas_id)
//! → chunk bytes` with replace semantics. Writes go through a bounded
//! queue drained by one dedicated writer thread so `append` on the hot path
//! never blocks on disk; `flush()` is a barrier that waits for the queue to
//! fully drain.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Sender};
use parking_lot::RwLock;

use crate::errors::{EngineError, Result};
use crate::types::Id;

type Key = (u64, Id);

enum Msg {
    Put { key: Key, bytes: Vec<u8> },
    Barrier(Sender<()>),
    Shutdown,
}

const MAX_QUEUE: usize = 4096;

struct Slot {
    offset: u64,
    len: u32,
}

pub struct IOAdapter {
    path: PathBuf,
    sender: Sender<Msg>,
    worker: Option<JoinHandle<()>>,
    index: Arc<RwLock<HashMap<Key, Slot>>>,
}

impl IOAdapter {
    /// Open (or create) the backing file and rebuild its in-memory index
    /// by scanning every record, keeping the last write per key.
    ///
    /// # Errors
    /// Returns `IOError` if the file cannot be opened or is corrupt.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| EngineError::io(path.display().to_string(), "open", e))?;

        let mut index = HashMap::new();
        let mut offset = 0u64;
        let len = file.metadata().map_err(|e| EngineError::io(path.display().to_string(), "stat", e))?.len();
        while offset < len {
            file.seek(SeekFrom::Start(offset)).map_err(|e| EngineError::io(path.display().to_string(), "seek", e))?;
            let mut header = [0u8; 16];
            if file.read_exact(&mut header).is_err() {
                break; // torn tail record, stop indexing
            }
            let period = u64::from_le_bytes(header[0..8].try_into().unwrap());
            let meas_id = u32::from_le_bytes(header[8..12].try_into().unwrap());
            let record_len = u32::from_le_bytes(header[12..16].try_into().unwrap());
            let data_offset = offset + 16;
            if data_offset + u64::from(record_len) > len {
                break;
            }
            index.insert((period, meas_id), Slot { offset: data_offset, len: record_len });
            offset = data_offset + u64::from(record_len);
        }

        let index = Arc::new(RwLock::new(index));
        let (sender, receiver) = bounded::<Msg>(MAX_QUEUE);
        let worker_path = path.clone();
        let worker_index = index.clone();
        let worker = std::thread::spawn(move || {
            let mut writer = match OpenOptions::new().write(true).open(&worker_path) {
                Ok(f) => f,
                Err(_) => return,
            };
            let _ = writer.seek(SeekFrom::End(0));
            for msg in receiver {
                match msg {
                    Msg::Put { key, bytes } => {
                        let offset = match writer.stream_position() {
                            Ok(o) => o,
                            Err(_) => continue,
                        };
                        let mut record = Vec::with_capacity(16 + bytes.len());
                        record.extend_from_slice(&key.0.to_le_bytes());
                        record.extend_from_slice(&key.1.to_le_bytes());
                        record.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                        record.extend_from_slice(&bytes);
                        if writer.write_all(&record).is_ok() {
                            worker_index.write().insert(key, Slot { offset: offset + 16, len: bytes.len() as u32 });
                        }
                    }
                    Msg::Barrier(done) => {
                        let _ = writer.sync_data();
                        let _ = done.send(());
                    }
                    Msg::Shutdown => break,
                }
            }
        });

        Ok(Self { path, sender, worker: Some(worker), index })
    }

    /// Queue `bytes` to be durably stored under `(period, meas_id)`,
    /// replacing any prior value. Does not block on disk I/O.
    pub fn put(&self, period: u64, meas_id: Id, bytes: Vec<u8>) {
        let _ = self.sender.send(Msg::Put { key: (period, meas_id), bytes });
    }

    /// Read back the most recently written bytes for `(period, meas_id)`.
    ///
    /// # Errors
    /// Returns `IOError` if the backing file cannot be read.
    pub fn get(&self, period: u64, meas_id: Id) -> Result<Option<Vec<u8>>> {
        let slot = {
            let index = self.index.read();
            match index.get(&(period, meas_id)) {
                Some(s) => (s.offset, s.len),
                None => return Ok(None),
            }
        };
        let mut file = File::open(&self.path).map_err(|e| EngineError::io(self.path.display().to_string(), "open", e))?;
        file.seek(SeekFrom::Start(slot.0)).map_err(|e| EngineError::io(self.path.display().to_string(), "seek", e))?;
        let mut buf = vec![0u8; slot.1 as usize];
        file.read_exact(&mut buf).map_err(|e| EngineError::io(self.path.display().to_string(), "read", e))?;
        Ok(Some(buf))
    }

    /// Block until every queued write so far has been applied and fsynced.
    pub fn flush(&self) {
        let (tx, rx) = bounded(1);
        if self.sender.send(Msg::Barrier(tx)).is_ok() {
            let _ = rx.recv();
        }
    }
}

impl Drop for IOAdapter {
    fn drop(&mut self) {
        self.flush();
        let _ = self.sender.send(Msg::Shutdown);
        if let Some(w) = self.worker.take() {
            let _ = w.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let adapter = IOAdapter::open(dir.path().join("bystep.db")).unwrap();
        adapter.put(1, 9, vec![1, 2, 3]);
        adapter.flush();
        assert_eq!(adapter.get(1, 9).unwrap(), Some(vec![1, 2, 3]));
    }

    #[test]
    fn later_put_replaces_earlier_value() {
        let dir = tempdir().unwrap();
        let adapter = IOAdapter::open(dir.path().join("bystep.db")).unwrap();
        adapter.put(1, 9, vec![1]);
        adapter.put(1, 9, vec![2, 2]);
        adapter.flush();
        assert_eq!(adapter.get(1, 9).unwrap(), Some(vec![2, 2]));
    }

    #[test]
    fn index_rebuilds_on_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bystep.db");
        {
            let adapter = IOAdapter::open(&path).unwrap();
            adapter.put(5, 1, vec![9, 9, 9]);
            adapter.flush();
        }
        let adapter = IOAdapter::open(&path).unwrap();
        assert_eq!(adapter.get(5, 1).unwrap(), Some(vec![9, 9, 9]));
    }
}
