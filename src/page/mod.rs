//! Immutable page files: chunks for many series concatenated into one file,
//! with a sidecar index for id/time-range/flag skip checks.

mod index;

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub use index::{
    id_bloom_insert, id_bloom_might_contain, IndexRecord, IndexTrailer, PageTrailer, ID_BLOOM_BYTES,
    INDEX_RECORD_LEN, INDEX_TRAILER_LEN, PAGE_TRAILER_LEN,
};

use crate::chunk::{flag_bloom_might_contain, ChunkHeader, OpenChunk, SealedChunk, CHUNK_HEADER_LEN};
use crate::errors::{EngineError, Result};
use crate::types::{Flag, Id, Measurement, Time};

/// Summary returned after writing a page, useful to the caller (Dropper,
/// compactor) without reopening the files it just wrote.
#[derive(Debug, Clone)]
pub struct PageSummary {
    pub min_time: Time,
    pub max_time: Time,
    pub chunk_count: u32,
    pub next_chunk_id: u64,
}

/// Write a page file and its sidecar index from a measurement stream.
///
/// `measurements` need not be pre-sorted; it is grouped by id (stable,
/// preserving per-id order) and sorted within each id by time before
/// encoding, matching the on-disk invariant that chunks are grouped and
/// sorted by `meas_id` then `chunk_id`.
///
/// # Errors
/// Returns `IOError` if either file cannot be written.
pub fn write_page(
    page_path: impl AsRef<Path>,
    index_path: impl AsRef<Path>,
    measurements: &[Measurement],
    chunk_bytes: usize,
    chunk_id_start: u64,
) -> Result<PageSummary> {
    let page_path = page_path.as_ref();
    let index_path = index_path.as_ref();

    let mut grouped: BTreeMap<Id, Vec<Measurement>> = BTreeMap::new();
    for m in measurements {
        grouped.entry(m.id).or_default().push(*m);
    }
    for group in grouped.values_mut() {
        group.sort_by_key(|m| m.time);
    }

    let mut page_file =
        File::create(page_path).map_err(|e| EngineError::io(page_path.display().to_string(), "create", e))?;

    let mut records: Vec<IndexRecord> = Vec::new();
    let mut chunk_id = chunk_id_start;
    let mut offset: u64 = 0;
    let mut id_bloom = [0u8; ID_BLOOM_BYTES];
    let mut page_min: Option<Time> = None;
    let mut page_max: Time = 0;

    for (id, group) in grouped {
        id_bloom_insert(&mut id_bloom, id);
        let mut open = OpenChunk::new(id, chunk_bytes);
        for m in group {
            if !open.append(m) {
                offset = flush_chunk(&mut page_file, page_path, open, &mut chunk_id, offset, &mut records, &mut page_min, &mut page_max)?;
                open = OpenChunk::new(id, chunk_bytes);
                if !open.append(m) {
                    return Err(EngineError::DropFailed { reason: format!("single measurement for id {id} exceeds chunk_bytes") });
                }
            }
        }
        if !open.is_empty() {
            offset = flush_chunk(&mut page_file, page_path, open, &mut chunk_id, offset, &mut records, &mut page_min, &mut page_max)?;
        }
    }

    let trailer = PageTrailer {
        filesize: offset + PAGE_TRAILER_LEN as u64,
        chunk_count: u32::try_from(records.len()).unwrap_or(u32::MAX),
        min_time: page_min.unwrap_or(0),
        max_time: page_max,
        max_chunk_id: chunk_id.saturating_sub(1),
    };
    page_file
        .write_all(&trailer.to_bytes())
        .map_err(|e| EngineError::io(page_path.display().to_string(), "write-trailer", e))?;

    let mut index_file =
        File::create(index_path).map_err(|e| EngineError::io(index_path.display().to_string(), "create", e))?;
    for rec in &records {
        index_file
            .write_all(&rec.to_bytes())
            .map_err(|e| EngineError::io(index_path.display().to_string(), "write", e))?;
    }
    let index_trailer = IndexTrailer {
        count: u32::try_from(records.len()).unwrap_or(u32::MAX),
        min_time: page_min.unwrap_or(0),
        max_time: page_max,
        id_bloom,
    };
    index_file
        .write_all(&index_trailer.to_bytes())
        .map_err(|e| EngineError::io(index_path.display().to_string(), "write-trailer", e))?;
    index_file.sync_data().map_err(|e| EngineError::io(index_path.display().to_string(), "fsync", e))?;
    page_file.sync_data().map_err(|e| EngineError::io(page_path.display().to_string(), "fsync", e))?;

    Ok(PageSummary { min_time: page_min.unwrap_or(0), max_time: page_max, chunk_count: trailer.chunk_count, next_chunk_id: chunk_id })
}

#[allow(clippy::too_many_arguments)]
fn flush_chunk(
    page_file: &mut File,
    page_path: &Path,
    open: OpenChunk,
    chunk_id: &mut u64,
    offset: u64,
    records: &mut Vec<IndexRecord>,
    page_min: &mut Option<Time>,
    page_max: &mut Time,
) -> Result<u64> {
    let id_meas = open.id_meas();
    let mut sealed = open.pack();
    sealed.header.offset_in_page = offset;
    let header_bytes = sealed.header.to_bytes();
    page_file
        .write_all(&header_bytes)
        .map_err(|e| EngineError::io(page_path.display().to_string(), "write", e))?;
    page_file
        .write_all(&sealed.buf)
        .map_err(|e| EngineError::io(page_path.display().to_string(), "write", e))?;

    let (min_t, max_t) = (sealed.header.first_time, sealed.header.last_time);
    *page_min = Some(page_min.map_or(min_t, |m| m.min(min_t)));
    *page_max = (*page_max).max(max_t);

    records.push(IndexRecord {
        chunk_id: *chunk_id,
        meas_id: id_meas,
        min_time: min_t,
        max_time: max_t,
        flag_bloom: sealed.header.flag_bloom,
        offset_in_page: offset,
    });
    *chunk_id += 1;
    Ok(offset + CHUNK_HEADER_LEN as u64 + sealed.header.size_bytes as u64)
}

/// A page opened for reading: its index is loaded eagerly, chunks are
/// decoded lazily on demand.
pub struct Page {
    page_path: PathBuf,
    index_path: PathBuf,
    records: Vec<IndexRecord>,
    trailer: IndexTrailer,
}

impl Page {
    /// # Errors
    /// Returns `IOError` if either file cannot be read, or `Manifest` if the
    /// index is truncated/malformed.
    pub fn open(page_path: impl AsRef<Path>, index_path: impl AsRef<Path>) -> Result<Self> {
        let page_path = page_path.as_ref().to_path_buf();
        let index_path = index_path.as_ref().to_path_buf();
        let mut buf = Vec::new();
        File::open(&index_path)
            .map_err(|e| EngineError::io(index_path.display().to_string(), "open", e))?
            .read_to_end(&mut buf)
            .map_err(|e| EngineError::io(index_path.display().to_string(), "read", e))?;
        if buf.len() < INDEX_TRAILER_LEN {
            return Err(EngineError::Manifest(format!("index file {} is too short", index_path.display())));
        }
        let split = buf.len() - INDEX_TRAILER_LEN;
        let trailer = IndexTrailer::from_bytes(&buf[split..])
            .ok_or_else(|| EngineError::Manifest(format!("bad index trailer in {}", index_path.display())))?;
        let mut records = Vec::with_capacity(trailer.count as usize);
        for chunk in buf[..split].chunks_exact(INDEX_RECORD_LEN) {
            if let Some(rec) = IndexRecord::from_bytes(chunk) {
                records.push(rec);
            }
        }
        Ok(Self { page_path, index_path, records, trailer })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.page_path
    }

    #[must_use]
    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    #[must_use]
    pub fn min_max_time(&self) -> (Time, Time) {
        (self.trailer.min_time, self.trailer.max_time)
    }

    #[must_use]
    pub fn records(&self) -> &[IndexRecord] {
        &self.records
    }

    #[must_use]
    pub fn might_contain_any(&self, ids: &[Id]) -> bool {
        ids.is_empty() || ids.iter().any(|id| id_bloom_might_contain(&self.trailer.id_bloom, *id))
    }

    #[must_use]
    pub fn known_ids(&self) -> Vec<Id> {
        let mut ids: Vec<Id> = self.records.iter().map(|r| r.meas_id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    fn overlaps_time(&self, from: Time, to: Time) -> bool {
        self.trailer.min_time <= to && self.trailer.max_time >= from
    }

    /// Read the trailer written at the end of the page file itself (as
    /// opposed to the sidecar index trailer loaded at `open`).
    ///
    /// # Errors
    /// Returns `IOError` on read failure or `Manifest` if the page file is
    /// too short to hold a trailer.
    pub fn read_page_trailer(&self) -> Result<PageTrailer> {
        let mut file = File::open(&self.page_path)
            .map_err(|e| EngineError::io(self.page_path.display().to_string(), "open", e))?;
        let len = file
            .metadata()
            .map_err(|e| EngineError::io(self.page_path.display().to_string(), "stat", e))?
            .len();
        if len < PAGE_TRAILER_LEN as u64 {
            return Err(EngineError::Manifest(format!("page {} is too short for a trailer", self.page_path.display())));
        }
        file.seek(SeekFrom::Start(len - PAGE_TRAILER_LEN as u64))
            .map_err(|e| EngineError::io(self.page_path.display().to_string(), "seek", e))?;
        let mut buf = [0u8; PAGE_TRAILER_LEN];
        file.read_exact(&mut buf).map_err(|e| EngineError::io(self.page_path.display().to_string(), "read", e))?;
        PageTrailer::from_bytes(&buf)
            .ok_or_else(|| EngineError::Manifest(format!("malformed page trailer in {}", self.page_path.display())))
    }

    /// Cross-check the page file's own trailer against its sidecar index
    /// trailer: chunk count and time range must agree.
    ///
    /// # Errors
    /// Returns `IOError`/`Manifest` if the page trailer can't be read.
    pub fn verify_trailers_agree(&self) -> Result<bool> {
        let page_trailer = self.read_page_trailer()?;
        Ok(page_trailer.chunk_count == self.trailer.count
            && page_trailer.min_time == self.trailer.min_time
            && page_trailer.max_time == self.trailer.max_time)
    }

    /// Read and checksum-verify one chunk named by an index record.
    ///
    /// # Errors
    /// Returns `IOError` on read failure or `BadChecksum` on corruption.
    pub fn read_chunk(&self, record: &IndexRecord) -> Result<Vec<Measurement>> {
        let mut file = File::open(&self.page_path)
            .map_err(|e| EngineError::io(self.page_path.display().to_string(), "open", e))?;
        file.seek(SeekFrom::Start(record.offset_in_page))
            .map_err(|e| EngineError::io(self.page_path.display().to_string(), "seek", e))?;
        let mut header_buf = [0u8; CHUNK_HEADER_LEN];
        file.read_exact(&mut header_buf)
            .map_err(|e| EngineError::io(self.page_path.display().to_string(), "read", e))?;
        let header = ChunkHeader::from_bytes(&header_buf)
            .ok_or_else(|| EngineError::Manifest(format!("truncated chunk header at offset {}", record.offset_in_page)))?;
        let mut buf = vec![0u8; header.size_bytes as usize];
        file.read_exact(&mut buf).map_err(|e| EngineError::io(self.page_path.display().to_string(), "read", e))?;
        let sealed = SealedChunk { header, buf };
        sealed.reader_with_id(&self.page_path.display().to_string(), record.chunk_id)
    }

    /// Closed-interval scan. Chunks that fail their checksum are skipped and
    /// logged; the scan continues with whatever else could be read.
    ///
    /// # Errors
    /// Returns `IOError` on a read failure that isn't a checksum mismatch.
    pub fn interval(&self, ids: &[Id], flag: Flag, from: Time, to: Time) -> Result<Vec<Measurement>> {
        let mut out = Vec::new();
        if !self.overlaps_time(from, to) || !self.might_contain_any(ids) {
            return Ok(out);
        }
        for rec in &self.records {
            if !rec.overlaps(from, to) {
                continue;
            }
            if !(ids.is_empty() || ids.contains(&rec.meas_id)) {
                continue;
            }
            if !flag_bloom_might_contain(rec.flag_bloom, flag) {
                continue;
            }
            match self.read_chunk(rec) {
                Ok(samples) => {
                    out.extend(samples.into_iter().filter(|m| m.in_interval(from, to) && m.in_flag(flag)));
                }
                Err(EngineError::BadChecksum { file, chunk_id }) => {
                    log::warn!("bad checksum in {file} (chunk {chunk_id}), skipping");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Best sample per id with `time <= tp`. Ids with no matching record are
    /// simply absent from the result; the caller fills `NO_DATA`.
    ///
    /// # Errors
    /// Returns `IOError` on a read failure that isn't a checksum mismatch.
    pub fn time_point(&self, ids: &[Id], flag: Flag, tp: Time) -> Result<HashMap<Id, Measurement>> {
        let mut out = HashMap::new();
        let wanted: Vec<Id> = if ids.is_empty() { self.known_ids() } else { ids.to_vec() };
        for id in wanted {
            let best = self
                .records
                .iter()
                .filter(|r| r.meas_id == id && r.max_time <= tp && flag_bloom_might_contain(r.flag_bloom, flag))
                .max_by_key(|r| r.max_time);
            let Some(rec) = best else { continue };
            match self.read_chunk(rec) {
                Ok(samples) => {
                    if let Some(m) = samples
                        .into_iter()
                        .filter(|m| m.time <= tp && m.in_flag(flag))
                        .max_by_key(|m| m.time)
                    {
                        out.insert(id, m);
                    }
                }
                Err(EngineError::BadChecksum { file, chunk_id }) => {
                    log::warn!("bad checksum in {file} (chunk {chunk_id}), skipping");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn gen(id: Id, from: u64, to: u64) -> Vec<Measurement> {
        (from..to).map(|t| Measurement::new(id, t, t as f64, 0)).collect()
    }

    #[test]
    fn write_then_interval_round_trips() {
        let dir = tempdir().unwrap();
        let page_path = dir.path().join("p.page");
        let index_path = dir.path().join("p.pagei");
        let mut all = gen(1, 0, 500);
        all.extend(gen(2, 100, 300));
        let summary = write_page(&page_path, &index_path, &all, 512, 1).unwrap();
        assert!(summary.chunk_count > 0);

        let page = Page::open(&page_path, &index_path).unwrap();
        let got = page.interval(&[1, 2], 0, 0, 1000).unwrap();
        assert_eq!(got.len(), all.len());
        let id1: Vec<_> = got.iter().filter(|m| m.id == 1).collect();
        for w in id1.windows(2) {
            assert!(w[0].time < w[1].time);
        }
    }

    #[test]
    fn bloom_rejects_absent_id() {
        let dir = tempdir().unwrap();
        let page_path = dir.path().join("p.page");
        let index_path = dir.path().join("p.pagei");
        write_page(&page_path, &index_path, &gen(1, 0, 10), 4096, 1).unwrap();
        let page = Page::open(&page_path, &index_path).unwrap();
        assert!(!page.might_contain_any(&[999]));
    }

    #[test]
    fn time_point_returns_latest_at_or_before() {
        let dir = tempdir().unwrap();
        let page_path = dir.path().join("p.page");
        let index_path = dir.path().join("p.pagei");
        write_page(&page_path, &index_path, &gen(1, 0, 50), 4096, 1).unwrap();
        let page = Page::open(&page_path, &index_path).unwrap();
        let out = page.time_point(&[1], 0, 20).unwrap();
        assert_eq!(out.get(&1).unwrap().time, 20);
    }

    #[test]
    fn corrupted_chunk_is_skipped_not_fatal() {
        let dir = tempdir().unwrap();
        let page_path = dir.path().join("p.page");
        let index_path = dir.path().join("p.pagei");
        write_page(&page_path, &index_path, &gen(1, 0, 10), 4096, 1).unwrap();
        // flip a byte inside the chunk body (past the header).
        let mut bytes = std::fs::read(&page_path).unwrap();
        let flip_at = CHUNK_HEADER_LEN + 1;
        bytes[flip_at] ^= 0xFF;
        std::fs::write(&page_path, bytes).unwrap();

        let page = Page::open(&page_path, &index_path).unwrap();
        let got = page.interval(&[1], 0, 0, 100).unwrap();
        assert!(got.is_empty());
    }
}
