//! Chunk: header + compressed byte buffer holding one series' measurements
//! in insertion order.
//!
//! A chunk owns one [`BitCursor`] shared by all three codecs (time/value/
//! flag). `append` attempts all three codec writes for a measurement under
//! that single cursor; if any fails the cursor and codec state are rolled
//! back atomically and the chunk reports itself full.

use crate::bitcursor::BitCursor;
use crate::codec::{DeltaCodec, FlagCodec, XorCodec};
use crate::errors::{EngineError, Result};
use crate::types::{Flag, Id, Measurement, Time};

/// On-disk chunk header, little-endian, packed (44 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub id_meas: Id,
    pub first_time: Time,
    pub last_time: Time,
    pub count: u32,
    pub size_bytes: u32,
    pub crc32: u32,
    pub flag_bloom: u32,
    pub offset_in_page: u64,
}

pub const CHUNK_HEADER_LEN: usize = 44;

impl ChunkHeader {
    #[must_use]
    pub fn to_bytes(&self) -> [u8; CHUNK_HEADER_LEN] {
        let mut out = [0u8; CHUNK_HEADER_LEN];
        let mut o = 0;
        out[o..o + 4].copy_from_slice(&self.id_meas.to_le_bytes());
        o += 4;
        out[o..o + 8].copy_from_slice(&self.first_time.to_le_bytes());
        o += 8;
        out[o..o + 8].copy_from_slice(&self.last_time.to_le_bytes());
        o += 8;
        out[o..o + 4].copy_from_slice(&self.count.to_le_bytes());
        o += 4;
        out[o..o + 4].copy_from_slice(&self.size_bytes.to_le_bytes());
        o += 4;
        out[o..o + 4].copy_from_slice(&self.crc32.to_le_bytes());
        o += 4;
        out[o..o + 4].copy_from_slice(&self.flag_bloom.to_le_bytes());
        o += 4;
        out[o..o + 8].copy_from_slice(&self.offset_in_page.to_le_bytes());
        out
    }

    #[must_use]
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.len() < CHUNK_HEADER_LEN {
            return None;
        }
        let mut o = 0;
        let id_meas = u32::from_le_bytes(b[o..o + 4].try_into().ok()?);
        o += 4;
        let first_time = u64::from_le_bytes(b[o..o + 8].try_into().ok()?);
        o += 8;
        let last_time = u64::from_le_bytes(b[o..o + 8].try_into().ok()?);
        o += 8;
        let count = u32::from_le_bytes(b[o..o + 4].try_into().ok()?);
        o += 4;
        let size_bytes = u32::from_le_bytes(b[o..o + 4].try_into().ok()?);
        o += 4;
        let crc32 = u32::from_le_bytes(b[o..o + 4].try_into().ok()?);
        o += 4;
        let flag_bloom = u32::from_le_bytes(b[o..o + 4].try_into().ok()?);
        o += 4;
        let offset_in_page = u64::from_le_bytes(b[o..o + 8].try_into().ok()?);
        Some(Self { id_meas, first_time, last_time, count, size_bytes, crc32, flag_bloom, offset_in_page })
    }
}

/// A chunk open for writes. Converted into a [`SealedChunk`] once full or
/// explicitly sealed; the writer then surrenders exclusive ownership.
#[derive(Debug)]
pub struct OpenChunk {
    id_meas: Id,
    buf: Vec<u8>,
    bit_pos: (usize, u8),
    delta: DeltaCodec,
    xor: XorCodec,
    flagc: FlagCodec,
    first_time: Option<Time>,
    last_time: Time,
    count: u32,
    flag_bloom: u32,
}

/// Number of bits hashed into the 32-bit per-chunk flag bloom.
const FLAG_BLOOM_HASHES: u32 = 3;

fn flag_bloom_insert(bloom: &mut u32, flag: Flag) {
    for i in 0..FLAG_BLOOM_HASHES {
        let h = flag.wrapping_mul(2_654_435_761).wrapping_add(i.wrapping_mul(0x9E37_79B1));
        *bloom |= 1u32 << (h % 32);
    }
}

#[must_use]
pub fn flag_bloom_might_contain(bloom: u32, flag: Flag) -> bool {
    if flag == 0 {
        return true; // "match any flag"
    }
    for i in 0..FLAG_BLOOM_HASHES {
        let h = flag.wrapping_mul(2_654_435_761).wrapping_add(i.wrapping_mul(0x9E37_79B1));
        if bloom & (1u32 << (h % 32)) == 0 {
            return false;
        }
    }
    true
}

impl OpenChunk {
    #[must_use]
    pub fn new(id_meas: Id, bytes_capacity: usize) -> Self {
        Self {
            id_meas,
            buf: vec![0u8; bytes_capacity],
            bit_pos: (0, 0),
            delta: DeltaCodec::new(),
            xor: XorCodec::new(),
            flagc: FlagCodec::new(),
            first_time: None,
            last_time: 0,
            count: 0,
            flag_bloom: 0,
        }
    }

    #[must_use]
    pub fn id_meas(&self) -> Id {
        self.id_meas
    }

    #[must_use]
    pub fn count(&self) -> u32 {
        self.count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[must_use]
    pub fn min_max_time(&self) -> Option<(Time, Time)> {
        self.first_time.map(|f| (f, self.last_time))
    }

    /// Decode everything accepted so far without sealing. Used by the
    /// in-memory tier to answer queries against a still-writable chunk.
    #[must_use]
    pub fn decode_current(&self) -> Vec<Measurement> {
        if self.count == 0 {
            return Vec::new();
        }
        let byte_len = self.bit_pos.0 + usize::from(self.bit_pos.1 > 0);
        let mut buf = self.buf[..byte_len].to_vec();
        let mut cursor = BitCursor::new(&mut buf);
        let mut delta = DeltaCodec::new();
        let mut xor = XorCodec::new();
        let mut flagc = FlagCodec::new();
        let mut out = Vec::with_capacity(self.count as usize);
        for _ in 0..self.count {
            let Some(time) = delta.read(&mut cursor) else { break };
            let Some(value) = xor.read(&mut cursor) else { break };
            let Some(flag) = flagc.read(&mut cursor) else { break };
            out.push(Measurement::new(self.id_meas, time, value, flag));
        }
        out
    }

    /// Attempt to append a measurement. Returns `false` ("chunk is full")
    /// without mutating any state when the codecs cannot fit the next
    /// symbol; the caller must redirect further appends to a new chunk.
    pub fn append(&mut self, m: Measurement) -> bool {
        debug_assert_eq!(m.id, self.id_meas);
        let saved_delta = self.delta;
        let saved_xor = self.xor;
        let saved_flag = self.flagc;
        let saved_pos = self.bit_pos;

        let ok = {
            let mut cursor = BitCursor::at(&mut self.buf, saved_pos.0, saved_pos.1);
            let ok = self.delta.append(&mut cursor, m.time)
                && self.xor.append(&mut cursor, m.value)
                && self.flagc.append(&mut cursor, m.flag);
            if ok {
                self.bit_pos = cursor.position();
            }
            ok
        };

        if !ok {
            self.delta = saved_delta;
            self.xor = saved_xor;
            self.flagc = saved_flag;
            return false;
        }

        if self.first_time.is_none() {
            self.first_time = Some(m.time);
        }
        self.last_time = m.time;
        self.count += 1;
        flag_bloom_insert(&mut self.flag_bloom, m.flag);
        true
    }

    /// Compact unused trailing bytes, zero the remainder for determinism,
    /// and compute the checksum and header for a sealed chunk.
    #[must_use]
    pub fn pack(mut self) -> SealedChunk {
        let used_bytes = {
            let mut cursor = BitCursor::at(&mut self.buf, self.bit_pos.0, self.bit_pos.1);
            cursor.zero_fill_tail();
            cursor.position().0
        };
        self.buf.truncate(used_bytes);
        // keep at least one byte so an empty chunk still has a well-formed buffer
        if self.buf.is_empty() {
            self.buf.push(0);
        }
        let mut crc = crc32fast::Hasher::new();
        crc.update(&self.buf);
        let checksum = crc.finalize();
        let header = ChunkHeader {
            id_meas: self.id_meas,
            first_time: self.first_time.unwrap_or(0),
            last_time: self.last_time,
            count: self.count,
            size_bytes: u32::try_from(self.buf.len()).unwrap_or(u32::MAX),
            crc32: checksum,
            flag_bloom: self.flag_bloom,
            offset_in_page: 0,
        };
        SealedChunk { header, buf: self.buf }
    }
}

/// An immutable, checksummed chunk ready for shared read access.
#[derive(Debug, Clone)]
pub struct SealedChunk {
    pub header: ChunkHeader,
    pub buf: Vec<u8>,
}

impl SealedChunk {
    #[must_use]
    pub fn check_checksum(&self) -> bool {
        let mut crc = crc32fast::Hasher::new();
        crc.update(&self.buf);
        crc.finalize() == self.header.crc32
    }

    /// Decode every stored measurement in insertion order.
    ///
    /// # Errors
    /// Returns `BadChecksum` if the stored CRC does not match the buffer.
    pub fn reader(&self, file_hint: &str) -> Result<Vec<Measurement>> {
        self.reader_with_id(file_hint, 0)
    }

    /// As [`Self::reader`], but attributes checksum failures to `chunk_id`
    /// (the index record's identifier) rather than a default of zero.
    ///
    /// # Errors
    /// Returns `BadChecksum` if the stored CRC does not match the buffer.
    pub fn reader_with_id(&self, file_hint: &str, chunk_id: u64) -> Result<Vec<Measurement>> {
        if !self.check_checksum() {
            return Err(EngineError::BadChecksum { file: file_hint.to_string(), chunk_id });
        }
        let mut buf = self.buf.clone();
        let mut cursor = BitCursor::new(&mut buf);
        let mut delta = DeltaCodec::new();
        let mut xor = XorCodec::new();
        let mut flagc = FlagCodec::new();
        let mut out = Vec::with_capacity(self.header.count as usize);
        for _ in 0..self.header.count {
            let time = delta.read(&mut cursor).expect("chunk count exceeds encoded stream");
            let value = xor.read(&mut cursor).expect("chunk count exceeds encoded stream");
            let flag = flagc.read(&mut cursor).expect("chunk count exceeds encoded stream");
            out.push(Measurement::new(self.header.id_meas, time, value, flag));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_prefix_preserved() {
        let mut chunk = OpenChunk::new(7, 256);
        let mut accepted = 0usize;
        for i in 0..10_000u64 {
            let m = Measurement::new(7, i, i as f64, 0);
            if chunk.append(m) {
                accepted += 1;
            } else {
                break;
            }
        }
        assert!(accepted > 0);
        let sealed = chunk.pack();
        assert_eq!(sealed.header.count as usize, accepted);
        assert!(sealed.check_checksum());
        let decoded = sealed.reader("test").unwrap();
        assert_eq!(decoded.len(), accepted);
        for (i, m) in decoded.iter().enumerate() {
            assert_eq!(m.time, i as u64);
            assert!((m.value - i as f64).abs() < f64::EPSILON);
        }
    }

    #[test]
    fn full_chunk_append_returns_false_and_caller_must_roll() {
        let mut chunk = OpenChunk::new(1, 16);
        let mut last_accepted = true;
        let mut i = 0u64;
        while last_accepted {
            last_accepted = chunk.append(Measurement::new(1, i, i as f64, 0));
            i += 1;
        }
        assert!(chunk.count() > 0);
        // further appends keep failing; caller is responsible for rolling to a new chunk
        assert!(!chunk.append(Measurement::new(1, i, 0.0, 0)));
    }

    #[test]
    fn checksum_detects_corruption() {
        let mut chunk = OpenChunk::new(3, 64);
        chunk.append(Measurement::new(3, 1, 1.0, 0));
        chunk.append(Measurement::new(3, 2, 2.0, 0));
        let mut sealed = chunk.pack();
        sealed.buf[0] ^= 0xFF;
        assert!(!sealed.check_checksum());
        assert!(sealed.reader("corrupt").is_err());
    }

    #[test]
    fn flag_bloom_soundness() {
        let mut chunk = OpenChunk::new(2, 4096);
        for i in 0..50u32 {
            chunk.append(Measurement::new(2, u64::from(i), 0.0, i));
        }
        let sealed = chunk.pack();
        // every inserted flag must be reported as possibly-present
        for i in 0..50u32 {
            assert!(flag_bloom_might_contain(sealed.header.flag_bloom, i));
        }
    }
}
