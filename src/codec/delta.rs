//! Delta-of-delta encoding for the timestamp stream.
//!
//! The first timestamp is written raw (64 bits). Every later timestamp
//! encodes `D = (t - t_prev) - delta_prev` with a variable-length prefix
//! chosen by the magnitude of `D`:
//!
//! - `D == 0`: one bit `0`.
//! - `|D| <= 63`: `10` + 7 bits signed.
//! - `|D| <= 255`: `110` + 9 bits signed.
//! - `|D| <= 2047`: `1110` + 12 bits signed.
//! - otherwise: `1111` + 32 bits signed.

use crate::bitcursor::BitCursor;
use crate::types::Time;

#[derive(Debug, Clone, Copy, Default)]
pub struct DeltaCodec {
    prev_time: Time,
    prev_delta: i64,
    first: bool,
}

impl DeltaCodec {
    #[must_use]
    pub fn new() -> Self {
        Self { prev_time: 0, prev_delta: 0, first: true }
    }

    /// Attempt to append `time`. Returns `false` (without mutating codec
    /// state) if the cursor doesn't have room for the symbol.
    pub fn append(&mut self, cursor: &mut BitCursor<'_>, time: Time) -> bool {
        if self.first {
            if !cursor.write_bits(time, 64) {
                return false;
            }
            self.prev_time = time;
            self.first = false;
            return true;
        }

        let delta = (time as i64).wrapping_sub(self.prev_time as i64);
        let d = delta.wrapping_sub(self.prev_delta);

        // Compute the full symbol width up front so a too-small cursor is
        // rejected atomically instead of leaving a partial prefix written.
        let (prefix, prefix_bits, value_bits) = if d == 0 {
            (0u64, 1u32, 0u32)
        } else if (-63..=63).contains(&d) {
            (0b10, 2, 7)
        } else if (-255..=255).contains(&d) {
            (0b110, 3, 9)
        } else if (-2047..=2047).contains(&d) {
            (0b1110, 4, 12)
        } else {
            (0b1111, 4, 32)
        };
        if !cursor.has_bits(prefix_bits + value_bits) {
            return false;
        }
        if d == 0 {
            cursor.write_bit(false);
        } else {
            cursor.write_bits(prefix, prefix_bits);
            cursor.write_bits(sign_extend_mask(d, value_bits), value_bits);
        }
        self.prev_delta = delta;
        self.prev_time = time;
        true
    }

    pub fn read(&mut self, cursor: &mut BitCursor<'_>) -> Option<Time> {
        if self.first {
            let raw = cursor.read_bits(64)?;
            self.prev_time = raw;
            self.first = false;
            return Some(raw);
        }
        let d: i64 = if cursor.read_bit()? {
            if cursor.read_bit()? {
                if cursor.read_bit()? {
                    if cursor.read_bit()? {
                        sign_extend_from(cursor.read_bits(32)?, 32)
                    } else {
                        sign_extend_from(cursor.read_bits(12)?, 12)
                    }
                } else {
                    sign_extend_from(cursor.read_bits(9)?, 9)
                }
            } else {
                sign_extend_from(cursor.read_bits(7)?, 7)
            }
        } else {
            0
        };
        let delta = self.prev_delta.wrapping_add(d);
        let time = (self.prev_time as i64).wrapping_add(delta) as u64;
        self.prev_delta = delta;
        self.prev_time = time;
        Some(time)
    }
}

fn sign_extend_mask(v: i64, bits: u32) -> u64 {
    (v as u64) & ((1u64 << bits) - 1)
}

fn sign_extend_from(raw: u64, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((raw << shift) as i64) >> shift
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(times: &[Time]) -> Vec<Time> {
        let mut buf = vec![0u8; 4096];
        {
            let mut cursor = BitCursor::new(&mut buf);
            let mut enc = DeltaCodec::new();
            for &t in times {
                assert!(enc.append(&mut cursor, t));
            }
        }
        let mut cursor = BitCursor::new(&mut buf);
        let mut dec = DeltaCodec::new();
        times.iter().map(|_| dec.read(&mut cursor).unwrap()).collect()
    }

    #[test]
    fn constant_step_roundtrips() {
        let times: Vec<Time> = (0..500).map(|i| i * 1000).collect();
        assert_eq!(roundtrip(&times), times);
    }

    #[test]
    fn jittery_step_roundtrips() {
        let mut t = 0u64;
        let mut times = vec![];
        for i in 0..200u64 {
            t += 1000 + (i % 7) * 37;
            times.push(t);
        }
        assert_eq!(roundtrip(&times), times);
    }

    #[test]
    fn large_jump_roundtrips() {
        let times = vec![0, 10, 20, 1_000_000_000, 1_000_000_020];
        assert_eq!(roundtrip(&times), times);
    }

    #[test]
    fn full_buffer_rolls_back() {
        let mut buf = vec![0u8; 9]; // 64 bits for first value + 8 spare bits
        let mut cursor = BitCursor::new(&mut buf);
        let mut enc = DeltaCodec::new();
        assert!(enc.append(&mut cursor, 0));
        let before = cursor.position();
        // A 32-bit-delta symbol (36 bits) cannot fit in the remaining 8 bits.
        assert!(!enc.append(&mut cursor, 10_000_000));
        assert_eq!(cursor.position(), before);
    }
}
