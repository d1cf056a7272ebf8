//! Run-length-with-flag-bit encoding for the sideband flag column.
//!
//! The first flag is a 32-bit literal. Afterwards one bit `0` means "same as
//! previous"; `1` means "followed by a 32-bit literal".

use crate::bitcursor::BitCursor;
use crate::types::Flag;

#[derive(Debug, Clone, Copy, Default)]
pub struct FlagCodec {
    prev: Flag,
    first: bool,
}

impl FlagCodec {
    #[must_use]
    pub fn new() -> Self {
        Self { prev: 0, first: true }
    }

    pub fn append(&mut self, cursor: &mut BitCursor<'_>, flag: Flag) -> bool {
        if self.first {
            if !cursor.write_bits(u64::from(flag), 32) {
                return false;
            }
            self.prev = flag;
            self.first = false;
            return true;
        }
        if flag == self.prev {
            if !cursor.write_bit(false) {
                return false;
            }
            return true;
        }
        if !cursor.has_bits(1 + 32) {
            return false;
        }
        cursor.write_bit(true);
        cursor.write_bits(u64::from(flag), 32);
        self.prev = flag;
        true
    }

    pub fn read(&mut self, cursor: &mut BitCursor<'_>) -> Option<Flag> {
        if self.first {
            let raw = u32::try_from(cursor.read_bits(32)?).ok()?;
            self.prev = raw;
            self.first = false;
            return Some(raw);
        }
        let literal = cursor.read_bit()?;
        if literal {
            let raw = u32::try_from(cursor.read_bits(32)?).ok()?;
            self.prev = raw;
            Some(raw)
        } else {
            Some(self.prev)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_flag_roundtrips() {
        let flags = vec![0u32; 50];
        let mut buf = vec![0u8; 512];
        {
            let mut cursor = BitCursor::new(&mut buf);
            let mut enc = FlagCodec::new();
            for &f in &flags {
                assert!(enc.append(&mut cursor, f));
            }
        }
        let mut cursor = BitCursor::new(&mut buf);
        let mut dec = FlagCodec::new();
        let out: Vec<u32> = flags.iter().map(|_| dec.read(&mut cursor).unwrap()).collect();
        assert_eq!(out, flags);
    }

    #[test]
    fn alternating_flags_roundtrip() {
        let flags: Vec<u32> = (0..40).map(|i| if i % 2 == 0 { 1 } else { 2 }).collect();
        let mut buf = vec![0u8; 1024];
        {
            let mut cursor = BitCursor::new(&mut buf);
            let mut enc = FlagCodec::new();
            for &f in &flags {
                assert!(enc.append(&mut cursor, f));
            }
        }
        let mut cursor = BitCursor::new(&mut buf);
        let mut dec = FlagCodec::new();
        let out: Vec<u32> = flags.iter().map(|_| dec.read(&mut cursor).unwrap()).collect();
        assert_eq!(out, flags);
    }
}
