//! XOR encoding for the value stream (Gorilla-style).
//!
//! The first value is written as its raw 64-bit float bit pattern. For each
//! later value, `X = bits(v) XOR bits(v_prev)`:
//!
//! - `X == 0`: one bit `0` ("same as previous").
//! - else: `1` + a control bit. `0` means "reuse the previous
//!   leading/trailing zero-run window"; `1` means "emit a new
//!   `{leading:5, meaningful_bits:6}` header, then the meaningful bits,
//!   and adopt this window for subsequent reuse".

use crate::bitcursor::BitCursor;
use crate::types::Value;

#[derive(Debug, Clone, Copy, Default)]
pub struct XorCodec {
    prev_bits: u64,
    leading: u32,
    trailing: u32,
    first: bool,
    have_window: bool,
}

impl XorCodec {
    #[must_use]
    pub fn new() -> Self {
        Self { prev_bits: 0, leading: 0, trailing: 0, first: true, have_window: false }
    }

    pub fn append(&mut self, cursor: &mut BitCursor<'_>, value: Value) -> bool {
        let bits = value.to_bits();
        if self.first {
            if !cursor.write_bits(bits, 64) {
                return false;
            }
            self.prev_bits = bits;
            self.first = false;
            return true;
        }

        let x = bits ^ self.prev_bits;
        if x == 0 {
            if !cursor.write_bit(false) {
                return false;
            }
            return true;
        }

        let leading = x.leading_zeros().min(31);
        let trailing = x.trailing_zeros();
        let meaningful = 64 - leading - trailing;

        let reuse = self.have_window && leading >= self.leading && trailing >= self.trailing;
        if reuse {
            let window_meaningful = 64 - self.leading - self.trailing;
            if !cursor.has_bits(2 + window_meaningful) {
                return false;
            }
            cursor.write_bits(0b10, 2);
            let shifted = x >> self.trailing;
            cursor.write_bits(shifted, window_meaningful);
        } else {
            // header: leading(5 bits) + meaningful_bits(6 bits), meaningful in 1..=64
            // encode as (meaningful - 1) to fit 6 bits.
            if !cursor.has_bits(2 + 5 + 6 + meaningful) {
                return false;
            }
            cursor.write_bits(0b11, 2);
            cursor.write_bits(u64::from(leading), 5);
            cursor.write_bits(u64::from(meaningful - 1), 6);
            let shifted = x >> trailing;
            cursor.write_bits(shifted, meaningful);
            self.leading = leading;
            self.trailing = trailing;
            self.have_window = true;
        }
        self.prev_bits = bits;
        true
    }

    pub fn read(&mut self, cursor: &mut BitCursor<'_>) -> Option<Value> {
        if self.first {
            let raw = cursor.read_bits(64)?;
            self.prev_bits = raw;
            self.first = false;
            return Some(Value::from_bits(raw));
        }
        let same = !cursor.read_bit()?;
        if same {
            return Some(Value::from_bits(self.prev_bits));
        }
        let new_header = cursor.read_bit()?;
        let x = if new_header {
            let leading = u32::try_from(cursor.read_bits(5)?).ok()?;
            let meaningful = u32::try_from(cursor.read_bits(6)?).ok()? + 1;
            let trailing = 64 - leading - meaningful;
            let shifted = cursor.read_bits(meaningful)?;
            self.leading = leading;
            self.trailing = trailing;
            self.have_window = true;
            shifted << trailing
        } else {
            let window_meaningful = 64 - self.leading - self.trailing;
            let shifted = cursor.read_bits(window_meaningful)?;
            shifted << self.trailing
        };
        let bits = x ^ self.prev_bits;
        self.prev_bits = bits;
        Some(Value::from_bits(bits))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(values: &[Value]) -> Vec<Value> {
        let mut buf = vec![0u8; 8192];
        {
            let mut cursor = BitCursor::new(&mut buf);
            let mut enc = XorCodec::new();
            for &v in values {
                assert!(enc.append(&mut cursor, v));
            }
        }
        let mut cursor = BitCursor::new(&mut buf);
        let mut dec = XorCodec::new();
        values.iter().map(|_| dec.read(&mut cursor).unwrap()).collect()
    }

    #[test]
    fn constant_values_roundtrip() {
        let values = vec![1.0; 100];
        assert_eq!(roundtrip(&values), values);
    }

    #[test]
    fn varying_values_roundtrip() {
        let values: Vec<Value> =
            (0..300).map(|i| f64::from(i) * 0.01 + (f64::from(i).sin())).collect();
        assert_eq!(roundtrip(&values), values);
    }

    #[test]
    fn mixed_magnitudes_roundtrip() {
        let values = vec![0.0, 1.0, -1.0, 1e10, 1e-10, f64::MAX, f64::MIN, 42.125];
        assert_eq!(roundtrip(&values), values);
    }
}
