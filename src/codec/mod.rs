//! The three codecs that share a [`BitCursor`](crate::bitcursor::BitCursor)
//! inside a chunk: delta-of-delta for timestamps, XOR for values, and
//! run-length-with-flag-bit for the sideband flag column.

mod delta;
mod flag;
mod xor;

pub use delta::DeltaCodec;
pub use flag::FlagCodec;
pub use xor::XorCodec;
