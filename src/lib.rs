#![forbid(unsafe_code)]

//! Embedded time-series storage engine: a chunked columnar codec, a
//! WAL/Page storage pipeline, and a fixed-step grid mode, all behind one
//! [`engine::Engine`] facade.

pub mod bitcursor;
pub mod bystep;
pub mod chunk;
pub mod cli;
pub mod codec;
pub mod config;
pub mod dropper;
pub mod engine;
pub mod errors;
pub mod lock;
pub mod logger;
pub mod manifest;
pub mod mem;
pub mod page;
pub mod subscribe;
pub mod threadpool;
pub mod types;
pub mod wal;

pub use config::EngineConfig;
pub use engine::{AppendOutcome, Engine};
pub use errors::{EngineError, Result};
pub use types::{Flag, Id, Measurement, StepKind, Strategy, Time, Value, NO_DATA};
