//! IPC boundary: raw bytes in, typed envelopes to the engine.

mod handler;

pub use handler::*;
