//! In-memory parking lot booking core with write-ahead-log durability.
//!
//! Lots own contiguously numbered spots; users hold at most one active
//! booking at a time. Every mutation is appended to the WAL (group commit)
//! before memory changes, so reopening the engine replays to the exact
//! committed state.

pub mod clock;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod spotnum;
pub mod wal;

pub use engine::{Engine, EngineError};
