//! Byte-log storage for the Olivine replicated log.
//!
//! Two things live here:
//! - [`LogStore`]: the abstract append/read/truncate contract the physical
//!   log writer runs against
//! - [`MemoryLog`]: the chunked in-memory implementation used for testing
//!   and for replicas that keep their log in RAM
//!
//! A production file-backed store implements the same contract in the
//! hosting process; the pipeline never sees past this trait.

mod memory_log;
mod store;

pub use memory_log::{DEFAULT_CHUNK_SIZE, MemoryLog, MemoryLogReadStream};
pub use store::{LogReadStream, LogStore};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LogError {
    /// A read or truncation referenced bytes outside `[head, tail]`.
    #[error("position {position} outside the retained log [{head}, {tail}]")]
    PositionOutOfRange {
        position: u64,
        head: u64,
        tail: u64,
    },

    /// The store has been shut down; new operations fail immediately.
    #[error("log store is closed")]
    Closed,

    /// Backing storage ran out of space or memory.
    #[error("insufficient resources: {0}")]
    InsufficientResources(String),

    /// The write cannot fit under the configured cap.
    #[error("log full: write of {requested} bytes exceeds cap of {cap}")]
    LogFull { requested: u64, cap: u64 },
}
