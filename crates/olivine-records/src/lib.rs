//! Log record model for the Olivine replicated log.
//!
//! This crate defines everything that goes *into* the log:
//! - [`OperationData`]: the serialization primitive (an ordered sequence of
//!   byte buffers, zero-length buffers included)
//! - [`LogRecord`] and its variants: logical records visible to state
//!   providers and physical records used for internal bookkeeping
//! - [`ProgressVector`]: the epoch history a replica has observed, with the
//!   shared-point and copy-mode algorithms used during catch-up negotiation
//!
//! Records are framed `length | payload | length` so the log can be
//! scanned in either direction; the same framing is used on disk and on
//! the wire.

mod operation_data;
mod progress_vector;
mod record;

pub use operation_data::OperationData;
pub use progress_vector::{
    CopyContextParameters, CopyMode, CopyModeResult, FullCopyReason, ProgressVector,
    ProgressVectorEntry, SharedProgressVectorEntry, SharedVectorStatus,
};
pub use record::{
    AtomicOperationBody, AtomicRedoOperationBody, BackupBody, BarrierBody, BeginCheckpointBody,
    BeginTransactionBody, CompleteCheckpointBody, EndCheckpointBody, EndTransactionBody,
    FRAME_OVERHEAD, IndexingBody, InformationBody, InformationKind, LogRecord, OperationBody,
    RecordBody, RecordKind, TruncateHeadBody, TruncateTailBody, UpdateEpochBody,
};

use thiserror::Error;

/// Errors surfaced while encoding or decoding records.
///
/// Decode failures during recovery are fatal: a replica must not continue
/// with a partially-valid log.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("durable bytes failed structural validation: {0}")]
    InvalidData(String),

    #[error("record frame truncated: needed {needed} bytes, had {available}")]
    Truncated { needed: usize, available: usize },

    #[error("unknown record kind tag {0}")]
    UnknownKind(u32),
}
