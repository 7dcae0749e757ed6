//! The Olivine log replication pipeline.
//!
//! An external transaction manager produces records into the
//! [`ReplicatedLogManager`], which assigns LSNs, tracks transactions in the
//! [`TransactionMap`], and submits records to the [`PhysicalLogWriter`].
//! The writer batches, flushes to a byte log, and fires ordered flush
//! callbacks; those drive the [`RecordsDispatcher`], which hands applied
//! records to the state provider in barrier groups. The
//! [`LogTruncationManager`] watches flush progress and decides when to
//! index, checkpoint, truncate the log head, or throttle producers. At
//! role changes the copy machinery under [`copy`] negotiates how a
//! catching-up replica is built.
//!
//! Collaborators enter through narrow seams: the byte log
//! ([`olivine_log::LogStore`]), the flush processor ([`FlushProcessor`]),
//! and the state provider ([`StateProvider`]). All are generics, not trait
//! objects; the variant set is closed (test vs production).

pub mod copy;
mod dispatcher;
mod log_manager;
mod transaction_map;
mod truncation;
mod writer;

pub use dispatcher::{DispatchMode, RecordsDispatcher, StateProvider};
pub use log_manager::ReplicatedLogManager;
pub use transaction_map::TransactionMap;
pub use truncation::LogTruncationManager;
pub use writer::{FlushProcessor, LoggedRecords, PhysicalLogWriter};

use thiserror::Error;

/// Pipeline error kinds. Cloneable because a single flush failure fans out
/// to every record of the affected batch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReplicatorError {
    /// The component has been shut down; new operations fail immediately.
    #[error("component closed")]
    Closed,

    /// Cooperative cancellation was observed at a suspension point.
    #[error("operation canceled")]
    Canceled,

    /// The byte log rejected a write or marker.
    #[error("log store failure: {0}")]
    Store(String),

    /// Durable bytes failed structural validation.
    #[error("invalid data: {0}")]
    InvalidData(String),
}

impl From<olivine_log::LogError> for ReplicatorError {
    fn from(err: olivine_log::LogError) -> Self {
        match err {
            olivine_log::LogError::Closed => ReplicatorError::Closed,
            other => ReplicatorError::Store(other.to_string()),
        }
    }
}
