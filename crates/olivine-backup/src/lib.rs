//! Backup containers for the Olivine replicated log.
//!
//! Two self-describing file formats:
//! - [`BackupLogFile`]: a contiguous LSN range of logical records for
//!   off-box incremental backup
//! - [`BackupMetadataFile`]: the chain bookkeeping of a backup folder
//!   (which backup this is, its parent, where it starts)
//!
//! Both share one container discipline:
//!
//! ```text
//! [Header: magic(8) | version(4) | partition_id(16) | replica_id(8)]
//! [Body]
//! [Properties block: named properties]
//! [Footer: properties_offset(u64) | properties_size(u64) | crc32(4)]
//! ```
//!
//! The footer checksum covers the properties block, so truncation and
//! bit-rot are detected before any property is trusted. The container is
//! checksummed but not cryptographically signed.

mod container;
mod log_file;
mod metadata_file;
mod properties;

pub use log_file::{BackupLogFile, BackupLogRecordEnumerator};
pub use metadata_file::{BackupMetadataFile, BackupOption};
pub use properties::{BackupLogFileProperties, BackupMetadataFileProperties};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("io failure on backup file: {0}")]
    Io(#[from] std::io::Error),

    #[error("backup file failed validation: {0}")]
    InvalidData(String),

    #[error("backup record block is corrupt: {0}")]
    Record(#[from] olivine_records::RecordError),
}
