//! The incremental backup log file.
//!
//! Serializes a contiguous LSN range of logical records with the same
//! `length | payload | length` framing the log itself uses, wrapped in
//! the checksummed container. Reading validates the footer checksum
//! before trusting any property, then exposes the properties and an
//! enumerator over the records block.

use std::path::{Path, PathBuf};

use bytes::{Buf, Bytes, BytesMut};
use olivine_records::{BackupBody, LogRecord};
use olivine_types::{Epoch, Lsn, ReplicaId};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use uuid::Uuid;

use crate::container::{CONTAINER_VERSION, ContainerFooter, ContainerHeader, FOOTER_SIZE, HEADER_SIZE};
use crate::properties::BackupLogFileProperties;
use crate::BackupError;

const MAGIC: [u8; 8] = *b"OLVBKLOG";

/// A serialized incremental log backup on disk.
#[derive(Debug)]
pub struct BackupLogFile {
    path: PathBuf,
    partition_id: Uuid,
    replica_id: ReplicaId,
    properties: BackupLogFileProperties,
}

impl BackupLogFile {
    /// Streams `records` into a new backup file at `path`.
    ///
    /// The indexing epoch/LSN anchor the backup to the index point it
    /// hangs off; `last_backup_record` supplies the range this backup
    /// extends (use [`BackupBody::zero`] for a full backup).
    pub async fn write_async(
        path: &Path,
        partition_id: Uuid,
        replica_id: ReplicaId,
        records: &[std::sync::Arc<LogRecord>],
        indexing_record_epoch: Epoch,
        indexing_record_lsn: Lsn,
        last_backup_record: &BackupBody,
    ) -> Result<Self, BackupError> {
        let mut file = fs::File::create(path).await?;

        let header = ContainerHeader::new(MAGIC, partition_id, replica_id);
        let mut buffer = BytesMut::with_capacity(4096);
        header.serialize_into(&mut buffer);
        file.write_all(&buffer).await?;

        // Records block, streamed record by record.
        let records_offset = HEADER_SIZE as u64;
        let mut records_size = 0u64;
        for record in records {
            debug_assert!(record.kind().is_logical(), "backups carry logical records");
            buffer.clear();
            record.write_frame(&mut buffer);
            records_size += buffer.len() as u64;
            file.write_all(&buffer).await?;
        }

        let properties = BackupLogFileProperties {
            count: records.len() as u32,
            indexing_record_epoch,
            indexing_record_lsn,
            last_backed_up_epoch: last_backup_record.highest_backed_up_epoch,
            last_backed_up_lsn: last_backup_record.highest_backed_up_lsn,
            records_offset,
            records_size,
        };
        let properties_bytes = properties.serialize();
        let properties_offset = records_offset + records_size;
        file.write_all(&properties_bytes).await?;

        let footer = ContainerFooter::over(properties_offset, &properties_bytes);
        buffer.clear();
        footer.serialize_into(&mut buffer);
        file.write_all(&buffer).await?;
        file.sync_all().await?;

        tracing::info!(
            path = %path.display(),
            count = properties.count,
            bytes = records_size,
            last_backed_up_lsn = %properties.last_backed_up_lsn,
            "wrote backup log file"
        );

        Ok(Self {
            path: path.to_path_buf(),
            partition_id,
            replica_id,
            properties,
        })
    }

    /// Opens and validates an existing backup file: footer checksum
    /// first, then the properties, then the header.
    pub async fn read_async(path: &Path) -> Result<Self, BackupError> {
        let mut file = fs::File::open(path).await?;
        let file_len = file.metadata().await?.len();
        if file_len < (HEADER_SIZE + FOOTER_SIZE) as u64 {
            return Err(BackupError::InvalidData(format!(
                "backup file is {file_len} bytes, smaller than header plus footer"
            )));
        }

        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64))).await?;
        let mut footer_bytes = vec![0u8; FOOTER_SIZE];
        file.read_exact(&mut footer_bytes).await?;
        let footer = ContainerFooter::deserialize(&mut Bytes::from(footer_bytes))?;

        if footer.properties_offset + footer.properties_size + FOOTER_SIZE as u64 != file_len {
            return Err(BackupError::InvalidData(format!(
                "footer places properties at {}+{} in a {file_len}-byte file",
                footer.properties_offset, footer.properties_size
            )));
        }

        file.seek(SeekFrom::Start(footer.properties_offset)).await?;
        let mut properties_bytes = vec![0u8; footer.properties_size as usize];
        file.read_exact(&mut properties_bytes).await?;
        footer.verify(&properties_bytes)?;
        let properties = BackupLogFileProperties::deserialize(Bytes::from(properties_bytes))?;

        file.seek(SeekFrom::Start(0)).await?;
        let mut header_bytes = vec![0u8; HEADER_SIZE];
        file.read_exact(&mut header_bytes).await?;
        let header = ContainerHeader::deserialize(&mut Bytes::from(header_bytes), MAGIC)?;

        Ok(Self {
            path: path.to_path_buf(),
            partition_id: header.partition_id,
            replica_id: header.replica_id,
            properties,
        })
    }

    // ------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------

    pub fn count(&self) -> u32 {
        self.properties.count
    }

    pub fn indexing_record_epoch(&self) -> Epoch {
        self.properties.indexing_record_epoch
    }

    pub fn indexing_record_lsn(&self) -> Lsn {
        self.properties.indexing_record_lsn
    }

    pub fn last_backed_up_epoch(&self) -> Epoch {
        self.properties.last_backed_up_epoch
    }

    pub fn last_backed_up_lsn(&self) -> Lsn {
        self.properties.last_backed_up_lsn
    }

    pub fn partition_id(&self) -> Uuid {
        self.partition_id
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    pub fn properties(&self) -> &BackupLogFileProperties {
        &self.properties
    }

    pub fn version(&self) -> u32 {
        CONTAINER_VERSION
    }

    /// Opens an enumerator over the records block.
    pub async fn records(&self) -> Result<BackupLogRecordEnumerator, BackupError> {
        let mut file = fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(self.properties.records_offset))
            .await?;
        let mut block = vec![0u8; self.properties.records_size as usize];
        file.read_exact(&mut block).await?;
        Ok(BackupLogRecordEnumerator {
            block: Bytes::from(block),
            remaining: self.properties.count,
        })
    }
}

/// Async enumerator over a backup's records block, in written order.
#[derive(Debug)]
pub struct BackupLogRecordEnumerator {
    block: Bytes,
    remaining: u32,
}

impl BackupLogRecordEnumerator {
    /// Next record, or `None` once `count` records have been yielded.
    pub async fn next(&mut self) -> Result<Option<LogRecord>, BackupError> {
        if self.remaining == 0 {
            if self.block.has_remaining() {
                return Err(BackupError::InvalidData(format!(
                    "{} bytes of records block remain after the recorded count",
                    self.block.remaining()
                )));
            }
            return Ok(None);
        }
        let record = LogRecord::read_frame(&mut self.block)?;
        self.remaining -= 1;
        Ok(Some(record))
    }
}
