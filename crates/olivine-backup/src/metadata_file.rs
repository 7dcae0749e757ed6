//! The backup metadata file.
//!
//! One per backup folder: records which backup this is, its parent in the
//! incremental chain, and the range it starts from. Same container
//! discipline as the log file; the body is empty — everything lives in
//! the properties block.

use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

use crate::container::{ContainerFooter, ContainerHeader, FOOTER_SIZE, HEADER_SIZE};
use crate::properties::BackupMetadataFileProperties;
use crate::BackupError;

const MAGIC: [u8; 8] = *b"OLVBKMET";

/// Whether a backup captures full state or a log increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BackupOption {
    Full = 1,
    Incremental = 2,
}

impl BackupOption {
    pub(crate) fn from_tag(tag: u8) -> Result<Self, BackupError> {
        Ok(match tag {
            1 => Self::Full,
            2 => Self::Incremental,
            other => {
                return Err(BackupError::InvalidData(format!(
                    "unknown backup option tag {other}"
                )));
            }
        })
    }
}

/// Backup-chain bookkeeping on disk.
#[derive(Debug)]
pub struct BackupMetadataFile {
    path: PathBuf,
    properties: BackupMetadataFileProperties,
}

impl BackupMetadataFile {
    pub async fn write_async(
        path: &Path,
        properties: BackupMetadataFileProperties,
    ) -> Result<Self, BackupError> {
        let mut file = fs::File::create(path).await?;

        let header = ContainerHeader::new(MAGIC, properties.partition_id, properties.replica_id);
        let mut buffer = BytesMut::with_capacity(HEADER_SIZE);
        header.serialize_into(&mut buffer);
        file.write_all(&buffer).await?;

        let properties_bytes = properties.serialize();
        file.write_all(&properties_bytes).await?;

        let footer = ContainerFooter::over(HEADER_SIZE as u64, &properties_bytes);
        buffer.clear();
        footer.serialize_into(&mut buffer);
        file.write_all(&buffer).await?;
        file.sync_all().await?;

        Ok(Self {
            path: path.to_path_buf(),
            properties,
        })
    }

    pub async fn read_async(path: &Path) -> Result<Self, BackupError> {
        let mut file = fs::File::open(path).await?;
        let file_len = file.metadata().await?.len();
        if file_len < (HEADER_SIZE + FOOTER_SIZE) as u64 {
            return Err(BackupError::InvalidData(format!(
                "backup metadata file is {file_len} bytes, smaller than header plus footer"
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
        let properties = BackupMetadataFileProperties::deserialize(Bytes::from(properties_bytes))?;

        file.seek(SeekFrom::Start(0)).await?;
        let mut header_bytes = vec![0u8; HEADER_SIZE];
        file.read_exact(&mut header_bytes).await?;
        ContainerHeader::deserialize(&mut Bytes::from(header_bytes), MAGIC)?;

        Ok(Self {
            path: path.to_path_buf(),
            properties,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn properties(&self) -> &BackupMetadataFileProperties {
        &self.properties
    }
}
