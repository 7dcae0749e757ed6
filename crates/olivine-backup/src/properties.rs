//! Named-property blocks for the backup containers.
//!
//! Each property is `name_length(u8) | name(UTF-8) | value(LE)`; values
//! are fixed-width per property, so the set of names pins the block size
//! exactly. The log-file block is always **130** bytes and the metadata
//! block **206** — cheap invariants that catch both encoding drift and
//! misdirected offsets.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use olivine_types::{Epoch, Lsn, ReplicaId};
use uuid::Uuid;

use crate::BackupError;

fn put_name(name: &str, out: &mut BytesMut) {
    debug_assert!(name.len() <= u8::MAX as usize);
    out.put_u8(name.len() as u8);
    out.put_slice(name.as_bytes());
}

fn get_name(src: &mut Bytes) -> Result<String, BackupError> {
    if src.remaining() < 1 {
        return Err(truncated("property name length"));
    }
    let len = src.get_u8() as usize;
    if src.remaining() < len {
        return Err(truncated("property name"));
    }
    let bytes = src.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec())
        .map_err(|_| BackupError::InvalidData("property name is not UTF-8".to_string()))
}

fn put_epoch(epoch: Epoch, out: &mut BytesMut) {
    out.put_i64_le(epoch.data_loss);
    out.put_i64_le(epoch.configuration);
}

fn need(src: &Bytes, bytes: usize, what: &str) -> Result<(), BackupError> {
    if src.remaining() < bytes {
        Err(truncated(what))
    } else {
        Ok(())
    }
}

fn truncated(what: &str) -> BackupError {
    BackupError::InvalidData(format!("properties block truncated reading {what}"))
}

// ============================================================================
// Backup log file properties
// ============================================================================

/// Properties block of a [`crate::BackupLogFile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BackupLogFileProperties {
    /// Number of records in the records block.
    pub count: u32,
    /// Epoch of the index point this backup hangs off.
    pub indexing_record_epoch: Epoch,
    /// LSN of that index point.
    pub indexing_record_lsn: Lsn,
    /// Highest epoch covered by this backup.
    pub last_backed_up_epoch: Epoch,
    /// Highest LSN covered by this backup.
    pub last_backed_up_lsn: Lsn,
    /// Offset and size of the records block within the file.
    pub records_offset: u64,
    pub records_size: u64,
}

impl BackupLogFileProperties {
    /// Exact encoded size of the block.
    pub const ENCODED_SIZE: usize = 130;

    const COUNT: &str = "count";
    const INDEXING_EPOCH: &str = "indexingepoch";
    const INDEXING_LSN: &str = "indexinglsn";
    const BACKUP_EPOCH: &str = "backupepoch";
    const BACKUP_LSN: &str = "backuplsn";
    const RECORDS: &str = "records";

    pub fn serialize(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(Self::ENCODED_SIZE);
        put_name(Self::COUNT, &mut out);
        out.put_u32_le(self.count);
        put_name(Self::INDEXING_EPOCH, &mut out);
        put_epoch(self.indexing_record_epoch, &mut out);
        put_name(Self::INDEXING_LSN, &mut out);
        out.put_i64_le(self.indexing_record_lsn.as_i64());
        put_name(Self::BACKUP_EPOCH, &mut out);
        put_epoch(self.last_backed_up_epoch, &mut out);
        put_name(Self::BACKUP_LSN, &mut out);
        out.put_i64_le(self.last_backed_up_lsn.as_i64());
        put_name(Self::RECORDS, &mut out);
        out.put_u64_le(self.records_offset);
        out.put_u64_le(self.records_size);
        debug_assert_eq!(out.len(), Self::ENCODED_SIZE);
        out.freeze()
    }

    pub fn deserialize(mut src: Bytes) -> Result<Self, BackupError> {
        let mut properties = Self::default();
        while src.has_remaining() {
            let name = get_name(&mut src)?;
            match name.as_str() {
                Self::COUNT => {
                    need(&src, 4, Self::COUNT)?;
                    properties.count = src.get_u32_le();
                }
                Self::INDEXING_EPOCH => {
                    need(&src, 16, Self::INDEXING_EPOCH)?;
                    properties.indexing_record_epoch =
                        Epoch::new(src.get_i64_le(), src.get_i64_le());
                }
                Self::INDEXING_LSN => {
                    need(&src, 8, Self::INDEXING_LSN)?;
                    properties.indexing_record_lsn = Lsn::new(src.get_i64_le());
                }
                Self::BACKUP_EPOCH => {
                    need(&src, 16, Self::BACKUP_EPOCH)?;
                    properties.last_backed_up_epoch =
                        Epoch::new(src.get_i64_le(), src.get_i64_le());
                }
                Self::BACKUP_LSN => {
                    need(&src, 8, Self::BACKUP_LSN)?;
                    properties.last_backed_up_lsn = Lsn::new(src.get_i64_le());
                }
                Self::RECORDS => {
                    need(&src, 16, Self::RECORDS)?;
                    properties.records_offset = src.get_u64_le();
                    properties.records_size = src.get_u64_le();
                }
                unknown => {
                    return Err(BackupError::InvalidData(format!(
                        "unknown backup log property {unknown:?}"
                    )));
                }
            }
        }
        Ok(properties)
    }
}

// ============================================================================
// Backup metadata file properties
// ============================================================================

/// Properties block of a [`crate::BackupMetadataFile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupMetadataFileProperties {
    pub backup_option: crate::BackupOption,
    pub parent_backup_id: Uuid,
    pub backup_id: Uuid,
    pub partition_id: Uuid,
    pub replica_id: ReplicaId,
    pub starting_epoch: Epoch,
    pub starting_lsn: Lsn,
    pub backup_epoch: Epoch,
    pub backup_lsn: Lsn,
}

impl Default for BackupMetadataFileProperties {
    fn default() -> Self {
        Self {
            backup_option: crate::BackupOption::Full,
            parent_backup_id: Uuid::nil(),
            backup_id: Uuid::nil(),
            partition_id: Uuid::nil(),
            replica_id: ReplicaId::INVALID,
            starting_epoch: Epoch::INVALID,
            starting_lsn: Lsn::INVALID,
            backup_epoch: Epoch::INVALID,
            backup_lsn: Lsn::INVALID,
        }
    }
}

impl BackupMetadataFileProperties {
    /// Exact encoded size of the block.
    pub const ENCODED_SIZE: usize = 206;

    const OPTION: &str = "option";
    const PARENT_BACKUP_ID: &str = "parentbackupid";
    const BACKUP_ID: &str = "backupid";
    const PARTITION_ID: &str = "partitionid";
    const REPLICA_ID: &str = "replicaid";
    const STARTING_EPOCH: &str = "startingepoch";
    const STARTING_LSN: &str = "startinglsn";
    const BACKUP_EPOCH: &str = "backupepoch";
    const BACKUP_LSN: &str = "backuplsn";

    pub fn serialize(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(Self::ENCODED_SIZE);
        put_name(Self::OPTION, &mut out);
        out.put_u8(self.backup_option as u8);
        put_name(Self::PARENT_BACKUP_ID, &mut out);
        out.put_slice(self.parent_backup_id.as_bytes());
        put_name(Self::BACKUP_ID, &mut out);
        out.put_slice(self.backup_id.as_bytes());
        put_name(Self::PARTITION_ID, &mut out);
        out.put_slice(self.partition_id.as_bytes());
        put_name(Self::REPLICA_ID, &mut out);
        out.put_i64_le(self.replica_id.as_i64());
        put_name(Self::STARTING_EPOCH, &mut out);
        put_epoch(self.starting_epoch, &mut out);
        put_name(Self::STARTING_LSN, &mut out);
        out.put_i64_le(self.starting_lsn.as_i64());
        put_name(Self::BACKUP_EPOCH, &mut out);
        put_epoch(self.backup_epoch, &mut out);
        put_name(Self::BACKUP_LSN, &mut out);
        out.put_i64_le(self.backup_lsn.as_i64());
        debug_assert_eq!(out.len(), Self::ENCODED_SIZE);
        out.freeze()
    }

    pub fn deserialize(mut src: Bytes) -> Result<Self, BackupError> {
        let mut uuid_bytes = [0u8; 16];
        let mut properties = Self::default();
        while src.has_remaining() {
            let name = get_name(&mut src)?;
            match name.as_str() {
                Self::OPTION => {
                    need(&src, 1, Self::OPTION)?;
                    properties.backup_option = crate::BackupOption::from_tag(src.get_u8())?;
                }
                Self::PARENT_BACKUP_ID => {
                    need(&src, 16, Self::PARENT_BACKUP_ID)?;
                    src.copy_to_slice(&mut uuid_bytes);
                    properties.parent_backup_id = Uuid::from_bytes(uuid_bytes);
                }
                Self::BACKUP_ID => {
                    need(&src, 16, Self::BACKUP_ID)?;
                    src.copy_to_slice(&mut uuid_bytes);
                    properties.backup_id = Uuid::from_bytes(uuid_bytes);
                }
                Self::PARTITION_ID => {
                    need(&src, 16, Self::PARTITION_ID)?;
                    src.copy_to_slice(&mut uuid_bytes);
                    properties.partition_id = Uuid::from_bytes(uuid_bytes);
                }
                Self::REPLICA_ID => {
                    need(&src, 8, Self::REPLICA_ID)?;
                    properties.replica_id = ReplicaId::new(src.get_i64_le());
                }
                Self::STARTING_EPOCH => {
                    need(&src, 16, Self::STARTING_EPOCH)?;
                    properties.starting_epoch = Epoch::new(src.get_i64_le(), src.get_i64_le());
                }
                Self::STARTING_LSN => {
                    need(&src, 8, Self::STARTING_LSN)?;
                    properties.starting_lsn = Lsn::new(src.get_i64_le());
                }
                Self::BACKUP_EPOCH => {
                    need(&src, 16, Self::BACKUP_EPOCH)?;
                    properties.backup_epoch = Epoch::new(src.get_i64_le(), src.get_i64_le());
                }
                Self::BACKUP_LSN => {
                    need(&src, 8, Self::BACKUP_LSN)?;
                    properties.backup_lsn = Lsn::new(src.get_i64_le());
                }
                unknown => {
                    return Err(BackupError::InvalidData(format!(
                        "unknown backup metadata property {unknown:?}"
                    )));
                }
            }
        }
        Ok(properties)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BackupOption;

    #[test]
    fn log_file_properties_encode_to_exactly_130_bytes() {
        let properties = BackupLogFileProperties {
            count: 16,
            indexing_record_epoch: Epoch::new(19, 87),
            indexing_record_lsn: Lsn::new(16),
            last_backed_up_epoch: Epoch::new(20, 88),
            last_backed_up_lsn: Lsn::new(6),
            records_offset: 5,
            records_size: 15,
        };
        let encoded = properties.serialize();
        assert_eq!(encoded.len(), BackupLogFileProperties::ENCODED_SIZE);
        assert_eq!(encoded.len(), 130);

        let decoded = BackupLogFileProperties::deserialize(encoded).unwrap();
        assert_eq!(decoded, properties);
    }

    #[test]
    fn metadata_properties_encode_to_exactly_206_bytes() {
        let properties = BackupMetadataFileProperties {
            backup_option: BackupOption::Full,
            parent_backup_id: Uuid::new_v4(),
            backup_id: Uuid::new_v4(),
            partition_id: Uuid::new_v4(),
            replica_id: ReplicaId::new(16),
            starting_epoch: Epoch::new(19, 87),
            starting_lsn: Lsn::new(8),
            backup_epoch: Epoch::new(20, 88),
            backup_lsn: Lsn::new(128),
        };
        let encoded = properties.serialize();
        assert_eq!(encoded.len(), BackupMetadataFileProperties::ENCODED_SIZE);
        assert_eq!(encoded.len(), 206);

        let decoded = BackupMetadataFileProperties::deserialize(encoded).unwrap();
        assert_eq!(decoded, properties);
    }

    #[test]
    fn truncated_property_value_is_rejected() {
        let properties = BackupLogFileProperties::default();
        let encoded = properties.serialize();
        let cut = encoded.slice(..encoded.len() - 3);
        assert!(BackupLogFileProperties::deserialize(cut).is_err());
    }

    #[test]
    fn unknown_property_is_rejected() {
        let mut out = BytesMut::new();
        put_name("mystery", &mut out);
        out.put_u32_le(7);
        assert!(BackupLogFileProperties::deserialize(out.freeze()).is_err());
    }
}
