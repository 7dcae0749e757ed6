//! Shared header/footer plumbing for the backup containers.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use olivine_types::ReplicaId;
use uuid::Uuid;

use crate::BackupError;

pub(crate) const HEADER_SIZE: usize = 8 + 4 + 16 + 8;
pub(crate) const FOOTER_SIZE: usize = 8 + 8 + 4;
pub(crate) const CONTAINER_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ContainerHeader {
    pub magic: [u8; 8],
    pub version: u32,
    pub partition_id: Uuid,
    pub replica_id: ReplicaId,
}

impl ContainerHeader {
    pub fn new(magic: [u8; 8], partition_id: Uuid, replica_id: ReplicaId) -> Self {
        Self {
            magic,
            version: CONTAINER_VERSION,
            partition_id,
            replica_id,
        }
    }

    pub fn serialize_into(&self, out: &mut BytesMut) {
        out.put_slice(&self.magic);
        out.put_u32_le(self.version);
        out.put_slice(self.partition_id.as_bytes());
        out.put_i64_le(self.replica_id.as_i64());
    }

    pub fn deserialize(src: &mut Bytes, expected_magic: [u8; 8]) -> Result<Self, BackupError> {
        if src.remaining() < HEADER_SIZE {
            return Err(BackupError::InvalidData(format!(
                "container header truncated: {} bytes",
                src.remaining()
            )));
        }
        let mut magic = [0u8; 8];
        src.copy_to_slice(&mut magic);
        if magic != expected_magic {
            return Err(BackupError::InvalidData(format!(
                "bad magic {magic:02x?}, expected {expected_magic:02x?}"
            )));
        }
        let version = src.get_u32_le();
        if version != CONTAINER_VERSION {
            return Err(BackupError::InvalidData(format!(
                "unsupported container version {version}"
            )));
        }
        let mut partition = [0u8; 16];
        src.copy_to_slice(&mut partition);
        Ok(Self {
            magic,
            version,
            partition_id: Uuid::from_bytes(partition),
            replica_id: ReplicaId::new(src.get_i64_le()),
        })
    }
}

/// Trailer locating and checksumming the properties block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ContainerFooter {
    pub properties_offset: u64,
    pub properties_size: u64,
    pub properties_crc: u32,
}

impl ContainerFooter {
    pub fn over(properties_offset: u64, properties: &[u8]) -> Self {
        Self {
            properties_offset,
            properties_size: properties.len() as u64,
            properties_crc: crc32fast::hash(properties),
        }
    }

    pub fn serialize_into(&self, out: &mut BytesMut) {
        out.put_u64_le(self.properties_offset);
        out.put_u64_le(self.properties_size);
        out.put_u32_le(self.properties_crc);
    }

    pub fn deserialize(src: &mut Bytes) -> Result<Self, BackupError> {
        if src.remaining() < FOOTER_SIZE {
            return Err(BackupError::InvalidData(format!(
                "container footer truncated: {} bytes",
                src.remaining()
            )));
        }
        Ok(Self {
            properties_offset: src.get_u64_le(),
            properties_size: src.get_u64_le(),
            properties_crc: src.get_u32_le(),
        })
    }

    /// Confirms the properties bytes match the recorded checksum.
    pub fn verify(&self, properties: &[u8]) -> Result<(), BackupError> {
        let actual = crc32fast::hash(properties);
        if actual != self.properties_crc {
            return Err(BackupError::InvalidData(format!(
                "properties checksum mismatch: stored {:#010x}, computed {actual:#010x}",
                self.properties_crc
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrips() {
        let header = ContainerHeader::new(*b"OLVBKLOG", Uuid::new_v4(), ReplicaId::new(16));
        let mut out = BytesMut::new();
        header.serialize_into(&mut out);
        assert_eq!(out.len(), HEADER_SIZE);

        let decoded = ContainerHeader::deserialize(&mut out.freeze(), *b"OLVBKLOG").unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let header = ContainerHeader::new(*b"OLVBKLOG", Uuid::new_v4(), ReplicaId::new(16));
        let mut out = BytesMut::new();
        header.serialize_into(&mut out);
        assert!(ContainerHeader::deserialize(&mut out.freeze(), *b"OLVBKMET").is_err());
    }

    #[test]
    fn footer_detects_bit_rot() {
        let properties = b"some property bytes";
        let footer = ContainerFooter::over(36, properties);
        footer.verify(properties).unwrap();

        let mut rotten = properties.to_vec();
        rotten[3] ^= 0x01;
        assert!(footer.verify(&rotten).is_err());
    }
}
