//! Copy negotiation framing and the operation streams handed to the
//! replication transport.
//!
//! At build time the target sends its [`CopyContext`] (one framed blob);
//! the source runs the copy-mode decision against it and answers with a
//! [`CopyStream`]: a [`CopyHeader`], then a [`CopyMetadata`], then the log
//! records the target must apply. Live replication uses
//! [`ReplicationStream`], fed by subsequent sequencing. Both streams are
//! lazy, finite, and not restartable; a closed stream yields `None`.

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use olivine_records::{
    CopyContextParameters, LogRecord, OperationData, ProgressVector, RecordError,
};
use olivine_types::{Epoch, Lsn, ReplicaId};
use tokio::sync::mpsc;

// ============================================================================
// CopyHeader
// ============================================================================

/// Which phase of the copy conversation a payload belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CopyStage {
    CopyMetadata = 1,
    CopyState = 2,
    CopyLog = 3,
    CopyDone = 4,
}

impl CopyStage {
    fn from_tag(tag: u8) -> Result<Self, RecordError> {
        Ok(match tag {
            1 => Self::CopyMetadata,
            2 => Self::CopyState,
            3 => Self::CopyLog,
            4 => Self::CopyDone,
            other => {
                return Err(RecordError::InvalidData(format!(
                    "unknown copy stage tag {other}"
                )));
            }
        })
    }
}

/// First payload of a copy stream. Network byte order on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyHeader {
    pub version: u32,
    pub stage: CopyStage,
    pub primary_replica_id: ReplicaId,
}

impl CopyHeader {
    pub const CURRENT_VERSION: u32 = 1;

    pub fn new(stage: CopyStage, primary_replica_id: ReplicaId) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            stage,
            primary_replica_id,
        }
    }

    pub fn serialize(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(13);
        out.put_u32(self.version);
        out.put_u8(self.stage as u8);
        out.put_i64(self.primary_replica_id.as_i64());
        out.freeze()
    }

    pub fn deserialize(mut src: Bytes) -> Result<Self, RecordError> {
        if src.remaining() < 13 {
            return Err(RecordError::Truncated {
                needed: 13,
                available: src.remaining(),
            });
        }
        Ok(Self {
            version: src.get_u32(),
            stage: CopyStage::from_tag(src.get_u8())?,
            primary_replica_id: ReplicaId::new(src.get_i64()),
        })
    }
}

// ============================================================================
// CopyMetadata
// ============================================================================

/// Second payload of a copy stream: everything the target needs to place
/// the incoming records.
#[derive(Debug, Clone, PartialEq)]
pub struct CopyMetadata {
    pub state_metadata_version: u32,
    pub progress_vector: ProgressVector,
    pub starting_epoch: Epoch,
    pub starting_lsn: Lsn,
    pub checkpoint_lsn: Lsn,
    pub upto_lsn: Lsn,
    pub highest_state_provider_copied_lsn: Lsn,
}

impl CopyMetadata {
    pub fn serialize(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(4 + self.progress_vector.serialized_size() + 48);
        out.put_u32_le(self.state_metadata_version);
        self.progress_vector.serialize_into(&mut out);
        out.put_i64_le(self.starting_epoch.data_loss);
        out.put_i64_le(self.starting_epoch.configuration);
        out.put_i64_le(self.starting_lsn.as_i64());
        out.put_i64_le(self.checkpoint_lsn.as_i64());
        out.put_i64_le(self.upto_lsn.as_i64());
        out.put_i64_le(self.highest_state_provider_copied_lsn.as_i64());
        out.freeze()
    }

    pub fn deserialize(mut src: Bytes) -> Result<Self, RecordError> {
        if src.remaining() < 4 {
            return Err(RecordError::Truncated {
                needed: 4,
                available: src.remaining(),
            });
        }
        let state_metadata_version = src.get_u32_le();
        let progress_vector = ProgressVector::deserialize(&mut src)?;
        if src.remaining() < 48 {
            return Err(RecordError::Truncated {
                needed: 48,
                available: src.remaining(),
            });
        }
        Ok(Self {
            state_metadata_version,
            progress_vector,
            starting_epoch: Epoch::new(src.get_i64_le(), src.get_i64_le()),
            starting_lsn: Lsn::new(src.get_i64_le()),
            checkpoint_lsn: Lsn::new(src.get_i64_le()),
            upto_lsn: Lsn::new(src.get_i64_le()),
            highest_state_provider_copied_lsn: Lsn::new(src.get_i64_le()),
        })
    }
}

// ============================================================================
// CopyContext
// ============================================================================

/// The target replica's view of its own log, sent to the copy source so
/// both sides can run the copy-mode decision on identical inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct CopyContext {
    pub replica_id: ReplicaId,
    pub progress_vector: ProgressVector,
    pub log_head_epoch: Epoch,
    pub log_head_lsn: Lsn,
    pub log_tail_lsn: Lsn,
    pub latest_recovered_atomic_redo_lsn: Lsn,
}

impl CopyContext {
    /// Borrows this context as copy-mode parameters.
    pub fn as_parameters(&self) -> CopyContextParameters<'_> {
        CopyContextParameters {
            progress_vector: &self.progress_vector,
            log_head_epoch: self.log_head_epoch,
            log_head_lsn: self.log_head_lsn,
            current_tail_lsn: self.log_tail_lsn,
        }
    }

    pub fn serialize(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(8 + self.progress_vector.serialized_size() + 40);
        out.put_i64_le(self.replica_id.as_i64());
        self.progress_vector.serialize_into(&mut out);
        out.put_i64_le(self.log_head_epoch.data_loss);
        out.put_i64_le(self.log_head_epoch.configuration);
        out.put_i64_le(self.log_head_lsn.as_i64());
        out.put_i64_le(self.log_tail_lsn.as_i64());
        out.put_i64_le(self.latest_recovered_atomic_redo_lsn.as_i64());
        out.freeze()
    }

    pub fn deserialize(mut src: Bytes) -> Result<Self, RecordError> {
        if src.remaining() < 8 {
            return Err(RecordError::Truncated {
                needed: 8,
                available: src.remaining(),
            });
        }
        let replica_id = ReplicaId::new(src.get_i64_le());
        let progress_vector = ProgressVector::deserialize(&mut src)?;
        if src.remaining() < 40 {
            return Err(RecordError::Truncated {
                needed: 40,
                available: src.remaining(),
            });
        }
        Ok(Self {
            replica_id,
            progress_vector,
            log_head_epoch: Epoch::new(src.get_i64_le(), src.get_i64_le()),
            log_head_lsn: Lsn::new(src.get_i64_le()),
            log_tail_lsn: Lsn::new(src.get_i64_le()),
            latest_recovered_atomic_redo_lsn: Lsn::new(src.get_i64_le()),
        })
    }

    /// The single framed payload the target hands the transport.
    pub fn to_operation_data(&self) -> OperationData {
        OperationData::from_buffers(vec![self.serialize()])
    }
}

// ============================================================================
// Streams
// ============================================================================

fn record_to_operation_data(record: &Arc<LogRecord>) -> OperationData {
    let mut out = BytesMut::new();
    record.write_frame(&mut out);
    OperationData::from_buffers(vec![out.freeze()])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CopyStreamStage {
    Header,
    Metadata,
    Records,
    Finished,
}

/// Build-a-replica stream: header, metadata, then the log records the
/// target must apply. Lazy and finite; yields `None` once drained or
/// closed, and cannot be restarted.
pub struct CopyStream {
    primary_replica_id: ReplicaId,
    metadata: CopyMetadata,
    records: std::vec::IntoIter<Arc<LogRecord>>,
    stage: CopyStreamStage,
}

impl CopyStream {
    pub fn new(
        primary_replica_id: ReplicaId,
        metadata: CopyMetadata,
        records: Vec<Arc<LogRecord>>,
    ) -> Self {
        Self {
            primary_replica_id,
            metadata,
            records: records.into_iter(),
            stage: CopyStreamStage::Header,
        }
    }

    pub async fn get_next(&mut self) -> Option<OperationData> {
        match self.stage {
            CopyStreamStage::Header => {
                self.stage = CopyStreamStage::Metadata;
                let header = CopyHeader::new(CopyStage::CopyMetadata, self.primary_replica_id);
                Some(OperationData::from_buffers(vec![header.serialize()]))
            }
            CopyStreamStage::Metadata => {
                self.stage = CopyStreamStage::Records;
                Some(OperationData::from_buffers(vec![self.metadata.serialize()]))
            }
            CopyStreamStage::Records => match self.records.next() {
                Some(record) => Some(record_to_operation_data(&record)),
                None => {
                    self.stage = CopyStreamStage::Finished;
                    None
                }
            },
            CopyStreamStage::Finished => None,
        }
    }

    pub fn close(&mut self) {
        self.stage = CopyStreamStage::Finished;
    }
}

/// Live replication stream fed by ongoing sequencing. The feeding side
/// holds a [`ReplicationFeed`]; dropping it (or calling
/// [`ReplicationFeed::finish`]) ends the stream.
pub struct ReplicationStream {
    receiver: mpsc::UnboundedReceiver<Arc<LogRecord>>,
    closed: bool,
}

/// Producer handle for a [`ReplicationStream`].
#[derive(Clone)]
pub struct ReplicationFeed {
    sender: mpsc::UnboundedSender<Arc<LogRecord>>,
}

impl ReplicationFeed {
    pub fn publish(&self, record: Arc<LogRecord>) {
        let _ = self.sender.send(record);
    }

    pub fn finish(self) {}
}

impl ReplicationStream {
    pub fn new() -> (ReplicationFeed, Self) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            ReplicationFeed { sender },
            Self {
                receiver,
                closed: false,
            },
        )
    }

    /// Next replicated operation, or `None` once the feed has finished or
    /// the stream was closed.
    pub async fn get_next(&mut self) -> Option<OperationData> {
        if self.closed {
            return None;
        }
        match self.receiver.recv().await {
            Some(record) => Some(record_to_operation_data(&record)),
            None => {
                self.closed = true;
                None
            }
        }
    }

    pub fn close(&mut self) {
        self.closed = true;
        self.receiver.close();
    }
}

#[cfg(test)]
mod tests {
    use olivine_records::{
        BarrierBody, CopyMode, ProgressVectorEntry, RecordBody,
    };

    use super::*;

    fn vector(entries: &[(i64, i64, i64, i64)]) -> ProgressVector {
        let mut vector = ProgressVector::new();
        for &(dl, cfg, primary, lsn) in entries {
            vector.append(ProgressVectorEntry::new(
                Epoch::new(dl, cfg),
                Lsn::new(lsn),
                ReplicaId::new(primary),
                0,
            ));
        }
        vector
    }

    fn metadata() -> CopyMetadata {
        CopyMetadata {
            state_metadata_version: 1,
            progress_vector: vector(&[(0, 0, 0, 0), (3, 2, 12345, 5)]),
            starting_epoch: Epoch::new(3, 2),
            starting_lsn: Lsn::new(5),
            checkpoint_lsn: Lsn::new(6),
            upto_lsn: Lsn::new(7),
            highest_state_provider_copied_lsn: Lsn::new(8),
        }
    }

    #[test]
    fn header_roundtrips_in_network_byte_order() {
        let header = CopyHeader::new(CopyStage::CopyLog, ReplicaId::new(0x0102_0304));
        let bytes = header.serialize();
        assert_eq!(bytes.len(), 13);
        // Version is big-endian on the wire.
        assert_eq!(&bytes[..4], &[0, 0, 0, 1]);
        assert_eq!(bytes[4], CopyStage::CopyLog as u8);

        let decoded = CopyHeader::deserialize(bytes).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn header_with_unknown_stage_is_rejected() {
        let mut bytes = BytesMut::new();
        bytes.put_u32(1);
        bytes.put_u8(99);
        bytes.put_i64(1);
        assert!(CopyHeader::deserialize(bytes.freeze()).is_err());
    }

    #[test]
    fn metadata_roundtrips() {
        let original = metadata();
        let decoded = CopyMetadata::deserialize(original.serialize()).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(
            decoded.progress_vector.last_entry().unwrap().primary_replica_id,
            ReplicaId::new(12345)
        );
    }

    #[test]
    fn context_roundtrips_and_feeds_copy_mode() {
        let context = CopyContext {
            replica_id: ReplicaId::new(1234),
            progress_vector: vector(&[(0, 0, 0, 0), (1, 1, 1, 700)]),
            log_head_epoch: Epoch::ZERO,
            log_head_lsn: Lsn::ZERO,
            log_tail_lsn: Lsn::new(730),
            latest_recovered_atomic_redo_lsn: Lsn::new(8),
        };
        let decoded = CopyContext::deserialize(context.serialize()).unwrap();
        assert_eq!(decoded, context);

        // The decoded context plugs straight into the negotiation.
        let source_vector = vector(&[(0, 0, 0, 0), (1, 1, 1, 700), (1, 2, 2, 720)]);
        let source = CopyContextParameters {
            progress_vector: &source_vector,
            log_head_epoch: Epoch::ZERO,
            log_head_lsn: Lsn::ZERO,
            current_tail_lsn: Lsn::new(740),
        };
        let result = ProgressVector::find_copy_mode(
            &source,
            &decoded.as_parameters(),
            Lsn::INVALID,
        );
        assert_eq!(
            result.mode,
            CopyMode::Partial {
                false_progress: true
            }
        );
    }

    #[tokio::test]
    async fn copy_stream_yields_header_metadata_records_then_none() {
        let record = Arc::new(LogRecord::with_lsn(
            RecordBody::Barrier(BarrierBody {
                last_stable_lsn: Lsn::ZERO,
            }),
            Lsn::ONE,
        ));
        let mut stream = CopyStream::new(ReplicaId::new(9), metadata(), vec![record.clone()]);

        let header_payload = stream.get_next().await.unwrap();
        let header = CopyHeader::deserialize(header_payload.buffers()[0].clone()).unwrap();
        assert_eq!(header.stage, CopyStage::CopyMetadata);
        assert_eq!(header.primary_replica_id, ReplicaId::new(9));

        let metadata_payload = stream.get_next().await.unwrap();
        let decoded = CopyMetadata::deserialize(metadata_payload.buffers()[0].clone()).unwrap();
        assert_eq!(decoded, metadata());

        let record_payload = stream.get_next().await.unwrap();
        let mut frame = record_payload.buffers()[0].clone();
        let decoded_record = LogRecord::read_frame(&mut frame).unwrap();
        assert_eq!(decoded_record.lsn(), Lsn::ONE);

        // Finite, and stays finished.
        assert!(stream.get_next().await.is_none());
        assert!(stream.get_next().await.is_none());
    }

    #[tokio::test]
    async fn closed_copy_stream_yields_none() {
        let mut stream = CopyStream::new(ReplicaId::new(9), metadata(), Vec::new());
        stream.close();
        assert!(stream.get_next().await.is_none());
    }

    #[tokio::test]
    async fn replication_stream_relays_until_feed_finishes() {
        let (feed, mut stream) = ReplicationStream::new();
        for lsn in 1..=3 {
            feed.publish(Arc::new(LogRecord::with_lsn(
                RecordBody::Barrier(BarrierBody {
                    last_stable_lsn: Lsn::new(lsn - 1),
                }),
                Lsn::new(lsn),
            )));
        }
        feed.finish();

        for lsn in 1..=3 {
            let payload = stream.get_next().await.unwrap();
            let mut frame = payload.buffers()[0].clone();
            let record = LogRecord::read_frame(&mut frame).unwrap();
            assert_eq!(record.lsn(), Lsn::new(lsn));
        }
        assert!(stream.get_next().await.is_none());
        assert!(stream.get_next().await.is_none());
    }

    #[tokio::test]
    async fn closed_replication_stream_yields_none() {
        let (feed, mut stream) = ReplicationStream::new();
        feed.publish(Arc::new(LogRecord::with_lsn(
            RecordBody::Barrier(BarrierBody {
                last_stable_lsn: Lsn::ZERO,
            }),
            Lsn::ONE,
        )));
        stream.close();
        assert!(stream.get_next().await.is_none());
    }
}
