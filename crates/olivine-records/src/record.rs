//! Log record variants and their serialized form.
//!
//! Every durable event in the replicated log is a [`LogRecord`]: a common
//! header plus a variant body. Logical records are visible to state
//! providers; physical records are internal bookkeeping for recovery,
//! checkpointing, and truncation.
//!
//! # Frame format
//!
//! ```text
//! [length:u32][payload][length:u32]
//! payload = kind:u32 | lsn:i64 | psn:i64 | prev_physical:u64
//!           | linked_physical:u64 (physical kinds only)
//!           | body
//! ```
//!
//! The length appears on both ends so the log is scannable in either
//! direction. All integers little-endian. The same frame is used on disk
//! and on the wire.
//!
//! # Header mutability
//!
//! Producers allocate records before the pipeline sequences them: `lsn`
//! is stamped by the replicated log manager, `psn` by the physical log
//! writer at insert, and `record_position`/`record_length` at flush. The
//! header fields are atomics so a record can be shared (`Arc`) between
//! the producer, the transaction map, and the dispatcher while those
//! assignments happen.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use olivine_types::{
    Epoch, INVALID_RECORD_POSITION, Lsn, Psn, RecordPosition, ReplicaId, TransactionId,
};
use uuid::Uuid;

use crate::progress_vector::ProgressVector;
use crate::{OperationData, RecordError};

/// Bytes added around the payload by the double length frame.
pub const FRAME_OVERHEAD: usize = 8;

// ============================================================================
// Record kinds
// ============================================================================

/// Tag identifying the variant of a serialized record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RecordKind {
    BeginTransaction = 1,
    Operation = 2,
    EndTransaction = 3,
    AtomicOperation = 4,
    AtomicRedoOperation = 5,
    Barrier = 6,
    UpdateEpoch = 7,
    Backup = 8,
    Indexing = 9,
    BeginCheckpoint = 10,
    EndCheckpoint = 11,
    CompleteCheckpoint = 12,
    TruncateHead = 13,
    TruncateTail = 14,
    Information = 15,
}

impl RecordKind {
    pub fn from_tag(tag: u32) -> Result<Self, RecordError> {
        Ok(match tag {
            1 => Self::BeginTransaction,
            2 => Self::Operation,
            3 => Self::EndTransaction,
            4 => Self::AtomicOperation,
            5 => Self::AtomicRedoOperation,
            6 => Self::Barrier,
            7 => Self::UpdateEpoch,
            8 => Self::Backup,
            9 => Self::Indexing,
            10 => Self::BeginCheckpoint,
            11 => Self::EndCheckpoint,
            12 => Self::CompleteCheckpoint,
            13 => Self::TruncateHead,
            14 => Self::TruncateTail,
            15 => Self::Information,
            other => return Err(RecordError::UnknownKind(other)),
        })
    }

    /// Physical records chain through `linked_physical` and are invisible
    /// to state providers.
    pub fn is_physical(self) -> bool {
        matches!(
            self,
            Self::Indexing
                | Self::BeginCheckpoint
                | Self::EndCheckpoint
                | Self::CompleteCheckpoint
                | Self::TruncateHead
                | Self::TruncateTail
                | Self::Information
        )
    }

    pub fn is_logical(self) -> bool {
        !self.is_physical()
    }

    pub fn is_transactional(self) -> bool {
        matches!(
            self,
            Self::BeginTransaction
                | Self::Operation
                | Self::EndTransaction
                | Self::AtomicOperation
                | Self::AtomicRedoOperation
        )
    }
}

// ============================================================================
// Variant bodies
// ============================================================================

/// Starts a transaction; may carry the first operation's data triple.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BeginTransactionBody {
    pub transaction_id: TransactionId,
    /// True when the transaction is atomic with exactly this one op.
    pub is_single_operation: bool,
    pub metadata: Option<OperationData>,
    pub undo: Option<OperationData>,
    pub redo: Option<OperationData>,
}

/// Additional operation in an open transaction.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OperationBody {
    pub transaction_id: TransactionId,
    pub metadata: Option<OperationData>,
    pub undo: Option<OperationData>,
    pub redo: Option<OperationData>,
}

/// Commit or abort marker.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EndTransactionBody {
    pub transaction_id: TransactionId,
    pub is_committed: bool,
}

/// Self-contained single-record transaction.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AtomicOperationBody {
    pub transaction_id: TransactionId,
    pub metadata: Option<OperationData>,
    pub undo: Option<OperationData>,
    pub redo: Option<OperationData>,
}

/// Self-contained redo-only transaction. Cannot be undone, which matters
/// during false-progress resolution.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AtomicRedoOperationBody {
    pub transaction_id: TransactionId,
    pub metadata: Option<OperationData>,
    pub redo: Option<OperationData>,
}

/// Stability marker partitioning the log into dispatch groups.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BarrierBody {
    /// LSN of the previous barrier.
    pub last_stable_lsn: Lsn,
}

/// Records an epoch transition.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateEpochBody {
    pub epoch: Epoch,
    pub primary_replica_id: ReplicaId,
    /// Wall-clock seconds when the transition was observed; diagnostic only.
    pub timestamp_secs: i64,
}

/// Marks a completed backup point.
#[derive(Debug, Clone, PartialEq)]
pub struct BackupBody {
    pub backup_id: Uuid,
    pub highest_backed_up_epoch: Epoch,
    pub highest_backed_up_lsn: Lsn,
    pub record_count: u32,
    pub size_kb: u32,
}

impl BackupBody {
    /// The sentinel carried by checkpoints taken before any backup.
    pub fn zero() -> Self {
        Self {
            backup_id: Uuid::nil(),
            highest_backed_up_epoch: Epoch::INVALID,
            highest_backed_up_lsn: Lsn::INVALID,
            record_count: 0,
            size_kb: 0,
        }
    }
}

/// Index point enabling O(1) head lookup from a position.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexingBody {
    pub current_epoch: Epoch,
}

/// First phase of a checkpoint: captures the state needed to replay from
/// this point.
#[derive(Debug, Clone, PartialEq)]
pub struct BeginCheckpointBody {
    /// LSN of the earliest transaction still pending at checkpoint start,
    /// or `INVALID` when none were pending.
    pub earliest_pending_lsn: Lsn,
    pub epoch: Epoch,
    pub progress_vector: ProgressVector,
    /// The last completed backup, or [`BackupBody::zero`].
    pub last_backup: BackupBody,
}

/// Second phase: the checkpoint data is durable.
#[derive(Debug, Clone, PartialEq)]
pub struct EndCheckpointBody {
    pub begin_checkpoint_lsn: Lsn,
    pub begin_checkpoint_position: RecordPosition,
    pub head_lsn: Lsn,
    pub head_position: RecordPosition,
}

/// Third phase: the checkpoint fully applies; the log before it is
/// reclaimable.
#[derive(Debug, Clone, PartialEq)]
pub struct CompleteCheckpointBody {
    pub head_lsn: Lsn,
    pub head_position: RecordPosition,
}

/// Durable marker of a log-head advancement. References the indexing
/// record that becomes the new head; that record must already be flushed.
#[derive(Debug, Clone, PartialEq)]
pub struct TruncateHeadBody {
    pub head_lsn: Lsn,
    pub head_position: RecordPosition,
    pub head_epoch: Epoch,
}

/// Durable marker of a log-tail rewind during false-progress resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct TruncateTailBody {
    pub new_tail_lsn: Lsn,
}

/// Free-form event marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum InformationKind {
    Recovered = 1,
    CopyFinished = 2,
    ReplicationFinished = 3,
    Closed = 4,
    PrimarySwap = 5,
    RestoredFromBackup = 6,
    RemovingState = 7,
}

impl InformationKind {
    fn from_tag(tag: u32) -> Result<Self, RecordError> {
        Ok(match tag {
            1 => Self::Recovered,
            2 => Self::CopyFinished,
            3 => Self::ReplicationFinished,
            4 => Self::Closed,
            5 => Self::PrimarySwap,
            6 => Self::RestoredFromBackup,
            7 => Self::RemovingState,
            other => {
                return Err(RecordError::InvalidData(format!(
                    "unknown information event tag {other}"
                )));
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InformationBody {
    pub event: InformationKind,
}

/// The variant payload of a record.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordBody {
    BeginTransaction(BeginTransactionBody),
    Operation(OperationBody),
    EndTransaction(EndTransactionBody),
    AtomicOperation(AtomicOperationBody),
    AtomicRedoOperation(AtomicRedoOperationBody),
    Barrier(BarrierBody),
    UpdateEpoch(UpdateEpochBody),
    Backup(BackupBody),
    Indexing(IndexingBody),
    BeginCheckpoint(BeginCheckpointBody),
    EndCheckpoint(EndCheckpointBody),
    CompleteCheckpoint(CompleteCheckpointBody),
    TruncateHead(TruncateHeadBody),
    TruncateTail(TruncateTailBody),
    Information(InformationBody),
}

impl RecordBody {
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::BeginTransaction(_) => RecordKind::BeginTransaction,
            Self::Operation(_) => RecordKind::Operation,
            Self::EndTransaction(_) => RecordKind::EndTransaction,
            Self::AtomicOperation(_) => RecordKind::AtomicOperation,
            Self::AtomicRedoOperation(_) => RecordKind::AtomicRedoOperation,
            Self::Barrier(_) => RecordKind::Barrier,
            Self::UpdateEpoch(_) => RecordKind::UpdateEpoch,
            Self::Backup(_) => RecordKind::Backup,
            Self::Indexing(_) => RecordKind::Indexing,
            Self::BeginCheckpoint(_) => RecordKind::BeginCheckpoint,
            Self::EndCheckpoint(_) => RecordKind::EndCheckpoint,
            Self::CompleteCheckpoint(_) => RecordKind::CompleteCheckpoint,
            Self::TruncateHead(_) => RecordKind::TruncateHead,
            Self::TruncateTail(_) => RecordKind::TruncateTail,
            Self::Information(_) => RecordKind::Information,
        }
    }
}

// ============================================================================
// LogRecord
// ============================================================================

/// A single record in the replicated log.
pub struct LogRecord {
    kind: RecordKind,
    lsn: AtomicI64,
    psn: AtomicI64,
    position: AtomicU64,
    record_length: AtomicU32,
    prev_physical: AtomicU64,
    /// Secondary chain through the physical records; unused (INVALID) on
    /// logical records.
    linked_physical: AtomicU64,
    body: RecordBody,
}

impl LogRecord {
    pub fn new(body: RecordBody) -> Self {
        Self {
            kind: body.kind(),
            lsn: AtomicI64::new(Lsn::INVALID.as_i64()),
            psn: AtomicI64::new(Psn::INVALID.as_i64()),
            position: AtomicU64::new(INVALID_RECORD_POSITION),
            record_length: AtomicU32::new(0),
            prev_physical: AtomicU64::new(INVALID_RECORD_POSITION),
            linked_physical: AtomicU64::new(INVALID_RECORD_POSITION),
            body,
        }
    }

    pub fn with_lsn(body: RecordBody, lsn: Lsn) -> Self {
        let record = Self::new(body);
        record.set_lsn(lsn);
        record
    }

    // ------------------------------------------------------------------
    // Header accessors
    // ------------------------------------------------------------------

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    pub fn body(&self) -> &RecordBody {
        &self.body
    }

    pub fn lsn(&self) -> Lsn {
        Lsn::new(self.lsn.load(Ordering::Acquire))
    }

    pub fn set_lsn(&self, lsn: Lsn) {
        self.lsn.store(lsn.as_i64(), Ordering::Release);
    }

    pub fn psn(&self) -> Psn {
        Psn::new(self.psn.load(Ordering::Acquire))
    }

    pub fn set_psn(&self, psn: Psn) {
        self.psn.store(psn.as_i64(), Ordering::Release);
    }

    pub fn record_position(&self) -> RecordPosition {
        self.position.load(Ordering::Acquire)
    }

    pub fn set_record_position(&self, position: RecordPosition) {
        self.position.store(position, Ordering::Release);
    }

    pub fn is_flushed(&self) -> bool {
        self.record_position() != INVALID_RECORD_POSITION
    }

    /// Payload length in bytes, excluding the two frame lengths. Stable
    /// once the record is flushed.
    pub fn record_length(&self) -> u32 {
        self.record_length.load(Ordering::Acquire)
    }

    pub fn prev_physical_position(&self) -> RecordPosition {
        self.prev_physical.load(Ordering::Acquire)
    }

    pub fn set_prev_physical_position(&self, position: RecordPosition) {
        self.prev_physical.store(position, Ordering::Release);
    }

    pub fn linked_physical_position(&self) -> RecordPosition {
        self.linked_physical.load(Ordering::Acquire)
    }

    pub fn set_linked_physical_position(&self, position: RecordPosition) {
        debug_assert!(self.kind.is_physical());
        self.linked_physical.store(position, Ordering::Release);
    }

    pub fn transaction_id(&self) -> Option<TransactionId> {
        match &self.body {
            RecordBody::BeginTransaction(b) => Some(b.transaction_id),
            RecordBody::Operation(b) => Some(b.transaction_id),
            RecordBody::EndTransaction(b) => Some(b.transaction_id),
            RecordBody::AtomicOperation(b) => Some(b.transaction_id),
            RecordBody::AtomicRedoOperation(b) => Some(b.transaction_id),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Serialization
    // ------------------------------------------------------------------

    /// Exact payload size (without the frame lengths).
    pub fn serialized_size(&self) -> usize {
        let header = 4 + 8 + 8 + 8; // kind + lsn + psn + prev_physical
        let linked = if self.kind.is_physical() { 8 } else { 0 };
        header + linked + body_size(&self.body)
    }

    /// Total bytes this record occupies in the log.
    pub fn size_on_disk(&self) -> usize {
        self.serialized_size() + FRAME_OVERHEAD
    }

    /// Writes `length | payload | length` and records the payload length
    /// in the header.
    pub fn write_frame(&self, out: &mut BytesMut) {
        let payload_len = self.serialized_size() as u32;
        self.record_length.store(payload_len, Ordering::Release);

        out.reserve(payload_len as usize + FRAME_OVERHEAD);
        out.put_u32_le(payload_len);
        self.write_payload(out);
        out.put_u32_le(payload_len);
    }

    fn write_payload(&self, out: &mut BytesMut) {
        out.put_u32_le(self.kind as u32);
        out.put_i64_le(self.lsn().as_i64());
        out.put_i64_le(self.psn().as_i64());
        out.put_u64_le(self.prev_physical_position());
        if self.kind.is_physical() {
            out.put_u64_le(self.linked_physical_position());
        }
        write_body(&self.body, out);
    }

    /// Reads one framed record. Consumes exactly one frame from `src`.
    pub fn read_frame(src: &mut Bytes) -> Result<Self, RecordError> {
        if src.remaining() < 4 {
            return Err(RecordError::Truncated {
                needed: 4,
                available: src.remaining(),
            });
        }
        let payload_len = src.get_u32_le() as usize;
        if src.remaining() < payload_len + 4 {
            return Err(RecordError::Truncated {
                needed: payload_len + 4,
                available: src.remaining(),
            });
        }
        let mut payload = src.copy_to_bytes(payload_len);
        let trailing = src.get_u32_le() as usize;
        if trailing != payload_len {
            return Err(RecordError::InvalidData(format!(
                "frame lengths disagree: leading {payload_len}, trailing {trailing}"
            )));
        }

        let record = Self::read_payload(&mut payload)?;
        if payload.has_remaining() {
            return Err(RecordError::InvalidData(format!(
                "{} trailing bytes after record body",
                payload.remaining()
            )));
        }
        record
            .record_length
            .store(payload_len as u32, Ordering::Release);
        Ok(record)
    }

    fn read_payload(src: &mut Bytes) -> Result<Self, RecordError> {
        if src.remaining() < 28 {
            return Err(RecordError::Truncated {
                needed: 28,
                available: src.remaining(),
            });
        }
        let kind = RecordKind::from_tag(src.get_u32_le())?;
        let lsn = src.get_i64_le();
        let psn = src.get_i64_le();
        let prev_physical = src.get_u64_le();
        let linked_physical = if kind.is_physical() {
            if src.remaining() < 8 {
                return Err(RecordError::Truncated {
                    needed: 8,
                    available: src.remaining(),
                });
            }
            src.get_u64_le()
        } else {
            INVALID_RECORD_POSITION
        };

        let body = read_body(kind, src)?;

        let record = Self::new(body);
        record.lsn.store(lsn, Ordering::Release);
        record.psn.store(psn, Ordering::Release);
        record.prev_physical.store(prev_physical, Ordering::Release);
        record
            .linked_physical
            .store(linked_physical, Ordering::Release);
        Ok(record)
    }
}

impl std::fmt::Debug for LogRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogRecord")
            .field("kind", &self.kind)
            .field("lsn", &self.lsn())
            .field("psn", &self.psn())
            .field("position", &self.record_position())
            .finish_non_exhaustive()
    }
}

/// Content equality: header sequence numbers, back references, and body.
/// Positions and lengths are placement artifacts and excluded.
impl PartialEq for LogRecord {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.lsn() == other.lsn()
            && self.psn() == other.psn()
            && self.prev_physical_position() == other.prev_physical_position()
            && self.linked_physical_position() == other.linked_physical_position()
            && self.body == other.body
    }
}

// ============================================================================
// Body serialization
// ============================================================================

fn op_triple_size(
    metadata: Option<&OperationData>,
    undo: Option<&OperationData>,
    redo: Option<&OperationData>,
) -> usize {
    OperationData::serialized_size_opt(metadata)
        + OperationData::serialized_size_opt(undo)
        + OperationData::serialized_size_opt(redo)
}

fn body_size(body: &RecordBody) -> usize {
    match body {
        RecordBody::BeginTransaction(b) => {
            8 + 1 + op_triple_size(b.metadata.as_ref(), b.undo.as_ref(), b.redo.as_ref())
        }
        RecordBody::Operation(b) => {
            8 + op_triple_size(b.metadata.as_ref(), b.undo.as_ref(), b.redo.as_ref())
        }
        RecordBody::EndTransaction(_) => 8 + 1,
        RecordBody::AtomicOperation(b) => {
            8 + op_triple_size(b.metadata.as_ref(), b.undo.as_ref(), b.redo.as_ref())
        }
        RecordBody::AtomicRedoOperation(b) => {
            8 + OperationData::serialized_size_opt(b.metadata.as_ref())
                + OperationData::serialized_size_opt(b.redo.as_ref())
        }
        RecordBody::Barrier(_) => 8,
        RecordBody::UpdateEpoch(_) => 16 + 8 + 8,
        RecordBody::Backup(_) => 16 + 16 + 8 + 4 + 4,
        RecordBody::Indexing(_) => 16,
        RecordBody::BeginCheckpoint(b) => {
            8 + 16 + b.progress_vector.serialized_size() + (16 + 16 + 8 + 4 + 4)
        }
        RecordBody::EndCheckpoint(_) => 8 + 8 + 8 + 8,
        RecordBody::CompleteCheckpoint(_) => 8 + 8,
        RecordBody::TruncateHead(_) => 8 + 8 + 16,
        RecordBody::TruncateTail(_) => 8,
        RecordBody::Information(_) => 4,
    }
}

fn put_epoch(epoch: Epoch, out: &mut BytesMut) {
    out.put_i64_le(epoch.data_loss);
    out.put_i64_le(epoch.configuration);
}

fn get_epoch(src: &mut Bytes) -> Result<Epoch, RecordError> {
    if src.remaining() < 16 {
        return Err(RecordError::Truncated {
            needed: 16,
            available: src.remaining(),
        });
    }
    Ok(Epoch::new(src.get_i64_le(), src.get_i64_le()))
}

fn put_backup(b: &BackupBody, out: &mut BytesMut) {
    out.put_slice(b.backup_id.as_bytes());
    put_epoch(b.highest_backed_up_epoch, out);
    out.put_i64_le(b.highest_backed_up_lsn.as_i64());
    out.put_u32_le(b.record_count);
    out.put_u32_le(b.size_kb);
}

fn get_backup(src: &mut Bytes) -> Result<BackupBody, RecordError> {
    if src.remaining() < 16 + 16 + 8 + 4 + 4 {
        return Err(RecordError::Truncated {
            needed: 48,
            available: src.remaining(),
        });
    }
    let mut id = [0u8; 16];
    src.copy_to_slice(&mut id);
    Ok(BackupBody {
        backup_id: Uuid::from_bytes(id),
        highest_backed_up_epoch: get_epoch(src)?,
        highest_backed_up_lsn: Lsn::new(src.get_i64_le()),
        record_count: src.get_u32_le(),
        size_kb: src.get_u32_le(),
    })
}

fn write_body(body: &RecordBody, out: &mut BytesMut) {
    match body {
        RecordBody::BeginTransaction(b) => {
            out.put_i64_le(b.transaction_id.as_i64());
            out.put_u8(u8::from(b.is_single_operation));
            OperationData::serialize_opt_into(b.metadata.as_ref(), out);
            OperationData::serialize_opt_into(b.undo.as_ref(), out);
            OperationData::serialize_opt_into(b.redo.as_ref(), out);
        }
        RecordBody::Operation(b) => {
            out.put_i64_le(b.transaction_id.as_i64());
            OperationData::serialize_opt_into(b.metadata.as_ref(), out);
            OperationData::serialize_opt_into(b.undo.as_ref(), out);
            OperationData::serialize_opt_into(b.redo.as_ref(), out);
        }
        RecordBody::EndTransaction(b) => {
            out.put_i64_le(b.transaction_id.as_i64());
            out.put_u8(u8::from(b.is_committed));
        }
        RecordBody::AtomicOperation(b) => {
            out.put_i64_le(b.transaction_id.as_i64());
            OperationData::serialize_opt_into(b.metadata.as_ref(), out);
            OperationData::serialize_opt_into(b.undo.as_ref(), out);
            OperationData::serialize_opt_into(b.redo.as_ref(), out);
        }
        RecordBody::AtomicRedoOperation(b) => {
            out.put_i64_le(b.transaction_id.as_i64());
            OperationData::serialize_opt_into(b.metadata.as_ref(), out);
            OperationData::serialize_opt_into(b.redo.as_ref(), out);
        }
        RecordBody::Barrier(b) => {
            out.put_i64_le(b.last_stable_lsn.as_i64());
        }
        RecordBody::UpdateEpoch(b) => {
            put_epoch(b.epoch, out);
            out.put_i64_le(b.primary_replica_id.as_i64());
            out.put_i64_le(b.timestamp_secs);
        }
        RecordBody::Backup(b) => put_backup(b, out),
        RecordBody::Indexing(b) => put_epoch(b.current_epoch, out),
        RecordBody::BeginCheckpoint(b) => {
            out.put_i64_le(b.earliest_pending_lsn.as_i64());
            put_epoch(b.epoch, out);
            b.progress_vector.serialize_into(out);
            put_backup(&b.last_backup, out);
        }
        RecordBody::EndCheckpoint(b) => {
            out.put_i64_le(b.begin_checkpoint_lsn.as_i64());
            out.put_u64_le(b.begin_checkpoint_position);
            out.put_i64_le(b.head_lsn.as_i64());
            out.put_u64_le(b.head_position);
        }
        RecordBody::CompleteCheckpoint(b) => {
            out.put_i64_le(b.head_lsn.as_i64());
            out.put_u64_le(b.head_position);
        }
        RecordBody::TruncateHead(b) => {
            out.put_i64_le(b.head_lsn.as_i64());
            out.put_u64_le(b.head_position);
            put_epoch(b.head_epoch, out);
        }
        RecordBody::TruncateTail(b) => {
            out.put_i64_le(b.new_tail_lsn.as_i64());
        }
        RecordBody::Information(b) => {
            out.put_u32_le(b.event as u32);
        }
    }
}

fn read_body(kind: RecordKind, src: &mut Bytes) -> Result<RecordBody, RecordError> {
    let need = |src: &Bytes, n: usize| -> Result<(), RecordError> {
        if src.remaining() < n {
            Err(RecordError::Truncated {
                needed: n,
                available: src.remaining(),
            })
        } else {
            Ok(())
        }
    };

    Ok(match kind {
        RecordKind::BeginTransaction => {
            need(src, 9)?;
            RecordBody::BeginTransaction(BeginTransactionBody {
                transaction_id: TransactionId::new(src.get_i64_le()),
                is_single_operation: src.get_u8() != 0,
                metadata: OperationData::deserialize_opt(src)?,
                undo: OperationData::deserialize_opt(src)?,
                redo: OperationData::deserialize_opt(src)?,
            })
        }
        RecordKind::Operation => {
            need(src, 8)?;
            RecordBody::Operation(OperationBody {
                transaction_id: TransactionId::new(src.get_i64_le()),
                metadata: OperationData::deserialize_opt(src)?,
                undo: OperationData::deserialize_opt(src)?,
                redo: OperationData::deserialize_opt(src)?,
            })
        }
        RecordKind::EndTransaction => {
            need(src, 9)?;
            RecordBody::EndTransaction(EndTransactionBody {
                transaction_id: TransactionId::new(src.get_i64_le()),
                is_committed: src.get_u8() != 0,
            })
        }
        RecordKind::AtomicOperation => {
            need(src, 8)?;
            RecordBody::AtomicOperation(AtomicOperationBody {
                transaction_id: TransactionId::new(src.get_i64_le()),
                metadata: OperationData::deserialize_opt(src)?,
                undo: OperationData::deserialize_opt(src)?,
                redo: OperationData::deserialize_opt(src)?,
            })
        }
        RecordKind::AtomicRedoOperation => {
            need(src, 8)?;
            RecordBody::AtomicRedoOperation(AtomicRedoOperationBody {
                transaction_id: TransactionId::new(src.get_i64_le()),
                metadata: OperationData::deserialize_opt(src)?,
                redo: OperationData::deserialize_opt(src)?,
            })
        }
        RecordKind::Barrier => {
            need(src, 8)?;
            RecordBody::Barrier(BarrierBody {
                last_stable_lsn: Lsn::new(src.get_i64_le()),
            })
        }
        RecordKind::UpdateEpoch => {
            let epoch = get_epoch(src)?;
            need(src, 16)?;
            RecordBody::UpdateEpoch(UpdateEpochBody {
                epoch,
                primary_replica_id: ReplicaId::new(src.get_i64_le()),
                timestamp_secs: src.get_i64_le(),
            })
        }
        RecordKind::Backup => RecordBody::Backup(get_backup(src)?),
        RecordKind::Indexing => RecordBody::Indexing(IndexingBody {
            current_epoch: get_epoch(src)?,
        }),
        RecordKind::BeginCheckpoint => {
            need(src, 8)?;
            let earliest_pending_lsn = Lsn::new(src.get_i64_le());
            let epoch = get_epoch(src)?;
            let progress_vector = ProgressVector::deserialize(src)?;
            let last_backup = get_backup(src)?;
            RecordBody::BeginCheckpoint(BeginCheckpointBody {
                earliest_pending_lsn,
                epoch,
                progress_vector,
                last_backup,
            })
        }
        RecordKind::EndCheckpoint => {
            need(src, 32)?;
            RecordBody::EndCheckpoint(EndCheckpointBody {
                begin_checkpoint_lsn: Lsn::new(src.get_i64_le()),
                begin_checkpoint_position: src.get_u64_le(),
                head_lsn: Lsn::new(src.get_i64_le()),
                head_position: src.get_u64_le(),
            })
        }
        RecordKind::CompleteCheckpoint => {
            need(src, 16)?;
            RecordBody::CompleteCheckpoint(CompleteCheckpointBody {
                head_lsn: Lsn::new(src.get_i64_le()),
                head_position: src.get_u64_le(),
            })
        }
        RecordKind::TruncateHead => {
            need(src, 16)?;
            let head_lsn = Lsn::new(src.get_i64_le());
            let head_position = src.get_u64_le();
            RecordBody::TruncateHead(TruncateHeadBody {
                head_lsn,
                head_position,
                head_epoch: get_epoch(src)?,
            })
        }
        RecordKind::TruncateTail => {
            need(src, 8)?;
            RecordBody::TruncateTail(TruncateTailBody {
                new_tail_lsn: Lsn::new(src.get_i64_le()),
            })
        }
        RecordKind::Information => {
            need(src, 4)?;
            RecordBody::Information(InformationBody {
                event: InformationKind::from_tag(src.get_u32_le())?,
            })
        }
    })
}
