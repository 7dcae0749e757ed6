//! Replicated log manager: record creation and sequencing.
//!
//! Sits between record producers and the physical log writer: assigns
//! LSNs, keeps the transaction map current, tracks the head/index/
//! checkpoint/truncation bookkeeping records, and owns the progress
//! vector. At most one checkpoint and at most one head truncation are in
//! progress at any time.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use olivine_log::LogStore;
use olivine_records::{
    BackupBody, BarrierBody, BeginCheckpointBody, CompleteCheckpointBody, EndCheckpointBody,
    IndexingBody, InformationBody, InformationKind, LogRecord, ProgressVector,
    ProgressVectorEntry, RecordBody, TruncateHeadBody, TruncateTailBody, UpdateEpochBody,
};
use olivine_types::{Epoch, INVALID_RECORD_POSITION, Lsn, RecordPosition, ReplicaId};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

use crate::writer::PhysicalLogWriter;
use crate::{ReplicatorError, TransactionMap};

struct ManagerState {
    progress_vector: ProgressVector,
    current_epoch: Epoch,
    /// Indexing record at the current log head.
    head_record: Option<Arc<LogRecord>>,
    last_index_record: Option<Arc<LogRecord>>,
    in_progress_checkpoint: Option<Arc<LogRecord>>,
    last_completed_checkpoint: Option<Arc<LogRecord>>,
    in_progress_truncate_head: Option<Arc<LogRecord>>,
    last_backup: BackupBody,
    last_barrier_lsn: Lsn,
}

/// Orchestrates record creation over a [`PhysicalLogWriter`].
pub struct ReplicatedLogManager<S: LogStore> {
    writer: Arc<PhysicalLogWriter<S>>,
    transaction_map: Arc<TransactionMap>,
    state: Mutex<ManagerState>,
    /// Next LSN to assign; every assignment is strictly increasing.
    next_lsn: AtomicI64,
    checkpoint_completed: Notify,
}

impl<S: LogStore> ReplicatedLogManager<S> {
    pub fn new(
        writer: Arc<PhysicalLogWriter<S>>,
        transaction_map: Arc<TransactionMap>,
    ) -> Arc<Self> {
        Arc::new(Self {
            writer,
            transaction_map,
            state: Mutex::new(ManagerState {
                progress_vector: ProgressVector::with_zero_entry(),
                current_epoch: Epoch::ZERO,
                head_record: None,
                last_index_record: None,
                in_progress_checkpoint: None,
                last_completed_checkpoint: None,
                in_progress_truncate_head: None,
                last_backup: BackupBody::zero(),
                last_barrier_lsn: Lsn::ZERO,
            }),
            next_lsn: AtomicI64::new(Lsn::ONE.as_i64()),
            checkpoint_completed: Notify::new(),
        })
    }

    pub fn writer(&self) -> &Arc<PhysicalLogWriter<S>> {
        &self.writer
    }

    pub fn transaction_map(&self) -> &Arc<TransactionMap> {
        &self.transaction_map
    }

    // ------------------------------------------------------------------
    // Sequencing
    // ------------------------------------------------------------------

    /// Last assigned LSN.
    pub fn current_log_tail_lsn(&self) -> Lsn {
        Lsn::new(self.next_lsn.load(Ordering::Acquire) - 1)
    }

    fn assign_lsn(&self) -> Lsn {
        Lsn::new(self.next_lsn.fetch_add(1, Ordering::AcqRel))
    }

    /// Sequences a logical record, updates transaction state, and buffers
    /// it in the writer. Never suspends; callers await a subsequent flush.
    ///
    /// Returns the sequenced record and the writer's buffered byte count.
    pub fn replicate_and_log(&self, body: RecordBody) -> (Arc<LogRecord>, i64) {
        assert!(
            body.kind().is_logical(),
            "replicate_and_log only sequences logical records"
        );
        let record = Arc::new(LogRecord::with_lsn(body, self.assign_lsn()));

        match record.body() {
            RecordBody::BeginTransaction(_) => {
                self.transaction_map.create_transaction(record.clone());
            }
            RecordBody::Operation(_) => self.transaction_map.add_operation(record.clone()),
            RecordBody::EndTransaction(_) => {
                self.transaction_map.complete_transaction(record.clone());
            }
            RecordBody::Barrier(_) => {
                let mut state = self.state.lock().expect("log manager lock poisoned");
                state.last_barrier_lsn = record.lsn();
            }
            RecordBody::Backup(backup) => {
                let mut state = self.state.lock().expect("log manager lock poisoned");
                state.last_backup = backup.clone();
            }
            _ => {}
        }

        let buffered = self.writer.insert_buffered_record(record.clone());
        (record, buffered)
    }

    /// Appends a barrier carrying the previous barrier's LSN.
    pub fn append_barrier(&self) -> (Arc<LogRecord>, i64) {
        let last_stable_lsn = {
            let state = self.state.lock().expect("log manager lock poisoned");
            state.last_barrier_lsn
        };
        self.replicate_and_log(RecordBody::Barrier(BarrierBody { last_stable_lsn }))
    }

    /// A barrier became stable: completed transactions at or below it are
    /// discarded.
    pub fn on_barrier_stable(&self, barrier_lsn: Lsn) {
        self.transaction_map.remove_stable_transactions(barrier_lsn);
    }

    // ------------------------------------------------------------------
    // Physical bookkeeping records
    // ------------------------------------------------------------------

    fn append_physical(&self, body: RecordBody) -> Arc<LogRecord> {
        // The writer resolves prev/linked back-pointers at serialization
        // time, once positions exist.
        let record = Arc::new(LogRecord::with_lsn(body, self.current_log_tail_lsn()));
        self.writer.insert_buffered_record(record.clone());
        record
    }

    /// Appends an `Information` event marker and flushes it.
    pub async fn information(
        &self,
        event: InformationKind,
    ) -> Result<Arc<LogRecord>, ReplicatorError> {
        let record = self.append_physical(RecordBody::Information(InformationBody { event }));
        self.writer.flush_async("information").await?;
        Ok(record)
    }

    /// Appends an index point at the current epoch. Callers gate this on
    /// the truncation manager's indexing policy.
    pub fn index(&self) -> Arc<LogRecord> {
        let current_epoch = {
            let state = self.state.lock().expect("log manager lock poisoned");
            state.current_epoch
        };
        let record = self.append_physical(RecordBody::Indexing(IndexingBody { current_epoch }));
        let mut state = self.state.lock().expect("log manager lock poisoned");
        if state.head_record.is_none() {
            // The very first index point doubles as the initial head.
            state.head_record = Some(record.clone());
        }
        state.last_index_record = Some(record.clone());
        record
    }

    // ------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------

    /// Starts the three-phase checkpoint.
    ///
    /// # Panics
    ///
    /// At most one checkpoint may be in progress.
    pub fn insert_begin_checkpoint(&self) -> Arc<LogRecord> {
        let (earliest_pending, _) = self.transaction_map.get_earliest_pending_transaction(None);
        let body = {
            let state = self.state.lock().expect("log manager lock poisoned");
            assert!(
                state.in_progress_checkpoint.is_none(),
                "a checkpoint is already in progress"
            );
            BeginCheckpointBody {
                earliest_pending_lsn: earliest_pending
                    .map_or(Lsn::INVALID, |record| record.lsn()),
                epoch: state.current_epoch,
                progress_vector: state.progress_vector.clone(),
                last_backup: state.last_backup.clone(),
            }
        };
        let record = self.append_physical(RecordBody::BeginCheckpoint(body));
        self.state
            .lock()
            .expect("log manager lock poisoned")
            .in_progress_checkpoint = Some(record.clone());
        record
    }

    /// Second phase: marks the checkpoint durable.
    pub fn insert_end_checkpoint(&self, begin_checkpoint: &Arc<LogRecord>) -> Arc<LogRecord> {
        let (head_lsn, head_position) = self.head_lsn_and_position();
        self.append_physical(RecordBody::EndCheckpoint(EndCheckpointBody {
            begin_checkpoint_lsn: begin_checkpoint.lsn(),
            begin_checkpoint_position: begin_checkpoint.record_position(),
            head_lsn,
            head_position,
        }))
    }

    /// Final phase: the checkpoint fully applies and waiters of
    /// [`Self::checkpoint_completed_notified`] wake.
    pub fn complete_checkpoint(&self) -> Arc<LogRecord> {
        let (head_lsn, head_position) = self.head_lsn_and_position();
        let record = self.append_physical(RecordBody::CompleteCheckpoint(
            CompleteCheckpointBody {
                head_lsn,
                head_position,
            },
        ));
        {
            let mut state = self.state.lock().expect("log manager lock poisoned");
            let begun = state.in_progress_checkpoint.take();
            assert!(begun.is_some(), "no checkpoint in progress to complete");
            state.last_completed_checkpoint = begun;
        }
        self.checkpoint_completed.notify_waiters();
        record
    }

    pub fn in_progress_checkpoint(&self) -> Option<Arc<LogRecord>> {
        self.state
            .lock()
            .expect("log manager lock poisoned")
            .in_progress_checkpoint
            .clone()
    }

    pub fn last_completed_checkpoint(&self) -> Option<Arc<LogRecord>> {
        self.state
            .lock()
            .expect("log manager lock poisoned")
            .last_completed_checkpoint
            .clone()
    }

    /// Future that resolves at the next checkpoint completion. Obtain it
    /// before re-checking [`Self::in_progress_checkpoint`] to avoid a
    /// wakeup race.
    pub fn checkpoint_completed_notified(&self) -> Notified<'_> {
        self.checkpoint_completed.notified()
    }

    // ------------------------------------------------------------------
    // Head truncation
    // ------------------------------------------------------------------

    /// Durably records a head advancement to `new_head`, an indexing
    /// record that must already be flushed.
    ///
    /// # Panics
    ///
    /// At most one head truncation may be in flight, and never while a
    /// checkpoint is still in progress (the checkpoint must be durable
    /// before the log below it goes away).
    pub fn insert_truncate_head(&self, new_head: Arc<LogRecord>) -> Arc<LogRecord> {
        assert!(new_head.is_flushed(), "new head must be flushed");
        let head_epoch = match new_head.body() {
            RecordBody::Indexing(body) => body.current_epoch,
            other => panic!("log head must be an indexing record, got {:?}", other.kind()),
        };
        {
            let state = self.state.lock().expect("log manager lock poisoned");
            assert!(
                state.in_progress_truncate_head.is_none(),
                "a head truncation is already in progress"
            );
            assert!(
                state.in_progress_checkpoint.is_none(),
                "head truncation cannot start during a checkpoint"
            );
        }
        let record = self.append_physical(RecordBody::TruncateHead(TruncateHeadBody {
            head_lsn: new_head.lsn(),
            head_position: new_head.record_position(),
            head_epoch,
        }));
        let mut state = self.state.lock().expect("log manager lock poisoned");
        state.head_record = Some(new_head);
        state.in_progress_truncate_head = Some(record.clone());
        record
    }

    pub fn in_progress_truncate_head(&self) -> Option<Arc<LogRecord>> {
        self.state
            .lock()
            .expect("log manager lock poisoned")
            .in_progress_truncate_head
            .clone()
    }

    /// Completes the pending head truncation by releasing the bytes below
    /// the new head from the store.
    pub async fn on_complete_pending_log_head_truncation(
        &self,
    ) -> Result<(), ReplicatorError> {
        let truncate_record = {
            let mut state = self.state.lock().expect("log manager lock poisoned");
            state
                .in_progress_truncate_head
                .take()
                .expect("no head truncation in progress")
        };
        let RecordBody::TruncateHead(body) = truncate_record.body() else {
            unreachable!("in-progress truncation is always a truncate-head record");
        };
        tracing::info!(head_lsn = %body.head_lsn, head_position = body.head_position, "advancing log head");
        self.writer.truncate_log_head_async(body.head_position).await
    }

    // ------------------------------------------------------------------
    // Tail truncation (false-progress resolution)
    // ------------------------------------------------------------------

    /// Rewinds the log tail to `new_tail`, undoing `undone_records` (the
    /// flushed records above it, newest first) from the transaction map,
    /// and records the rewind durably.
    ///
    /// LSN assignment restarts right after the restored tail, replacing
    /// the false-progressed range.
    pub async fn truncate_tail(
        &self,
        new_tail: Arc<LogRecord>,
        undone_records: &[Arc<LogRecord>],
    ) -> Result<Arc<LogRecord>, ReplicatorError> {
        assert!(new_tail.is_flushed(), "tail truncation target must be flushed");

        for record in undone_records {
            match record.body() {
                RecordBody::Operation(_) => self.transaction_map.false_progress_apply(record),
                RecordBody::EndTransaction(_) => {
                    self.transaction_map.false_progress_complete(record);
                }
                RecordBody::BeginTransaction(_) => {
                    self.transaction_map.false_progress_begin(record);
                }
                _ => {}
            }
        }

        self.writer.truncate_log_tail(Arc::clone(&new_tail)).await?;
        self.next_lsn
            .store(new_tail.lsn().as_i64() + 1, Ordering::Release);

        let record = self.append_physical(RecordBody::TruncateTail(TruncateTailBody {
            new_tail_lsn: new_tail.lsn(),
        }));
        self.writer.flush_async("truncate-tail").await?;
        tracing::info!(new_tail_lsn = %new_tail.lsn(), undone = undone_records.len(), "rewound log tail");
        Ok(record)
    }

    // ------------------------------------------------------------------
    // Epochs
    // ------------------------------------------------------------------

    /// Records an epoch transition at the current tail.
    pub fn update_epoch(
        &self,
        epoch: Epoch,
        primary_replica_id: ReplicaId,
        timestamp_secs: i64,
    ) -> Arc<LogRecord> {
        let lsn = self.current_log_tail_lsn();
        let record = Arc::new(LogRecord::with_lsn(
            RecordBody::UpdateEpoch(UpdateEpochBody {
                epoch,
                primary_replica_id,
                timestamp_secs,
            }),
            lsn,
        ));
        {
            let mut state = self.state.lock().expect("log manager lock poisoned");
            assert!(
                epoch > state.current_epoch,
                "epoch transitions must move forward: {} then {}",
                state.current_epoch,
                epoch
            );
            state.current_epoch = epoch;
            state.progress_vector.append(ProgressVectorEntry::new(
                epoch,
                lsn,
                primary_replica_id,
                timestamp_secs,
            ));
        }
        self.writer.insert_buffered_record(record.clone());
        record
    }

    pub fn current_epoch(&self) -> Epoch {
        self.state
            .lock()
            .expect("log manager lock poisoned")
            .current_epoch
    }

    pub fn progress_vector(&self) -> ProgressVector {
        self.state
            .lock()
            .expect("log manager lock poisoned")
            .progress_vector
            .clone()
    }

    /// Trims the progress vector against the head and backup epochs.
    pub fn trim_progress_vector(&self, max_entries: usize) {
        let mut state = self.state.lock().expect("log manager lock poisoned");
        let head_epoch = state
            .head_record
            .as_ref()
            .and_then(|head| match head.body() {
                RecordBody::Indexing(body) => Some(body.current_epoch),
                _ => None,
            })
            .unwrap_or(Epoch::INVALID);
        let backup_epoch = state.last_backup.highest_backed_up_epoch;
        state
            .progress_vector
            .trim_if_needed(head_epoch, backup_epoch, max_entries);
    }

    // ------------------------------------------------------------------
    // Head and usage queries
    // ------------------------------------------------------------------

    pub fn head_record(&self) -> Option<Arc<LogRecord>> {
        self.state
            .lock()
            .expect("log manager lock poisoned")
            .head_record
            .clone()
    }

    pub fn last_index_record(&self) -> Option<Arc<LogRecord>> {
        self.state
            .lock()
            .expect("log manager lock poisoned")
            .last_index_record
            .clone()
    }

    pub fn last_backup(&self) -> BackupBody {
        self.state
            .lock()
            .expect("log manager lock poisoned")
            .last_backup
            .clone()
    }

    fn head_lsn_and_position(&self) -> (Lsn, RecordPosition) {
        let state = self.state.lock().expect("log manager lock poisoned");
        state.head_record.as_ref().map_or(
            (Lsn::ZERO, 0),
            |head| (head.lsn(), head.record_position()),
        )
    }

    /// Byte offset of the current head record, zero before the first
    /// index point.
    pub fn head_position(&self) -> RecordPosition {
        let (_, position) = self.head_lsn_and_position();
        if position == INVALID_RECORD_POSITION {
            0
        } else {
            position
        }
    }

    /// Bytes of log between the head record and the store's tail.
    pub fn log_usage(&self) -> u64 {
        self.writer
            .store()
            .tail_position()
            .saturating_sub(self.head_position())
    }
}
