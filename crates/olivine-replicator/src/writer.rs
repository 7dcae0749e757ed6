//! Physical log writer: the buffer→flush pipeline.
//!
//! Producers insert records without blocking; one in-flight flush at a
//! time serializes the batch, appends it to the byte log, issues the
//! durability marker, and hands the batch to the callback pump. The pump
//! is a single task draining a channel, so flush callbacks form one
//! logical stream: on the success path PSNs increase by exactly one
//! between successive records.
//!
//! Failure latches: the first append/marker error is attached to every
//! record of its batch, and every record inserted afterwards is surfaced
//! through the callback with `Closed`. The writer never retries silently;
//! higher layers decide whether to retry or fail the replica.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::BytesMut;
use olivine_log::LogStore;
use olivine_records::LogRecord;
use olivine_types::{INVALID_RECORD_POSITION, Psn, RecordPosition};
use tokio::sync::{mpsc, oneshot, watch};

use crate::ReplicatorError;

/// A flushed batch (or a failed record set) delivered to the flush
/// processor in PSN order.
#[derive(Debug, Clone)]
pub struct LoggedRecords {
    pub records: Vec<Arc<LogRecord>>,
    /// Set when the batch failed to reach durable storage; the records'
    /// PSNs may be unassigned.
    pub error: Option<ReplicatorError>,
}

/// Consumer of ordered flush callbacks. Keep implementations non-blocking;
/// hand long work to a queue (the records dispatcher does exactly that).
pub trait FlushProcessor: Send + Sync + 'static {
    fn process_flushed_records(&self, records: LoggedRecords);
}

type FlushWaiter = oneshot::Sender<Result<(), ReplicatorError>>;

struct WriterState {
    buffered: Vec<Arc<LogRecord>>,
    buffered_bytes: i64,
    waiters: Vec<FlushWaiter>,
    flushing: bool,
    closed_error: Option<ReplicatorError>,
    next_psn: Psn,
    tail_record: Option<Arc<LogRecord>>,
}

/// Single-writer pipeline over a [`LogStore`].
pub struct PhysicalLogWriter<S: LogStore> {
    store: S,
    state: Mutex<WriterState>,
    pending_flush_bytes: AtomicI64,
    last_physical_position: AtomicU64,
    /// Position of the most recent checkpoint/truncation marker, the
    /// anchor of the secondary physical-record chain.
    last_marker_position: AtomicU64,
    throttle_threshold_bytes: i64,
    callback_tx: mpsc::UnboundedSender<LoggedRecords>,
    flushed_watch: watch::Sender<bool>,
    /// Back-reference for handing the flush loop an owned handle.
    this: Weak<Self>,
}

impl<S: LogStore> PhysicalLogWriter<S> {
    /// Creates the writer and starts the callback pump feeding
    /// `processor`.
    pub fn new<P: FlushProcessor>(
        store: S,
        processor: Arc<P>,
        throttle_threshold_bytes: i64,
    ) -> Arc<Self> {
        let (callback_tx, mut callback_rx) = mpsc::unbounded_channel::<LoggedRecords>();
        tokio::spawn(async move {
            while let Some(records) = callback_rx.recv().await {
                processor.process_flushed_records(records);
            }
        });

        let (flushed_watch, _) = watch::channel(true);
        Arc::new_cyclic(|this| Self {
            store,
            state: Mutex::new(WriterState {
                buffered: Vec::new(),
                buffered_bytes: 0,
                waiters: Vec::new(),
                flushing: false,
                closed_error: None,
                next_psn: Psn::ZERO,
                tail_record: None,
            }),
            pending_flush_bytes: AtomicI64::new(0),
            last_physical_position: AtomicU64::new(INVALID_RECORD_POSITION),
            last_marker_position: AtomicU64::new(INVALID_RECORD_POSITION),
            throttle_threshold_bytes,
            callback_tx,
            flushed_watch,
            this: this.clone(),
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    // ------------------------------------------------------------------
    // Producer side
    // ------------------------------------------------------------------

    /// Appends a record to the write buffer and returns the total buffered
    /// bytes. Never blocks.
    ///
    /// Once the writer carries a closed/failed error the record is not
    /// buffered; it is surfaced straight through the callback with the
    /// error so anyone waiting on it unblocks. Its PSN stays unassigned.
    pub fn insert_buffered_record(&self, record: Arc<LogRecord>) -> i64 {
        let mut state = self.state.lock().expect("writer lock poisoned");
        if state.closed_error.is_some() {
            let _ = self.callback_tx.send(LoggedRecords {
                records: vec![record],
                error: Some(ReplicatorError::Closed),
            });
            return state.buffered_bytes;
        }

        record.set_psn(state.next_psn);
        state.next_psn = state.next_psn.next();
        state.buffered_bytes += record.size_on_disk() as i64;
        state.buffered.push(record);
        self.flushed_watch.send_replace(false);
        state.buffered_bytes
    }

    /// Triggers a flush and resolves when the records buffered at the time
    /// of this call are durable (or failed). Concurrent callers join the
    /// next flush; the flush loop drains the buffer until empty.
    pub async fn flush_async(&self, initiator: &str) -> Result<(), ReplicatorError> {
        let receiver = {
            let mut state = self.state.lock().expect("writer lock poisoned");
            if state.buffered.is_empty() && !state.flushing {
                return match &state.closed_error {
                    // Nothing pending: closing already delivered everything.
                    Some(error) => Err(error.clone()),
                    None => Ok(()),
                };
            }
            let (sender, receiver) = oneshot::channel();
            state.waiters.push(sender);
            if !state.flushing {
                state.flushing = true;
                let this = self.this.upgrade().expect("writer outlives its flushes");
                let initiator = initiator.to_string();
                tokio::spawn(async move { this.flush_loop(initiator).await });
            }
            receiver
        };

        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(ReplicatorError::Closed),
        }
    }

    // ------------------------------------------------------------------
    // Flush loop
    // ------------------------------------------------------------------

    async fn flush_loop(self: Arc<Self>, initiator: String) {
        let mut last_result: Result<(), ReplicatorError> = Ok(());
        loop {
            enum Step {
                Batch {
                    records: Vec<Arc<LogRecord>>,
                    waiters: Vec<FlushWaiter>,
                    bytes: i64,
                    latched: Option<ReplicatorError>,
                },
                Drained(Vec<FlushWaiter>),
            }

            let step = {
                let mut state = self.state.lock().expect("writer lock poisoned");
                if state.buffered.is_empty() {
                    state.flushing = false;
                    Step::Drained(std::mem::take(&mut state.waiters))
                } else {
                    let records = std::mem::take(&mut state.buffered);
                    let bytes = state.buffered_bytes;
                    state.buffered_bytes = 0;
                    Step::Batch {
                        records,
                        waiters: std::mem::take(&mut state.waiters),
                        bytes,
                        latched: state.closed_error.clone(),
                    }
                }
            };

            match step {
                Step::Drained(waiters) => {
                    // Late joiners whose records rode an earlier batch.
                    for waiter in waiters {
                        let _ = waiter.send(last_result.clone());
                    }
                    let state = self.state.lock().expect("writer lock poisoned");
                    if state.buffered.is_empty() && !state.flushing {
                        self.flushed_watch.send_replace(true);
                    }
                    return;
                }
                Step::Batch {
                    records,
                    waiters,
                    bytes,
                    latched,
                } => {
                    self.pending_flush_bytes.fetch_add(bytes, Ordering::AcqRel);
                    let result = match latched {
                        Some(error) => Err(error),
                        None => self.write_batch(&records).await,
                    };
                    self.pending_flush_bytes.fetch_sub(bytes, Ordering::AcqRel);

                    if let Err(error) = &result {
                        tracing::error!(
                            initiator = %initiator,
                            records = records.len(),
                            %error,
                            "flush failed; latching writer"
                        );
                        let mut state = self.state.lock().expect("writer lock poisoned");
                        if state.closed_error.is_none() {
                            state.closed_error = Some(error.clone());
                        }
                    } else {
                        tracing::debug!(
                            initiator = %initiator,
                            records = records.len(),
                            bytes,
                            "flushed batch"
                        );
                    }

                    let _ = self.callback_tx.send(LoggedRecords {
                        records,
                        error: result.as_ref().err().cloned(),
                    });
                    for waiter in waiters {
                        let _ = waiter.send(result.clone());
                    }
                    last_result = result;
                }
            }
        }
    }

    async fn write_batch(&self, batch: &[Arc<LogRecord>]) -> Result<(), ReplicatorError> {
        let total: usize = batch.iter().map(|r| r.size_on_disk()).sum();
        let mut out = BytesMut::with_capacity(total);
        let base = self.store.tail_position();

        for record in batch {
            let frame_start = base + out.len() as u64;
            record.set_record_position(frame_start);
            record.set_prev_physical_position(self.last_physical_position.load(Ordering::Acquire));
            if record.kind().is_physical() {
                record.set_linked_physical_position(
                    self.last_marker_position.load(Ordering::Acquire),
                );
            }
            record.write_frame(&mut out);
            if record.kind().is_physical() {
                self.last_physical_position
                    .store(frame_start, Ordering::Release);
            }
            if matches!(
                record.kind(),
                olivine_records::RecordKind::EndCheckpoint
                    | olivine_records::RecordKind::CompleteCheckpoint
                    | olivine_records::RecordKind::TruncateHead
            ) {
                self.last_marker_position
                    .store(frame_start, Ordering::Release);
            }
        }

        self.store.append(out.freeze()).await?;
        self.store.flush_with_marker().await?;

        if let Some(last) = batch.last() {
            self.state.lock().expect("writer lock poisoned").tail_record = Some(Arc::clone(last));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Tail management
    // ------------------------------------------------------------------

    /// Re-anchors the logical tail without changing durable content; PSN
    /// assignment continues after the new tail.
    pub fn set_tail_record(&self, record: Arc<LogRecord>) {
        let mut state = self.state.lock().expect("writer lock poisoned");
        state.next_psn = record.psn().next();
        state.tail_record = Some(record);
    }

    pub fn current_log_tail_record(&self) -> Option<Arc<LogRecord>> {
        self.state
            .lock()
            .expect("writer lock poisoned")
            .tail_record
            .clone()
    }

    /// Durably narrows the log to end just after `new_tail_record`.
    pub async fn truncate_log_tail(
        &self,
        new_tail_record: Arc<LogRecord>,
    ) -> Result<(), ReplicatorError> {
        assert!(
            new_tail_record.is_flushed(),
            "tail truncation target must be flushed"
        );
        let end = new_tail_record.record_position()
            + u64::from(new_tail_record.record_length())
            + olivine_records::FRAME_OVERHEAD as u64;
        self.store.truncate_tail(end).await?;
        self.set_tail_record(new_tail_record);
        Ok(())
    }

    /// Durably advances the log head to `position`.
    pub async fn truncate_log_head_async(
        &self,
        position: RecordPosition,
    ) -> Result<(), ReplicatorError> {
        self.store.truncate_head(position).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lifecycle and properties
    // ------------------------------------------------------------------

    /// Arms the terminal state. Later inserts are surfaced through the
    /// callback with `Closed`; no further successful flush is possible.
    pub fn prepare_to_close(&self) {
        let mut state = self.state.lock().expect("writer lock poisoned");
        if state.closed_error.is_none() {
            state.closed_error = Some(ReplicatorError::Closed);
        }
    }

    pub fn closed_error(&self) -> Option<ReplicatorError> {
        self.state
            .lock()
            .expect("writer lock poisoned")
            .closed_error
            .clone()
    }

    pub fn buffered_record_bytes(&self) -> i64 {
        self.state
            .lock()
            .expect("writer lock poisoned")
            .buffered_bytes
    }

    pub fn pending_flush_bytes(&self) -> i64 {
        self.pending_flush_bytes.load(Ordering::Acquire)
    }

    pub fn is_completely_flushed(&self) -> bool {
        let state = self.state.lock().expect("writer lock poisoned");
        state.buffered.is_empty()
            && !state.flushing
            && self.pending_flush_bytes.load(Ordering::Acquire) == 0
    }

    /// Resolves the next time the writer is completely flushed. Resolves
    /// immediately when it already is.
    pub async fn wait_for_complete_flush(&self) {
        let mut watcher = self.flushed_watch.subscribe();
        loop {
            if *watcher.borrow_and_update() && self.is_completely_flushed() {
                return;
            }
            if watcher.changed().await.is_err() {
                return;
            }
        }
    }

    /// Back-pressure signal: true while buffered plus in-flight bytes
    /// exceed the throttle threshold. Writes are never dropped; producers
    /// are expected to back off.
    pub fn should_throttle_writes(&self) -> bool {
        let buffered = self.buffered_record_bytes();
        let pending = self.pending_flush_bytes();
        buffered + pending > self.throttle_threshold_bytes
    }
}
