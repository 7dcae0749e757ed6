//! Ordered, barrier-gated delivery of logged records.
//!
//! Flushed records arrive in PSN order and are partitioned into **barrier
//! groups**: a barrier record concludes the group containing everything
//! since the previous barrier. A group is handed to the state provider
//! only after the previous group is fully applied and unlocked; within a
//! group, parallel mode may apply records concurrently while serial mode
//! applies them one by one. Barriers themselves are always serialized.
//!
//! The worker is one flat loop over queued groups — a run of thousands of
//! consecutive barriers costs no stack.

use std::sync::Arc;

use olivine_records::{LogRecord, RecordKind};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use crate::writer::{FlushProcessor, LoggedRecords};

/// How records inside one barrier group reach the state provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// One record at a time, in PSN order.
    Serial,
    /// Records of a group may apply concurrently and out of order;
    /// group boundaries still serialize.
    Parallel,
}

/// The state machine consuming applied records.
///
/// `apply` runs the record's effect; `unlock` releases it once the whole
/// group has applied. Both are invoked for logical records only.
pub trait StateProvider: Send + Sync + 'static {
    fn apply(&self, record: Arc<LogRecord>) -> impl Future<Output = ()> + Send;

    fn unlock(&self, record: &Arc<LogRecord>);
}

/// Barrier-gated dispatcher feeding a [`StateProvider`].
pub struct RecordsDispatcher<P: StateProvider> {
    records_tx: mpsc::UnboundedSender<LoggedRecords>,
    paused_tx: watch::Sender<bool>,
    barriers_rx: watch::Receiver<u64>,
    idle_rx: watch::Receiver<bool>,
    _provider: std::marker::PhantomData<fn() -> P>,
}

impl<P: StateProvider> RecordsDispatcher<P> {
    pub fn new(provider: Arc<P>, mode: DispatchMode) -> Arc<Self> {
        let (records_tx, records_rx) = mpsc::unbounded_channel();
        let (paused_tx, paused_rx) = watch::channel(false);
        let (barriers_tx, barriers_rx) = watch::channel(0u64);
        let (idle_tx, idle_rx) = watch::channel(true);

        tokio::spawn(run_dispatch_loop(
            provider, mode, records_rx, paused_rx, barriers_tx, idle_tx,
        ));

        Arc::new(Self {
            records_tx,
            paused_tx,
            barriers_rx,
            idle_rx,
            _provider: std::marker::PhantomData,
        })
    }

    /// Count of barrier groups fully dispatched so far; exactly one
    /// completion per barrier record seen.
    pub fn dispatched_barrier_count(&self) -> u64 {
        *self.barriers_rx.borrow()
    }

    /// Waits until at least `count` barrier groups have been dispatched.
    pub async fn wait_for_barriers(&self, count: u64) {
        let mut barriers = self.barriers_rx.clone();
        loop {
            if *barriers.borrow_and_update() >= count {
                return;
            }
            if barriers.changed().await.is_err() {
                return;
            }
        }
    }

    /// Stops dispatching after the currently running group completes.
    /// Queued groups stay queued until [`Self::continue_dispatch`].
    pub async fn drain_and_pause(&self) {
        self.paused_tx.send_replace(true);
        let mut idle = self.idle_rx.clone();
        loop {
            if *idle.borrow_and_update() {
                return;
            }
            if idle.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn continue_dispatch(&self) {
        self.paused_tx.send_replace(false);
    }
}

impl<P: StateProvider> FlushProcessor for RecordsDispatcher<P> {
    fn process_flushed_records(&self, records: LoggedRecords) {
        let _ = self.records_tx.send(records);
    }
}

async fn run_dispatch_loop<P: StateProvider>(
    provider: Arc<P>,
    mode: DispatchMode,
    mut records_rx: mpsc::UnboundedReceiver<LoggedRecords>,
    mut paused_rx: watch::Receiver<bool>,
    barriers_tx: watch::Sender<u64>,
    idle_tx: watch::Sender<bool>,
) {
    let mut group: Vec<Arc<LogRecord>> = Vec::new();

    'outer: loop {
        let Some(logged) = records_rx.recv().await else {
            break;
        };
        if let Some(error) = logged.error {
            // Failed records never reach the state provider.
            tracing::warn!(%error, count = logged.records.len(), "dropping failed records");
            continue;
        }

        for record in logged.records {
            if !record.kind().is_logical() {
                continue;
            }
            let is_barrier = record.kind() == RecordKind::Barrier;
            group.push(record);
            if !is_barrier {
                continue;
            }

            // The previous group must be fully unlocked before this one
            // starts, and a pause request takes effect at this boundary.
            while *paused_rx.borrow_and_update() {
                if paused_rx.changed().await.is_err() {
                    break 'outer;
                }
            }

            idle_tx.send_replace(false);
            process_group(&provider, mode, std::mem::take(&mut group)).await;
            barriers_tx.send_modify(|count| *count += 1);
            idle_tx.send_replace(true);
        }
    }
}

async fn process_group<P: StateProvider>(
    provider: &Arc<P>,
    mode: DispatchMode,
    records: Vec<Arc<LogRecord>>,
) {
    match mode {
        DispatchMode::Serial => {
            for record in &records {
                provider.apply(Arc::clone(record)).await;
            }
        }
        DispatchMode::Parallel => {
            let mut applies = JoinSet::new();
            for record in &records {
                let provider = Arc::clone(provider);
                let record = Arc::clone(record);
                applies.spawn(async move { provider.apply(record).await });
            }
            while applies.join_next().await.is_some() {}
        }
    }

    for record in &records {
        provider.unlock(record);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use olivine_records::{
        AtomicOperationBody, BarrierBody, IndexingBody, InformationBody, InformationKind,
        OperationData, RecordBody,
    };
    use olivine_types::{Epoch, Lsn, TransactionId};

    use super::*;
    use crate::ReplicatorError;

    struct TestProvider {
        applied: Mutex<Vec<Lsn>>,
        apply_count: AtomicU64,
        unlock_count: AtomicU64,
        apply_delay: Duration,
    }

    impl TestProvider {
        fn new() -> Arc<Self> {
            Self::with_delay(Duration::ZERO)
        }

        fn with_delay(apply_delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                applied: Mutex::new(Vec::new()),
                apply_count: AtomicU64::new(0),
                unlock_count: AtomicU64::new(0),
                apply_delay,
            })
        }
    }

    impl StateProvider for TestProvider {
        fn apply(&self, record: Arc<LogRecord>) -> impl Future<Output = ()> + Send {
            async move {
                if !self.apply_delay.is_zero() {
                    tokio::time::sleep(self.apply_delay).await;
                }
                self.applied.lock().unwrap().push(record.lsn());
                self.apply_count.fetch_add(1, Ordering::AcqRel);
            }
        }

        fn unlock(&self, _record: &Arc<LogRecord>) {
            self.unlock_count.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn operation(lsn: i64) -> Arc<LogRecord> {
        Arc::new(LogRecord::with_lsn(
            RecordBody::AtomicOperation(AtomicOperationBody {
                transaction_id: TransactionId::new(lsn),
                metadata: None,
                undo: None,
                redo: Some(OperationData::from_slice(b"r")),
            }),
            Lsn::new(lsn),
        ))
    }

    fn barrier(lsn: i64) -> Arc<LogRecord> {
        Arc::new(LogRecord::with_lsn(
            RecordBody::Barrier(BarrierBody {
                last_stable_lsn: Lsn::new(lsn - 1),
            }),
            Lsn::new(lsn),
        ))
    }

    fn batch(records: Vec<Arc<LogRecord>>) -> LoggedRecords {
        LoggedRecords {
            records,
            error: None,
        }
    }

    #[tokio::test]
    async fn records_then_barrier_dispatch_one_group() {
        let provider = TestProvider::new();
        let dispatcher = RecordsDispatcher::new(provider.clone(), DispatchMode::Serial);

        dispatcher.process_flushed_records(batch(vec![
            operation(1),
            operation(2),
            barrier(3),
        ]));
        dispatcher.wait_for_barriers(1).await;

        assert_eq!(provider.apply_count.load(Ordering::Acquire), 3);
        assert_eq!(provider.unlock_count.load(Ordering::Acquire), 3);
        assert_eq!(
            *provider.applied.lock().unwrap(),
            vec![Lsn::new(1), Lsn::new(2), Lsn::new(3)]
        );
    }

    #[tokio::test]
    async fn no_barrier_means_no_processing() {
        let provider = TestProvider::new();
        let dispatcher = RecordsDispatcher::new(provider.clone(), DispatchMode::Serial);

        dispatcher.process_flushed_records(batch(vec![operation(1), operation(2)]));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(provider.apply_count.load(Ordering::Acquire), 0);
        assert_eq!(dispatcher.dispatched_barrier_count(), 0);
    }

    #[tokio::test]
    async fn two_consecutive_barriers_dispatch_twice() {
        let provider = TestProvider::new();
        let dispatcher = RecordsDispatcher::new(provider.clone(), DispatchMode::Serial);

        dispatcher.process_flushed_records(batch(vec![barrier(1), barrier(2)]));
        dispatcher.wait_for_barriers(2).await;

        assert_eq!(dispatcher.dispatched_barrier_count(), 2);
        assert_eq!(provider.apply_count.load(Ordering::Acquire), 2);
    }

    #[tokio::test]
    async fn physical_records_are_not_dispatched() {
        let provider = TestProvider::new();
        let dispatcher = RecordsDispatcher::new(provider.clone(), DispatchMode::Serial);

        dispatcher.process_flushed_records(batch(vec![
            operation(1),
            Arc::new(LogRecord::with_lsn(
                RecordBody::Indexing(IndexingBody {
                    current_epoch: Epoch::ZERO,
                }),
                Lsn::new(1),
            )),
            Arc::new(LogRecord::with_lsn(
                RecordBody::Information(InformationBody {
                    event: InformationKind::Recovered,
                }),
                Lsn::new(1),
            )),
            barrier(2),
        ]));
        dispatcher.wait_for_barriers(1).await;

        // Only the operation and the barrier reached the provider.
        assert_eq!(provider.apply_count.load(Ordering::Acquire), 2);
    }

    #[tokio::test]
    async fn failed_batches_are_dropped() {
        let provider = TestProvider::new();
        let dispatcher = RecordsDispatcher::new(provider.clone(), DispatchMode::Serial);

        dispatcher.process_flushed_records(LoggedRecords {
            records: vec![operation(1), barrier(2)],
            error: Some(ReplicatorError::Closed),
        });
        dispatcher.process_flushed_records(batch(vec![barrier(3)]));
        dispatcher.wait_for_barriers(1).await;

        // The failed group's records never applied.
        assert_eq!(provider.apply_count.load(Ordering::Acquire), 1);
        assert_eq!(dispatcher.dispatched_barrier_count(), 1);
    }

    /// Asserts, at apply time, that nothing from the second group arrives
    /// before the first group (LSNs 1..=4) is fully unlocked.
    struct BoundaryCheckingProvider {
        unlock_count: AtomicU64,
        apply_count: AtomicU64,
    }

    impl StateProvider for BoundaryCheckingProvider {
        fn apply(&self, record: Arc<LogRecord>) -> impl Future<Output = ()> + Send {
            async move {
                // Stagger applies so out-of-order execution within the
                // group actually happens.
                tokio::time::sleep(Duration::from_millis(5 - (record.lsn().as_i64() % 5) as u64))
                    .await;
                if record.lsn().as_i64() >= 5 {
                    assert_eq!(
                        self.unlock_count.load(Ordering::Acquire),
                        4,
                        "second group applied before the first was unlocked"
                    );
                }
                self.apply_count.fetch_add(1, Ordering::AcqRel);
            }
        }

        fn unlock(&self, _record: &Arc<LogRecord>) {
            self.unlock_count.fetch_add(1, Ordering::AcqRel);
        }
    }

    #[tokio::test]
    async fn groups_do_not_overlap_even_in_parallel_mode() {
        let provider = Arc::new(BoundaryCheckingProvider {
            unlock_count: AtomicU64::new(0),
            apply_count: AtomicU64::new(0),
        });
        let dispatcher = RecordsDispatcher::new(provider.clone(), DispatchMode::Parallel);

        dispatcher.process_flushed_records(batch(vec![
            operation(1),
            operation(2),
            operation(3),
            barrier(4),
        ]));
        dispatcher.process_flushed_records(batch(vec![operation(5), barrier(6)]));

        dispatcher.wait_for_barriers(2).await;
        assert_eq!(provider.apply_count.load(Ordering::Acquire), 6);
        assert_eq!(provider.unlock_count.load(Ordering::Acquire), 6);
    }

    #[tokio::test]
    async fn pause_blocks_new_groups_and_continue_resumes() {
        let provider = TestProvider::new();
        let dispatcher = RecordsDispatcher::new(provider.clone(), DispatchMode::Serial);

        dispatcher.process_flushed_records(batch(vec![operation(1), barrier(2)]));
        dispatcher.wait_for_barriers(1).await;

        dispatcher.drain_and_pause().await;
        dispatcher.process_flushed_records(batch(vec![operation(3), barrier(4)]));
        tokio::time::sleep(Duration::from_millis(50)).await;
        // The queued group waits while paused.
        assert_eq!(dispatcher.dispatched_barrier_count(), 1);
        assert_eq!(provider.apply_count.load(Ordering::Acquire), 2);

        dispatcher.continue_dispatch();
        dispatcher.wait_for_barriers(2).await;
        assert_eq!(provider.apply_count.load(Ordering::Acquire), 4);
    }

    #[tokio::test]
    async fn pause_without_records_completes_immediately() {
        let provider = TestProvider::new();
        let dispatcher = RecordsDispatcher::new(provider.clone(), DispatchMode::Serial);
        dispatcher.drain_and_pause().await;
        dispatcher.continue_dispatch();
        dispatcher.process_flushed_records(batch(vec![barrier(1)]));
        dispatcher.wait_for_barriers(1).await;
    }

    #[tokio::test]
    async fn ten_thousand_records_dispatch_in_order() {
        let provider = TestProvider::new();
        let dispatcher = RecordsDispatcher::new(provider.clone(), DispatchMode::Serial);

        let mut lsn = 0i64;
        for _ in 0..100 {
            let mut records = Vec::with_capacity(100);
            for _ in 0..99 {
                lsn += 1;
                records.push(operation(lsn));
            }
            lsn += 1;
            records.push(barrier(lsn));
            dispatcher.process_flushed_records(batch(records));
        }
        dispatcher.wait_for_barriers(100).await;

        let applied = provider.applied.lock().unwrap();
        assert_eq!(applied.len(), 10_000);
        for (index, applied_lsn) in applied.iter().enumerate() {
            assert_eq!(applied_lsn.as_i64(), index as i64 + 1);
        }
    }

    #[tokio::test]
    async fn two_thousand_consecutive_barriers_keep_the_stack_flat() {
        let provider = TestProvider::new();
        let dispatcher = RecordsDispatcher::new(provider.clone(), DispatchMode::Parallel);

        for lsn in 1..=2000 {
            dispatcher.process_flushed_records(batch(vec![barrier(lsn)]));
        }
        dispatcher.wait_for_barriers(2000).await;
        assert_eq!(dispatcher.dispatched_barrier_count(), 2000);
        assert_eq!(provider.apply_count.load(Ordering::Acquire), 2000);
    }
}
