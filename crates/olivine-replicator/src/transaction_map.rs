//! Index of pending and completed transactions.
//!
//! Each transaction moves through exactly one of three states: **pending**
//! (begin record seen, no end yet), **completed-unstable** (end record
//! seen, not yet covered by a barrier), and **stable** (covered; dropped
//! from the map). Barrier advancement drives the unstable→stable
//! transition through [`TransactionMap::remove_stable_transactions`].
//!
//! Per-transaction record chains are held as vectors in insertion order,
//! so walking or freeing a chain of 10⁴+ operations never recurses.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use olivine_records::{LogRecord, RecordKind};
use olivine_types::{Lsn, RecordPosition, TransactionId};

struct PendingTransaction {
    /// Begin record first, then operations in insertion order.
    chain: Vec<Arc<LogRecord>>,
}

impl PendingTransaction {
    fn begin(&self) -> &Arc<LogRecord> {
        &self.chain[0]
    }

    fn latest(&self) -> &Arc<LogRecord> {
        self.chain.last().expect("chain never empty")
    }
}

struct CompletedTransaction {
    transaction_id: TransactionId,
    end_lsn: Lsn,
    end_record: Arc<LogRecord>,
    /// Retained until stable so a tail rewind can resurrect the chain.
    chain: Vec<Arc<LogRecord>>,
}

#[derive(Default)]
struct MapInner {
    pending: HashMap<TransactionId, PendingTransaction>,
    /// Begin-record LSN → transaction, for earliest-pending queries.
    pending_by_lsn: BTreeMap<Lsn, TransactionId>,
    /// Completed but not yet stable, ordered by completion.
    completed: Vec<CompletedTransaction>,
}

/// Thread-safe transaction index. Mutations serialize internally; list
/// queries return snapshots.
#[derive(Default)]
pub struct TransactionMap {
    inner: Mutex<MapInner>,
}

impl TransactionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a begin-transaction record as pending.
    ///
    /// # Panics
    ///
    /// A duplicate transaction id is a coding error upstream.
    pub fn create_transaction(&self, begin_record: Arc<LogRecord>) {
        assert_eq!(begin_record.kind(), RecordKind::BeginTransaction);
        let transaction_id = begin_record
            .transaction_id()
            .expect("begin record carries a transaction id");

        let mut inner = self.inner.lock().expect("transaction map lock poisoned");
        inner.pending_by_lsn.insert(begin_record.lsn(), transaction_id);
        let previous = inner.pending.insert(
            transaction_id,
            PendingTransaction {
                chain: vec![begin_record],
            },
        );
        assert!(
            previous.is_none(),
            "transaction {transaction_id} created twice"
        );
    }

    /// Links an operation record into its transaction's chain.
    pub fn add_operation(&self, operation_record: Arc<LogRecord>) {
        assert_eq!(operation_record.kind(), RecordKind::Operation);
        let transaction_id = operation_record
            .transaction_id()
            .expect("operation record carries a transaction id");

        let mut inner = self.inner.lock().expect("transaction map lock poisoned");
        let pending = inner
            .pending
            .get_mut(&transaction_id)
            .unwrap_or_else(|| panic!("operation for unknown transaction {transaction_id}"));
        pending.chain.push(operation_record);
    }

    /// Moves a transaction from pending to completed-unstable.
    pub fn complete_transaction(&self, end_record: Arc<LogRecord>) {
        assert_eq!(end_record.kind(), RecordKind::EndTransaction);
        let transaction_id = end_record
            .transaction_id()
            .expect("end record carries a transaction id");

        let mut inner = self.inner.lock().expect("transaction map lock poisoned");
        let pending = inner
            .pending
            .remove(&transaction_id)
            .unwrap_or_else(|| panic!("completing unknown transaction {transaction_id}"));
        let begin_lsn = pending.begin().lsn();
        inner.pending_by_lsn.remove(&begin_lsn);
        inner.completed.push(CompletedTransaction {
            transaction_id,
            end_lsn: end_record.lsn(),
            end_record,
            chain: pending.chain,
        });
    }

    /// Discards completed transactions whose end LSN is at or below the
    /// barrier. Idempotent.
    pub fn remove_stable_transactions(&self, barrier_lsn: Lsn) {
        let mut inner = self.inner.lock().expect("transaction map lock poisoned");
        inner
            .completed
            .retain(|completed| completed.end_lsn > barrier_lsn);
    }

    /// The oldest pending transaction's begin record.
    ///
    /// When `barrier_lsn` is supplied and the earliest pending began at or
    /// below `barrier_lsn + 1`, returns `None` with
    /// `failed_barrier_check = true` — the diagnostic checkpointing uses
    /// to detect transactions outliving the stability point. A begin
    /// record immediately after the barrier still trips the check: its
    /// transaction straddles the stability point.
    pub fn get_earliest_pending_transaction(
        &self,
        barrier_lsn: Option<Lsn>,
    ) -> (Option<Arc<LogRecord>>, bool) {
        let inner = self.inner.lock().expect("transaction map lock poisoned");
        let Some((&begin_lsn, transaction_id)) = inner.pending_by_lsn.first_key_value() else {
            return (None, false);
        };
        if let Some(barrier_lsn) = barrier_lsn
            && begin_lsn <= barrier_lsn + 1
        {
            return (None, true);
        }
        let begin = inner.pending[transaction_id].begin().clone();
        (Some(begin), false)
    }

    /// Every record of every pending transaction, ordered by LSN.
    pub fn get_pending_records(&self) -> Vec<Arc<LogRecord>> {
        let inner = self.inner.lock().expect("transaction map lock poisoned");
        let mut records: Vec<Arc<LogRecord>> = inner
            .pending
            .values()
            .flat_map(|pending| pending.chain.iter().cloned())
            .collect();
        records.sort_by_key(|record| record.lsn());
        records
    }

    /// End records of completed-but-unstable transactions.
    pub fn get_completed_records(&self) -> Vec<Arc<LogRecord>> {
        let inner = self.inner.lock().expect("transaction map lock poisoned");
        inner
            .completed
            .iter()
            .map(|completed| completed.end_record.clone())
            .collect()
    }

    /// Begin records of all pending transactions, ordered by LSN.
    pub fn get_pending_transactions(&self) -> Vec<Arc<LogRecord>> {
        let inner = self.inner.lock().expect("transaction map lock poisoned");
        inner
            .pending_by_lsn
            .values()
            .map(|transaction_id| inner.pending[transaction_id].begin().clone())
            .collect()
    }

    /// Pending transactions whose begin record was flushed before
    /// `position`.
    pub fn get_pending_transactions_older_than_position(
        &self,
        position: RecordPosition,
    ) -> Vec<Arc<LogRecord>> {
        self.get_pending_transactions()
            .into_iter()
            .filter(|begin| begin.is_flushed() && begin.record_position() < position)
            .collect()
    }

    /// The most recent record in a pending transaction's chain.
    pub fn latest_record(&self, transaction_id: TransactionId) -> Option<Arc<LogRecord>> {
        let inner = self.inner.lock().expect("transaction map lock poisoned");
        inner
            .pending
            .get(&transaction_id)
            .map(|pending| pending.latest().clone())
    }

    /// Reverses one operation during tail truncation: the chain's latest
    /// record (which must match `record` by LSN) is unlinked.
    pub fn false_progress_apply(&self, record: &Arc<LogRecord>) {
        let transaction_id = record
            .transaction_id()
            .expect("false progress applies to transactional records");
        let mut inner = self.inner.lock().expect("transaction map lock poisoned");
        let pending = inner
            .pending
            .get_mut(&transaction_id)
            .unwrap_or_else(|| panic!("false progress on unknown transaction {transaction_id}"));
        assert!(
            pending.chain.len() > 1,
            "cannot unlink the begin record of transaction {transaction_id}"
        );
        let removed = pending.chain.pop().expect("chain never empty");
        assert_eq!(
            removed.lsn(),
            record.lsn(),
            "false progress must unwind the chain from its latest record"
        );
    }

    /// Reverses a transaction's creation during tail truncation. The
    /// chain must be down to its begin record.
    pub fn false_progress_begin(&self, begin_record: &Arc<LogRecord>) {
        let transaction_id = begin_record
            .transaction_id()
            .expect("begin record carries a transaction id");
        let mut inner = self.inner.lock().expect("transaction map lock poisoned");
        let pending = inner
            .pending
            .remove(&transaction_id)
            .unwrap_or_else(|| panic!("false progress on unknown transaction {transaction_id}"));
        assert_eq!(
            pending.chain.len(),
            1,
            "transaction {transaction_id} still has operations to unwind"
        );
        let begin_lsn = pending.begin().lsn();
        inner.pending_by_lsn.remove(&begin_lsn);
    }

    /// Reverses a completion during tail truncation: the transaction moves
    /// back from completed-unstable to pending.
    pub fn false_progress_complete(&self, end_record: &Arc<LogRecord>) {
        let transaction_id = end_record
            .transaction_id()
            .expect("end record carries a transaction id");
        let mut inner = self.inner.lock().expect("transaction map lock poisoned");
        let index = inner
            .completed
            .iter()
            .position(|completed| completed.transaction_id == transaction_id)
            .unwrap_or_else(|| {
                panic!("reversing completion of unknown transaction {transaction_id}")
            });
        let completed = inner.completed.swap_remove(index);
        let begin_lsn = completed.chain[0].lsn();
        inner.pending_by_lsn.insert(begin_lsn, transaction_id);
        inner.pending.insert(
            transaction_id,
            PendingTransaction {
                chain: completed.chain,
            },
        );
    }

    pub fn pending_count(&self) -> usize {
        self.inner
            .lock()
            .expect("transaction map lock poisoned")
            .pending
            .len()
    }

    pub fn completed_count(&self) -> usize {
        self.inner
            .lock()
            .expect("transaction map lock poisoned")
            .completed
            .len()
    }
}

#[cfg(test)]
mod tests {
    use olivine_records::{
        BeginTransactionBody, EndTransactionBody, OperationBody, OperationData, RecordBody,
    };

    use super::*;

    fn begin(tx: i64, lsn: i64) -> Arc<LogRecord> {
        Arc::new(LogRecord::with_lsn(
            RecordBody::BeginTransaction(BeginTransactionBody {
                transaction_id: TransactionId::new(tx),
                is_single_operation: false,
                metadata: Some(OperationData::from_slice(b"m")),
                undo: None,
                redo: None,
            }),
            Lsn::new(lsn),
        ))
    }

    fn operation(tx: i64, lsn: i64) -> Arc<LogRecord> {
        Arc::new(LogRecord::with_lsn(
            RecordBody::Operation(OperationBody {
                transaction_id: TransactionId::new(tx),
                metadata: None,
                undo: None,
                redo: Some(OperationData::from_slice(b"r")),
            }),
            Lsn::new(lsn),
        ))
    }

    fn end(tx: i64, lsn: i64, committed: bool) -> Arc<LogRecord> {
        Arc::new(LogRecord::with_lsn(
            RecordBody::EndTransaction(EndTransactionBody {
                transaction_id: TransactionId::new(tx),
                is_committed: committed,
            }),
            Lsn::new(lsn),
        ))
    }

    #[test]
    fn single_operation_chain() {
        let map = TransactionMap::new();
        let begin_record = begin(1, 10);
        map.create_transaction(begin_record.clone());
        assert_eq!(
            map.latest_record(TransactionId::new(1)).unwrap().lsn(),
            Lsn::new(10)
        );

        let op = operation(1, 11);
        map.add_operation(op.clone());
        assert_eq!(
            map.latest_record(TransactionId::new(1)).unwrap().lsn(),
            Lsn::new(11)
        );
    }

    #[test]
    fn chain_of_three_operations_walks_in_order() {
        let map = TransactionMap::new();
        map.create_transaction(begin(1, 10));
        for lsn in 11..14 {
            map.add_operation(operation(1, lsn));
        }

        let records = map.get_pending_records();
        let lsns: Vec<i64> = records.iter().map(|r| r.lsn().as_i64()).collect();
        assert_eq!(lsns, vec![10, 11, 12, 13]);
    }

    #[test]
    fn transactions_move_through_the_three_states() {
        let map = TransactionMap::new();
        map.create_transaction(begin(1, 10));
        map.create_transaction(begin(2, 20));
        assert_eq!(map.pending_count(), 2);
        assert_eq!(map.completed_count(), 0);

        map.complete_transaction(end(1, 30, true));
        assert_eq!(map.pending_count(), 1);
        assert_eq!(map.completed_count(), 1);
        assert_eq!(map.get_completed_records()[0].lsn(), Lsn::new(30));

        // Barrier below the end LSN leaves it unstable.
        map.remove_stable_transactions(Lsn::new(29));
        assert_eq!(map.completed_count(), 1);

        // Barrier at the end LSN makes it stable.
        map.remove_stable_transactions(Lsn::new(30));
        assert_eq!(map.completed_count(), 0);

        // Idempotent.
        map.remove_stable_transactions(Lsn::new(30));
        assert_eq!(map.completed_count(), 0);
    }

    #[test]
    fn earliest_pending_transaction_and_barrier_check() {
        let map = TransactionMap::new();
        assert_eq!(map.get_earliest_pending_transaction(None), (None, false));

        map.create_transaction(begin(1, 10));
        map.create_transaction(begin(2, 20));

        let (earliest, failed) = map.get_earliest_pending_transaction(None);
        assert_eq!(earliest.unwrap().lsn(), Lsn::new(10));
        assert!(!failed);

        // Earliest pending began at or below the barrier: diagnostic trips.
        let (earliest, failed) = map.get_earliest_pending_transaction(Some(Lsn::new(15)));
        assert!(earliest.is_none());
        assert!(failed);

        // Boundary: a begin record right after the barrier still trips it.
        let (earliest, failed) = map.get_earliest_pending_transaction(Some(Lsn::new(9)));
        assert!(earliest.is_none());
        assert!(failed);

        // Barrier comfortably below every pending begin: clean answer.
        let (earliest, failed) = map.get_earliest_pending_transaction(Some(Lsn::new(5)));
        assert_eq!(earliest.unwrap().lsn(), Lsn::new(10));
        assert!(!failed);
    }

    #[test]
    fn pending_queries_filter_by_position() {
        let map = TransactionMap::new();
        let flushed = begin(1, 10);
        flushed.set_record_position(100);
        map.create_transaction(flushed);

        let unflushed = begin(2, 20);
        map.create_transaction(unflushed);

        let pending = map.get_pending_transactions();
        assert_eq!(pending.len(), 2);

        let old = map.get_pending_transactions_older_than_position(500);
        assert_eq!(old.len(), 1);
        assert_eq!(old[0].lsn(), Lsn::new(10));

        let old = map.get_pending_transactions_older_than_position(50);
        assert!(old.is_empty());
    }

    #[test]
    fn false_progress_unwinds_operations_and_completion() {
        let map = TransactionMap::new();
        map.create_transaction(begin(1, 10));
        map.add_operation(operation(1, 11));
        let op2 = operation(1, 12);
        map.add_operation(op2.clone());
        map.complete_transaction(end(1, 13, true));
        assert_eq!(map.pending_count(), 0);

        // Tail rewind: the end record and the last operation come back out.
        map.false_progress_complete(&end(1, 13, true));
        assert_eq!(map.pending_count(), 1);
        map.false_progress_apply(&op2);
        assert_eq!(
            map.latest_record(TransactionId::new(1)).unwrap().lsn(),
            Lsn::new(11)
        );
    }

    #[test]
    fn ten_thousand_operations_in_one_transaction() {
        let map = TransactionMap::new();
        map.create_transaction(begin(1, 0));
        for lsn in 1..=10_000 {
            map.add_operation(operation(1, lsn));
        }
        assert_eq!(
            map.latest_record(TransactionId::new(1)).unwrap().lsn(),
            Lsn::new(10_000)
        );
        assert_eq!(map.get_pending_records().len(), 10_001);

        // Completion and stabilization drop the whole chain without
        // recursing through it.
        map.complete_transaction(end(1, 10_001, false));
        map.remove_stable_transactions(Lsn::new(10_001));
        assert_eq!(map.pending_count(), 0);
        assert_eq!(map.completed_count(), 0);
    }

    #[test]
    #[should_panic(expected = "created twice")]
    fn duplicate_transaction_is_a_coding_error() {
        let map = TransactionMap::new();
        map.create_transaction(begin(1, 10));
        map.create_transaction(begin(1, 11));
    }
}
