//! Checkpoint, indexing, truncation, and throttling policy.
//!
//! A pure policy engine over the replicated log manager's state: every
//! query recomputes from current positions and the configured thresholds.
//! Nothing here mutates the log; callers act on the answers (insert an
//! index record, start a checkpoint, propose a head).

use std::sync::Arc;

use olivine_config::ReplicatorSettings;
use olivine_log::LogStore;
use olivine_records::LogRecord;
use olivine_types::Lsn;
use tokio_util::sync::CancellationToken;

use crate::log_manager::ReplicatedLogManager;
use crate::transaction_map::TransactionMap;
use crate::ReplicatorError;

/// Index points are placed this fraction of the checkpoint threshold
/// apart, keeping head-candidate granularity well below checkpoint
/// granularity.
const INDEX_INTERVAL_DIVISOR: u64 = 50;

/// Threshold-driven policy over a [`ReplicatedLogManager`].
pub struct LogTruncationManager<S: LogStore> {
    log_manager: Arc<ReplicatedLogManager<S>>,
    settings: ReplicatorSettings,
}

impl<S: LogStore> LogTruncationManager<S> {
    pub fn new(
        log_manager: Arc<ReplicatedLogManager<S>>,
        settings: ReplicatorSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            log_manager,
            settings,
        })
    }

    pub fn settings(&self) -> &ReplicatorSettings {
        &self.settings
    }

    fn index_interval_bytes(&self) -> u64 {
        (self.settings.checkpoint_threshold_bytes() / INDEX_INTERVAL_DIVISOR).max(1)
    }

    fn tail_position(&self) -> u64 {
        self.log_manager.writer().store().tail_position()
    }

    /// Bytes of log written since the most recent checkpoint began (the
    /// whole retained log when none has).
    fn bytes_since_last_checkpoint(&self) -> u64 {
        let anchor = self
            .log_manager
            .in_progress_checkpoint()
            .or_else(|| self.log_manager.last_completed_checkpoint())
            .filter(|checkpoint| checkpoint.is_flushed())
            .map_or_else(
                || self.log_manager.head_position(),
                |checkpoint| checkpoint.record_position(),
            );
        self.tail_position().saturating_sub(anchor)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// True when no usable index point exists or the last one is further
    /// behind the tail than the indexing interval.
    pub fn should_index(&self) -> bool {
        match self.log_manager.last_index_record() {
            None => true,
            Some(index) => {
                if !index.is_flushed() {
                    // One is already on its way to disk.
                    return false;
                }
                self.tail_position() - index.record_position() > self.index_interval_bytes()
            }
        }
    }

    /// Checkpoint trigger for the primary. Alongside the decision, returns
    /// the pending transactions old enough that aborting them would let
    /// the next truncation make progress.
    pub fn should_checkpoint_on_primary(
        &self,
        transaction_map: &TransactionMap,
    ) -> (bool, Vec<Arc<LogRecord>>) {
        if !self.checkpoint_size_trigger() {
            return (false, Vec::new());
        }
        (true, self.get_old_transactions(transaction_map))
    }

    pub fn should_checkpoint_on_secondary(&self, _transaction_map: &TransactionMap) -> bool {
        self.checkpoint_size_trigger()
    }

    fn checkpoint_size_trigger(&self) -> bool {
        if self.log_manager.in_progress_checkpoint().is_some() {
            return false;
        }
        self.bytes_since_last_checkpoint() > self.settings.checkpoint_threshold_bytes()
    }

    /// True when enough log has accumulated above the head to make a
    /// truncation worthwhile, and none is already in flight.
    pub fn should_truncate_head(&self) -> bool {
        if self.log_manager.in_progress_truncate_head().is_some() {
            return false;
        }
        if self.log_manager.in_progress_checkpoint().is_some() {
            return false;
        }
        self.log_manager.log_usage() > self.settings.truncation_threshold_bytes()
    }

    /// Throttle signal for producers. Writes are never dropped.
    pub fn should_block_operations_on_primary(&self) -> bool {
        self.log_manager.log_usage() > self.settings.throttle_threshold_bytes()
            || self.log_manager.writer().should_throttle_writes()
    }

    /// A proposed head is acceptable when it is durable, truncating to it
    /// reclaims at least the minimum log size, and it still leaves the
    /// minimum log size retained above it.
    pub fn is_good_log_head_candidate(&self, candidate: &Arc<LogRecord>) -> bool {
        if !candidate.is_flushed() {
            return false;
        }
        let candidate_position = candidate.record_position();
        let head_position = self.log_manager.head_position();
        let tail_position = self.tail_position();

        let reclaimed = candidate_position.saturating_sub(head_position);
        if reclaimed < self.settings.min_log_size_bytes() {
            return false;
        }
        let retained = tail_position.saturating_sub(candidate_position);
        retained >= self.settings.min_log_size_bytes()
    }

    /// The head-candidacy predicate as a callable, for the log manager's
    /// recovery and truncation paths.
    pub fn good_log_head_candidate_calculator(
        self: Arc<Self>,
    ) -> impl Fn(&Arc<LogRecord>) -> bool + Send + Sync + use<S> {
        move |candidate| self.is_good_log_head_candidate(candidate)
    }

    /// Pending transactions that began in the older half of the retained
    /// log; aborting them unblocks head truncation.
    pub fn get_old_transactions(&self, transaction_map: &TransactionMap) -> Vec<Arc<LogRecord>> {
        let head_position = self.log_manager.head_position();
        let cutoff = head_position + self.log_manager.log_usage() / 2;
        transaction_map.get_pending_transactions_older_than_position(cutoff)
    }

    /// Holds the secondary's apply pump while a checkpoint that began at
    /// or below `lsn` is still in progress. Returns immediately otherwise.
    /// Cancellation is honored at the suspension point.
    pub async fn block_secondary_pump_if_needed(
        &self,
        lsn: Lsn,
        cancel: &CancellationToken,
    ) -> Result<(), ReplicatorError> {
        loop {
            let completed = self.log_manager.checkpoint_completed_notified();
            match self.log_manager.in_progress_checkpoint() {
                Some(checkpoint) if checkpoint.lsn() <= lsn => {
                    tracing::debug!(
                        pump_lsn = %lsn,
                        checkpoint_lsn = %checkpoint.lsn(),
                        "secondary pump waiting for checkpoint completion"
                    );
                    tokio::select! {
                        () = completed => {}
                        () = cancel.cancelled() => return Err(ReplicatorError::Canceled),
                    }
                }
                _ => return Ok(()),
            }
        }
    }
}
