//! Epoch history and the copy-mode negotiation.
//!
//! A [`ProgressVector`] records every epoch transition a replica has
//! observed, with the LSN at which each took effect. During catch-up the
//! source (primary) and target (idle secondary) compare vectors to find
//! the latest point their histories agree on, then decide how much log the
//! target needs: nothing, a partial range, a partial range preceded by
//! undo of the target's false progress, or a full state copy.
//!
//! [`ProgressVector::find_copy_mode`] is a pure function: identical inputs
//! produce identical outputs, which is how the two sides of the
//! negotiation converge without explicit agreement.

use std::cmp::min;
use std::fmt::{self, Display, Write as _};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use olivine_types::{Epoch, Lsn, ReplicaId};

use crate::RecordError;

// ============================================================================
// Entries
// ============================================================================

/// One epoch transition: the epoch, the LSN at which it began, which
/// replica was primary, and when this replica observed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProgressVectorEntry {
    pub epoch: Epoch,
    pub lsn: Lsn,
    pub primary_replica_id: ReplicaId,
    pub timestamp_secs: i64,
}

impl ProgressVectorEntry {
    pub const fn new(
        epoch: Epoch,
        lsn: Lsn,
        primary_replica_id: ReplicaId,
        timestamp_secs: i64,
    ) -> Self {
        Self {
            epoch,
            lsn,
            primary_replica_id,
            timestamp_secs,
        }
    }

    /// The entry every fresh replica starts with.
    pub const fn zero() -> Self {
        Self::new(Epoch::ZERO, Lsn::ZERO, ReplicaId::new(0), 0)
    }

    /// Two replicas share progress when they agree on the epoch and the
    /// LSN it began at. Primary id and timestamp are each replica's local
    /// view and may differ legitimately.
    fn shares_progress_with(&self, other: &ProgressVectorEntry) -> bool {
        self.epoch == other.epoch && self.lsn == other.lsn
    }
}

impl Display for ProgressVectorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}@{} p{}]",
            self.epoch, self.lsn, self.primary_replica_id
        )
    }
}

// ============================================================================
// Shared-point search
// ============================================================================

/// Outcome of the shared-point walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SharedVectorStatus {
    /// A shared entry was found.
    Found,
    /// One side's history was trimmed past any possible shared point.
    Trimmed,
    /// The vectors disagree where they must agree.
    ValidationFailed(&'static str),
}

/// The latest point two progress vectors agree on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedProgressVectorEntry {
    pub source_index: usize,
    pub target_index: usize,
    pub source_entry: ProgressVectorEntry,
    pub target_entry: ProgressVectorEntry,
    pub status: SharedVectorStatus,
}

impl SharedProgressVectorEntry {
    fn not_found(status: SharedVectorStatus) -> Self {
        Self {
            source_index: 0,
            target_index: 0,
            source_entry: ProgressVectorEntry::zero(),
            target_entry: ProgressVectorEntry::zero(),
            status,
        }
    }
}

// ============================================================================
// Copy mode
// ============================================================================

/// How much the target needs from the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMode {
    /// Nothing to copy; the target is already caught up.
    None,
    /// Replay a log range; `false_progress` means the target must first
    /// undo records past the shared history.
    Partial { false_progress: bool },
    /// The log cannot bridge the gap; ship full state.
    Full,
}

/// Why a full copy was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullCopyReason {
    /// Target sits at an epoch the source cannot replay it out of.
    Other,
    /// A data-loss epoch follows the shared point on either side.
    DataLoss,
    /// A log head has advanced past the range the copy would need.
    InsufficientLogs,
    /// The vectors were trimmed past any possible shared point.
    ProgressVectorTrimmed,
    /// Undoing the target's false progress would undo an atomic redo
    /// operation, which is unsafe.
    AtomicRedoOperationFalseProgressed,
    /// The vectors disagree where they must agree.
    ValidationFailed,
}

/// Decision produced by [`ProgressVector::find_copy_mode`].
#[derive(Debug, Clone, PartialEq)]
pub struct CopyModeResult {
    pub mode: CopyMode,
    pub full_copy_reason: Option<FullCopyReason>,
    pub shared: SharedProgressVectorEntry,
    /// First LSN the source replays from (`INVALID` for none/full).
    pub source_starting_lsn: Lsn,
    /// LSN the target currently stands at, or must undo back to
    /// (`INVALID` for none/full).
    pub target_starting_lsn: Lsn,
}

impl CopyModeResult {
    fn full(shared: SharedProgressVectorEntry, reason: FullCopyReason) -> Self {
        Self {
            mode: CopyMode::Full,
            full_copy_reason: Some(reason),
            shared,
            source_starting_lsn: Lsn::INVALID,
            target_starting_lsn: Lsn::INVALID,
        }
    }

    fn none(shared: SharedProgressVectorEntry) -> Self {
        Self {
            mode: CopyMode::None,
            full_copy_reason: None,
            shared,
            source_starting_lsn: Lsn::INVALID,
            target_starting_lsn: Lsn::INVALID,
        }
    }

    fn partial(
        shared: SharedProgressVectorEntry,
        false_progress: bool,
        source_starting_lsn: Lsn,
        target_starting_lsn: Lsn,
    ) -> Self {
        Self {
            mode: CopyMode::Partial { false_progress },
            full_copy_reason: None,
            shared,
            source_starting_lsn,
            target_starting_lsn,
        }
    }
}

/// A replica's view of its own log, exchanged during copy negotiation.
#[derive(Debug, Clone, Copy)]
pub struct CopyContextParameters<'a> {
    pub progress_vector: &'a ProgressVector,
    pub log_head_epoch: Epoch,
    pub log_head_lsn: Lsn,
    pub current_tail_lsn: Lsn,
}

// ============================================================================
// ProgressVector
// ============================================================================

/// Append-only sequence of epoch transitions, strictly increasing in
/// epoch. May be trimmed from the front once the log head and backups have
/// moved past old epochs.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProgressVector {
    entries: Vec<ProgressVectorEntry>,
}

impl ProgressVector {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// A vector seeded with the zero entry, as every fresh replica starts.
    pub fn with_zero_entry() -> Self {
        Self {
            entries: vec![ProgressVectorEntry::zero()],
        }
    }

    pub fn append(&mut self, entry: ProgressVectorEntry) {
        if let Some(last) = self.entries.last() {
            assert!(
                entry.epoch > last.epoch,
                "progress vector entries must be strictly increasing in epoch: {} then {}",
                last.epoch,
                entry.epoch
            );
        }
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ProgressVectorEntry] {
        &self.entries
    }

    pub fn last_entry(&self) -> Option<&ProgressVectorEntry> {
        self.entries.last()
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// The epoch under which `lsn` was written: the latest entry whose
    /// transition LSN is strictly below it. A record at the transition LSN
    /// itself was written under the previous epoch.
    ///
    /// Returns [`Epoch::INVALID`] when the vector has been trimmed past
    /// the answer (or never covered it).
    pub fn find_epoch(&self, lsn: Lsn) -> Epoch {
        self.entries
            .iter()
            .rev()
            .find(|entry| entry.lsn < lsn)
            .map_or(Epoch::INVALID, |entry| entry.epoch)
    }

    /// Finds the latest entry `source` and `target` agree on.
    ///
    /// Both cursors start at the tails; the side with the higher epoch
    /// steps back. Equal epochs whose transition LSNs disagree mean the
    /// two replicas made different progress under one epoch; both cursors
    /// step back and the disagreement is counted — more than one is a
    /// validation failure. Running off either end means that side's
    /// history was trimmed past the shared point.
    ///
    /// Symmetric in its arguments: swapping source and target swaps the
    /// indices and entries but finds the same shared point.
    pub fn find_shared_vector(
        source: &ProgressVector,
        target: &ProgressVector,
    ) -> SharedProgressVectorEntry {
        if source.is_empty() || target.is_empty() {
            return SharedProgressVectorEntry::not_found(SharedVectorStatus::Trimmed);
        }

        let mut source_index = source.len() - 1;
        let mut target_index = target.len() - 1;
        let mut progress_disagreements = 0usize;

        loop {
            let source_entry = &source.entries[source_index];
            let target_entry = &target.entries[target_index];

            if source_entry.epoch > target_entry.epoch {
                if source_index == 0 {
                    return SharedProgressVectorEntry::not_found(SharedVectorStatus::Trimmed);
                }
                source_index -= 1;
            } else if target_entry.epoch > source_entry.epoch {
                if target_index == 0 {
                    return SharedProgressVectorEntry::not_found(SharedVectorStatus::Trimmed);
                }
                target_index -= 1;
            } else if !source_entry.shares_progress_with(target_entry) {
                progress_disagreements += 1;
                if source_index == 0 || target_index == 0 {
                    return SharedProgressVectorEntry::not_found(SharedVectorStatus::Trimmed);
                }
                source_index -= 1;
                target_index -= 1;
            } else {
                break;
            }
        }

        let status = if progress_disagreements > 1 {
            SharedVectorStatus::ValidationFailed(
                "progress under a shared epoch diverged more than once",
            )
        } else {
            SharedVectorStatus::Found
        };

        SharedProgressVectorEntry {
            source_index,
            target_index,
            source_entry: source.entries[source_index],
            target_entry: target.entries[target_index],
            status,
        }
    }

    /// Decides how a target replica catches up from a source.
    ///
    /// Pure: identical inputs yield identical results byte-for-byte, so
    /// both ends of the negotiation reach the same conclusion
    /// independently. Full-copy outcomes carry a reason instead of an
    /// error; the caller logs it and proceeds.
    pub fn find_copy_mode(
        source: &CopyContextParameters<'_>,
        target: &CopyContextParameters<'_>,
        last_recovered_atomic_redo_lsn_on_target: Lsn,
    ) -> CopyModeResult {
        let source_vector = source.progress_vector;
        let target_vector = target.progress_vector;

        let shared = Self::find_shared_vector(source_vector, target_vector);
        match shared.status {
            SharedVectorStatus::Trimmed => {
                return CopyModeResult::full(shared, FullCopyReason::ProgressVectorTrimmed);
            }
            SharedVectorStatus::ValidationFailed(_) => {
                return CopyModeResult::full(shared, FullCopyReason::ValidationFailed);
            }
            SharedVectorStatus::Found => {}
        }

        // The copy source must have observed at least everything the
        // target has; a target ahead of its source is a coding error
        // upstream, degraded to a full copy here.
        let source_last = source_vector.last_entry().copied().unwrap_or_default();
        let target_last = target_vector.last_entry().copied().unwrap_or_default();
        if target_last.epoch > source_last.epoch {
            let mut shared = shared;
            shared.status = SharedVectorStatus::ValidationFailed(
                "target observed an epoch later than the source's latest",
            );
            return CopyModeResult::full(shared, FullCopyReason::ValidationFailed);
        }

        // Brand-new target: nothing to reconcile, replay everything the
        // source still has. A truncated source head means it no longer
        // has everything.
        if target.current_tail_lsn == Lsn::ONE {
            if source.log_head_lsn != Lsn::ZERO {
                return CopyModeResult::full(shared, FullCopyReason::InsufficientLogs);
            }
            return CopyModeResult::partial(shared, false, source_last.lsn, Lsn::ONE);
        }

        // First LSN after the shared point on each side: the next entry's
        // transition LSN, or the tail when the shared point is the last
        // entry.
        let source_next = if shared.source_index == source_vector.len() - 1 {
            source.current_tail_lsn
        } else {
            source_vector.entries[shared.source_index + 1].lsn
        };
        let target_next = if shared.target_index == target_vector.len() - 1 {
            target.current_tail_lsn
        } else {
            target_vector.entries[shared.target_index + 1].lsn
        };

        // Same history, same tail: nothing to copy.
        if shared.source_index == source_vector.len() - 1
            && shared.target_index == target_vector.len() - 1
            && source.current_tail_lsn == target.current_tail_lsn
        {
            return CopyModeResult::none(shared);
        }

        // A data-loss bump after the shared point invalidates log replay
        // entirely.
        let shared_data_loss = shared.source_entry.epoch.data_loss;
        if source_last.epoch.data_loss != shared_data_loss
            || target_last.epoch.data_loss != shared_data_loss
        {
            return CopyModeResult::full(shared, FullCopyReason::DataLoss);
        }

        // Target wrote records beyond the point where the source's history
        // moved on: false progress, resolved by undoing back to the
        // divergence point and replaying from there.
        if source_next < target_next {
            if source.log_head_lsn > source_next || target.log_head_lsn > source_next {
                return CopyModeResult::full(shared, FullCopyReason::InsufficientLogs);
            }
            if last_recovered_atomic_redo_lsn_on_target.is_valid()
                && last_recovered_atomic_redo_lsn_on_target > source_next
            {
                return CopyModeResult::full(
                    shared,
                    FullCopyReason::AtomicRedoOperationFalseProgressed,
                );
            }
            return CopyModeResult::partial(shared, true, source_next, target_next);
        }

        // Target has epoch transitions the source never observed.
        if shared.target_index < target_vector.len() - 1 {
            if target.current_tail_lsn == target_next {
                // It stopped right at the unknown transition; there is no
                // record range the source could replace it with.
                return CopyModeResult::full(shared, FullCopyReason::Other);
            }
            if source.log_head_lsn > target_next || target.log_head_lsn > target_next {
                return CopyModeResult::full(shared, FullCopyReason::InsufficientLogs);
            }
            if last_recovered_atomic_redo_lsn_on_target.is_valid()
                && last_recovered_atomic_redo_lsn_on_target > target_next
            {
                return CopyModeResult::full(
                    shared,
                    FullCopyReason::AtomicRedoOperationFalseProgressed,
                );
            }
            return CopyModeResult::partial(shared, true, target_next, target_next);
        }

        // Plain catch-up: replay (target_next, source tail].
        if source.log_head_lsn > target_next {
            return CopyModeResult::full(shared, FullCopyReason::InsufficientLogs);
        }
        CopyModeResult::partial(shared, false, source_next, target_next)
    }

    // ------------------------------------------------------------------
    // Trimming
    // ------------------------------------------------------------------

    /// Drops entries no longer needed by `find_epoch` over the retained
    /// log or by incremental backup chains.
    ///
    /// Only acts when the vector exceeds `max_entries` (zero disables).
    /// Entries strictly older than both the log-head epoch and the
    /// last-backed-up epoch are dropped; an invalid epoch imposes no
    /// bound. Answers for LSNs at or above the retained head are
    /// unchanged.
    pub fn trim_if_needed(
        &mut self,
        log_head_epoch: Epoch,
        last_backed_up_epoch: Epoch,
        max_entries: usize,
    ) {
        if max_entries == 0 || self.entries.len() <= max_entries {
            return;
        }

        let bound = match (log_head_epoch.is_valid(), last_backed_up_epoch.is_valid()) {
            (true, true) => min(log_head_epoch, last_backed_up_epoch),
            (true, false) => log_head_epoch,
            (false, true) => last_backed_up_epoch,
            (false, false) => return,
        };

        let before = self.entries.len();
        self.entries.retain(|entry| entry.epoch >= bound);
        if self.entries.len() != before {
            tracing::debug!(
                dropped = before - self.entries.len(),
                retained = self.entries.len(),
                bound = %bound,
                "trimmed progress vector"
            );
        }
    }

    // ------------------------------------------------------------------
    // Serialization
    // ------------------------------------------------------------------

    const ENTRY_SIZE: usize = 16 + 8 + 8 + 8;

    pub fn serialized_size(&self) -> usize {
        4 + self.entries.len() * Self::ENTRY_SIZE
    }

    pub fn serialize_into(&self, out: &mut BytesMut) {
        out.put_u32_le(self.entries.len() as u32);
        for entry in &self.entries {
            out.put_i64_le(entry.epoch.data_loss);
            out.put_i64_le(entry.epoch.configuration);
            out.put_i64_le(entry.lsn.as_i64());
            out.put_i64_le(entry.primary_replica_id.as_i64());
            out.put_i64_le(entry.timestamp_secs);
        }
    }

    pub fn deserialize(src: &mut Bytes) -> Result<Self, RecordError> {
        if src.remaining() < 4 {
            return Err(RecordError::Truncated {
                needed: 4,
                available: src.remaining(),
            });
        }
        let count = src.get_u32_le() as usize;
        if src.remaining() < count * Self::ENTRY_SIZE {
            return Err(RecordError::Truncated {
                needed: count * Self::ENTRY_SIZE,
                available: src.remaining(),
            });
        }
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(ProgressVectorEntry {
                epoch: Epoch::new(src.get_i64_le(), src.get_i64_le()),
                lsn: Lsn::new(src.get_i64_le()),
                primary_replica_id: ReplicaId::new(src.get_i64_le()),
                timestamp_secs: src.get_i64_le(),
            });
        }
        Ok(Self { entries })
    }

    /// Diagnostic rendering bounded to `max_bytes`; long vectors are
    /// elided from the front (the recent history is the interesting end).
    pub fn to_bounded_string(&self, max_bytes: usize) -> String {
        let mut rendered = String::new();
        let mut shown = 0usize;
        for entry in self.entries.iter().rev() {
            let piece = entry.to_string();
            if rendered.len() + piece.len() + 32 > max_bytes {
                break;
            }
            rendered.insert_str(0, &piece);
            shown += 1;
        }
        if shown < self.entries.len() {
            let mut prefix = String::new();
            let _ = write!(prefix, "(…{} earlier) ", self.entries.len() - shown);
            rendered.insert_str(0, &prefix);
        }
        rendered
    }
}

impl Display for ProgressVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            write!(f, "{entry}")?;
        }
        Ok(())
    }
}
