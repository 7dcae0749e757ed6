//! # olivine-types: Core types for `Olivine`
//!
//! Shared types used across the log replication engine:
//! - Sequence numbers ([`Lsn`], [`Psn`])
//! - Replica and transaction identity ([`ReplicaId`], [`TransactionId`])
//! - Reconfiguration epochs ([`Epoch`])
//! - Record position constants ([`INVALID_RECORD_POSITION`])
//!
//! All types here are `Copy` 8- or 16-byte values with explicit sentinel
//! constants. Sentinels are negative (or `u64::MAX` for positions) so a
//! default-initialized field is never mistaken for a real assignment.

use std::fmt::{self, Display};
use std::ops::{Add, AddAssign, Sub};

use serde::{Deserialize, Serialize};

// ============================================================================
// Logical sequence number
// ============================================================================

/// Logical sequence number: per-replica monotonic counter stamped on each
/// logical record.
///
/// `INVALID` marks a record that has not yet been sequenced.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Lsn(i64);

impl Lsn {
    pub const INVALID: Lsn = Lsn(-1);
    pub const ZERO: Lsn = Lsn(0);
    pub const ONE: Lsn = Lsn(1);

    pub const fn new(lsn: i64) -> Self {
        Self(lsn)
    }

    pub const fn as_i64(self) -> i64 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }

    /// The next sequence number.
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Lsn {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Lsn> for i64 {
    fn from(lsn: Lsn) -> Self {
        lsn.0
    }
}

impl Add<i64> for Lsn {
    type Output = Lsn;

    fn add(self, rhs: i64) -> Lsn {
        Lsn(self.0 + rhs)
    }
}

impl AddAssign<i64> for Lsn {
    fn add_assign(&mut self, rhs: i64) {
        self.0 += rhs;
    }
}

impl Sub for Lsn {
    type Output = i64;

    fn sub(self, rhs: Lsn) -> i64 {
        self.0 - rhs.0
    }
}

// ============================================================================
// Physical sequence number
// ============================================================================

/// Physical sequence number: monotonic counter over flushed records.
///
/// Gapless on the success path; successive flush callbacks observe
/// `psn + 1` between records.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Psn(i64);

impl Psn {
    pub const INVALID: Psn = Psn(-1);
    pub const ZERO: Psn = Psn(0);

    pub const fn new(psn: i64) -> Self {
        Self(psn)
    }

    pub const fn as_i64(self) -> i64 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }

    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for Psn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Psn {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Psn> for i64 {
    fn from(psn: Psn) -> Self {
        psn.0
    }
}

impl Sub for Psn {
    type Output = i64;

    fn sub(self, rhs: Psn) -> i64 {
        self.0 - rhs.0
    }
}

// ============================================================================
// Record position
// ============================================================================

/// Byte offset of a record within the log. Positions are assigned at flush
/// time; until then a record carries [`INVALID_RECORD_POSITION`].
pub type RecordPosition = u64;

/// Sentinel for a record that has not been written to the log yet, and for
/// absent back-references between records.
pub const INVALID_RECORD_POSITION: RecordPosition = u64::MAX;

// ============================================================================
// Replica and transaction identity
// ============================================================================

/// Unique identifier of a replica within a partition.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ReplicaId(i64);

impl ReplicaId {
    pub const INVALID: ReplicaId = ReplicaId(-1);

    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    pub const fn as_i64(self) -> i64 {
        self.0
    }
}

impl Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for ReplicaId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<ReplicaId> for i64 {
    fn from(id: ReplicaId) -> Self {
        id.0
    }
}

/// Identifier of a transaction. Produced by the transaction manager; the
/// log pipeline only indexes by it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct TransactionId(i64);

impl TransactionId {
    pub const INVALID: TransactionId = TransactionId(0);

    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    pub const fn as_i64(self) -> i64 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for TransactionId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<TransactionId> for i64 {
    fn from(id: TransactionId) -> Self {
        id.0
    }
}

// ============================================================================
// Epoch
// ============================================================================

/// A primary's reign: `(data_loss, configuration)` version pair, totally
/// ordered lexicographically.
///
/// The data-loss version increases when the partition loses acknowledged
/// state; the configuration version increases on every reconfiguration.
/// `(0, 0)` is the zero epoch a fresh replica starts in; `(-1, -1)` is the
/// invalid sentinel.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Epoch {
    pub data_loss: i64,
    pub configuration: i64,
}

impl Epoch {
    pub const ZERO: Epoch = Epoch {
        data_loss: 0,
        configuration: 0,
    };
    pub const INVALID: Epoch = Epoch {
        data_loss: -1,
        configuration: -1,
    };

    pub const fn new(data_loss: i64, configuration: i64) -> Self {
        Self {
            data_loss,
            configuration,
        }
    }

    pub const fn is_valid(self) -> bool {
        self.data_loss >= 0 && self.configuration >= 0
    }
}

impl Default for Epoch {
    fn default() -> Self {
        Epoch::INVALID
    }
}

impl Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.data_loss, self.configuration)
    }
}
