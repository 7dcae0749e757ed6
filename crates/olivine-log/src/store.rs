//! The byte-log contract.

use bytes::Bytes;

use crate::LogError;

/// Positioned reader over a byte log.
///
/// Each stream carries an independent cursor; concurrent streams may read
/// while the single writer appends.
pub trait LogReadStream: Send {
    fn position(&self) -> u64;

    fn set_position(&mut self, position: u64);

    /// Reads up to `count` bytes at the cursor into `buf[offset..]`,
    /// returning how many were available. A read past the tail is a short
    /// read, not an error.
    fn read(
        &mut self,
        buf: &mut [u8],
        offset: usize,
        count: usize,
    ) -> impl Future<Output = Result<usize, LogError>> + Send;
}

/// Abstract append-only byte log with two-ended truncation.
///
/// The physical log writer is generic over this trait; the closed variant
/// set is [`crate::MemoryLog`] for tests/in-memory replicas and a
/// file-backed store supplied by the hosting process. Positions are byte
/// offsets from the beginning of the stream's lifetime; truncation moves
/// `head`/`tail` but never renumbers.
pub trait LogStore: Clone + Send + Sync + 'static {
    type ReadStream: LogReadStream;

    /// Appends `data` at the tail. Single writer.
    fn append(&self, data: Bytes) -> impl Future<Output = Result<(), LogError>> + Send;

    /// Issues a durability marker covering everything appended so far
    /// (fsync-equivalent).
    fn flush_with_marker(&self) -> impl Future<Output = Result<(), LogError>> + Send;

    /// Releases storage for bytes below `new_head`.
    fn truncate_head(&self, new_head: u64) -> impl Future<Output = Result<(), LogError>> + Send;

    /// Discards bytes at and beyond `new_tail`; subsequent appends
    /// continue from there.
    fn truncate_tail(&self, new_tail: u64) -> impl Future<Output = Result<(), LogError>> + Send;

    /// Opens an independent positioned reader.
    fn create_read_stream(&self, start: u64) -> Self::ReadStream;

    fn head_position(&self) -> u64;

    fn tail_position(&self) -> u64;
}
