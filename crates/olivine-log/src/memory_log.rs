//! Chunked in-memory byte log.
//!
//! The log is a run of fixed-size chunks covering `[head, tail]`. The
//! writer appends at the tail, allocating chunks as it crosses boundaries;
//! a chunk is allocated eagerly the moment the tail lands on a boundary so
//! the next append never waits for the first allocation. Head truncation
//! releases whole chunks below the head (a partially covered chunk stays);
//! tail truncation drops chunks past the cursor and rewinds it.
//!
//! Readers and the writer share the chunk table through a lock held only
//! for the duration of the byte copy, never across an await.

use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

use bytes::Bytes;

use crate::store::{LogReadStream, LogStore};
use crate::LogError;

/// Default chunk size: 64 KiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 64 * 1024;

#[derive(Debug)]
struct Inner {
    chunks: VecDeque<Box<[u8]>>,
    /// Absolute offset of the first byte of `chunks[0]`.
    first_chunk_start: u64,
    head: u64,
    tail: u64,
}

impl Inner {
    fn chunk_size(&self) -> u64 {
        self.chunks
            .front()
            .map_or(DEFAULT_CHUNK_SIZE, |c| c.len() as u64)
    }
}

/// Chunked in-memory byte log. Cheap to clone; clones share the log.
#[derive(Debug, Clone)]
pub struct MemoryLog {
    inner: Arc<RwLock<Inner>>,
    chunk_size: u64,
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl MemoryLog {
    /// Creates an empty log with the given chunk size.
    ///
    /// # Panics
    ///
    /// Panics when `chunk_size` is zero.
    pub fn new(chunk_size: u64) -> Self {
        assert!(chunk_size > 0, "chunk size must be non-zero");
        let mut inner = Inner {
            chunks: VecDeque::new(),
            first_chunk_start: 0,
            head: 0,
            tail: 0,
        };
        // The chunk the first append writes into.
        inner
            .chunks
            .push_back(vec![0u8; chunk_size as usize].into_boxed_slice());
        Self {
            inner: Arc::new(RwLock::new(inner)),
            chunk_size,
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn head(&self) -> u64 {
        self.inner.read().expect("memory log lock poisoned").head
    }

    pub fn tail(&self) -> u64 {
        self.inner.read().expect("memory log lock poisoned").tail
    }

    /// Bytes currently retained, `tail - head`.
    pub fn size(&self) -> u64 {
        let inner = self.inner.read().expect("memory log lock poisoned");
        inner.tail - inner.head
    }

    pub fn chunk_count(&self) -> usize {
        self.inner
            .read()
            .expect("memory log lock poisoned")
            .chunks
            .len()
    }

    /// Appends `count` bytes from `buf[offset..]` at the tail.
    pub fn append_slice(&self, buf: &[u8], offset: usize, count: usize) {
        let data = &buf[offset..offset + count];
        let mut inner = self.inner.write().expect("memory log lock poisoned");
        let chunk_size = self.chunk_size;

        let mut written = 0usize;
        while written < data.len() {
            let tail_offset = inner.tail - inner.first_chunk_start;
            let chunk_index = (tail_offset / chunk_size) as usize;
            let within = (tail_offset % chunk_size) as usize;

            debug_assert!(chunk_index < inner.chunks.len());
            let room = chunk_size as usize - within;
            let take = room.min(data.len() - written);
            inner.chunks[chunk_index][within..within + take]
                .copy_from_slice(&data[written..written + take]);
            written += take;
            inner.tail += take as u64;

            // Keep a chunk ready the moment the tail reaches a boundary.
            let next_index = ((inner.tail - inner.first_chunk_start) / chunk_size) as usize;
            if next_index == inner.chunks.len() {
                inner
                    .chunks
                    .push_back(vec![0u8; chunk_size as usize].into_boxed_slice());
            }
        }
    }

    fn read_at(&self, position: u64, buf: &mut [u8]) -> Result<usize, LogError> {
        let inner = self.inner.read().expect("memory log lock poisoned");
        if position < inner.head {
            return Err(LogError::PositionOutOfRange {
                position,
                head: inner.head,
                tail: inner.tail,
            });
        }
        if position >= inner.tail {
            return Ok(0);
        }

        let chunk_size = inner.chunk_size();
        let available = (inner.tail - position) as usize;
        let to_read = buf.len().min(available);

        let mut copied = 0usize;
        while copied < to_read {
            let absolute = position + copied as u64;
            let log_offset = absolute - inner.first_chunk_start;
            let chunk_index = (log_offset / chunk_size) as usize;
            let within = (log_offset % chunk_size) as usize;
            let take = (chunk_size as usize - within).min(to_read - copied);
            buf[copied..copied + take]
                .copy_from_slice(&inner.chunks[chunk_index][within..within + take]);
            copied += take;
        }
        Ok(to_read)
    }

    fn truncate_head_sync(&self, new_head: u64) -> Result<(), LogError> {
        let mut inner = self.inner.write().expect("memory log lock poisoned");
        if new_head < inner.head || new_head > inner.tail {
            return Err(LogError::PositionOutOfRange {
                position: new_head,
                head: inner.head,
                tail: inner.tail,
            });
        }
        inner.head = new_head;
        let chunk_size = self.chunk_size;
        let mut released = 0usize;
        while inner.first_chunk_start + chunk_size <= inner.head {
            inner.chunks.pop_front();
            inner.first_chunk_start += chunk_size;
            released += 1;
        }
        debug_assert!(!inner.chunks.is_empty());
        if released > 0 {
            tracing::debug!(head = inner.head, released, "released chunks below head");
        }
        Ok(())
    }

    fn truncate_tail_sync(&self, new_tail: u64) -> Result<(), LogError> {
        let mut inner = self.inner.write().expect("memory log lock poisoned");
        if new_tail < inner.head || new_tail > inner.tail {
            return Err(LogError::PositionOutOfRange {
                position: new_tail,
                head: inner.head,
                tail: inner.tail,
            });
        }
        let old_tail = inner.tail;
        inner.tail = new_tail;
        let chunk_size = self.chunk_size;
        let keep = ((new_tail - inner.first_chunk_start) / chunk_size) as usize + 1;
        inner.chunks.truncate(keep);
        tracing::debug!(old_tail, new_tail, "rewound log tail");
        Ok(())
    }
}

impl LogStore for MemoryLog {
    type ReadStream = MemoryLogReadStream;

    fn append(&self, data: Bytes) -> impl Future<Output = Result<(), LogError>> + Send {
        let log = self.clone();
        async move {
            log.append_slice(&data, 0, data.len());
            Ok(())
        }
    }

    fn flush_with_marker(&self) -> impl Future<Output = Result<(), LogError>> + Send {
        // Memory is as durable as it gets; the marker is a no-op.
        async { Ok(()) }
    }

    fn truncate_head(&self, new_head: u64) -> impl Future<Output = Result<(), LogError>> + Send {
        let log = self.clone();
        async move { log.truncate_head_sync(new_head) }
    }

    fn truncate_tail(&self, new_tail: u64) -> impl Future<Output = Result<(), LogError>> + Send {
        let log = self.clone();
        async move { log.truncate_tail_sync(new_tail) }
    }

    fn create_read_stream(&self, start: u64) -> MemoryLogReadStream {
        MemoryLogReadStream {
            log: self.clone(),
            position: start,
        }
    }

    fn head_position(&self) -> u64 {
        self.head()
    }

    fn tail_position(&self) -> u64 {
        self.tail()
    }
}

/// Independent positioned reader over a [`MemoryLog`].
#[derive(Debug, Clone)]
pub struct MemoryLogReadStream {
    log: MemoryLog,
    position: u64,
}

impl LogReadStream for MemoryLogReadStream {
    fn position(&self) -> u64 {
        self.position
    }

    fn set_position(&mut self, position: u64) {
        self.position = position;
    }

    fn read(
        &mut self,
        buf: &mut [u8],
        offset: usize,
        count: usize,
    ) -> impl Future<Output = Result<usize, LogError>> + Send {
        async move {
            let read = self
                .log
                .read_at(self.position, &mut buf[offset..offset + count])?;
            self.position += read as u64;
            Ok(read)
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    const CHUNK: u64 = DEFAULT_CHUNK_SIZE;

    fn patterned(len: usize) -> Vec<u8> {
        let mut value = 0u8;
        (0..len)
            .map(|_| {
                let v = value;
                value = value.wrapping_add(1);
                v
            })
            .collect()
    }

    fn fill(log: &MemoryLog, total: usize, max_write: usize, rng: &mut StdRng) {
        let mut value = 0u8;
        let mut written = 0usize;
        while written < total {
            let size = rng.gen_range(1..=max_write).min(total - written);
            let buf: Vec<u8> = (0..size)
                .map(|_| {
                    let v = value;
                    value = value.wrapping_add(1);
                    v
                })
                .collect();
            log.append_slice(&buf, 0, size);
            written += size;
        }
    }

    fn verify_pattern(buf: &[u8], offset: usize, count: usize) {
        let mut value = 0u8;
        for i in offset..offset + count {
            assert_eq!(buf[i], value, "mismatch at index {i}");
            value = value.wrapping_add(1);
        }
    }

    #[test]
    fn one_byte_append() {
        let log = MemoryLog::default();
        log.append_slice(&[0xAB], 0, 1);
        assert_eq!(log.chunk_count(), 1);
        assert_eq!(log.head(), 0);
        assert_eq!(log.tail(), 1);
    }

    #[test]
    fn exact_chunk_append_allocates_the_next_chunk() {
        let log = MemoryLog::default();
        log.append_slice(&vec![0u8; CHUNK as usize], 0, CHUNK as usize);
        assert_eq!(log.chunk_count(), 2);
        assert_eq!(log.head(), 0);
        assert_eq!(log.tail(), CHUNK);
    }

    #[test]
    fn append_bigger_than_one_chunk() {
        let log = MemoryLog::default();
        log.append_slice(&vec![0u8; CHUNK as usize + 1], 0, CHUNK as usize + 1);
        assert_eq!(log.chunk_count(), 2);
        assert_eq!(log.tail(), CHUNK + 1);
    }

    #[test]
    fn append_smaller_than_one_chunk() {
        let log = MemoryLog::default();
        log.append_slice(&vec![0u8; CHUNK as usize - 1], 0, CHUNK as usize - 1);
        assert_eq!(log.chunk_count(), 1);
        assert_eq!(log.tail(), CHUNK - 1);
    }

    #[test]
    fn repeated_half_chunk_appends() {
        let log = MemoryLog::default();
        let half = (CHUNK / 2) as usize;
        let buf = vec![0u8; half];

        log.append_slice(&buf, 0, half);
        assert_eq!(log.chunk_count(), 1);
        assert_eq!(log.tail(), CHUNK / 2);

        log.append_slice(&buf, 0, half);
        assert_eq!(log.chunk_count(), 2);
        assert_eq!(log.tail(), CHUNK);

        log.append_slice(&buf, 0, half);
        assert_eq!(log.chunk_count(), 2);
        assert_eq!(log.tail(), CHUNK + CHUNK / 2);
    }

    #[test]
    fn append_bigger_than_double_chunk() {
        let log = MemoryLog::default();
        let size = (CHUNK * 2 + 1) as usize;
        log.append_slice(&vec![0u8; size], 0, size);
        assert_eq!(log.chunk_count(), 3);
        assert_eq!(log.tail(), CHUNK * 2 + 1);
    }

    #[test]
    fn many_small_writes_land_at_the_right_tail() {
        let mut rng = StdRng::seed_from_u64(7);
        let log = MemoryLog::default();
        let total = (CHUNK * 20) as usize;
        fill(&log, total, 1024, &mut rng);
        assert_eq!(log.tail(), total as u64);
    }

    #[tokio::test]
    async fn read_one_chunk() {
        let log = MemoryLog::default();
        let data = patterned(CHUNK as usize);
        log.append_slice(&data, 0, data.len());

        let mut stream = log.create_read_stream(0);
        let mut buf = vec![0u8; CHUNK as usize + 100];
        let read = stream.read(&mut buf, 100, CHUNK as usize).await.unwrap();
        assert_eq!(read, CHUNK as usize);
        verify_pattern(&buf, 100, CHUNK as usize);
    }

    #[tokio::test]
    async fn read_across_chunk_boundary() {
        let log = MemoryLog::default();
        let data = patterned((CHUNK * 2) as usize);
        log.append_slice(&data, 0, data.len());

        let mut stream = log.create_read_stream(0);
        stream.set_position(CHUNK / 2);
        let mut buf = vec![0u8; CHUNK as usize];
        let read = stream.read(&mut buf, 0, CHUNK as usize).await.unwrap();
        assert_eq!(read, CHUNK as usize);
        for (i, byte) in buf.iter().enumerate() {
            assert_eq!(*byte, data[(CHUNK / 2) as usize + i]);
        }
    }

    #[tokio::test]
    async fn read_more_than_available_is_a_short_read() {
        let log = MemoryLog::default();
        let total = (CHUNK * 11) as usize;
        log.append_slice(&patterned(total), 0, total);

        let mut stream = log.create_read_stream(0);
        stream.set_position(CHUNK / 2);
        let want = (CHUNK * 12) as usize;
        let mut buf = vec![0u8; want];
        let read = stream.read(&mut buf, 0, want).await.unwrap();
        assert_eq!(read as u64, 11 * CHUNK - CHUNK / 2);
    }

    #[tokio::test]
    async fn read_at_tail_returns_zero() {
        let log = MemoryLog::default();
        log.append_slice(b"xyz", 0, 3);
        let mut stream = log.create_read_stream(3);
        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf, 0, 8).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn read_below_head_is_rejected() {
        let log = MemoryLog::default();
        log.append_slice(&vec![0u8; CHUNK as usize], 0, CHUNK as usize);
        log.truncate_head(CHUNK / 2).await.unwrap();

        let mut stream = log.create_read_stream(0);
        let mut buf = [0u8; 16];
        assert!(matches!(
            stream.read(&mut buf, 0, 16).await,
            Err(LogError::PositionOutOfRange { .. })
        ));
    }

    #[tokio::test]
    async fn truncate_head_at_chunk_boundary_releases_the_chunk() {
        let log = MemoryLog::default();
        log.append_slice(&vec![0u8; CHUNK as usize], 0, CHUNK as usize);
        assert_eq!(log.chunk_count(), 2);

        log.truncate_head(CHUNK).await.unwrap();
        assert_eq!(log.chunk_count(), 1);
        assert_eq!(log.head(), CHUNK);
        assert_eq!(log.tail(), CHUNK);
    }

    #[tokio::test]
    async fn truncate_head_within_a_chunk_keeps_it() {
        let log = MemoryLog::default();
        let size = (CHUNK - 100) as usize;
        log.append_slice(&vec![0u8; size], 0, size);

        log.truncate_head(100).await.unwrap();
        assert_eq!(log.chunk_count(), 1);
        assert_eq!(log.head(), 100);
        assert_eq!(log.tail(), CHUNK - 100);
    }

    #[tokio::test]
    async fn truncate_head_near_end_of_chunk_then_cross_boundary() {
        let log = MemoryLog::default();
        let size = (CHUNK - 1) as usize;
        log.append_slice(&vec![0u8; size], 0, size);

        log.truncate_head(CHUNK - 2).await.unwrap();
        assert_eq!(log.chunk_count(), 1);
        assert_eq!(log.head(), CHUNK - 2);

        log.append_slice(&[0u8; 1], 0, 1);
        assert_eq!(log.chunk_count(), 2);
        assert_eq!(log.tail(), CHUNK);

        log.truncate_head(CHUNK).await.unwrap();
        assert_eq!(log.chunk_count(), 1);
        assert_eq!(log.head(), CHUNK);
    }

    #[tokio::test]
    async fn truncate_tail_to_zero_resets_to_one_chunk() {
        let log = MemoryLog::default();
        log.append_slice(&vec![0u8; CHUNK as usize], 0, CHUNK as usize);
        assert_eq!(log.chunk_count(), 2);

        log.truncate_tail(0).await.unwrap();
        assert_eq!(log.chunk_count(), 1);
        assert_eq!(log.head(), 0);
        assert_eq!(log.tail(), 0);
    }

    #[tokio::test]
    async fn truncate_tail_within_a_chunk() {
        let log = MemoryLog::default();
        let size = (CHUNK - 100) as usize;
        log.append_slice(&vec![0u8; size], 0, size);

        log.truncate_tail(CHUNK - 200).await.unwrap();
        assert_eq!(log.chunk_count(), 1);
        assert_eq!(log.tail(), CHUNK - 200);
    }

    #[tokio::test]
    async fn truncate_tail_then_append_continues_from_new_tail() {
        let log = MemoryLog::default();
        let size = (CHUNK - 1) as usize;
        log.append_slice(&patterned(size), 0, size);

        log.truncate_tail(1).await.unwrap();
        assert_eq!(log.tail(), 1);
        assert_eq!(log.chunk_count(), 1);

        log.append_slice(&[0x42], 0, 1);
        assert_eq!(log.tail(), 2);

        let mut stream = log.create_read_stream(0);
        let mut buf = [0u8; 2];
        assert_eq!(stream.read(&mut buf, 0, 2).await.unwrap(), 2);
        assert_eq!(buf, [0x00, 0x42]);
    }

    #[tokio::test]
    async fn oversized_truncation_is_rejected() {
        let log = MemoryLog::default();
        log.append_slice(b"abc", 0, 3);
        assert!(log.truncate_tail(10).await.is_err());
        assert!(log.truncate_head(10).await.is_err());
    }

    #[tokio::test]
    async fn concurrent_readers_see_consistent_bytes() {
        let mut rng = StdRng::seed_from_u64(99);
        let log = MemoryLog::new(4096);
        let total = 4096 * 50;
        fill(&log, total, 4096 * 2, &mut rng);

        let mut tasks = Vec::new();
        for task_id in 0..4u64 {
            let log = log.clone();
            let start = task_id * 4096;
            let count = total as u64 - start;
            tasks.push(tokio::spawn(async move {
                let mut stream = log.create_read_stream(start);
                let mut buf = vec![0u8; count as usize];
                let mut total_read = 0usize;
                while (total_read as u64) < count {
                    let read = stream
                        .read(&mut buf, total_read, (count as usize) - total_read)
                        .await
                        .unwrap();
                    assert!(read > 0);
                    total_read += read;
                }
                (start, buf)
            }));
        }

        for task in tasks {
            let (start, buf) = task.await.unwrap();
            let mut value = (start % 256) as u8;
            for (i, byte) in buf.iter().enumerate() {
                assert_eq!(*byte, value, "reader from {start} mismatch at {i}");
                value = value.wrapping_add(1);
            }
        }
    }
}
