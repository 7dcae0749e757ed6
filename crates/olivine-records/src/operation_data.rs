//! The serialization primitive handed across the state-provider boundary.
//!
//! An [`OperationData`] is an ordered sequence of byte buffers. Buffers may
//! be zero-length and must survive a round-trip; order is significant.
//!
//! # Serialized form
//!
//! ```text
//! [buffer_count:i32][len:u32 | bytes]*
//! ```
//!
//! A count of `-1` encodes an absent value (used by record bodies whose
//! metadata/undo/redo slots are optional). All integers little-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::RecordError;

/// Ordered sequence of byte buffers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OperationData {
    buffers: Vec<Bytes>,
}

impl OperationData {
    pub fn new() -> Self {
        Self {
            buffers: Vec::new(),
        }
    }

    pub fn from_buffers(buffers: Vec<Bytes>) -> Self {
        Self { buffers }
    }

    /// Builds a single-buffer value from a contiguous slice.
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self {
            buffers: vec![Bytes::copy_from_slice(bytes)],
        }
    }

    pub fn push(&mut self, buffer: Bytes) {
        self.buffers.push(buffer);
    }

    pub fn buffers(&self) -> &[Bytes] {
        &self.buffers
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Total payload bytes across all buffers.
    pub fn total_len(&self) -> usize {
        self.buffers.iter().map(Bytes::len).sum()
    }

    /// Flattens into one contiguous buffer. Buffer boundaries are lost;
    /// use only where the consumer re-frames the content itself.
    pub fn to_contiguous(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.total_len());
        for buffer in &self.buffers {
            out.extend_from_slice(buffer);
        }
        out.freeze()
    }

    /// Exact serialized size, including the count prefix.
    pub fn serialized_size(&self) -> usize {
        4 + self.buffers.iter().map(|b| 4 + b.len()).sum::<usize>()
    }

    pub fn serialize_into(&self, out: &mut BytesMut) {
        out.put_i32_le(self.buffers.len() as i32);
        for buffer in &self.buffers {
            out.put_u32_le(buffer.len() as u32);
            out.put_slice(buffer);
        }
    }

    pub fn deserialize(src: &mut Bytes) -> Result<Self, RecordError> {
        match read_count(src)? {
            None => Err(RecordError::InvalidData(
                "operation data count was -1 where a value is required".to_string(),
            )),
            Some(value) => Ok(value),
        }
    }

    /// Serializes an optional value; `None` is a `-1` count.
    pub fn serialize_opt_into(value: Option<&OperationData>, out: &mut BytesMut) {
        match value {
            Some(data) => data.serialize_into(out),
            None => out.put_i32_le(-1),
        }
    }

    pub fn deserialize_opt(src: &mut Bytes) -> Result<Option<Self>, RecordError> {
        read_count(src)
    }

    /// Exact serialized size of an optional slot.
    pub fn serialized_size_opt(value: Option<&OperationData>) -> usize {
        value.map_or(4, OperationData::serialized_size)
    }
}

fn read_count(src: &mut Bytes) -> Result<Option<OperationData>, RecordError> {
    if src.remaining() < 4 {
        return Err(RecordError::Truncated {
            needed: 4,
            available: src.remaining(),
        });
    }
    let count = src.get_i32_le();
    if count < 0 {
        if count != -1 {
            return Err(RecordError::InvalidData(format!(
                "operation data count {count} is negative but not the absent sentinel"
            )));
        }
        return Ok(None);
    }

    let mut buffers = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if src.remaining() < 4 {
            return Err(RecordError::Truncated {
                needed: 4,
                available: src.remaining(),
            });
        }
        let len = src.get_u32_le() as usize;
        if src.remaining() < len {
            return Err(RecordError::Truncated {
                needed: len,
                available: src.remaining(),
            });
        }
        buffers.push(src.copy_to_bytes(len));
    }
    Ok(Some(OperationData { buffers }))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn roundtrip(data: &OperationData) -> OperationData {
        let mut out = BytesMut::new();
        data.serialize_into(&mut out);
        assert_eq!(out.len(), data.serialized_size());
        let mut src = out.freeze();
        let decoded = OperationData::deserialize(&mut src).unwrap();
        assert!(!src.has_remaining());
        decoded
    }

    #[test]
    fn empty_roundtrips() {
        let data = OperationData::new();
        assert_eq!(roundtrip(&data), data);
    }

    #[test]
    fn zero_length_buffers_roundtrip() {
        let data = OperationData::from_buffers(vec![
            Bytes::new(),
            Bytes::from_static(b"x"),
            Bytes::new(),
        ]);
        let decoded = roundtrip(&data);
        assert_eq!(decoded.buffer_count(), 3);
        assert_eq!(decoded, data);
    }

    #[test]
    fn absent_value_is_minus_one() {
        let mut out = BytesMut::new();
        OperationData::serialize_opt_into(None, &mut out);
        assert_eq!(&out[..], (-1i32).to_le_bytes());

        let mut src = out.freeze();
        assert_eq!(OperationData::deserialize_opt(&mut src).unwrap(), None);
    }

    #[test]
    fn contiguous_matches_scatter_gather() {
        let scattered =
            OperationData::from_buffers(vec![Bytes::from_static(b"ab"), Bytes::from_static(b"cd")]);
        assert_eq!(&scattered.to_contiguous()[..], b"abcd");
    }

    #[test]
    fn bogus_negative_count_rejected() {
        let mut out = BytesMut::new();
        out.put_i32_le(-7);
        assert!(OperationData::deserialize(&mut out.freeze()).is_err());
    }

    #[test]
    fn truncated_buffer_rejected() {
        let mut out = BytesMut::new();
        out.put_i32_le(1);
        out.put_u32_le(10);
        out.put_slice(b"abc"); // 3 of the promised 10 bytes
        assert!(matches!(
            OperationData::deserialize(&mut out.freeze()),
            Err(RecordError::Truncated { .. })
        ));
    }

    proptest! {
        #[test]
        fn roundtrip_law(buffers in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 0..64),
            0..8,
        )) {
            let data = OperationData::from_buffers(
                buffers.into_iter().map(Bytes::from).collect(),
            );
            prop_assert_eq!(roundtrip(&data), data);
        }
    }
}
