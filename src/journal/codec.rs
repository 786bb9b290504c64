//! Fixed-layout key and header codec.
//!
//! Keys and headers are big-endian so that the store's byte-wise key order
//! equals `(serial, chunk_index)` order and the files are portable between
//! endiannesses.  Everything here is pure encode/decode.

/// One physical record key: `(serial_be32, chunk_index_be32)`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct ChunkKey {
    pub serial: u32,
    pub index: u32,
}

pub(crate) const CHUNK_KEY_LEN: usize = 8;

impl ChunkKey {
    pub fn new(serial: u32, index: u32) -> Self {
        Self { serial, index }
    }

    pub fn encode(self) -> [u8; CHUNK_KEY_LEN] {
        let mut out = [0u8; CHUNK_KEY_LEN];
        out[..4].copy_from_slice(&self.serial.to_be_bytes());
        out[4..].copy_from_slice(&self.index.to_be_bytes());
        out
    }

    pub fn decode(raw: &[u8]) -> Option<Self> {
        if raw.len() != CHUNK_KEY_LEN {
            return None;
        }
        let serial = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let index = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
        Some(Self { serial, index })
    }
}

/// Per-chunk header replicated in every chunk of a changeset:
/// `(serial_to_be32, chunk_count_be32, chunk_size_be32)`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct ChunkHeader {
    pub serial_to: u32,
    pub chunk_count: u32,
    pub chunk_size: u32,
}

pub(crate) const CHUNK_HEADER_LEN: usize = 12;

/// Upper bound on one physical record, kept well under the store's
/// page/record comfort zone.
pub(crate) const CHUNK_MAX: usize = 60 * 1024;

/// Payload capacity of one chunk.
pub(crate) const CHUNK_PAYLOAD_MAX: usize = CHUNK_MAX - CHUNK_HEADER_LEN;

impl ChunkHeader {
    pub fn encode(self) -> [u8; CHUNK_HEADER_LEN] {
        let mut out = [0u8; CHUNK_HEADER_LEN];
        out[..4].copy_from_slice(&self.serial_to.to_be_bytes());
        out[4..8].copy_from_slice(&self.chunk_count.to_be_bytes());
        out[8..].copy_from_slice(&self.chunk_size.to_be_bytes());
        out
    }

    pub fn decode(raw: &[u8]) -> Option<Self> {
        if raw.len() < CHUNK_HEADER_LEN {
            return None;
        }
        Some(Self {
            serial_to: u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]),
            chunk_count: u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]),
            chunk_size: u32::from_be_bytes([raw[8], raw[9], raw[10], raw[11]]),
        })
    }
}

/// Builds the stored value for one chunk: header followed by payload.
pub(crate) fn encode_chunk(header: ChunkHeader, payload: &[u8]) -> Vec<u8> {
    let mut value = Vec::with_capacity(CHUNK_HEADER_LEN + payload.len());
    value.extend_from_slice(&header.encode());
    value.extend_from_slice(payload);
    value
}

/// Splits a stored value into its header and payload.  Returns `None` when
/// the value is shorter than its header or shorter than the payload length
/// the header promises.
pub(crate) fn decode_chunk(value: &[u8]) -> Option<(ChunkHeader, &[u8])> {
    let header = ChunkHeader::decode(value)?;
    let payload = &value[CHUNK_HEADER_LEN..];
    if payload.len() != header.chunk_size as usize {
        return None;
    }
    Some((header, payload))
}

/// Encodes a 4-byte big-endian metadata integer.
pub(crate) fn encode_u32(value: u32) -> [u8; 4] {
    value.to_be_bytes()
}

/// Encodes an 8-byte big-endian metadata integer.
pub(crate) fn encode_u64(value: u64) -> [u8; 8] {
    value.to_be_bytes()
}

/// Decodes an 8-byte big-endian metadata integer.
pub(crate) fn decode_u64(raw: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = raw.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

/// Decodes a 4-byte big-endian metadata integer.
pub(crate) fn decode_u32(raw: &[u8]) -> Option<u32> {
    if raw.len() != 4 {
        return None;
    }
    Some(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

#[cfg(test)]
mod tests {
    use super::{decode_chunk, ChunkHeader, ChunkKey, CHUNK_HEADER_LEN};

    #[test]
    fn key_order_matches_serial_then_index() {
        let lower = ChunkKey::new(5, u32::MAX).encode();
        let higher = ChunkKey::new(6, 0).encode();
        assert!(lower < higher);

        let first = ChunkKey::new(6, 1).encode();
        let second = ChunkKey::new(6, 2).encode();
        assert!(first < second);
    }

    #[test]
    fn key_round_trip() {
        let key = ChunkKey::new(0xdead_beef, 17);
        assert_eq!(ChunkKey::decode(&key.encode()), Some(key));
        assert_eq!(ChunkKey::decode(&[0u8; 7]), None);
    }

    #[test]
    fn chunk_value_round_trip() {
        let header = ChunkHeader {
            serial_to: 9,
            chunk_count: 2,
            chunk_size: 3,
        };
        let value = super::encode_chunk(header, b"abc");
        assert_eq!(value.len(), CHUNK_HEADER_LEN + 3);
        let (back, payload) = decode_chunk(&value).expect("value should decode");
        assert_eq!(back, header);
        assert_eq!(payload, b"abc");

        // A header that promises more payload than is present is rejected.
        assert!(decode_chunk(&value[..value.len() - 1]).is_none());
    }
}
