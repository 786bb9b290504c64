//! Chain walkers.
//!
//! Chunks are keyed `(serial, chunk_index)`, so all chunks of one changeset
//! are contiguous in key order.  Between changesets, however, the walkers
//! follow the continuity chain (the next from-serial is the *current*
//! changeset's `serial_to`) rather than raw key order, so recycled serials
//! elsewhere in the keyspace cannot derail a walk.

use super::codec::{decode_chunk, ChunkKey, CHUNK_KEY_LEN};
use super::txn::JournalTxn;
use super::{JournalError, MalformedSnafu};
use crate::store::{Bucket, ReadTxn, StoreError};

/// Read access the walkers need, satisfied by both snapshot reads and the
/// write-transaction helper.
pub(crate) trait ChunkSource {
    fn get(&self, bucket: Bucket, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    fn count(&self, bucket: Bucket) -> Result<u64, StoreError>;
}

impl ChunkSource for ReadTxn {
    fn get(&self, bucket: Bucket, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        ReadTxn::get(self, bucket, key)
    }

    fn count(&self, bucket: Bucket) -> Result<u64, StoreError> {
        ReadTxn::count(self, bucket)
    }
}

impl ChunkSource for JournalTxn<'_> {
    fn get(&self, bucket: Bucket, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.find(bucket, key)
    }

    fn count(&self, bucket: Bucket) -> Result<u64, StoreError> {
        JournalTxn::count(self, bucket)
    }
}

/// One reassembled changeset, still serialized.
pub(crate) struct ChangesetBlob {
    pub serial: u32,
    pub serial_to: u32,
    pub chunk_count: u32,
    /// Keys, values and per-entry overhead, as counted by space accounting.
    pub stored_bytes: u64,
    pub payload: Vec<u8>,
}

/// How a walk over `[first, last]` ended.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum WalkEnd {
    /// The changeset whose from-serial is `last` was reached and visited.
    Completed,
    /// The chain stopped short: no chunk `(serial, 0)` exists.
    Missing { serial: u32 },
}

/// Reads and reassembles the single changeset starting at `serial`, or
/// `None` when its first chunk is absent.
///
/// Every chunk must agree on `serial_to` and `chunk_count`, and the index
/// range `[0, chunk_count)` must be complete; anything else is *malformed*.
pub(crate) fn read_changeset<S>(
    src: &S,
    bucket: Bucket,
    serial: u32,
) -> Result<Option<ChangesetBlob>, JournalError>
where
    S: ChunkSource,
{
    let first_key = ChunkKey::new(serial, 0).encode();
    let Some(first_value) = src.get(bucket, &first_key)? else {
        return Ok(None);
    };
    let (header, first_payload) =
        decode_chunk(&first_value).ok_or_else(|| MalformedSnafu { what: "chunk value" }.build())?;
    if header.chunk_count == 0 {
        return Err(MalformedSnafu { what: "chunk count" }.build());
    }

    let mut blob = ChangesetBlob {
        serial,
        serial_to: header.serial_to,
        chunk_count: header.chunk_count,
        stored_bytes: (CHUNK_KEY_LEN + first_value.len()) as u64 + crate::store::ENTRY_OVERHEAD,
        payload: first_payload.to_vec(),
    };

    for index in 1..header.chunk_count {
        let key = ChunkKey::new(serial, index).encode();
        let value = src
            .get(bucket, &key)?
            .ok_or_else(|| MalformedSnafu { what: "chunk gap" }.build())?;
        let (next_header, payload) =
            decode_chunk(&value).ok_or_else(|| MalformedSnafu { what: "chunk value" }.build())?;
        if next_header.serial_to != header.serial_to || next_header.chunk_count != header.chunk_count
        {
            return Err(MalformedSnafu {
                what: "chunk header disagreement",
            }
            .build());
        }
        blob.stored_bytes += (CHUNK_KEY_LEN + value.len()) as u64 + crate::store::ENTRY_OVERHEAD;
        blob.payload.extend_from_slice(payload);
    }

    Ok(Some(blob))
}

/// Walks whole changesets over `[first, last]` inclusive, following the
/// continuity chain, and hands each reassembled blob to `visit`.
///
/// A missing first chunk ends the walk with [`WalkEnd::Missing`]; the caller
/// decides whether that is *not-found*, an acceptable partial result, or
/// corruption.  A chain longer than the number of stored chunks is reported
/// as *malformed* (it can only happen when `serial_to` links form a cycle).
pub(crate) fn walk_changesets<S, F>(
    src: &S,
    bucket: Bucket,
    first: u32,
    last: u32,
    visit: &mut F,
) -> Result<WalkEnd, JournalError>
where
    S: ChunkSource,
    F: FnMut(ChangesetBlob) -> Result<(), JournalError>,
{
    let mut remaining = src.count(bucket)?;
    let mut serial = first;
    loop {
        let Some(blob) = read_changeset(src, bucket, serial)? else {
            return Ok(WalkEnd::Missing { serial });
        };
        if u64::from(blob.chunk_count) > remaining {
            return Err(MalformedSnafu {
                what: "changeset chain cycle",
            }
            .build());
        }
        remaining -= u64::from(blob.chunk_count);

        let done = blob.serial == last;
        let next = blob.serial_to;
        visit(blob)?;
        if done {
            return Ok(WalkEnd::Completed);
        }
        serial = next;
    }
}
