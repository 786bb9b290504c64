//! Space reclamation: eviction of flushed history, merge-mode compaction,
//! and full history drops.
//!
//! None of these commit; they run inside the caller's transaction helper so
//! that, for example, insert-with-eviction-with-merge stays one atomic
//! operation.

use super::codec::{decode_chunk, ChunkKey, CHUNK_KEY_LEN};
use super::iter::{read_changeset, walk_changesets, WalkEnd};
use super::metadata::Flags;
use super::txn::JournalTxn;
use super::writer::{self, InsertMode};
use super::{BusySnafu, JournalError, MalformedSnafu, NotFoundSnafu};
use crate::changeset::Changeset;
use crate::config::JournalConfig;
use crate::serial::{serial_cmp, serial_le, SerialCmp};
use crate::store::{Bucket, StoreError, ENTRY_OVERHEAD};

/// Deletes `key`, committing and restarting the transaction when the backend
/// reports it full.  A retry after a fresh transaction failing the same way
/// means the budget cannot make progress at all, which is propagated.
pub(super) fn delete_with_restart(
    txn: &mut JournalTxn<'_>,
    bucket: Bucket,
    key: &[u8],
) -> Result<Option<usize>, JournalError> {
    match txn.delete(bucket, key) {
        Err(StoreError::TransactionFull) => {
            txn.restart()?;
            txn.delete(bucket, key).map_err(Into::into)
        }
        other => other.map_err(Into::into),
    }
}

/// Deletes every chunk of one changeset, accumulating freed bytes.
///
/// Chunks go in reverse index order so chunk 0, the one whose header the
/// walkers rely on, disappears last; a crash mid-deletion leaves a
/// changeset that can still be found and re-deleted.
fn delete_chunks(
    txn: &mut JournalTxn<'_>,
    bucket: Bucket,
    serial: u32,
    chunk_count: u32,
    freed: &mut u64,
) -> Result<(), JournalError> {
    for index in (0..chunk_count).rev() {
        let key = ChunkKey::new(serial, index).encode();
        if let Some(len) = delete_with_restart(txn, bucket, &key)? {
            *freed += (CHUNK_KEY_LEN + len) as u64 + ENTRY_OVERHEAD;
        }
    }
    Ok(())
}

fn chunk_header(
    txn: &JournalTxn<'_>,
    bucket: Bucket,
    serial: u32,
) -> Result<Option<super::codec::ChunkHeader>, JournalError> {
    match txn.find(bucket, &ChunkKey::new(serial, 0).encode())? {
        None => Ok(None),
        Some(value) => decode_chunk(&value)
            .map(|(header, _)| Some(header))
            .ok_or_else(|| MalformedSnafu { what: "chunk value" }.build()),
    }
}

/// Walks the flushed prefix from `first_serial`, deleting changesets until
/// `want` bytes are freed or nothing flushed remains.  Unflushed changesets
/// are never touched.  Evicting the `last_flushed` changeset itself clears
/// `LAST_FLUSHED_VALID`.
pub(super) fn evict_flushed(txn: &mut JournalTxn<'_>, want: u64) -> Result<u64, JournalError> {
    let mut freed = 0u64;
    while freed < want {
        let meta = txn.meta;
        if !meta.has(Flags::SERIAL_TO_VALID) || !meta.has(Flags::LAST_FLUSHED_VALID) {
            break;
        }
        let serial = meta.first_serial;
        if !serial_le(serial, meta.last_flushed) {
            break;
        }
        let Some(header) = chunk_header(txn, Bucket::Chunks, serial)? else {
            break;
        };
        delete_chunks(txn, Bucket::Chunks, serial, header.chunk_count, &mut freed)?;
        txn.meta.first_serial = header.serial_to;
        if serial == meta.last_flushed {
            txn.meta.flags.clear(Flags::LAST_FLUSHED_VALID);
        }
        trace!(serial, freed, "Evicted flushed changeset.");
    }
    Ok(freed)
}

/// Deletes the history prefix up to and including the changeset starting at
/// `through`.  The caller has already ensured the prefix is flushed.
pub(super) fn delete_upto(txn: &mut JournalTxn<'_>, through: u32) -> Result<(), JournalError> {
    let mut freed = 0u64;
    loop {
        let meta = txn.meta;
        if !meta.has(Flags::SERIAL_TO_VALID) {
            break;
        }
        let serial = meta.first_serial;
        let Some(header) = chunk_header(txn, Bucket::Chunks, serial)? else {
            break;
        };
        delete_chunks(txn, Bucket::Chunks, serial, header.chunk_count, &mut freed)?;
        txn.meta.first_serial = header.serial_to;
        if meta.has(Flags::LAST_FLUSHED_VALID) && serial == meta.last_flushed {
            txn.meta.flags.clear(Flags::LAST_FLUSHED_VALID);
        }
        if serial == through || serial == meta.last_serial {
            break;
        }
    }
    debug!(through, freed, "Deleted history prefix.");
    Ok(())
}

/// Deletes the merged changeset, if one exists, and clears its flag.
pub(super) fn delete_merged(txn: &mut JournalTxn<'_>) -> Result<(), JournalError> {
    if !txn.meta.has(Flags::MERGED_SERIAL_VALID) {
        return Ok(());
    }
    let serial = txn.meta.merged_serial;
    let header = chunk_header(txn, Bucket::Merged, serial)?
        .ok_or_else(|| NotFoundSnafu.build())?;
    let mut freed = 0u64;
    delete_chunks(txn, Bucket::Merged, serial, header.chunk_count, &mut freed)?;
    txn.meta.flags.clear(Flags::MERGED_SERIAL_VALID);
    Ok(())
}

/// From-serial of the oldest changeset the caller has not externalized.
fn first_unflushed(txn: &JournalTxn<'_>) -> Result<u32, JournalError> {
    let meta = txn.meta;
    if meta.has(Flags::LAST_FLUSHED_VALID) {
        let header = chunk_header(txn, Bucket::Chunks, meta.last_flushed)?.ok_or_else(|| {
            MalformedSnafu {
                what: "last_flushed anchor",
            }
            .build()
        })?;
        Ok(header.serial_to)
    } else {
        Ok(meta.first_serial)
    }
}

/// Ensures the whole history is eligible for eviction: a no-op when already
/// flushed, an in-place merge when policy permits it, and *busy* otherwise
/// (the caller must externalize the zone and retry).
pub(super) fn try_flush<C: Changeset>(
    txn: &mut JournalTxn<'_>,
    cfg: &JournalConfig,
) -> Result<(), JournalError> {
    if !txn.meta.has_unflushed() {
        return Ok(());
    }
    if cfg.merge_enabled {
        merge_journal::<C>(txn, cfg)
    } else {
        BusySnafu.fail()
    }
}

/// Folds the unflushed history into a single merged changeset stored under
/// the reserved namespace, then marks everything flushed.  Afterwards reads
/// see `merged_serial -> last_serial_to` as one logical step, and the
/// ordinary history it spans is all evictable.
pub(super) fn merge_journal<C: Changeset>(
    txn: &mut JournalTxn<'_>,
    cfg: &JournalConfig,
) -> Result<(), JournalError> {
    if !txn.meta.has_unflushed() {
        return Ok(());
    }

    let unflushed_from = first_unflushed(txn)?;
    let mut freed = 0u64;

    let mut seed: C = if txn.meta.has(Flags::MERGED_SERIAL_VALID) {
        let serial = txn.meta.merged_serial;
        let blob = read_changeset(txn, Bucket::Merged, serial)?
            .ok_or_else(|| NotFoundSnafu.build())?;
        let merged = C::deserialize(blob.serial, blob.serial_to, &blob.payload)?;
        delete_chunks(txn, Bucket::Merged, serial, blob.chunk_count, &mut freed)?;
        txn.meta.flags.clear(Flags::MERGED_SERIAL_VALID);
        if serial_cmp(merged.serial_to(), unflushed_from) != SerialCmp::Equal {
            return MalformedSnafu {
                what: "merged changeset continuity",
            }
            .fail();
        }
        merged
    } else {
        // Retire the flushed prefix first so adopting the seed does not
        // punch a hole in the middle of the chain.
        if txn.meta.has(Flags::LAST_FLUSHED_VALID) {
            let flushed = txn.meta.last_flushed;
            delete_upto(txn, flushed)?;
        }
        let serial = txn.meta.first_serial;
        let blob = read_changeset(txn, Bucket::Chunks, serial)?.ok_or_else(|| {
            MalformedSnafu {
                what: "history chain",
            }
            .build()
        })?;
        let seed = C::deserialize(blob.serial, blob.serial_to, &blob.payload)?;
        delete_chunks(txn, Bucket::Chunks, serial, blob.chunk_count, &mut freed)?;
        txn.meta.first_serial = seed.serial_to();
        seed
    };

    // Fold the rest of the unflushed tail into the seed.
    let fold_from = seed.serial_to();
    if serial_cmp(fold_from, txn.meta.last_serial_to) != SerialCmp::Equal {
        let last = txn.meta.last_serial;
        let mut fold = |blob: super::iter::ChangesetBlob| -> Result<(), JournalError> {
            let next = C::deserialize(blob.serial, blob.serial_to, &blob.payload)?;
            seed.merge(&next)?;
            Ok(())
        };
        match walk_changesets(&*txn, Bucket::Chunks, fold_from, last, &mut fold)? {
            WalkEnd::Completed => {}
            WalkEnd::Missing { .. } => {
                return MalformedSnafu {
                    what: "history chain",
                }
                .fail()
            }
        }
    }

    writer::insert_changeset(txn, cfg, &seed, InsertMode::Merged)?;
    txn.meta.last_flushed = txn.meta.last_serial;
    txn.meta.flags.set(Flags::LAST_FLUSHED_VALID);
    info!(
        merged_from = seed.serial_from(),
        merged_to = seed.serial_to(),
        "Merged journal history into a single changeset."
    );
    Ok(())
}

/// Deletes the merged changeset (if any) and the whole ordinary history,
/// clearing the corresponding flags.  Key-order sweeps rather than chain
/// walks, so a damaged chain cannot leave anything behind.
pub(super) fn drop_journal(txn: &mut JournalTxn<'_>) -> Result<(), JournalError> {
    for bucket in [Bucket::Merged, Bucket::Chunks] {
        loop {
            let Some((key, _)) = txn.seek(bucket, &[])? else {
                break;
            };
            delete_with_restart(txn, bucket, &key)?;
        }
    }
    txn.meta.flags.clear(Flags::SERIAL_TO_VALID);
    txn.meta.flags.clear(Flags::LAST_FLUSHED_VALID);
    txn.meta.flags.clear(Flags::MERGED_SERIAL_VALID);
    Ok(())
}
