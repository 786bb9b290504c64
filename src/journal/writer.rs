//! Changeset insertion: continuity and collision recovery, space planning,
//! chunking, and mid-insert durability.

use super::codec::{encode_chunk, ChunkHeader, ChunkKey, CHUNK_HEADER_LEN, CHUNK_KEY_LEN,
    CHUNK_PAYLOAD_MAX};
use super::compact::{self, delete_merged, drop_journal, evict_flushed, try_flush};
use super::metadata::Flags;
use super::txn::JournalTxn;
use super::{BusySnafu, JournalError, NoSpaceSnafu};
use crate::changeset::Changeset;
use crate::config::JournalConfig;
use crate::serial::{serial_cmp, serial_lt, SerialCmp};
use crate::store::{Bucket, StoreError, ENTRY_OVERHEAD};

/// Whether an insert stores ordinary history or the merged changeset.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(super) enum InsertMode {
    Normal,
    Merged,
}

/// Stores one changeset.  Normal mode runs the full insert pipeline;
/// merged mode only plans space by eviction and writes under the reserved
/// namespace.
pub(super) fn insert_changeset<C: Changeset>(
    txn: &mut JournalTxn<'_>,
    cfg: &JournalConfig,
    ch: &C,
    mode: InsertMode,
) -> Result<(), JournalError> {
    let from = ch.serial_from();
    let to = ch.serial_to();

    if mode == InsertMode::Normal {
        // A merged changeset that is entirely behind the flush watermark is
        // dead weight once merging is disallowed; retire it up front.
        if !cfg.merge_enabled
            && txn.meta.has(Flags::MERGED_SERIAL_VALID)
            && txn.meta.has(Flags::LAST_FLUSHED_VALID)
            && serial_lt(txn.meta.merged_serial, txn.meta.last_flushed)
        {
            debug!(
                merged_serial = txn.meta.merged_serial,
                "Deleting stale merged changeset; merging is disallowed."
            );
            delete_merged(txn)?;
        }

        // Changeset serials cycle and zones get reinitialized; both cases
        // are recovered by flushing whatever the caller has not persisted
        // yet and clearing the conflicting history.
        if txn.meta.has(Flags::SERIAL_TO_VALID)
            && serial_cmp(txn.meta.last_serial_to, from) != SerialCmp::Equal
        {
            warn!(
                expected = txn.meta.last_serial_to,
                got = from,
                "Discontinuous changeset; dropping journal history."
            );
            try_flush::<C>(txn, cfg)?;
            drop_journal(txn)?;
        }
        if txn
            .find(Bucket::Chunks, &ChunkKey::new(to, 0).encode())?
            .is_some()
        {
            warn!(
                serial = to,
                "Inserted changeset collides with recorded history; evicting prefix."
            );
            try_flush::<C>(txn, cfg)?;
            compact::delete_upto(txn, to)?;
        }
    }

    let payload_size = ch.serialized_size();
    plan_space::<C>(txn, cfg, stored_footprint(payload_size), mode)?;

    let mut payload = Vec::with_capacity(payload_size);
    ch.serialize(&mut payload);
    write_chunks(txn, cfg, mode, from, to, &payload)?;

    match mode {
        InsertMode::Normal => {
            if !txn.meta.has(Flags::SERIAL_TO_VALID) {
                txn.meta.first_serial = from;
            }
            txn.meta.flags.set(Flags::SERIAL_TO_VALID);
            txn.meta.last_serial = from;
            txn.meta.last_serial_to = to;
        }
        InsertMode::Merged => {
            txn.meta.merged_serial = from;
            txn.meta.flags.set(Flags::MERGED_SERIAL_VALID);
        }
    }
    Ok(())
}

/// Bytes a serialized changeset of `payload_size` will occupy on the store,
/// chunk headers, keys and per-entry overhead included.
fn stored_footprint(payload_size: usize) -> u64 {
    let chunks = chunk_count(payload_size) as usize;
    (payload_size + chunks * (CHUNK_HEADER_LEN + CHUNK_KEY_LEN + ENTRY_OVERHEAD as usize)) as u64
}

fn chunk_count(payload_size: usize) -> u32 {
    payload_size.div_ceil(CHUNK_PAYLOAD_MAX).max(1) as u32
}

/// Splits the payload into chunks and inserts them, sub-committing behind a
/// dirty-serial marker whenever a single transaction has absorbed more than
/// the configured share of the journal.  A crash between sub-commits leaves
/// `DIRTY_SERIAL_VALID` set on disk and the next open sweeps the partial
/// insert.
fn write_chunks(
    txn: &mut JournalTxn<'_>,
    cfg: &JournalConfig,
    mode: InsertMode,
    from: u32,
    to: u32,
    payload: &[u8],
) -> Result<(), JournalError> {
    let bucket = match mode {
        InsertMode::Normal => Bucket::Chunks,
        InsertMode::Merged => Bucket::Merged,
    };
    let count = chunk_count(payload.len());
    let subcommit_threshold = (cfg.subcommit_ratio * cfg.max_size as f64) as u64;
    let mut written_since_commit = 0u64;

    let mut pieces: Vec<&[u8]> = payload.chunks(CHUNK_PAYLOAD_MAX).collect();
    if pieces.is_empty() {
        pieces.push(&[]);
    }

    for (index, piece) in pieces.iter().copied().enumerate() {
        let header = ChunkHeader {
            serial_to: to,
            chunk_count: count,
            chunk_size: piece.len() as u32,
        };
        let key = ChunkKey::new(from, index as u32).encode();
        let value = encode_chunk(header, piece);

        match txn.insert(bucket, &key, &value) {
            Ok(()) => {}
            Err(StoreError::TransactionFull) => {
                subcommit(txn, from)?;
                written_since_commit = 0;
                txn.insert(bucket, &key, &value)?;
            }
            Err(e) => return Err(e.into()),
        }

        written_since_commit += (key.len() + value.len()) as u64 + ENTRY_OVERHEAD;
        if written_since_commit > subcommit_threshold && index + 1 < pieces.len() {
            subcommit(txn, from)?;
            written_since_commit = 0;
        }
    }
    Ok(())
}

/// One mid-insert durability point: record the dirty serial, commit, open a
/// fresh transaction, and clear the marker in the shadow so the final commit
/// retires it.
fn subcommit(txn: &mut JournalTxn<'_>, serial: u32) -> Result<(), JournalError> {
    txn.meta.dirty_serial = serial;
    txn.meta.flags.set(Flags::DIRTY_SERIAL_VALID);
    txn.restart()?;
    txn.meta.flags.clear(Flags::DIRTY_SERIAL_VALID);
    trace!(serial, "Sub-committed partial insert.");
    Ok(())
}

/// Occupancy the policy permits before eviction kicks in, which depends on
/// how much headroom a future merge needs.
fn allowed_occupancy(cfg: &JournalConfig, merged_present: bool) -> u64 {
    let reserve = if merged_present {
        cfg.free_reserve_merged
    } else if cfg.merge_enabled {
        cfg.free_reserve_premerge
    } else {
        cfg.free_reserve_normal
    };
    ((1.0 - reserve) * cfg.max_size as f64) as u64
}

/// Bytes that must be freed before `incoming` may be written: the policy
/// excess over allowed occupancy, or the hard shortfall against the size
/// limit, whichever is larger.  The merged changeset itself is gated only by
/// the hard limit; the occupancy reserves exist to keep room *for* it.
fn shortfall(txn: &JournalTxn<'_>, cfg: &JournalConfig, incoming: u64, mode: InsertMode) -> u64 {
    let occupied = txn.occupied();
    let hard = occupied.saturating_add(incoming).saturating_sub(cfg.max_size);
    if mode == InsertMode::Merged {
        return hard;
    }
    let allowed = allowed_occupancy(cfg, txn.meta.has(Flags::MERGED_SERIAL_VALID));
    let soft = occupied.saturating_sub(allowed);
    soft.max(hard)
}

/// Makes room for `incoming` stored bytes: evict flushed history, and in
/// normal mode fall back to merge (when configured) or ask the caller to
/// flush (*busy*).  *No-space* when nothing more can ever be reclaimed.
fn plan_space<C: Changeset>(
    txn: &mut JournalTxn<'_>,
    cfg: &JournalConfig,
    incoming: u64,
    mode: InsertMode,
) -> Result<(), JournalError> {
    let mut need = shortfall(txn, cfg, incoming, mode);
    if need == 0 {
        return Ok(());
    }

    // Ask for a multiple of the shortfall so eviction cost is amortized
    // across many inserts rather than paid on every one.
    evict_flushed(txn, need.saturating_mul(3))?;
    need = shortfall(txn, cfg, incoming, mode);
    if need == 0 {
        return Ok(());
    }

    if mode == InsertMode::Merged {
        return NoSpaceSnafu.fail();
    }

    if !cfg.merge_enabled {
        if txn.meta.has_unflushed() {
            // The caller can make the remainder evictable by flushing.
            return BusySnafu.fail();
        }
        return NoSpaceSnafu.fail();
    }

    // Merge folds the whole history into one changeset and marks it
    // flushed, after which eviction can take everything it spans.
    compact::merge_journal::<C>(txn, cfg)?;
    need = shortfall(txn, cfg, incoming, mode);
    if need > 0 {
        evict_flushed(txn, need.saturating_mul(3))?;
        need = shortfall(txn, cfg, incoming, mode);
    }
    if need == 0 {
        Ok(())
    } else {
        NoSpaceSnafu.fail()
    }
}
