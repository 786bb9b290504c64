//! Changeset loading.

use super::iter::{read_changeset, walk_changesets, WalkEnd};
use super::metadata::{self, Flags};
use super::{JournalError, NotFoundSnafu};
use crate::changeset::Changeset;
use crate::serial::{serial_cmp, SerialCmp};
use crate::store::{Bucket, ReadTxn};

/// Reassembles whole changesets for `[from, last_serial]` against one read
/// snapshot.
///
/// When the requested serial is exactly the merged changeset's, the merged
/// changeset leads the result and the chain continues from its `serial_to`.
/// A missing first hop is *not-found*; a chain that stops short after the
/// first hop yields the partial list, from which the caller detects the gap
/// and falls back to a full transfer.
pub(super) fn load_changesets<C: Changeset>(
    txn: &ReadTxn,
    from: u32,
) -> Result<Vec<C>, JournalError> {
    let meta = metadata::load(txn)?;
    let mut out: Vec<C> = Vec::new();
    let mut start = from;

    if meta.has(Flags::MERGED_SERIAL_VALID) && serial_cmp(meta.merged_serial, from) == SerialCmp::Equal
    {
        let blob = read_changeset(txn, Bucket::Merged, from)?
            .ok_or_else(|| NotFoundSnafu.build())?;
        let merged = C::deserialize(blob.serial, blob.serial_to, &blob.payload)?;
        start = merged.serial_to();
        out.push(merged);
    }

    let tail_pending = meta.has(Flags::SERIAL_TO_VALID)
        && serial_cmp(start, meta.last_serial_to) != SerialCmp::Equal;
    if tail_pending {
        let mut push = |blob: super::iter::ChangesetBlob| -> Result<(), JournalError> {
            out.push(C::deserialize(blob.serial, blob.serial_to, &blob.payload)?);
            Ok(())
        };
        let end = walk_changesets(txn, Bucket::Chunks, start, meta.last_serial, &mut push)?;
        match end {
            WalkEnd::Completed => {}
            WalkEnd::Missing { serial } => {
                if serial == start && out.is_empty() {
                    return NotFoundSnafu.fail();
                }
                // Partial result; the chain stopped short of last_serial.
            }
        }
    } else if out.is_empty() {
        return NotFoundSnafu.fail();
    }

    Ok(out)
}
