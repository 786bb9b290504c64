//! The journal proper: lifecycle and recovery, the public operations, and
//! the self-check.
//!
//! A [`Journal`] owns one directory holding the backing store and an
//! advisory lock file.  Every mutating operation runs in a single write
//! transaction with shadowed metadata (see [`txn`]), so data and metadata
//! are always published together; crash recovery at open therefore only has
//! to handle the one deliberate mid-operation commit point, the dirty-serial
//! marker of an oversized insert.

mod codec;
mod compact;
mod iter;
mod metadata;
mod reader;
mod txn;
mod writer;

#[cfg(test)]
mod tests;

use std::marker::PhantomData;
use std::path::Path;

use fslock::LockFile;
use snafu::{ResultExt, Snafu};

use crate::changeset::{Changeset, ChangesetError};
use crate::config::JournalConfig;
use crate::serial::{serial_cmp, SerialCmp};
use crate::store::{Bucket, RecordStore, StoreError};

use self::codec::ChunkKey;
use self::iter::{read_changeset, walk_changesets, WalkEnd};
use self::metadata::{version_major, Flags, Metadata, FORMAT_VERSION};
use self::txn::JournalTxn;
use self::writer::InsertMode;

const LOCK_FILE_NAME: &str = "journal.lock";

/// Error surfaced by journal operations.
#[derive(Debug, Snafu)]
pub enum JournalError {
    /// A caller-supplied argument made no sense.
    #[snafu(display("invalid argument: {}", reason))]
    InvalidArgument { reason: &'static str },

    /// The caller must flush the zone (or release the other handle holding
    /// this journal open) and retry.
    #[snafu(display("journal requires a flush before it can continue"))]
    Busy,

    /// The size limit shrank below the persisted data while unflushed
    /// history exists; flush under the old limit, then retry.
    #[snafu(display("journal size limit shrank below persisted data with unflushed history"))]
    TryAgain,

    /// The changeset cannot fit even after all permissible eviction.
    #[snafu(display("changeset does not fit into the journal"))]
    NoSpace,

    /// The requested changeset is not in the journal.
    #[snafu(display("requested changeset is not in the journal"))]
    NotFound,

    /// An on-disk record had an unexpected shape.
    #[snafu(display("malformed journal record: {}", what))]
    Malformed { what: &'static str },

    /// The on-disk format has a different major version.
    #[snafu(display("unsupported journal format version {}", version))]
    Unsupported { version: u32 },

    /// The journal on disk belongs to a different zone; the stored name is
    /// handed back so the caller can decide what to do.
    #[snafu(display("journal belongs to another zone"))]
    ZoneMismatch { stored: Vec<u8> },

    /// An I/O error outside the backing store (lock file, directories).
    #[snafu(display("journal I/O error: {}", source))]
    Io { source: std::io::Error },

    /// The backing store reported an error.
    #[snafu(context(false), display("{}", source))]
    Store { source: StoreError },

    /// The changeset implementation reported an error.
    #[snafu(context(false), display("{}", source))]
    Changeset { source: ChangesetError },
}

/// Visible serial range of a journal.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct JournalInfo {
    /// No changesets at all, merged included.
    pub empty: bool,
    /// Oldest serial a load can start from: the merged changeset's when one
    /// exists, the oldest stored changeset's otherwise.  Meaningful only
    /// when not empty.
    pub serial_from: u32,
    /// To-serial of the newest changeset.  Meaningful only when not empty.
    pub serial_to: u32,
}

/// How thorough a [`Journal::check`] should be.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CheckDepth {
    /// Metadata consistency and flag anchors only.
    Shallow,
    /// Full chain walk verifying chunk completeness and continuity.
    Deep,
}

/// Outcome of a successful [`Journal::check`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct CheckReport {
    /// Changesets verified (zero for shallow checks).
    pub changesets: u64,
    /// Physical chunks present.
    pub chunks: u64,
    /// Occupied bytes, as space accounting sees them.
    pub occupied_bytes: u64,
    /// Whether a merged changeset is present.
    pub merged_present: bool,
}

/// A per-zone changeset journal.
///
/// One handle owns the journal directory exclusively (advisory lock); the
/// backing store serializes the single writer against any number of
/// snapshot readers.
pub struct Journal<C: Changeset> {
    config: JournalConfig,
    store: RecordStore,
    meta: Metadata,
    _lock: LockFile,
    _marker: PhantomData<C>,
}

impl<C: Changeset> Journal<C> {
    /// Opens (creating if necessary) the journal described by `config`.
    ///
    /// # Errors
    ///
    /// *busy* when another handle holds the journal open; *unsupported* on a
    /// major format version mismatch; the zone-name mismatch error carries
    /// the stored owner back to the caller; *try-again* when the size limit
    /// shrank below the persisted data while unflushed history exists.
    pub fn open(config: JournalConfig) -> Result<Self, JournalError> {
        std::fs::create_dir_all(&config.data_dir).context(IoSnafu)?;

        let lock_path = config.data_dir.join(LOCK_FILE_NAME);
        let mut lock = LockFile::open(&lock_path).context(IoSnafu)?;
        if !lock.try_lock().context(IoSnafu)? {
            return BusySnafu.fail();
        }

        let mut store = RecordStore::open(&config.data_dir, config.txn_write_budget)?;
        let mut fresh;
        let mut meta = Metadata::default();
        let mut persisted_limit = None;
        {
            let rtxn = store.begin_read()?;
            match metadata::load_version(&rtxn)? {
                None => fresh = true,
                Some(version) => {
                    if version_major(version) != version_major(FORMAT_VERSION) {
                        return UnsupportedSnafu { version }.fail();
                    }
                    let stored = metadata::load_zone_name(&rtxn)?.unwrap_or_default();
                    if stored != config.zone_name {
                        return ZoneMismatchSnafu { stored }.fail();
                    }
                    meta = metadata::load(&rtxn)?;
                    persisted_limit = metadata::load_mapsize(&rtxn)?;
                    fresh = false;
                }
            }
        }

        // A previous open may have run with a larger limit than this one;
        // data written under it has no room now.
        if persisted_limit.is_some_and(|limit| limit > config.max_size) {
            if meta.has_unflushed() {
                return TryAgainSnafu.fail();
            }
            info!(
                limit = config.max_size,
                "Journal size limit shrank below the stored mapping; recreating."
            );
            drop(store);
            RecordStore::wipe(&config.data_dir)?;
            store = RecordStore::open(&config.data_dir, config.txn_write_budget)?;
            meta = Metadata::default();
            persisted_limit = None;
            fresh = true;
        }

        if fresh || persisted_limit != Some(config.max_size) {
            let mut wtxn = store.begin_write()?;
            if fresh {
                metadata::write_identity(&mut wtxn, &config.zone_name)?;
            }
            metadata::write_mapsize(&mut wtxn, config.max_size)?;
            wtxn.commit()?;
        }

        if meta.has(Flags::DIRTY_SERIAL_VALID) {
            meta = sweep_dirty_serial(&store)?;
        }

        Ok(Journal {
            config,
            store,
            meta,
            _lock: lock,
            _marker: PhantomData,
        })
    }

    /// Whether a journal is present under `path`.  A stat-level check; the
    /// journal is not opened or validated.
    pub fn exists<P: AsRef<Path>>(path: P) -> bool {
        RecordStore::exists(path.as_ref())
    }

    /// Detaches from the journal.  Every state transition was committed as
    /// it happened, so closing performs no writes.
    pub fn close(self) {}

    /// The zone this handle was opened for.
    pub fn zone_name(&self) -> &[u8] {
        &self.config.zone_name
    }

    /// The zone name recorded inside the journal.
    pub fn stored_zone_name(&self) -> Result<Vec<u8>, JournalError> {
        let rtxn = self.store.begin_read()?;
        metadata::load_zone_name(&rtxn)?.ok_or_else(|| {
            MalformedSnafu {
                what: "zone_name record",
            }
            .build()
        })
    }

    /// Reports the visible serial range.
    pub fn info(&self) -> JournalInfo {
        let meta = self.meta;
        let merged = meta.has(Flags::MERGED_SERIAL_VALID);
        let history = meta.has(Flags::SERIAL_TO_VALID);
        JournalInfo {
            empty: !merged && !history,
            serial_from: if merged {
                meta.merged_serial
            } else {
                meta.first_serial
            },
            serial_to: meta.last_serial_to,
        }
    }

    /// Stores one changeset.
    ///
    /// # Errors
    ///
    /// *busy* asks the caller to flush the zone and retry; *no-space* means
    /// the changeset cannot fit even after eviction; store errors propagate.
    pub fn store_changeset(&mut self, ch: &C) -> Result<(), JournalError> {
        self.store_changesets(std::slice::from_ref(ch))
    }

    /// Stores a batch of changesets in one transaction; either all of them
    /// become visible or none do.
    pub fn store_changesets(&mut self, changesets: &[C]) -> Result<(), JournalError> {
        for ch in changesets {
            if serial_cmp(ch.serial_from(), ch.serial_to()) == SerialCmp::Equal {
                return InvalidArgumentSnafu {
                    reason: "changeset serials must differ",
                }
                .fail();
            }
        }
        if changesets.is_empty() {
            return Ok(());
        }

        let mut txn = JournalTxn::begin(&self.store)?;
        let mut outcome = Ok(());
        for ch in changesets {
            outcome = writer::insert_changeset(&mut txn, &self.config, ch, InsertMode::Normal);
            if outcome.is_err() {
                break;
            }
        }
        match outcome {
            Ok(()) => {
                self.meta = txn.commit()?;
                Ok(())
            }
            Err(e) => {
                abort_and_resync(&self.store, &mut self.meta, txn);
                Err(e)
            }
        }
    }

    /// Loads whole changesets starting at `from` (see the reader contract:
    /// a merged prefix is prepended when `from` names it, a missing start is
    /// *not-found*, and a chain that stops short yields a partial list).
    pub fn load_changesets(&self, from: u32) -> Result<Vec<C>, JournalError> {
        let rtxn = self.store.begin_read()?;
        reader::load_changesets(&rtxn, from)
    }

    /// Declares that the caller has durably externalized the zone: all
    /// history up to the newest changeset becomes eligible for eviction.
    /// Metadata-only, and idempotent.
    pub fn flush(&mut self) -> Result<(), JournalError> {
        let mut txn = JournalTxn::begin(&self.store)?;
        if txn.meta.has(Flags::SERIAL_TO_VALID) {
            txn.meta.last_flushed = txn.meta.last_serial;
            txn.meta.flags.set(Flags::LAST_FLUSHED_VALID);
        }
        self.meta = txn.commit()?;
        Ok(())
    }

    /// Runs merge compaction directly instead of waiting for space pressure
    /// to trigger it.  Test-only: production merges happen inside the insert
    /// pipeline so they stay atomic with the write that needed the room.
    #[cfg(test)]
    pub(crate) fn force_merge(&mut self) -> Result<(), JournalError> {
        let mut txn = JournalTxn::begin(&self.store)?;
        compact::merge_journal::<C>(&mut txn, &self.config)?;
        self.meta = txn.commit()?;
        Ok(())
    }

    /// Verifies journal consistency using only read transactions.
    pub fn check(&self, depth: CheckDepth) -> Result<CheckReport, JournalError> {
        let rtxn = self.store.begin_read()?;
        let meta = metadata::load(&rtxn)?;
        let merged_present = meta.has(Flags::MERGED_SERIAL_VALID);

        if merged_present
            && rtxn
                .get(Bucket::Merged, &ChunkKey::new(meta.merged_serial, 0).encode())?
                .is_none()
        {
            return MalformedSnafu {
                what: "merged changeset missing",
            }
            .fail();
        }
        if meta.has(Flags::LAST_FLUSHED_VALID)
            && rtxn
                .get(Bucket::Chunks, &ChunkKey::new(meta.last_flushed, 0).encode())?
                .is_none()
        {
            return MalformedSnafu {
                what: "last_flushed does not name a changeset",
            }
            .fail();
        }
        let has_tail = meta.has(Flags::SERIAL_TO_VALID)
            && serial_cmp(meta.first_serial, meta.last_serial_to) != SerialCmp::Equal;
        if has_tail
            && rtxn
                .get(Bucket::Chunks, &ChunkKey::new(meta.first_serial, 0).encode())?
                .is_none()
        {
            return MalformedSnafu {
                what: "first changeset missing",
            }
            .fail();
        }

        if depth == CheckDepth::Shallow {
            return Ok(CheckReport {
                changesets: 0,
                chunks: rtxn.count(Bucket::Chunks)? + rtxn.count(Bucket::Merged)?,
                occupied_bytes: self.store.occupied(),
                merged_present,
            });
        }

        let mut report = CheckReport {
            merged_present,
            ..CheckReport::default()
        };

        if merged_present {
            let blob = read_changeset(&rtxn, Bucket::Merged, meta.merged_serial)?
                .ok_or_else(|| NotFoundSnafu.build())?;
            let anchored = serial_cmp(blob.serial_to, meta.last_serial_to) == SerialCmp::Equal
                || rtxn
                    .get(Bucket::Chunks, &ChunkKey::new(blob.serial_to, 0).encode())?
                    .is_some();
            if !anchored {
                return MalformedSnafu {
                    what: "merged changeset continuity",
                }
                .fail();
            }
            report.changesets += 1;
            report.chunks += u64::from(blob.chunk_count);
            report.occupied_bytes += blob.stored_bytes;
        }

        if has_tail {
            let mut tail_end = meta.first_serial;
            let mut tally = |blob: iter::ChangesetBlob| -> Result<(), JournalError> {
                report.changesets += 1;
                report.chunks += u64::from(blob.chunk_count);
                report.occupied_bytes += blob.stored_bytes;
                tail_end = blob.serial_to;
                Ok(())
            };
            let end = walk_changesets(&rtxn, Bucket::Chunks, meta.first_serial, meta.last_serial, &mut tally)?;
            if end != WalkEnd::Completed {
                return MalformedSnafu {
                    what: "history chain hole",
                }
                .fail();
            }
            if serial_cmp(tail_end, meta.last_serial_to) != SerialCmp::Equal {
                return MalformedSnafu {
                    what: "last_serial_to mismatch",
                }
                .fail();
            }
        }

        Ok(report)
    }
}

/// Deletes every chunk left behind by an insert that died between its
/// sub-commits, then retires the marker.
fn sweep_dirty_serial(store: &RecordStore) -> Result<Metadata, JournalError> {
    let mut txn = JournalTxn::begin(store)?;
    let dirty = txn.meta.dirty_serial;
    info!(serial = dirty, "Sweeping chunks left by an interrupted insert.");

    let mut index = 0u32;
    while compact::delete_with_restart(&mut txn, Bucket::Chunks, &ChunkKey::new(dirty, index).encode())?
        .is_some()
    {
        index += 1;
    }
    // A merged-mode insert can also die mid-way, but never sweep a merged
    // changeset the metadata still vouches for.
    if !(txn.meta.has(Flags::MERGED_SERIAL_VALID) && txn.meta.merged_serial == dirty) {
        let mut index = 0u32;
        while compact::delete_with_restart(&mut txn, Bucket::Merged, &ChunkKey::new(dirty, index).encode())?
            .is_some()
        {
            index += 1;
        }
    }

    txn.meta.flags.clear(Flags::DIRTY_SERIAL_VALID);
    txn.commit().map_err(Into::into)
}

/// Rolls back a failed operation and refreshes the live metadata from disk;
/// sub-commits inside the failed operation may have published state the
/// in-memory copy has not seen.
fn abort_and_resync(store: &RecordStore, live: &mut Metadata, txn: JournalTxn<'_>) {
    if let Err(error) = txn.abort() {
        warn!(%error, "Failed to abort journal transaction.");
    }
    let reloaded = store
        .begin_read()
        .map_err(JournalError::from)
        .and_then(|rtxn| metadata::load(&rtxn));
    match reloaded {
        Ok(meta) => *live = meta,
        Err(error) => warn!(%error, "Failed to reload journal metadata after abort."),
    }
}
