//! Backing-store wrapper.
//!
//! The journal consumes an ordered key/value store with MVCC transactions:
//! single writer, any number of snapshot readers, byte-ordered keys, and
//! atomic commit.  This module binds that contract to redb and keeps the rest
//! of the crate ignorant of the engine.  Three tables mirror the data /
//! metadata / merged sub-database layout of the on-disk format.
//!
//! Two pieces of bookkeeping live here rather than in the engine:
//!
//! - **Occupancy.**  The wrapper reports occupied bytes from a full scan at
//!   open plus a running counter; each write transaction accumulates a delta
//!   that is applied on commit and discarded on abort.
//! - **Write budget.**  LMDB-style engines refuse transactions with too many
//!   dirty pages.  redb has no such ceiling, so the wrapper enforces a
//!   configurable per-transaction write budget and reports
//!   [`StoreError::TransactionFull`] when a data write would exceed it; the
//!   journal reacts by committing and restarting.  Metadata writes are exempt
//!   so a transaction can always record its own state before committing.

use std::{
    io,
    path::Path,
    sync::atomic::{AtomicU64, Ordering},
};

use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use snafu::{ResultExt, Snafu};

const CHUNKS_TABLE: TableDefinition<'static, &'static [u8], &'static [u8]> =
    TableDefinition::new("changesets");
const META_TABLE: TableDefinition<'static, &'static str, &'static [u8]> =
    TableDefinition::new("metadata");
const MERGED_TABLE: TableDefinition<'static, &'static [u8], &'static [u8]> =
    TableDefinition::new("merged");

const DB_FILE_NAME: &str = "journal.redb";

/// Approximate per-entry B-tree cost added to key and value lengths when
/// accounting occupied bytes.
pub(crate) const ENTRY_OVERHEAD: u64 = 48;

/// Error surfaced by the backing store.
#[derive(Debug, Snafu)]
pub enum StoreError {
    /// The storage engine reported an error.
    #[snafu(display("backing store error: {}", source))]
    Backend { source: redb::Error },

    /// An I/O error occurred outside the engine (directory creation, stat).
    #[snafu(display("backing store I/O error: {}", source))]
    Io { source: io::Error },

    /// The transaction's write budget is exhausted; commit and restart.
    #[snafu(display("backing store transaction is full"))]
    TransactionFull,
}

fn backend<E: Into<redb::Error>>(source: E) -> StoreError {
    StoreError::Backend {
        source: source.into(),
    }
}

/// Key namespace within the store.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Bucket {
    /// Ordinary changeset chunks, keyed by `(serial, chunk_index)`.
    Chunks,
    /// Chunks of the merged changeset, same key layout.
    Merged,
}

impl Bucket {
    fn table(self) -> TableDefinition<'static, &'static [u8], &'static [u8]> {
        match self {
            Bucket::Chunks => CHUNKS_TABLE,
            Bucket::Merged => MERGED_TABLE,
        }
    }
}

/// An open backing store for one journal directory.
pub(crate) struct RecordStore {
    db: Database,
    occupied: AtomicU64,
    write_budget: usize,
}

impl RecordStore {
    /// Opens (creating if necessary) the store under `data_dir`.
    pub fn open(data_dir: &Path, write_budget: usize) -> Result<Self, StoreError> {
        std::fs::create_dir_all(data_dir).context(IoSnafu)?;
        let db_path = data_dir.join(DB_FILE_NAME);
        let db = Database::create(&db_path).map_err(backend)?;

        // Pre-create the tables so later open_table calls cannot fail with
        // "table does not exist" on the read path.
        let txn = db.begin_write().map_err(backend)?;
        {
            txn.open_table(CHUNKS_TABLE).map_err(backend)?;
            txn.open_table(META_TABLE).map_err(backend)?;
            txn.open_table(MERGED_TABLE).map_err(backend)?;
        }
        txn.commit().map_err(backend)?;

        let occupied = scan_occupied(&db)?;
        debug!(occupied, path = %db_path.display(), "Opened journal store.");

        Ok(RecordStore {
            db,
            occupied: AtomicU64::new(occupied),
            write_budget,
        })
    }

    /// Whether a journal store file is present under `data_dir`.
    pub fn exists(data_dir: &Path) -> bool {
        data_dir.join(DB_FILE_NAME).is_file()
    }

    /// Deletes the store file under `data_dir`.  The store must not be open.
    pub fn wipe(data_dir: &Path) -> Result<(), StoreError> {
        match std::fs::remove_file(data_dir.join(DB_FILE_NAME)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context(IoSnafu),
        }
    }

    /// Occupied bytes as of the last committed transaction.
    pub fn occupied(&self) -> u64 {
        self.occupied.load(Ordering::Acquire)
    }

    /// Begins a read-only snapshot transaction.
    pub fn begin_read(&self) -> Result<ReadTxn, StoreError> {
        Ok(ReadTxn {
            txn: self.db.begin_read().map_err(backend)?,
        })
    }

    /// Begins the write transaction.  Blocks while another write transaction
    /// is in flight.
    pub fn begin_write(&self) -> Result<WriteTxn<'_>, StoreError> {
        Ok(WriteTxn {
            store: self,
            txn: self.db.begin_write().map_err(backend)?,
            writes: 0,
            delta: 0,
        })
    }
}

fn scan_occupied(db: &Database) -> Result<u64, StoreError> {
    let txn = db.begin_read().map_err(backend)?;
    let mut total = 0u64;
    for def in [CHUNKS_TABLE, MERGED_TABLE] {
        let table = txn.open_table(def).map_err(backend)?;
        for entry in table.range::<&[u8]>(..).map_err(backend)? {
            let (key, value) = entry.map_err(backend)?;
            total += key.value().len() as u64 + value.value().len() as u64 + ENTRY_OVERHEAD;
        }
    }
    let meta = txn.open_table(META_TABLE).map_err(backend)?;
    for entry in meta.range::<&str>(..).map_err(backend)? {
        let (key, value) = entry.map_err(backend)?;
        total += key.value().len() as u64 + value.value().len() as u64 + ENTRY_OVERHEAD;
    }
    Ok(total)
}

/// A read-only snapshot of the store.
pub(crate) struct ReadTxn {
    txn: redb::ReadTransaction,
}

impl ReadTxn {
    pub fn get(&self, bucket: Bucket, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let table = self.txn.open_table(bucket.table()).map_err(backend)?;
        Ok(table
            .get(key)
            .map_err(backend)?
            .map(|guard| guard.value().to_vec()))
    }

    pub fn meta_get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let table = self.txn.open_table(META_TABLE).map_err(backend)?;
        Ok(table
            .get(key)
            .map_err(backend)?
            .map(|guard| guard.value().to_vec()))
    }

    pub fn count(&self, bucket: Bucket) -> Result<u64, StoreError> {
        let table = self.txn.open_table(bucket.table()).map_err(backend)?;
        table.len().map_err(backend)
    }
}

/// The store's single write transaction.
///
/// Dropping the transaction without calling [`commit`](WriteTxn::commit)
/// aborts it; the accumulated occupancy delta is discarded with it.
pub(crate) struct WriteTxn<'s> {
    store: &'s RecordStore,
    txn: redb::WriteTransaction,
    writes: usize,
    delta: i64,
}

impl<'s> WriteTxn<'s> {
    pub fn get(&self, bucket: Bucket, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let table = self.txn.open_table(bucket.table()).map_err(backend)?;
        let result = table
            .get(key)
            .map_err(backend)?
            .map(|guard| guard.value().to_vec());
        Ok(result)
    }

    /// First entry whose key is at or after `key`, if any.
    pub fn seek(&self, bucket: Bucket, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>, StoreError> {
        let table = self.txn.open_table(bucket.table()).map_err(backend)?;
        let result = match table.range::<&[u8]>(key..).map_err(backend)?.next() {
            Some(entry) => {
                let (k, v) = entry.map_err(backend)?;
                Some((k.value().to_vec(), v.value().to_vec()))
            }
            None => None,
        };
        Ok(result)
    }

    pub fn count(&self, bucket: Bucket) -> Result<u64, StoreError> {
        let table = self.txn.open_table(bucket.table()).map_err(backend)?;
        table.len().map_err(backend)
    }

    pub fn insert(&mut self, bucket: Bucket, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        if self.writes >= self.store.write_budget {
            return Err(StoreError::TransactionFull);
        }
        let replaced = {
            let mut table = self.txn.open_table(bucket.table()).map_err(backend)?;
            let previous = table.insert(key, value).map_err(backend)?;
            previous.map(|old| old.value().len())
        };
        self.writes += 1;
        self.delta += match replaced {
            Some(old_len) => value.len() as i64 - old_len as i64,
            None => (key.len() + value.len()) as i64 + ENTRY_OVERHEAD as i64,
        };
        Ok(())
    }

    /// Removes `key`, reporting the length of the removed value if present.
    pub fn remove(&mut self, bucket: Bucket, key: &[u8]) -> Result<Option<usize>, StoreError> {
        if self.writes >= self.store.write_budget {
            return Err(StoreError::TransactionFull);
        }
        let removed = {
            let mut table = self.txn.open_table(bucket.table()).map_err(backend)?;
            let previous = table.remove(key).map_err(backend)?;
            previous.map(|old| old.value().len())
        };
        self.writes += 1;
        if let Some(len) = removed {
            self.delta -= (key.len() + len) as i64 + ENTRY_OVERHEAD as i64;
        }
        Ok(removed)
    }

    pub fn meta_get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let table = self.txn.open_table(META_TABLE).map_err(backend)?;
        let result = table
            .get(key)
            .map_err(backend)?
            .map(|guard| guard.value().to_vec());
        Ok(result)
    }

    /// Metadata writes are exempt from the write budget; a transaction must
    /// always be able to record its own state before committing.
    pub fn meta_put(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let replaced = {
            let mut table = self.txn.open_table(META_TABLE).map_err(backend)?;
            let previous = table.insert(key, value).map_err(backend)?;
            previous.map(|old| old.value().len())
        };
        self.delta += match replaced {
            Some(old_len) => value.len() as i64 - old_len as i64,
            None => (key.len() + value.len()) as i64 + ENTRY_OVERHEAD as i64,
        };
        Ok(())
    }

    pub fn meta_remove(&mut self, key: &str) -> Result<(), StoreError> {
        let removed = {
            let mut table = self.txn.open_table(META_TABLE).map_err(backend)?;
            let previous = table.remove(key).map_err(backend)?;
            previous.map(|old| old.value().len())
        };
        if let Some(len) = removed {
            self.delta -= (key.len() + len) as i64 + ENTRY_OVERHEAD as i64;
        }
        Ok(())
    }

    /// Occupied bytes as this transaction would leave them.
    pub fn projected_occupied(&self) -> u64 {
        let base = self.store.occupied() as i64;
        base.saturating_add(self.delta).max(0) as u64
    }

    pub fn commit(self) -> Result<(), StoreError> {
        let WriteTxn {
            store, txn, delta, ..
        } = self;
        txn.commit().map_err(backend)?;
        // Only the single writer mutates the counter, so load/store suffices.
        let base = store.occupied.load(Ordering::Acquire) as i64;
        store
            .occupied
            .store(base.saturating_add(delta).max(0) as u64, Ordering::Release);
        Ok(())
    }

    pub fn abort(self) -> Result<(), StoreError> {
        let WriteTxn { txn, .. } = self;
        txn.abort().map_err(backend)
    }
}
