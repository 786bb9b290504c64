//! Write-transaction helper.
//!
//! Every mutating journal operation runs inside one [`JournalTxn`]: a backend
//! write transaction plus a **shadow copy** of the journal metadata.  The
//! operation mutates only the shadow; `commit` first diff-writes the shadow
//! into the metadata records (inside the same backend transaction) and only
//! then commits the backend, so data and metadata land atomically.  The
//! caller publishes the returned shadow into the live journal state.  On
//! abort, explicit or by drop, both the backend transaction and the shadow
//! are discarded.
//!
//! Larger operations are built out of smaller ones by lending the helper
//! (`&mut JournalTxn`) downward; only the top-level owner commits.  `restart`
//! is the one mid-operation commit point: it persists the shadow, commits,
//! and opens a fresh backend transaction, which is how oversized inserts and
//! sweeps survive the backend's per-transaction write budget.

use super::metadata::{self, Metadata};
use super::JournalError;
use crate::store::{Bucket, RecordStore, StoreError, WriteTxn};

pub(crate) struct JournalTxn<'j> {
    store: &'j RecordStore,
    txn: Option<WriteTxn<'j>>,
    /// Shadowed metadata; published to the live journal only via `commit`.
    pub meta: Metadata,
    /// Metadata as last committed; the diff base for the next commit.
    base: Metadata,
}

impl<'j> JournalTxn<'j> {
    /// Opens the backend write transaction and loads the authoritative
    /// metadata into the shadow.
    pub fn begin(store: &'j RecordStore) -> Result<Self, JournalError> {
        let txn = store.begin_write()?;
        let meta = metadata::load(&txn)?;
        Ok(Self {
            store,
            txn: Some(txn),
            meta,
            base: meta,
        })
    }

    fn backend(&self) -> &WriteTxn<'j> {
        self.txn.as_ref().expect("transaction is active until commit or abort")
    }

    fn backend_mut(&mut self) -> &mut WriteTxn<'j> {
        self.txn.as_mut().expect("transaction is active until commit or abort")
    }

    pub fn find(&self, bucket: Bucket, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.backend().get(bucket, key)
    }

    /// First entry at or after `key`, if any.
    pub fn seek(&self, bucket: Bucket, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>, StoreError> {
        self.backend().seek(bucket, key)
    }

    pub fn insert(&mut self, bucket: Bucket, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.backend_mut().insert(bucket, key, value)
    }

    /// Deletes `key`, reporting the removed value length if it was present.
    pub fn delete(&mut self, bucket: Bucket, key: &[u8]) -> Result<Option<usize>, StoreError> {
        self.backend_mut().remove(bucket, key)
    }

    pub fn count(&self, bucket: Bucket) -> Result<u64, StoreError> {
        self.backend().count(bucket)
    }

    /// Occupied bytes as this transaction would leave them.
    pub fn occupied(&self) -> u64 {
        self.backend().projected_occupied()
    }

    /// Persists the shadow, commits the backend transaction, and opens a
    /// fresh one.  The committed shadow becomes the new diff base.
    ///
    /// This is the mid-insert durability primitive: callers set
    /// `dirty_serial` before restarting so a crash between the commit and
    /// the end of the operation is swept at the next open.
    pub fn restart(&mut self) -> Result<(), StoreError> {
        if let Some(mut txn) = self.txn.take() {
            metadata::write_diff(&mut txn, &self.base, &self.meta)?;
            txn.commit()?;
        }
        self.base = self.meta;
        self.txn = Some(self.store.begin_write()?);
        Ok(())
    }

    /// Persists the shadow and commits.  Returns the shadow for the caller to
    /// publish into the live journal state.
    pub fn commit(mut self) -> Result<Metadata, StoreError> {
        if let Some(mut txn) = self.txn.take() {
            metadata::write_diff(&mut txn, &self.base, &self.meta)?;
            txn.commit()?;
        }
        Ok(self.meta)
    }

    /// Aborts the backend transaction and discards the shadow.
    pub fn abort(mut self) -> Result<(), StoreError> {
        match self.txn.take() {
            Some(txn) => txn.abort(),
            None => Ok(()),
        }
    }
}
