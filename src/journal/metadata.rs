//! Journal metadata: the handful of well-known records persisted alongside
//! the chunk data, loaded in full at open and diff-written before every
//! commit that changed them.

use super::codec::{decode_u32, decode_u64, encode_u32, encode_u64};
use super::{JournalError, MalformedSnafu};
use crate::store::{ReadTxn, StoreError, WriteTxn};

pub(crate) const KEY_VERSION: &str = "version";
pub(crate) const KEY_ZONE_NAME: &str = "zone_name";
const KEY_MAPSIZE: &str = "mapsize";
const KEY_FIRST_SERIAL: &str = "first_serial";
const KEY_LAST_SERIAL: &str = "last_serial";
const KEY_LAST_SERIAL_TO: &str = "last_serial_to";
const KEY_LAST_FLUSHED: &str = "last_flushed";
const KEY_MERGED_SERIAL: &str = "merged_serial";
const KEY_DIRTY_SERIAL: &str = "dirty_serial";
const KEY_FLAGS: &str = "flags";

/// Current on-disk format version; the leading decimal digit is the major
/// version, so `10` reads as format "1.0".
pub(crate) const FORMAT_VERSION: u32 = 10;

/// Leading decimal digit of a version number.
pub(crate) fn version_major(version: u32) -> u32 {
    let mut major = version;
    while major >= 10 {
        major /= 10;
    }
    major
}

/// Validity bits for the optional metadata fields.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct Flags(u32);

impl Flags {
    /// `last_serial` / `last_serial_to` describe real non-merged history.
    pub const SERIAL_TO_VALID: u32 = 1 << 0;
    /// `last_flushed` names a changeset the caller has externalized.
    pub const LAST_FLUSHED_VALID: u32 = 1 << 1;
    /// A merged changeset exists under the reserved namespace.
    pub const MERGED_SERIAL_VALID: u32 = 1 << 2;
    /// An insert was interrupted mid-transaction; sweep `dirty_serial`.
    pub const DIRTY_SERIAL_VALID: u32 = 1 << 3;

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn has(self, bit: u32) -> bool {
        self.0 & bit != 0
    }

    pub fn set(&mut self, bit: u32) {
        self.0 |= bit;
    }

    pub fn clear(&mut self, bit: u32) {
        self.0 &= !bit;
    }
}

/// The mutable journal state, shadowed per transaction and published on
/// commit.  Serial watermarks are meaningful only when the corresponding
/// validity bit in `flags` is set; `first_serial` tracks the oldest
/// *non-merged* changeset.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct Metadata {
    pub first_serial: u32,
    pub last_serial: u32,
    pub last_serial_to: u32,
    pub last_flushed: u32,
    pub merged_serial: u32,
    pub dirty_serial: u32,
    pub flags: Flags,
}

impl Metadata {
    pub fn has(self, bit: u32) -> bool {
        self.flags.has(bit)
    }

    /// Whether any non-merged changeset exists that the caller has not yet
    /// externalized.
    pub fn has_unflushed(self) -> bool {
        if !self.has(Flags::SERIAL_TO_VALID) {
            return false;
        }
        !self.has(Flags::LAST_FLUSHED_VALID) || self.last_flushed != self.last_serial
    }
}

fn field(raw: Option<Vec<u8>>, what: &'static str) -> Result<Option<u32>, JournalError> {
    match raw {
        None => Ok(None),
        Some(bytes) => decode_u32(&bytes)
            .map(Some)
            .ok_or_else(|| MalformedSnafu { what }.build()),
    }
}

/// Metadata record access, satisfied by both transaction kinds.
pub(crate) trait MetaGet {
    fn meta_get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
}

impl MetaGet for ReadTxn {
    fn meta_get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        ReadTxn::meta_get(self, key)
    }
}

impl MetaGet for WriteTxn<'_> {
    fn meta_get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        WriteTxn::meta_get(self, key)
    }
}

/// Loads the full metadata set from a transaction.  Absent records read
/// as zero; records of unexpected size are *malformed*.
pub(crate) fn load<S: MetaGet>(txn: &S) -> Result<Metadata, JournalError> {
    Ok(Metadata {
        first_serial: field(txn.meta_get(KEY_FIRST_SERIAL)?, KEY_FIRST_SERIAL)?.unwrap_or(0),
        last_serial: field(txn.meta_get(KEY_LAST_SERIAL)?, KEY_LAST_SERIAL)?.unwrap_or(0),
        last_serial_to: field(txn.meta_get(KEY_LAST_SERIAL_TO)?, KEY_LAST_SERIAL_TO)?.unwrap_or(0),
        last_flushed: field(txn.meta_get(KEY_LAST_FLUSHED)?, KEY_LAST_FLUSHED)?.unwrap_or(0),
        merged_serial: field(txn.meta_get(KEY_MERGED_SERIAL)?, KEY_MERGED_SERIAL)?.unwrap_or(0),
        dirty_serial: field(txn.meta_get(KEY_DIRTY_SERIAL)?, KEY_DIRTY_SERIAL)?.unwrap_or(0),
        flags: Flags::from_bits(field(txn.meta_get(KEY_FLAGS)?, KEY_FLAGS)?.unwrap_or(0)),
    })
}

/// Loads the stored format version, if the journal was ever initialized.
pub(crate) fn load_version(txn: &ReadTxn) -> Result<Option<u32>, JournalError> {
    field(ReadTxn::meta_get(txn, KEY_VERSION)?, KEY_VERSION)
}

/// Loads the stored zone name, if the journal was ever initialized.
pub(crate) fn load_zone_name(txn: &ReadTxn) -> Result<Option<Vec<u8>>, StoreError> {
    txn.meta_get(KEY_ZONE_NAME)
}

/// Stamps a freshly created journal with its format version and owner.
pub(crate) fn write_identity(txn: &mut WriteTxn<'_>, zone_name: &[u8]) -> Result<(), StoreError> {
    txn.meta_put(KEY_VERSION, &encode_u32(FORMAT_VERSION))?;
    txn.meta_put(KEY_ZONE_NAME, zone_name)
}

/// The size limit the store was last opened with, the persisted counterpart
/// of a fixed mapping size.
pub(crate) fn load_mapsize(txn: &ReadTxn) -> Result<Option<u64>, JournalError> {
    match ReadTxn::meta_get(txn, KEY_MAPSIZE)? {
        None => Ok(None),
        Some(bytes) => decode_u64(&bytes)
            .map(Some)
            .ok_or_else(|| MalformedSnafu { what: KEY_MAPSIZE }.build()),
    }
}

pub(crate) fn write_mapsize(txn: &mut WriteTxn<'_>, limit: u64) -> Result<(), StoreError> {
    txn.meta_put(KEY_MAPSIZE, &encode_u64(limit))
}

/// Writes every field of `next` that differs from `prev`.  Called right
/// before the backend commit so data and metadata land atomically.
pub(crate) fn write_diff(
    txn: &mut WriteTxn<'_>,
    prev: &Metadata,
    next: &Metadata,
) -> Result<(), StoreError> {
    let fields = [
        (KEY_FIRST_SERIAL, prev.first_serial, next.first_serial),
        (KEY_LAST_SERIAL, prev.last_serial, next.last_serial),
        (KEY_LAST_SERIAL_TO, prev.last_serial_to, next.last_serial_to),
        (KEY_LAST_FLUSHED, prev.last_flushed, next.last_flushed),
        (KEY_MERGED_SERIAL, prev.merged_serial, next.merged_serial),
        (KEY_DIRTY_SERIAL, prev.dirty_serial, next.dirty_serial),
        (KEY_FLAGS, prev.flags.bits(), next.flags.bits()),
    ];
    for (key, old, new) in fields {
        if old != new {
            txn.meta_put(key, &encode_u32(new))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{version_major, Flags, Metadata};

    #[test]
    fn major_digit_extraction() {
        assert_eq!(version_major(10), 1);
        assert_eq!(version_major(19), 1);
        assert_eq!(version_major(20), 2);
        assert_eq!(version_major(7), 7);
        assert_eq!(version_major(123), 1);
    }

    #[test]
    fn unflushed_tracking() {
        let mut md = Metadata::default();
        assert!(!md.has_unflushed());

        md.flags.set(Flags::SERIAL_TO_VALID);
        md.last_serial = 4;
        md.last_serial_to = 5;
        assert!(md.has_unflushed());

        md.flags.set(Flags::LAST_FLUSHED_VALID);
        md.last_flushed = 3;
        assert!(md.has_unflushed());

        md.last_flushed = 4;
        assert!(!md.has_unflushed());
    }
}
