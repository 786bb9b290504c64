//! Changeset interface and a concrete zone-delta implementation.
//!
//! The journal treats a changeset as an opaque payload plus its two SOA
//! serials.  Everything it ever needs from one is captured by the
//! [`Changeset`] trait: report the serial pair, report the serialized size,
//! serialize/deserialize the payload, and (for merge-mode compaction) fold a
//! newer changeset into an older one.  [`ZoneDelta`] is the stock
//! implementation used by the zone subsystem and by the tests in this crate.

use bytes::{Buf, BufMut};
use snafu::{ensure, Snafu};

use crate::serial::{serial_cmp, SerialCmp};

/// Error that occurred while decoding or merging a changeset.
#[derive(Debug, Snafu)]
pub enum ChangesetError {
    /// The serialized payload ended before the structure it promised.
    #[snafu(display("changeset payload truncated"))]
    Truncated,

    /// The serialized payload had trailing bytes after the last record.
    #[snafu(display("changeset payload has {} trailing bytes", extra))]
    TrailingBytes { extra: usize },

    /// Merging was attempted across a serial gap.
    #[snafu(display(
        "cannot merge changeset {}..{} onto history ending at serial {}",
        from,
        to,
        end
    ))]
    MergeGap { end: u32, from: u32, to: u32 },
}

/// The four-operation contract the journal requires of a changeset.
///
/// Implementations must guarantee that `serialize` emits exactly
/// `serialized_size` bytes, and that `deserialize` inverts `serialize` for
/// the same serial pair.
pub trait Changeset: Sized {
    /// The serial this changeset transforms the zone *from*.
    fn serial_from(&self) -> u32;

    /// The serial this changeset transforms the zone *to*.
    fn serial_to(&self) -> u32;

    /// Exact size, in bytes, of the serialized payload.
    fn serialized_size(&self) -> usize;

    /// Appends the serialized payload to `out`.
    fn serialize(&self, out: &mut Vec<u8>);

    /// Rebuilds a changeset from a payload previously produced by
    /// [`serialize`](Changeset::serialize).  The serial pair is supplied by
    /// the caller because the journal keeps it in the chunk key and header
    /// rather than inside the payload.
    fn deserialize(serial_from: u32, serial_to: u32, payload: &[u8]) -> Result<Self, ChangesetError>;

    /// Folds `newer` into `self`, so that applying the result equals applying
    /// `self` then `newer`.  Requires `newer.serial_from() == self.serial_to()`.
    fn merge(&mut self, newer: &Self) -> Result<(), ChangesetError>;
}

/// A single resource record, in the minimal shape the journal's stock
/// changeset carries: wire-format owner name, type, TTL and rdata.
///
/// Both the owner and the rdata are bounded by the DNS wire format (255 and
/// 65535 bytes respectively), which is what keeps the length prefixes of the
/// encoding at 16 bits.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Record {
    pub owner: Vec<u8>,
    pub rtype: u16,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

impl Record {
    fn wire_size(&self) -> usize {
        // u16 owner len + owner + u16 rtype + u32 ttl + u16 rdata len + rdata
        2 + self.owner.len() + 2 + 4 + 2 + self.rdata.len()
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.put_u16(self.owner.len() as u16);
        out.put_slice(&self.owner);
        out.put_u16(self.rtype);
        out.put_u32(self.ttl);
        out.put_u16(self.rdata.len() as u16);
        out.put_slice(&self.rdata);
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, ChangesetError> {
        let owner = take_prefixed(buf)?;
        ensure!(buf.remaining() >= 2 + 4, TruncatedSnafu);
        let rtype = buf.get_u16();
        let ttl = buf.get_u32();
        let rdata = take_prefixed(buf)?;
        Ok(Record {
            owner,
            rtype,
            ttl,
            rdata,
        })
    }
}

fn take_prefixed(buf: &mut &[u8]) -> Result<Vec<u8>, ChangesetError> {
    ensure!(buf.remaining() >= 2, TruncatedSnafu);
    let len = buf.get_u16() as usize;
    ensure!(buf.remaining() >= len, TruncatedSnafu);
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

/// A delta between two zone versions: the records removed from the older
/// version and the records added to reach the newer one.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ZoneDelta {
    soa_from: u32,
    soa_to: u32,
    remove: Vec<Record>,
    add: Vec<Record>,
}

impl ZoneDelta {
    /// Creates an empty delta between the two serials.
    pub fn new(soa_from: u32, soa_to: u32) -> Self {
        Self {
            soa_from,
            soa_to,
            remove: Vec::new(),
            add: Vec::new(),
        }
    }

    /// Records `record` as added in the newer version.
    pub fn push_addition(&mut self, record: Record) {
        self.add.push(record);
    }

    /// Records `record` as removed from the older version.
    pub fn push_removal(&mut self, record: Record) {
        self.remove.push(record);
    }

    /// The records this delta adds.
    pub fn additions(&self) -> &[Record] {
        &self.add
    }

    /// The records this delta removes.
    pub fn removals(&self) -> &[Record] {
        &self.remove
    }
}

impl Changeset for ZoneDelta {
    fn serial_from(&self) -> u32 {
        self.soa_from
    }

    fn serial_to(&self) -> u32 {
        self.soa_to
    }

    fn serialized_size(&self) -> usize {
        let records: usize = self
            .remove
            .iter()
            .chain(self.add.iter())
            .map(Record::wire_size)
            .sum();
        // u32 removal count + u32 addition count + records
        4 + 4 + records
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        out.reserve(self.serialized_size());
        out.put_u32(self.remove.len() as u32);
        out.put_u32(self.add.len() as u32);
        for record in &self.remove {
            record.encode(out);
        }
        for record in &self.add {
            record.encode(out);
        }
    }

    fn deserialize(serial_from: u32, serial_to: u32, payload: &[u8]) -> Result<Self, ChangesetError> {
        let mut buf = payload;
        ensure!(buf.remaining() >= 8, TruncatedSnafu);
        let remove_count = buf.get_u32() as usize;
        let add_count = buf.get_u32() as usize;

        let mut remove = Vec::with_capacity(remove_count.min(1024));
        for _ in 0..remove_count {
            remove.push(Record::decode(&mut buf)?);
        }
        let mut add = Vec::with_capacity(add_count.min(1024));
        for _ in 0..add_count {
            add.push(Record::decode(&mut buf)?);
        }
        ensure!(
            buf.is_empty(),
            TrailingBytesSnafu {
                extra: buf.remaining()
            }
        );

        Ok(ZoneDelta {
            soa_from: serial_from,
            soa_to: serial_to,
            remove,
            add,
        })
    }

    fn merge(&mut self, newer: &Self) -> Result<(), ChangesetError> {
        ensure!(
            serial_cmp(self.soa_to, newer.soa_from) == SerialCmp::Equal,
            MergeGapSnafu {
                end: self.soa_to,
                from: newer.soa_from,
                to: newer.soa_to,
            }
        );

        // A removal cancels a pending addition of the same record; otherwise
        // it joins the removal set.  Additions mirror that against pending
        // removals.  Removals are folded first: within one changeset the
        // removals apply to the older zone version, before its additions.
        for record in &newer.remove {
            if let Some(at) = self.add.iter().position(|have| have == record) {
                self.add.swap_remove(at);
            } else {
                self.remove.push(record.clone());
            }
        }
        for record in &newer.add {
            if let Some(at) = self.remove.iter().position(|have| have == record) {
                self.remove.swap_remove(at);
            } else {
                self.add.push(record.clone());
            }
        }

        self.soa_to = newer.soa_to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::{Changeset, ChangesetError, Record, ZoneDelta};

    fn txt(owner: &[u8], text: &str) -> Record {
        Record {
            owner: owner.to_vec(),
            rtype: 16,
            ttl: 3600,
            rdata: text.as_bytes().to_vec(),
        }
    }

    #[test]
    fn round_trip_preserves_contents() {
        let mut delta = ZoneDelta::new(4, 5);
        delta.push_removal(txt(b"\x01a\x04test\x00", "old"));
        delta.push_addition(txt(b"\x01a\x04test\x00", "new"));
        delta.push_addition(txt(b"\x01b\x04test\x00", "fresh"));

        let mut wire = Vec::new();
        delta.serialize(&mut wire);
        assert_eq!(wire.len(), delta.serialized_size());

        let back = ZoneDelta::deserialize(4, 5, &wire).expect("decode should not fail");
        assert_eq!(back, delta);
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let mut delta = ZoneDelta::new(0, 1);
        delta.push_addition(txt(b"\x04test\x00", "payload"));
        let mut wire = Vec::new();
        delta.serialize(&mut wire);

        let cut = wire.len() - 3;
        let result = ZoneDelta::deserialize(0, 1, &wire[..cut]);
        assert!(matches!(result, Err(ChangesetError::Truncated)));
    }

    #[test]
    fn merge_cancels_removed_then_readded_records() {
        let a = txt(b"\x01a\x04test\x00", "a");
        let b = txt(b"\x01b\x04test\x00", "b");
        let c = txt(b"\x01c\x04test\x00", "c");

        let mut merged = ZoneDelta::new(0, 1);
        merged.push_addition(a.clone());
        merged.push_addition(b.clone());

        let mut second = ZoneDelta::new(1, 2);
        second.push_removal(b.clone());
        second.push_addition(c.clone());

        let mut third = ZoneDelta::new(2, 3);
        third.push_removal(c);
        third.push_addition(b.clone());

        merged.merge(&second).expect("merge should not fail");
        merged.merge(&third).expect("merge should not fail");

        assert_eq!(merged.serial_from(), 0);
        assert_eq!(merged.serial_to(), 3);
        let mut additions: Vec<_> = merged.additions().to_vec();
        additions.sort_by(|x, y| x.owner.cmp(&y.owner));
        assert_eq!(additions, vec![a, b]);
        assert!(merged.removals().is_empty());
    }

    #[test]
    fn merge_across_a_gap_fails() {
        let mut base = ZoneDelta::new(0, 1);
        let skipped = ZoneDelta::new(5, 6);
        assert!(matches!(
            base.merge(&skipped),
            Err(ChangesetError::MergeGap { end: 1, from: 5, to: 6 })
        ));
    }
}
