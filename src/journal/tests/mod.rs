use std::path::Path;
use std::sync::Once;

use rand::{rngs::StdRng, Rng, SeedableRng};
use temp_dir::TempDir;

use crate::changeset::{Changeset, Record, ZoneDelta};
use crate::config::JournalConfig;
use crate::journal::Journal;

mod basic;
mod merge;
mod wraparound;

/// Canonical wire-format apex used throughout the tests.
pub(crate) const APEX: &[u8] = b"\x04test\x00";

static TRACING: Once = Once::new();

/// Installs a fmt subscriber honoring `RUST_LOG`, once per test binary.
pub(crate) fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

pub(crate) fn with_temp_dir<F: FnOnce(&Path)>(f: F) {
    init_tracing();
    let dir = TempDir::new().expect("temp dir creation should not fail");
    f(dir.path());
}

pub(crate) fn journal_config(dir: &Path, max_size: u64) -> JournalConfig {
    JournalConfig::builder(dir, APEX)
        .max_size(max_size)
        .build()
        .expect("config should build")
}

pub(crate) fn open_default(dir: &Path, max_size: u64) -> Journal<ZoneDelta> {
    Journal::open(journal_config(dir, max_size)).expect("open should not fail")
}

pub(crate) fn seeded_rng() -> StdRng {
    StdRng::seed_from_u64(0x5eed_1982)
}

/// A TXT record `<label>.test` with the given rdata.
pub(crate) fn txt_record(label: &str, rdata: &[u8]) -> Record {
    let mut owner = Vec::with_capacity(1 + label.len() + APEX.len());
    owner.push(label.len() as u8);
    owner.extend_from_slice(label.as_bytes());
    owner.extend_from_slice(APEX);
    Record {
        owner,
        rtype: 16,
        ttl: 3600,
        rdata: rdata.to_vec(),
    }
}

/// A delta of `records` random additions plus `records` random removals.
pub(crate) fn random_delta(rng: &mut StdRng, from: u32, to: u32, records: usize) -> ZoneDelta {
    random_delta_sized(rng, from, to, records, 48)
}

pub(crate) fn random_delta_sized(
    rng: &mut StdRng,
    from: u32,
    to: u32,
    records: usize,
    rdata_len: usize,
) -> ZoneDelta {
    let mut delta = ZoneDelta::new(from, to);
    for i in 0..records {
        let mut added = vec![0u8; rdata_len];
        rng.fill(&mut added[..]);
        delta.push_addition(txt_record(&format!("a{from}x{i}"), &added));

        let mut removed = vec![0u8; rdata_len];
        rng.fill(&mut removed[..]);
        delta.push_removal(txt_record(&format!("r{from}x{i}"), &removed));
    }
    delta
}

pub(crate) fn assert_continuous(list: &[ZoneDelta]) {
    for pair in list.windows(2) {
        assert_eq!(
            pair[0].serial_to(),
            pair[1].serial_from(),
            "loaded history must chain continuously"
        );
    }
}
