//! Per-zone changeset journal
//!
//! This library implements an append-only, crash-safe, bounded-size log of
//! incremental zone updates ("from serial X to serial Y" deltas), backed by
//! an ordered key/value store with multi-reader / single-writer transactions.
//! It lets an authoritative server durably record zone mutations between full
//! zone-file flushes, replay them after restart, serve IXFR from them, and,
//! when flushing is deferred by policy, compact the accumulated history into
//! a single merged changeset so the log never grows without bound.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

#[macro_use]
extern crate tracing;

pub mod changeset;
pub use changeset::{Changeset, ChangesetError, Record, ZoneDelta};

pub mod config;
pub use config::{JournalConfig, JournalConfigBuilder};

mod journal;
pub use journal::{CheckDepth, CheckReport, Journal, JournalError, JournalInfo};

pub mod serial;

pub(crate) mod store;
pub use store::StoreError;
