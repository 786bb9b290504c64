//! Journal configuration.

use std::path::{Path, PathBuf};

use snafu::Snafu;

/// Journals refuse to operate below this size; smaller requested limits are
/// clamped up so that metadata plus at least one full chunk always fit.
pub const MIN_JOURNAL_SIZE: u64 = 1024 * 1024;

/// Default number of data writes permitted in one backing-store transaction
/// before the store reports *transaction-full* and the journal commits and
/// restarts.
pub const DEFAULT_TXN_WRITE_BUDGET: usize = 32 * 1024;

const DEFAULT_FREE_RESERVE_NORMAL: f64 = 0.50;
const DEFAULT_FREE_RESERVE_PREMERGE: f64 = 0.72;
const DEFAULT_FREE_RESERVE_MERGED: f64 = 0.44;
const DEFAULT_SUBCOMMIT_RATIO: f64 = 0.05;

#[derive(Debug, Snafu)]
pub enum BuildError {
    #[snafu(display("parameter '{}' was invalid: {}", param_name, reason))]
    InvalidParameter {
        param_name: &'static str,
        reason: String,
    },
}

/// Journal configuration.
///
/// Carries the data directory, the owning zone's canonical wire-format name,
/// the on-disk size limit, and the space-management policy.  The policy
/// ratios are the knobs behind the writer's occupancy planning: how much of
/// the configured limit is kept free in each of the three modes (plain
/// history, merge enabled but not yet merged, merged changeset present).
#[derive(Clone, Debug)]
pub struct JournalConfig {
    pub(crate) data_dir: PathBuf,
    pub(crate) zone_name: Vec<u8>,
    pub(crate) max_size: u64,
    pub(crate) merge_enabled: bool,
    pub(crate) free_reserve_normal: f64,
    pub(crate) free_reserve_premerge: f64,
    pub(crate) free_reserve_merged: f64,
    pub(crate) subcommit_ratio: f64,
    pub(crate) txn_write_budget: usize,
}

impl JournalConfig {
    /// Starts a builder for a journal under `data_dir` owned by `zone_name`.
    pub fn builder<P>(data_dir: P, zone_name: &[u8]) -> JournalConfigBuilder
    where
        P: AsRef<Path>,
    {
        JournalConfigBuilder {
            data_dir: data_dir.as_ref().to_path_buf(),
            zone_name: zone_name.to_vec(),
            max_size: None,
            merge_enabled: false,
            free_reserve_normal: None,
            free_reserve_premerge: None,
            free_reserve_merged: None,
            subcommit_ratio: None,
            txn_write_budget: None,
        }
    }

    /// The configured (clamped) size limit in bytes.
    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Whether in-journal merge compaction is permitted for this zone.
    pub fn merge_enabled(&self) -> bool {
        self.merge_enabled
    }
}

/// Builder for [`JournalConfig`].
#[derive(Clone, Debug)]
pub struct JournalConfigBuilder {
    data_dir: PathBuf,
    zone_name: Vec<u8>,
    max_size: Option<u64>,
    merge_enabled: bool,
    free_reserve_normal: Option<f64>,
    free_reserve_premerge: Option<f64>,
    free_reserve_merged: Option<f64>,
    subcommit_ratio: Option<f64>,
    txn_write_budget: Option<usize>,
}

impl JournalConfigBuilder {
    /// Sets the maximum size, in bytes, the journal may occupy on disk.
    ///
    /// Values below [`MIN_JOURNAL_SIZE`] are clamped up to it.
    pub fn max_size(mut self, amount: u64) -> Self {
        self.max_size = Some(amount);
        self
    }

    /// Permits merge-mode compaction: under space pressure with nothing
    /// flushed, the journal folds its history into a single merged changeset
    /// instead of asking the caller to flush the zone.
    pub fn merge_enabled(mut self, enabled: bool) -> Self {
        self.merge_enabled = enabled;
        self
    }

    /// Fraction of the size limit kept free when no merged changeset exists
    /// and merging is disabled.  Defaults to 0.50.
    pub fn free_reserve_normal(mut self, ratio: f64) -> Self {
        self.free_reserve_normal = Some(ratio);
        self
    }

    /// Fraction of the size limit kept free when merging is enabled but no
    /// merged changeset exists yet; the extra headroom is what a future merge
    /// will be written into.  Defaults to 0.72.
    pub fn free_reserve_premerge(mut self, ratio: f64) -> Self {
        self.free_reserve_premerge = Some(ratio);
        self
    }

    /// Fraction of the size limit kept free once a merged changeset is
    /// present.  Defaults to 0.44.
    pub fn free_reserve_merged(mut self, ratio: f64) -> Self {
        self.free_reserve_merged = Some(ratio);
        self
    }

    /// Fraction of the size limit a single insert may write before the
    /// journal sub-commits with a dirty-serial marker.  Defaults to 0.05.
    pub fn subcommit_ratio(mut self, ratio: f64) -> Self {
        self.subcommit_ratio = Some(ratio);
        self
    }

    /// Number of data writes permitted in one backing-store transaction
    /// before it reports *transaction-full*.  Defaults to
    /// [`DEFAULT_TXN_WRITE_BUDGET`]; tests shrink it to exercise the
    /// commit-and-restart paths.
    pub fn txn_write_budget(mut self, budget: usize) -> Self {
        self.txn_write_budget = Some(budget);
        self
    }

    /// Consumes this builder and constructs a [`JournalConfig`].
    pub fn build(self) -> Result<JournalConfig, BuildError> {
        if self.zone_name.is_empty() {
            return Err(BuildError::InvalidParameter {
                param_name: "zone_name",
                reason: "cannot be empty".to_string(),
            });
        }

        let max_size = self.max_size.unwrap_or(MIN_JOURNAL_SIZE).max(MIN_JOURNAL_SIZE);

        let free_reserve_normal = self.free_reserve_normal.unwrap_or(DEFAULT_FREE_RESERVE_NORMAL);
        let free_reserve_premerge = self
            .free_reserve_premerge
            .unwrap_or(DEFAULT_FREE_RESERVE_PREMERGE);
        let free_reserve_merged = self.free_reserve_merged.unwrap_or(DEFAULT_FREE_RESERVE_MERGED);
        let subcommit_ratio = self.subcommit_ratio.unwrap_or(DEFAULT_SUBCOMMIT_RATIO);

        for (param_name, ratio) in [
            ("free_reserve_normal", free_reserve_normal),
            ("free_reserve_premerge", free_reserve_premerge),
            ("free_reserve_merged", free_reserve_merged),
            ("subcommit_ratio", subcommit_ratio),
        ] {
            if !(ratio > 0.0 && ratio < 1.0) {
                return Err(BuildError::InvalidParameter {
                    param_name,
                    reason: format!("must be within (0, 1), got {ratio}"),
                });
            }
        }

        let txn_write_budget = self.txn_write_budget.unwrap_or(DEFAULT_TXN_WRITE_BUDGET);
        if txn_write_budget == 0 {
            return Err(BuildError::InvalidParameter {
                param_name: "txn_write_budget",
                reason: "cannot be zero".to_string(),
            });
        }

        Ok(JournalConfig {
            data_dir: self.data_dir,
            zone_name: self.zone_name,
            max_size,
            merge_enabled: self.merge_enabled,
            free_reserve_normal,
            free_reserve_premerge,
            free_reserve_merged,
            subcommit_ratio,
            txn_write_budget,
        })
    }
}
