#![forbid(unsafe_code)]
//! Shared data model for the defragd workspace.
//!
//! Everything here is plain data: records exchanged between the extent-map
//! parser, the per-filesystem state, and the orchestrator, plus the tunables
//! that bound queues, trackers, and loop cadence. Components receive an
//! immutable [`Config`] by reference; there is no process-global state.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

// ── Tunables ────────────────────────────────────────────────────────────────

/// Filesystem block size assumed by the cost model and extent accounting.
pub const BLOCK_SIZE: u64 = 4096;

/// Total candidate-queue capacity shared by both compression classes.
pub const MAX_QUEUE_LENGTH: usize = 2000;

/// Reserved capacity per class: neither class may squeeze the other below
/// its proportional share of this.
pub const QUEUE_RESERVE_PER_CLASS: usize = MAX_QUEUE_LENGTH / 2;

/// Cap on the write tracker; oldest entries are evicted past this.
pub const MAX_TRACKED_WRITTEN_FILES: usize = 10_000;

/// Entries retained per class in the cost-achievement history.
pub const COST_HISTORY_SIZE: usize = 2000;

/// Minimum interval between threshold recomputations.
pub const COST_COMPUTE_DELAY: Duration = Duration::from_secs(60);

/// Weighted-percentile cut used for the queueing threshold, in percent.
pub const COST_THRESHOLD_PERCENTILE: f64 = 50.0;

/// A file must promise at least this cost ratio over the achievable
/// threshold before it is worth queueing.
pub const MIN_EXPECTED_BENEFIT: f64 = 1.05;

/// How long a defragmented file is shielded from re-queueing.
pub const IGNORE_AFTER_DEFRAG_DELAY: Duration = Duration::from_secs(12 * 3600);

/// A tracked written file is consolidated no later than this after its
/// first observed write, even if writes keep arriving.
pub const MAX_WRITES_DELAY: Duration = Duration::from_secs(2 * 3600);

/// Cadence of the write-consolidation tick.
pub const WRITE_CONSOLIDATION_PERIOD: Duration = Duration::from_secs(5);

/// Modulus (in seconds) for the per-file fuzzy delay that spreads bursts of
/// simultaneously-written files across consolidation ticks.
pub const DEFRAG_CHECK_DISTRIBUTION_PERIOD: u32 = 120;

/// Mount-table rescan cadence of the supervisor.
pub const FS_DETECT_PERIOD: Duration = Duration::from_secs(60);

/// The write-event tracer is restarted this often.
pub const FATRACE_TTL: Duration = Duration::from_secs(24 * 3600);

/// Slow-scan batch sizing.
pub const MIN_FILES_BATCH_SIZE: usize = 50;
pub const MAX_FILES_BATCH_SIZE: usize = 250;

/// Inter-batch delay clamp for the slow scan, in seconds. The minimum is
/// divided by the speed multiplier.
pub const MIN_DELAY_BETWEEN_FILEFRAGS: f64 = 5.0;
pub const MAX_DELAY_BETWEEN_FILEFRAGS: f64 = 180.0;

/// Inter-defrag delay clamp, in seconds. Once the queue is >= 1% full the
/// defrag loop runs at the minimum delay.
pub const MIN_DELAY_BETWEEN_DEFRAGS: f64 = 0.1;
pub const MAX_DELAY_BETWEEN_DEFRAGS: f64 = 10.0;

/// `commit=N` mount-option default.
pub const DEFAULT_COMMIT_DELAY: Duration = Duration::from_secs(30);

/// Type-tracker weights are aged once their sum exceeds this.
pub const TYPE_TRACKER_MEMORY: f64 = 10_000.0;

/// Compressed btrfs extents span at most this many blocks; backward jumps
/// within this distance are overlap artifacts, not seeks.
pub const COMPRESSED_EXTENT_BLOCKS: u64 = 32;

/// Assumed on-disk shrinkage when rewriting a compressed file.
pub const EXPECTED_COMPRESS_RATIO: f64 = 0.5;

/// Default argv byte budget for one extent-listing invocation.
pub const DEFAULT_FILEFRAG_ARG_MAX: usize = 131_072 - 100 - 4096;

/// Device-time windows checked before admitting a defrag: `(window_secs,
/// fraction_of_window)`. Fractions scale with the speed multiplier.
pub const DEVICE_USAGE_WINDOWS: [(f64, f64); 2] = [(5.0, 0.5), (60.0, 0.25)];

/// Files smaller than one block cannot be fragmented.
pub const MIN_INTERESTING_FILE_SIZE: u64 = 4096;

// ── Compression classes ─────────────────────────────────────────────────────

/// Which candidate queue and history a file belongs to, decided by whether
/// the majority of its extent blocks are compressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressClass {
    Compressed,
    Uncompressed,
}

impl CompressClass {
    pub const ALL: [Self; 2] = [Self::Compressed, Self::Uncompressed];

    /// Queue/history slot for this class.
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::Compressed => 0,
            Self::Uncompressed => 1,
        }
    }

    #[must_use]
    pub fn other(self) -> Self {
        match self {
            Self::Compressed => Self::Uncompressed,
            Self::Uncompressed => Self::Compressed,
        }
    }

    #[must_use]
    pub fn from_index(index: usize) -> Self {
        if index == 0 {
            Self::Compressed
        } else {
            Self::Uncompressed
        }
    }
}

impl fmt::Display for CompressClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compressed => write!(f, "compressed"),
            Self::Uncompressed => write!(f, "uncompressed"),
        }
    }
}

// ── Records ─────────────────────────────────────────────────────────────────

/// A file path relative to its filesystem root — the canonical identity key
/// for queues, trackers, and the recently-defragmented set.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShortPath(pub String);

impl ShortPath {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShortPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShortPath {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// One measured file: the unit flowing from the extent-map parser into the
/// candidate queues. Immutable once queued; a re-measurement produces a new
/// record that supersedes the old one.
#[derive(Debug, Clone, PartialEq)]
pub struct FragRecord {
    pub short_path: ShortPath,
    /// File size in bytes.
    pub size: u64,
    /// Class of the majority of the file's extent blocks.
    pub class: CompressClass,
    /// Modeled read-time ratio, >= 1.0 (1.0 means perfectly sequential).
    pub cost: f64,
}

/// One defrag outcome: what the file cost before, what it settled at, and
/// how big it was. The threshold computation weighs these by size and
/// recency.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostAchievement {
    pub initial_cost: f64,
    pub final_cost: f64,
    pub size: u64,
}

/// First and most recent observed write to one short path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteEvent {
    pub first: SystemTime,
    pub last: SystemTime,
}

/// Slow-scan checkpoint persisted per filesystem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanCheckpoint {
    pub processed: u64,
    pub total: u64,
}

// ── Runtime configuration ───────────────────────────────────────────────────

/// Immutable runtime configuration, built once from the CLI and passed to
/// every component by reference.
#[derive(Debug, Clone)]
pub struct Config {
    /// Wall-clock target for one complete slow-scan pass.
    pub slow_scan_period: Duration,
    /// Delay before the first slow-scan pass when resuming from a checkpoint.
    pub slow_start: Duration,
    /// Passed through to the defrag tool as `-t <value>` when set.
    pub target_extent_size: Option<String>,
    /// Scales I/O budgets, batch ceilings, and inter-batch delays.
    pub speed_multiplier: f64,
    /// Number of rotational drives backing the filesystem (RAID).
    pub drive_count: f64,
    /// Directory holding the persistent state files.
    pub store_dir: PathBuf,
    /// Argv byte budget for one extent-listing invocation.
    pub filefrag_arg_max: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            slow_scan_period: Duration::from_secs(7 * 24 * 3600),
            slow_start: Duration::from_secs(600),
            target_extent_size: None,
            speed_multiplier: 1.0,
            drive_count: 1.0,
            store_dir: default_store_dir(),
            filefrag_arg_max: DEFAULT_FILEFRAG_ARG_MAX,
        }
    }
}

impl Config {
    /// Threshold multiplier applied to write-origin records so that the
    /// write path contributes no more than an equal share with the slow
    /// scan over the long run.
    #[must_use]
    pub fn write_threshold_multiplier(&self) -> f64 {
        let ratio =
            self.slow_scan_period.as_secs_f64() / IGNORE_AFTER_DEFRAG_DELAY.as_secs_f64();
        ratio.min(1.0)
    }

    /// Slow-scan batch ceiling, scaled by the speed multiplier.
    #[must_use]
    pub fn max_batch_size(&self) -> usize {
        let scaled = (MAX_FILES_BATCH_SIZE as f64 * self.speed_multiplier).round();
        (scaled as usize).max(MIN_FILES_BATCH_SIZE)
    }

    /// Minimum delay between extent-listing batches, in seconds.
    #[must_use]
    pub fn min_filefrag_delay(&self) -> f64 {
        MIN_DELAY_BETWEEN_FILEFRAGS / self.speed_multiplier
    }
}

/// `STORE_DIR` default: `$HOME/.btrfs_defrag`, or relative to the working
/// directory when `HOME` is unset (e.g. under a stripped service unit).
#[must_use]
pub fn default_store_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_default()
        .join(".btrfs_defrag")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_index_round_trips() {
        for class in CompressClass::ALL {
            assert_eq!(CompressClass::from_index(class.index()), class);
            assert_eq!(class.other().other(), class);
        }
    }

    #[test]
    fn write_multiplier_is_capped_at_one() {
        let config = Config::default();
        // 7 d / 12 h = 14, capped.
        assert_eq!(config.write_threshold_multiplier(), 1.0);

        let fast = Config {
            slow_scan_period: Duration::from_secs(6 * 3600),
            ..Config::default()
        };
        assert!((fast.write_threshold_multiplier() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn batch_ceiling_scales_with_speed() {
        let config = Config {
            speed_multiplier: 2.0,
            ..Config::default()
        };
        assert_eq!(config.max_batch_size(), 500);
        assert!((config.min_filefrag_delay() - 2.5).abs() < 1e-9);
    }
}
