//! Per-filesystem orchestrator.
//!
//! Four long-lived threads per managed filesystem, all funneling through
//! the shared [`FilesState`]:
//!
//! - the *slow scan* (see [`crate::scan`]) walks the whole tree over
//!   `SLOW_SCAN_PERIOD`;
//! - the *write consolidation* tick turns quiet written files into
//!   measurement batches;
//! - the *defrag* loop pops candidates, asks the usage governor for
//!   admission, and runs the external defragmenter;
//! - the *stat* loop re-measures defragmented files until their cost
//!   settles and feeds the outcome into the threshold history.
//!
//! Threads stop cooperatively at their sleep points; in-flight external
//! commands are left to finish on their own.

use crate::stop::StopFlag;
use dfd_cost::DriveGeometry;
use dfd_filefrag::ExtentParser;
use dfd_state::{CostHistories, FilesState, FuzzyEventTracker, UsagePolicyChecker};
use dfd_store::{CostsSnapshot, StateStore};
use dfd_sys::{
    MountEntry, MountOptions, batch_paths, build_defrag_command, options_for, run_defrag,
    run_filefrag,
};
use dfd_types::{
    CompressClass, Config, FragRecord, MAX_DELAY_BETWEEN_DEFRAGS, MIN_DELAY_BETWEEN_DEFRAGS,
    ShortPath, WRITE_CONSOLIDATION_PERIOD,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};

/// Stat-loop cadence.
const STAT_PERIOD: Duration = Duration::from_secs(5);

/// A defragmented file settles once quiet this long after an improvement…
const SETTLE_QUIET: Duration = Duration::from_secs(6);

/// …or unconditionally after this long.
const SETTLE_DEADLINE: Duration = Duration::from_secs(35);

/// Directory pruning inputs for the slow scan, refreshed by the
/// supervisor on every mount-detection cycle.
#[derive(Debug, Default, Clone)]
pub struct ScanPruneSet {
    /// Every mountpoint in the mount table.
    pub mountpoints: HashSet<PathBuf>,
    /// Absolute paths of this filesystem's read-write subvolumes; these
    /// are traversed even though they are mountpoints.
    pub rw_subvolumes: HashSet<PathBuf>,
}

impl ScanPruneSet {
    /// A directory is pruned when it is a foreign mountpoint: some mount
    /// that is not a read-write subvolume of this filesystem.
    #[must_use]
    pub fn prunes(&self, dir: &Path) -> bool {
        self.mountpoints.contains(dir) && !self.rw_subvolumes.contains(dir)
    }
}

/// A defragmented file awaiting cost settlement.
#[derive(Debug)]
struct PendingStat {
    short_path: ShortPath,
    size: u64,
    class: CompressClass,
    start_cost: f64,
    last_cost: f64,
    queued: Instant,
    last_change: Instant,
    improved: bool,
}

impl PendingStat {
    fn new(record: &FragRecord, now: Instant) -> Self {
        Self {
            short_path: record.short_path.clone(),
            size: record.size,
            class: record.class,
            start_cost: record.cost,
            last_cost: record.cost,
            queued: now,
            last_change: now,
            improved: false,
        }
    }

    fn settled(&self, now: Instant) -> bool {
        self.last_cost <= 1.0 + 1e-9
            || (self.improved && now.duration_since(self.last_change) >= SETTLE_QUIET)
            || now.duration_since(self.queued) >= SETTLE_DEADLINE
    }
}

/// Running orchestrator plus its thread handles.
pub struct FsHandle {
    pub orchestrator: Arc<FsOrchestrator>,
    threads: Vec<JoinHandle<()>>,
}

impl FsHandle {
    /// Stop all loops at their next suspension point and persist state.
    /// Threads are detached rather than joined: one may be blocked on an
    /// external command that is allowed to finish naturally.
    pub fn stop(self) {
        self.orchestrator.stop.set();
        self.orchestrator.persist();
        drop(self.threads);
    }
}

pub struct FsOrchestrator {
    pub(crate) fs_root: PathBuf,
    pub(crate) config: Config,
    pub(crate) geometry: DriveGeometry,
    pub(crate) state: Arc<FilesState>,
    pub(crate) store: StateStore,
    pub(crate) options: Mutex<MountOptions>,
    pub(crate) prune: Mutex<ScanPruneSet>,
    pending: Mutex<Vec<PendingStat>>,
    pub(crate) stop: StopFlag,
}

impl FsOrchestrator {
    /// Restore persisted state for `fs_root` and launch the four loops.
    pub fn start(
        fs_root: PathBuf,
        config: Config,
        store: StateStore,
        mount_entries: &[MountEntry],
    ) -> FsHandle {
        let now = SystemTime::now();
        let costs = store.load_costs(&fs_root).unwrap_or_default();
        let histories = CostHistories::from_entries(costs.compressed, costs.uncompressed, now);
        let recent = match store.load_recent(&fs_root) {
            Some(snapshot) => FuzzyEventTracker::from_snapshot(snapshot, now),
            None => FuzzyEventTracker::new(now),
        };
        let options = options_for(mount_entries, &fs_root).unwrap_or_default();
        info!(
            fs_root = %fs_root.display(),
            compress = options.compress.is_some(),
            commit_delay = options.commit_delay.as_secs(),
            "orchestrator_start"
        );

        let orchestrator = Arc::new(Self {
            geometry: DriveGeometry::new(config.drive_count),
            state: Arc::new(FilesState::restore(histories, recent)),
            store,
            options: Mutex::new(options),
            prune: Mutex::new(ScanPruneSet::default()),
            pending: Mutex::new(Vec::new()),
            stop: StopFlag::new(),
            fs_root,
            config,
        });

        let threads = [
            ("scan", FsOrchestrator::slow_scan_loop as fn(&FsOrchestrator)),
            ("writes", FsOrchestrator::consolidation_loop),
            ("defrag", FsOrchestrator::defrag_loop),
            ("stats", FsOrchestrator::stat_loop),
        ]
        .into_iter()
        .map(|(name, body)| {
            let orchestrator = Arc::clone(&orchestrator);
            std::thread::Builder::new()
                .name(format!("{name}:{}", orchestrator.fs_root.display()))
                .spawn(move || body(&orchestrator))
                .unwrap_or_else(|error| panic!("spawn {name} thread: {error}"))
        })
        .collect();

        FsHandle {
            orchestrator,
            threads,
        }
    }

    #[must_use]
    pub fn state(&self) -> &Arc<FilesState> {
        &self.state
    }

    #[must_use]
    pub fn fs_root(&self) -> &Path {
        &self.fs_root
    }

    /// Re-read the mount options; the defrag command is derived from them
    /// on every invocation, so a change takes effect immediately.
    pub fn redetect_options(&self, mount_entries: &[MountEntry]) {
        match options_for(mount_entries, &self.fs_root) {
            Ok(fresh) => {
                let mut current = self.options.lock();
                if *current != fresh {
                    info!(
                        fs_root = %self.fs_root.display(),
                        compress = fresh.compress.is_some(),
                        commit_delay = fresh.commit_delay.as_secs(),
                        "mount_options_changed"
                    );
                    *current = fresh;
                }
            }
            Err(error) => warn!(fs_root = %self.fs_root.display(), %error, "mount_options_lost"),
        }
    }

    /// Refresh the slow scan's pruning inputs.
    pub fn set_prune_set(&self, prune: ScanPruneSet) {
        *self.prune.lock() = prune;
    }

    /// Write history and recently-defragmented state to the store.
    pub fn persist(&self) {
        let [compressed, uncompressed] = self.state.history_snapshot();
        let costs = CostsSnapshot {
            compressed,
            uncompressed,
        };
        if let Err(error) = self.store.save_costs(&self.fs_root, &costs) {
            warn!(fs_root = %self.fs_root.display(), %error, "persist_costs_failed");
        }
        if let Err(error) = self
            .store
            .save_recent(&self.fs_root, &self.state.recent_snapshot())
        {
            warn!(fs_root = %self.fs_root.display(), %error, "persist_recent_failed");
        }
    }

    /// Extent-list one file; `None` when it vanished or the listing was
    /// unusable.
    pub(crate) fn measure_file(&self, absolute: &Path) -> Option<FragRecord> {
        let output = match run_filefrag(std::slice::from_ref(&absolute.to_path_buf())) {
            Ok(output) => output,
            Err(error) => {
                warn!(%error, "filefrag_failed");
                return None;
            }
        };
        ExtentParser::new(&self.geometry, &self.fs_root)
            .parse(&output)
            .into_iter()
            .next()
    }

    // ── Write consolidation loop ────────────────────────────────────────

    fn consolidation_loop(&self) {
        while !self.stop.wait(WRITE_CONSOLIDATION_PERIOD) {
            let now = SystemTime::now();
            let commit_delay = self.options.lock().commit_delay;
            let ready = self.state.take_ready_writes(now, commit_delay);
            if ready.is_empty() {
                continue;
            }
            let existing: Vec<PathBuf> = ready
                .iter()
                .filter_map(|short| {
                    let absolute = self.fs_root.join(short.as_str());
                    match std::fs::symlink_metadata(&absolute) {
                        Ok(metadata) if metadata.is_file() => Some(absolute),
                        _ => None,
                    }
                })
                .collect();
            debug!(
                ready = ready.len(),
                existing = existing.len(),
                "write_consolidation"
            );
            let multiplier = self.config.write_threshold_multiplier();
            for batch in batch_paths(existing, self.config.filefrag_arg_max) {
                match run_filefrag(&batch) {
                    Ok(output) => {
                        let records =
                            ExtentParser::new(&self.geometry, &self.fs_root).parse(&output);
                        self.state
                            .update_files(records, Some(multiplier), SystemTime::now());
                    }
                    Err(error) => warn!(%error, "filefrag_batch_failed"),
                }
            }
        }
    }

    // ── Defrag loop ─────────────────────────────────────────────────────

    fn defrag_loop(&self) {
        let mut usage = UsagePolicyChecker::new(self.config.speed_multiplier);
        while !self.stop.is_set() {
            let Some(candidate) = self.state.pop_most_interesting() else {
                if self
                    .stop
                    .wait(Duration::from_secs_f64(MAX_DELAY_BETWEEN_DEFRAGS))
                {
                    return;
                }
                continue;
            };
            let now = SystemTime::now();
            let absolute = self.fs_root.join(candidate.short_path.as_str());
            let Ok(metadata) = std::fs::symlink_metadata(&absolute) else {
                self.state.forget_write(&candidate.short_path);
                continue;
            };
            if !metadata.is_file() {
                self.state.forget_write(&candidate.short_path);
                continue;
            }

            // Queued cost may be stale; decide on a fresh measurement.
            let Some(current) = self.measure_file(&absolute) else {
                continue;
            };
            if self.state.below_threshold_cost(&current, None, now)
                || self.state.recently_defragmented(&current.short_path, now)
            {
                self.state.forget_write(&current.short_path);
                continue;
            }

            // Mark before launching so concurrent producers cannot
            // re-queue the file mid-defrag.
            self.state.defragmented(&current.short_path, now);

            let average = self.state.average_final_cost(current.class);
            let expected =
                self.geometry
                    .defrag_time(current.size, current.cost, current.class, average);
            loop {
                let fill = self.state.queue_fill();
                if usage.available(Instant::now(), fill, expected) {
                    break;
                }
                if self.stop.wait(Duration::from_secs(1)) {
                    return;
                }
            }

            let compress = self.options.lock().compress;
            let argv = build_defrag_command(
                compress,
                self.config.target_extent_size.as_deref(),
                &absolute,
            );
            let started = Instant::now();
            match run_defrag(&argv) {
                Ok(elapsed) => {
                    // The tool can return before the device is done; never
                    // credit more than twice our own estimate.
                    let credited = elapsed.as_secs_f64().min(2.0 * expected);
                    usage.record(started, credited);
                    debug!(
                        path = %current.short_path,
                        cost = current.cost,
                        expected_secs = expected,
                        actual_secs = elapsed.as_secs_f64(),
                        "defrag_complete"
                    );
                    self.pending
                        .lock()
                        .push(PendingStat::new(&current, Instant::now()));
                }
                Err(error) => warn!(path = %current.short_path, %error, "defrag_failed"),
            }

            let fill = self.state.queue_fill();
            let delay = (MAX_DELAY_BETWEEN_DEFRAGS
                - fill * 100.0 * (MAX_DELAY_BETWEEN_DEFRAGS - MIN_DELAY_BETWEEN_DEFRAGS))
                .max(MIN_DELAY_BETWEEN_DEFRAGS);
            if self.stop.wait(Duration::from_secs_f64(delay)) {
                return;
            }
        }
    }

    // ── Post-defrag stat loop ───────────────────────────────────────────

    fn stat_loop(&self) {
        let mut ticks = 0_u64;
        while !self.stop.wait(STAT_PERIOD) {
            let now = SystemTime::now();
            self.state.tick(now);
            ticks += 1;
            if ticks % 60 == 0 {
                let stats = self.state.stats();
                info!(
                    fs_root = %self.fs_root.display(),
                    queued_compressed = stats.queue_lengths[0],
                    queued_uncompressed = stats.queue_lengths[1],
                    threshold_compressed = stats.thresholds[0],
                    threshold_uncompressed = stats.thresholds[1],
                    tracked_writes = stats.tracked_writes,
                    recently_defragmented = stats.recently_defragmented,
                    "state_snapshot"
                );
            }

            let pending = std::mem::take(&mut *self.pending.lock());
            let mut keep = Vec::new();
            for mut item in pending {
                let absolute = self.fs_root.join(item.short_path.as_str());
                let instant = Instant::now();
                match self.measure_file(&absolute) {
                    Some(current) => {
                        if current.cost < item.last_cost - 1e-9 {
                            item.last_cost = current.cost;
                            item.last_change = instant;
                            item.improved = true;
                        }
                        if item.settled(instant) {
                            self.settle(&item, now);
                        } else {
                            keep.push(item);
                        }
                    }
                    // File vanished; book what we last saw.
                    None => self.settle(&item, now),
                }
            }
            self.pending.lock().extend(keep);

            if self.state.take_history_dirty() {
                self.persist();
            }
        }
        self.persist();
    }

    fn settle(&self, item: &PendingStat, now: SystemTime) {
        debug!(
            path = %item.short_path,
            start_cost = item.start_cost,
            final_cost = item.last_cost,
            "defrag_settled"
        );
        self.state.historize_cost_achievement(
            item.class,
            item.start_cost,
            item.last_cost,
            item.size,
            now,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prune_set_spares_rw_subvolumes() {
        let mut prune = ScanPruneSet::default();
        prune.mountpoints.insert(PathBuf::from("/mnt/a/vol"));
        prune.mountpoints.insert(PathBuf::from("/mnt/a/foreign"));
        prune.rw_subvolumes.insert(PathBuf::from("/mnt/a/vol"));
        assert!(!prune.prunes(Path::new("/mnt/a/vol")));
        assert!(prune.prunes(Path::new("/mnt/a/foreign")));
        assert!(!prune.prunes(Path::new("/mnt/a/plain-dir")));
    }

    #[test]
    fn pending_stat_settlement_rules() {
        let record = FragRecord {
            short_path: ShortPath::from("f"),
            size: 1 << 20,
            class: CompressClass::Uncompressed,
            cost: 3.0,
        };
        let start = Instant::now();
        let mut item = PendingStat::new(&record, start);

        // No improvement yet, no deadline: not settled.
        assert!(!item.settled(start + Duration::from_secs(10)));
        // Cost reached 1.0: settled immediately.
        item.last_cost = 1.0;
        assert!(item.settled(start + Duration::from_secs(1)));

        // Improvement followed by quiet: settled after SETTLE_QUIET.
        let mut item = PendingStat::new(&record, start);
        item.last_cost = 2.0;
        item.improved = true;
        item.last_change = start + Duration::from_secs(5);
        assert!(!item.settled(start + Duration::from_secs(8)));
        assert!(item.settled(start + Duration::from_secs(11)));

        // Deadline settles even without improvement.
        let item = PendingStat::new(&record, start);
        assert!(item.settled(start + SETTLE_DEADLINE));
    }
}
