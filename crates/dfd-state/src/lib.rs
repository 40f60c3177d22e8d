#![forbid(unsafe_code)]
//! Per-filesystem defragmentation state.
//!
//! [`FilesState`] is the hub every producer and consumer goes through: the
//! slow scan and the write consolidation feed measured files in, the
//! defrag loop pops the most interesting one out, and the post-defrag stat
//! loop feeds outcomes back into the cost-achievement history that tunes
//! the admission thresholds.
//!
//! # Locking
//!
//! Three mutexes, never held together:
//! - the *fragmentation* mutex over queues, thresholds, history, and the
//!   recently-defragmented set;
//! - the *write-tracker* mutex;
//! - the *type-tracker* mutex.
//!
//! Methods acquire them strictly one at a time; anything needing data from
//! two takes a snapshot under the first before taking the second.

pub mod fuzzy;
pub mod history;
pub mod type_tracker;
pub mod usage;
pub mod write_tracker;

pub use fuzzy::{FuzzyEventTracker, FuzzyTrackerSnapshot};
pub use history::{ClassStats, CostHistories};
pub use type_tracker::TypeTracker;
pub use usage::UsagePolicyChecker;
pub use write_tracker::WriteTracker;

use dfd_types::{CompressClass, CostAchievement, FragRecord, MAX_QUEUE_LENGTH, ShortPath};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::time::{Duration, SystemTime};
use tracing::{debug, trace};

/// Everything guarded by the fragmentation mutex.
#[derive(Debug)]
struct FragInner {
    /// Per-class candidate queues, kept sorted by ascending cost; the best
    /// candidate is the last element.
    queues: [Vec<FragRecord>; 2],
    /// Weighted round-robin fetch accumulators, one per class.
    accumulators: [f64; 2],
    recent: FuzzyEventTracker,
    histories: CostHistories,
    last_queue_overflow: Option<SystemTime>,
}

/// Observability snapshot of one filesystem's state.
#[derive(Debug, Clone, Copy)]
pub struct StateStats {
    pub queue_lengths: [usize; 2],
    pub thresholds: [f64; 2],
    pub tracked_writes: usize,
    pub recently_defragmented: usize,
    pub last_queue_overflow: Option<SystemTime>,
}

/// Shared per-filesystem state. See the module docs for the locking rules.
pub struct FilesState {
    frag: Mutex<FragInner>,
    writes: Mutex<WriteTracker>,
    types: Mutex<TypeTracker>,
}

impl FilesState {
    #[must_use]
    pub fn new(now: SystemTime) -> Self {
        Self::restore(CostHistories::new(now), FuzzyEventTracker::new(now))
    }

    /// Build from persisted history and recently-defragmented state.
    #[must_use]
    pub fn restore(histories: CostHistories, recent: FuzzyEventTracker) -> Self {
        Self {
            frag: Mutex::new(FragInner {
                queues: [Vec::new(), Vec::new()],
                accumulators: [0.0; 2],
                recent,
                histories,
                last_queue_overflow: None,
            }),
            writes: Mutex::new(WriteTracker::new()),
            types: Mutex::new(TypeTracker::new()),
        }
    }

    /// Feed a batch of measured files into the queues.
    ///
    /// Records below their class threshold (scaled by
    /// `threshold_multiplier` for write-origin batches) are dropped, as are
    /// recently-defragmented paths. A record supersedes any queued entry
    /// with the same short path. The total cap is enforced by trimming the
    /// low-cost end of each queue proportionally to the type-tracker
    /// share. Returns how many short paths ended up queued that were not
    /// queued before the call.
    pub fn update_files(
        &self,
        records: Vec<FragRecord>,
        threshold_multiplier: Option<f64>,
        now: SystemTime,
    ) -> usize {
        let multiplier = threshold_multiplier.unwrap_or(1.0);
        let shares = self.types.lock().shares();

        let mut queued_classes: Vec<CompressClass> = Vec::new();
        let mut queued_paths: Vec<ShortPath> = Vec::new();
        let newly_queued = {
            let mut frag = self.frag.lock();
            frag.recent.advance(now);
            frag.histories.maybe_recompute(now);

            let before: HashSet<ShortPath> = frag
                .queues
                .iter()
                .flatten()
                .map(|record| record.short_path.clone())
                .collect();

            for record in records {
                if frag.recent.recent(&record.short_path) {
                    trace!(path = %record.short_path, "skip_recently_defragmented");
                    continue;
                }
                let threshold = frag.histories.threshold(record.class);
                if cost_below_threshold(record.cost, threshold, multiplier) {
                    continue;
                }
                remove_path(&mut frag.queues, &record.short_path);
                trace!(
                    path = %record.short_path,
                    cost = record.cost,
                    class = %record.class,
                    "queue_insert"
                );
                queued_classes.push(record.class);
                queued_paths.push(record.short_path.clone());
                frag.queues[record.class.index()].push(record);
            }

            for queue in &mut frag.queues {
                queue.sort_by(|a, b| {
                    a.cost.partial_cmp(&b.cost).unwrap_or(Ordering::Equal)
                });
            }
            enforce_cap(&mut frag, shares, now);

            let after: HashSet<&ShortPath> = frag
                .queues
                .iter()
                .flatten()
                .map(|record| &record.short_path)
                .collect();
            queued_paths
                .iter()
                .collect::<HashSet<_>>()
                .into_iter()
                .filter(|path| after.contains(path) && !before.contains(*path))
                .count()
        };

        if !queued_classes.is_empty() {
            let mut types = self.types.lock();
            for class in queued_classes {
                types.add(class, 1.0);
            }
        }
        if !queued_paths.is_empty() {
            // A queued path must not linger in the write tracker.
            let mut writes = self.writes.lock();
            for path in &queued_paths {
                writes.remove(path);
            }
        }
        newly_queued
    }

    /// Pop the best candidate, alternating between classes in proportion
    /// to the type-tracker shares.
    pub fn pop_most_interesting(&self) -> Option<FragRecord> {
        let shares = self.types.lock().shares();
        let mut frag = self.frag.lock();
        if frag.queues.iter().all(Vec::is_empty) {
            return None;
        }
        loop {
            for (accumulator, share) in frag.accumulators.iter_mut().zip(shares) {
                *accumulator += share;
            }
            let winner = (0..2)
                .filter(|&index| frag.accumulators[index] >= 1.0)
                .max_by(|&a, &b| {
                    frag.accumulators[a]
                        .partial_cmp(&frag.accumulators[b])
                        .unwrap_or(Ordering::Equal)
                });
            let Some(winner) = winner else {
                continue;
            };
            frag.accumulators[winner] %= 1.0;
            let class = if frag.queues[winner].is_empty() {
                1 - winner
            } else {
                winner
            };
            if let Some(record) = frag.queues[class].pop() {
                trace!(path = %record.short_path, cost = record.cost, "queue_pop");
                return Some(record);
            }
        }
    }

    /// A write was observed on `path`. Recently-defragmented paths are
    /// ignored; everything else lands in the write tracker. Returns
    /// whether the event was tracked.
    pub fn file_written_to(&self, path: ShortPath, now: SystemTime) -> bool {
        {
            let mut frag = self.frag.lock();
            frag.recent.advance(now);
            if frag.recent.recent(&path) {
                return false;
            }
            // Any queued measurement is stale now; the path re-enters via
            // consolidation once it settles. A record is never in a queue
            // and the write tracker at once.
            remove_path(&mut frag.queues, &path);
        }
        self.writes.lock().upsert(path, now);
        true
    }

    /// Remove and return every tracked path ready for consolidation.
    pub fn take_ready_writes(&self, now: SystemTime, commit_delay: Duration) -> Vec<ShortPath> {
        self.writes.lock().take_ready(now, commit_delay)
    }

    /// Forget a tracked path (it disappeared or was re-queued elsewhere).
    pub fn forget_write(&self, path: &ShortPath) {
        self.writes.lock().remove(path);
    }

    /// Record a defrag outcome into the class history.
    pub fn historize_cost_achievement(
        &self,
        class: CompressClass,
        initial_cost: f64,
        final_cost: f64,
        size: u64,
        now: SystemTime,
    ) {
        let mut frag = self.frag.lock();
        frag.histories.push(
            class,
            CostAchievement {
                initial_cost,
                final_cost,
                size,
            },
        );
        frag.histories.maybe_recompute(now);
        debug!(
            class = %class,
            initial_cost,
            final_cost,
            size,
            "cost_achievement_recorded"
        );
    }

    /// Is `cost` at or below the class threshold, scaled by `multiplier`?
    pub fn below_threshold_cost(
        &self,
        record: &FragRecord,
        multiplier: Option<f64>,
        now: SystemTime,
    ) -> bool {
        let mut frag = self.frag.lock();
        frag.histories.maybe_recompute(now);
        let threshold = frag.histories.threshold(record.class);
        cost_below_threshold(record.cost, threshold, multiplier.unwrap_or(1.0))
    }

    /// Historically-achieved average final cost for a class, used when
    /// estimating defrag duration.
    pub fn average_final_cost(&self, class: CompressClass) -> f64 {
        self.frag.lock().histories.stats(class).average_final
    }

    pub fn recently_defragmented(&self, path: &ShortPath, now: SystemTime) -> bool {
        let mut frag = self.frag.lock();
        frag.recent.advance(now);
        frag.recent.recent(path)
    }

    /// Mark a path as defragmented, shielding it from re-queueing for the
    /// decay window.
    pub fn defragmented(&self, path: &ShortPath, now: SystemTime) {
        let mut frag = self.frag.lock();
        frag.recent.event(path, now);
    }

    /// Fill ratio of the shared queue cap, in [0, 1].
    pub fn queue_fill(&self) -> f64 {
        let frag = self.frag.lock();
        let total: usize = frag.queues.iter().map(Vec::len).sum();
        total as f64 / MAX_QUEUE_LENGTH as f64
    }

    /// Apply pending decay ticks; called periodically by the stat loop.
    pub fn tick(&self, now: SystemTime) {
        self.frag.lock().recent.advance(now);
    }

    pub fn stats(&self) -> StateStats {
        let frag = self.frag.lock();
        let tracked_writes = self.writes.lock().len();
        StateStats {
            queue_lengths: [frag.queues[0].len(), frag.queues[1].len()],
            thresholds: [
                frag.histories.threshold(CompressClass::Compressed),
                frag.histories.threshold(CompressClass::Uncompressed),
            ],
            tracked_writes,
            recently_defragmented: frag.recent.len(),
            last_queue_overflow: frag.last_queue_overflow,
        }
    }

    /// Per-class history entries for persistence.
    pub fn history_snapshot(&self) -> [Vec<CostAchievement>; 2] {
        let frag = self.frag.lock();
        [
            frag.histories.entries(CompressClass::Compressed),
            frag.histories.entries(CompressClass::Uncompressed),
        ]
    }

    /// Recently-defragmented structure for persistence.
    pub fn recent_snapshot(&self) -> FuzzyTrackerSnapshot {
        self.frag.lock().recent.snapshot()
    }

    /// True when history grew since the last call; clears the flag.
    pub fn take_history_dirty(&self) -> bool {
        let mut frag = self.frag.lock();
        let dirty = frag.histories.is_dirty();
        frag.histories.clear_dirty();
        dirty
    }
}

/// `cost <= 1 + multiplier * (threshold - 1)`.
fn cost_below_threshold(cost: f64, threshold: f64, multiplier: f64) -> bool {
    cost <= 1.0 + multiplier * (threshold - 1.0)
}

fn remove_path(queues: &mut [Vec<FragRecord>; 2], path: &ShortPath) -> bool {
    let mut removed = false;
    for queue in queues.iter_mut() {
        let before = queue.len();
        queue.retain(|record| record.short_path != *path);
        removed |= queue.len() != before;
    }
    removed
}

/// Per-class queue allowances under the shared cap, proportional to the
/// type-tracker shares with a floor of 2, slack flowing to the class that
/// needs it.
fn class_targets(shares: [f64; 2], lengths: [usize; 2]) -> [usize; 2] {
    let mut targets = [0_usize; 2];
    for index in 0..2 {
        targets[index] =
            ((MAX_QUEUE_LENGTH as f64 * shares[index]).floor() as usize).max(2);
    }
    for index in 0..2 {
        if lengths[index] < targets[index] {
            let slack = targets[index] - lengths[index];
            targets[index] = lengths[index];
            targets[1 - index] += slack;
        }
    }
    targets
}

fn enforce_cap(frag: &mut FragInner, shares: [f64; 2], now: SystemTime) {
    let total: usize = frag.queues.iter().map(Vec::len).sum();
    if total <= MAX_QUEUE_LENGTH {
        return;
    }
    frag.last_queue_overflow = Some(now);
    let lengths = [frag.queues[0].len(), frag.queues[1].len()];
    let targets = class_targets(shares, lengths);
    for (index, queue) in frag.queues.iter_mut().enumerate() {
        if queue.len() > targets[index] {
            let trim = queue.len() - targets[index];
            queue.drain(0..trim);
            debug!(
                class = %CompressClass::from_index(index),
                trimmed = trim,
                "queue_overflow_trimmed"
            );
        }
    }
}
