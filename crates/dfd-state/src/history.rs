//! Cost-achievement history and the thresholds derived from it.
//!
//! After every defragmentation the orchestrator records what the file cost
//! before and after. The threshold for queueing new candidates is a
//! weighted percentile over those outcomes: there is no point queueing a
//! file whose cost is already at what defragmentation typically achieves.
//!
//! Weighting: entry `i` (1-based, oldest first) weighs `size_i * i`, so
//! large and recent measurements dominate. Entries are walked in ascending
//! `final_cost` order (ties: smaller size, then older entry) until the
//! cumulative weight reaches the percentile cut; that entry's `final_cost`
//! times [`MIN_EXPECTED_BENEFIT`] is the threshold. The same walk
//! accumulates weighted averages of initial and final costs for the
//! defrag-duration estimate.

use dfd_types::{
    COST_COMPUTE_DELAY, COST_HISTORY_SIZE, COST_THRESHOLD_PERCENTILE, CompressClass,
    CostAchievement, MIN_EXPECTED_BENEFIT,
};
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::time::SystemTime;
use tracing::debug;

/// Cold-start seeds: one synthetic achievement per class so thresholds are
/// meaningful from the first minute. Compressed files bottom out near 2.65
/// (adjacent compressed extents read as overlap), uncompressed near 1.02.
const SEED_COMPRESSED: CostAchievement = CostAchievement {
    initial_cost: 2.65,
    final_cost: 2.65,
    size: 1_000_000,
};
const SEED_UNCOMPRESSED: CostAchievement = CostAchievement {
    initial_cost: 1.02,
    final_cost: 1.02,
    size: 1_000_000,
};

/// Derived numbers for one class, refreshed at most every
/// [`COST_COMPUTE_DELAY`].
#[derive(Debug, Clone, Copy)]
pub struct ClassStats {
    pub threshold: f64,
    pub average_initial: f64,
    pub average_final: f64,
}

#[derive(Debug)]
struct ClassHistory {
    entries: VecDeque<CostAchievement>,
}

impl ClassHistory {
    fn seeded(class: CompressClass) -> Self {
        let seed = match class {
            CompressClass::Compressed => SEED_COMPRESSED,
            CompressClass::Uncompressed => SEED_UNCOMPRESSED,
        };
        Self {
            entries: VecDeque::from([seed]),
        }
    }

    fn from_entries(class: CompressClass, entries: Vec<CostAchievement>) -> Self {
        if entries.is_empty() {
            return Self::seeded(class);
        }
        let mut deque = VecDeque::from(entries);
        while deque.len() > COST_HISTORY_SIZE {
            deque.pop_front();
        }
        Self { entries: deque }
    }

    fn push(&mut self, achievement: CostAchievement) {
        self.entries.push_back(achievement);
        while self.entries.len() > COST_HISTORY_SIZE {
            self.entries.pop_front();
        }
    }

    /// Weighted-percentile walk described in the module docs.
    fn compute(&self) -> ClassStats {
        let mut weighted: Vec<(f64, u64, usize, f64, f64)> = self
            .entries
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                let weight = entry.size as f64 * (index + 1) as f64;
                (
                    entry.final_cost,
                    entry.size,
                    index,
                    weight,
                    entry.initial_cost,
                )
            })
            .collect();
        let total_weight: f64 = weighted.iter().map(|item| item.3).sum();
        if total_weight <= 0.0 {
            return ClassStats {
                threshold: MIN_EXPECTED_BENEFIT,
                average_initial: 1.0,
                average_final: 1.0,
            };
        }
        weighted.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(Ordering::Equal)
                .then(a.1.cmp(&b.1))
                .then(a.2.cmp(&b.2))
        });

        let cut = total_weight * COST_THRESHOLD_PERCENTILE / 100.0;
        let mut cumulative = 0.0;
        let mut threshold_final = weighted[weighted.len() - 1].0;
        let mut found = false;
        let mut initial_sum = 0.0;
        let mut final_sum = 0.0;
        for &(final_cost, _, _, weight, initial_cost) in &weighted {
            cumulative += weight;
            if !found && cumulative >= cut {
                threshold_final = final_cost;
                found = true;
            }
            initial_sum += initial_cost * weight;
            final_sum += final_cost * weight;
        }

        ClassStats {
            threshold: threshold_final * MIN_EXPECTED_BENEFIT,
            average_initial: initial_sum / total_weight,
            average_final: final_sum / total_weight,
        }
    }
}

/// Both class histories plus their cached stats.
#[derive(Debug)]
pub struct CostHistories {
    classes: [ClassHistory; 2],
    stats: [ClassStats; 2],
    last_compute: SystemTime,
    dirty: bool,
}

impl CostHistories {
    #[must_use]
    pub fn new(now: SystemTime) -> Self {
        Self::from_entries(Vec::new(), Vec::new(), now)
    }

    /// Restore from persisted per-class entry lists; empty lists fall back
    /// to the cold-start seeds.
    #[must_use]
    pub fn from_entries(
        compressed: Vec<CostAchievement>,
        uncompressed: Vec<CostAchievement>,
        now: SystemTime,
    ) -> Self {
        let classes = [
            ClassHistory::from_entries(CompressClass::Compressed, compressed),
            ClassHistory::from_entries(CompressClass::Uncompressed, uncompressed),
        ];
        let stats = [classes[0].compute(), classes[1].compute()];
        Self {
            classes,
            stats,
            last_compute: now,
            dirty: false,
        }
    }

    pub fn push(&mut self, class: CompressClass, achievement: CostAchievement) {
        self.classes[class.index()].push(achievement);
        self.dirty = true;
    }

    /// Refresh cached stats when they are older than [`COST_COMPUTE_DELAY`].
    pub fn maybe_recompute(&mut self, now: SystemTime) {
        let stale = now
            .duration_since(self.last_compute)
            .map(|elapsed| elapsed >= COST_COMPUTE_DELAY)
            .unwrap_or(false);
        if !stale {
            return;
        }
        for (index, class) in self.classes.iter().enumerate() {
            self.stats[index] = class.compute();
        }
        self.last_compute = now;
        debug!(
            compressed_threshold = self.stats[0].threshold,
            uncompressed_threshold = self.stats[1].threshold,
            "cost_thresholds_recomputed"
        );
    }

    #[must_use]
    pub fn threshold(&self, class: CompressClass) -> f64 {
        self.stats[class.index()].threshold
    }

    #[must_use]
    pub fn stats(&self, class: CompressClass) -> ClassStats {
        self.stats[class.index()]
    }

    #[must_use]
    pub fn entries(&self, class: CompressClass) -> Vec<CostAchievement> {
        self.classes[class.index()].entries.iter().copied().collect()
    }

    #[must_use]
    pub fn len(&self, class: CompressClass) -> usize {
        self.classes[class.index()].entries.len()
    }

    /// True once new achievements arrived since the last `clear_dirty`.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }
}
