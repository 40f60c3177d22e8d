//! First/last-write bookkeeping between the event stream and the queues.
//!
//! A path sits here from its first observed write until it has been quiet
//! long enough for its extent layout to be meaningful (`commit_delay` plus
//! slack plus a per-file fuzzy offset), or until it has been churning for
//! two hours straight and we consolidate it anyway.

use dfd_types::{
    DEFRAG_CHECK_DISTRIBUTION_PERIOD, MAX_TRACKED_WRITTEN_FILES, MAX_WRITES_DELAY, ShortPath,
    WriteEvent,
};
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Settle slack added on top of the mount's commit delay.
const COMMIT_SLACK: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
pub struct WriteTracker {
    entries: HashMap<ShortPath, WriteEvent>,
}

impl WriteTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn contains(&self, path: &ShortPath) -> bool {
        self.entries.contains_key(path)
    }

    /// Record one write: creates the entry on first sight, refreshes
    /// `last` afterwards.
    pub fn upsert(&mut self, path: ShortPath, now: SystemTime) {
        self.entries
            .entry(path)
            .and_modify(|event| event.last = now)
            .or_insert(WriteEvent {
                first: now,
                last: now,
            });
    }

    /// Drop a path (it was queued or disappeared).
    pub fn remove(&mut self, path: &ShortPath) {
        self.entries.remove(path);
    }

    /// Remove and return every path ready for consolidation: quiet since
    /// `commit_delay + 5 s + fuzzy`, or first written over two hours ago.
    /// If the tracker still exceeds its cap afterwards, the entries with
    /// the oldest `last` write are evicted into the result as well.
    pub fn take_ready(&mut self, now: SystemTime, commit_delay: Duration) -> Vec<ShortPath> {
        let mut ready: Vec<ShortPath> = self
            .entries
            .iter()
            .filter(|(path, event)| is_ready(path, event, now, commit_delay))
            .map(|(path, _)| path.clone())
            .collect();
        for path in &ready {
            self.entries.remove(path);
        }

        if self.entries.len() > MAX_TRACKED_WRITTEN_FILES {
            let excess = self.entries.len() - MAX_TRACKED_WRITTEN_FILES;
            let mut by_age: Vec<(ShortPath, SystemTime)> = self
                .entries
                .iter()
                .map(|(path, event)| (path.clone(), event.last))
                .collect();
            by_age.sort_by_key(|&(_, last)| last);
            debug!(excess, "write_tracker_evicting_oldest");
            for (path, _) in by_age.into_iter().take(excess) {
                self.entries.remove(&path);
                ready.push(path);
            }
        }
        ready
    }
}

fn is_ready(
    path: &ShortPath,
    event: &WriteEvent,
    now: SystemTime,
    commit_delay: Duration,
) -> bool {
    let fuzzy = fuzzy_delay(event.first);
    let quiet_for = commit_delay + COMMIT_SLACK + fuzzy;
    let quiet = now
        .duration_since(event.last)
        .map(|elapsed| elapsed > quiet_for)
        .unwrap_or(false);
    let overdue = now
        .duration_since(event.first)
        .map(|elapsed| elapsed > MAX_WRITES_DELAY)
        .unwrap_or(false);
    if quiet || overdue {
        tracing::trace!(path = %path, quiet, overdue, "write_ready");
    }
    quiet || overdue
}

/// Per-file jitter spreading a burst of simultaneously-written files over
/// consolidation ticks: the microsecond remainder of the first write,
/// taken modulo [`DEFRAG_CHECK_DISTRIBUTION_PERIOD`], in seconds.
fn fuzzy_delay(first: SystemTime) -> Duration {
    let micros = first
        .duration_since(UNIX_EPOCH)
        .map(|since| since.subsec_micros())
        .unwrap_or(0);
    Duration::from_secs(u64::from(micros % DEFRAG_CHECK_DISTRIBUTION_PERIOD))
}

#[cfg(test)]
mod tests {
    use super::*;

    const COMMIT: Duration = Duration::from_secs(30);

    fn t(secs: u64) -> SystemTime {
        // Whole seconds: zero microsecond remainder, so fuzzy = 0.
        UNIX_EPOCH + Duration::from_secs(1_700_000_000 + secs)
    }

    #[test]
    fn quiet_file_becomes_ready_after_commit_delay() {
        let mut tracker = WriteTracker::new();
        tracker.upsert(ShortPath::from("a"), t(0));
        assert!(tracker.take_ready(t(30), COMMIT).is_empty());
        let ready = tracker.take_ready(t(36), COMMIT);
        assert_eq!(ready, vec![ShortPath::from("a")]);
        assert!(tracker.is_empty());
    }

    #[test]
    fn rewrites_push_readiness_out() {
        let mut tracker = WriteTracker::new();
        tracker.upsert(ShortPath::from("a"), t(0));
        tracker.upsert(ShortPath::from("a"), t(100));
        assert!(tracker.take_ready(t(120), COMMIT).is_empty());
        assert_eq!(tracker.take_ready(t(136), COMMIT).len(), 1);
    }

    #[test]
    fn churning_file_is_consolidated_after_two_hours() {
        let mut tracker = WriteTracker::new();
        tracker.upsert(ShortPath::from("a"), t(0));
        // Keep writing every few seconds; never quiet.
        for secs in (10..7300).step_by(10) {
            tracker.upsert(ShortPath::from("a"), t(secs));
        }
        let ready = tracker.take_ready(t(7301), COMMIT);
        assert_eq!(ready, vec![ShortPath::from("a")]);
    }

    #[test]
    fn fuzzy_offset_delays_readiness() {
        let mut tracker = WriteTracker::new();
        // First write at +77 microseconds: fuzzy = 77 s.
        let first = t(0) + Duration::from_micros(77);
        tracker.upsert(ShortPath::from("a"), first);
        assert!(tracker.take_ready(t(40), COMMIT).is_empty());
        assert!(tracker.take_ready(t(110), COMMIT).is_empty());
        assert_eq!(tracker.take_ready(t(113), COMMIT).len(), 1);
    }

    #[test]
    fn capacity_pressure_evicts_oldest_last_write() {
        let mut tracker = WriteTracker::new();
        for index in 0..(MAX_TRACKED_WRITTEN_FILES + 5) {
            let when = if index < 5 { t(0) } else { t(10) };
            tracker.upsert(ShortPath(format!("f{index}")), when);
        }
        // Nothing is quiet yet, but the cap forces the five oldest out.
        let evicted = tracker.take_ready(t(20), COMMIT);
        assert_eq!(evicted.len(), 5);
        assert_eq!(tracker.len(), MAX_TRACKED_WRITTEN_FILES);
        assert!(evicted.contains(&ShortPath::from("f0")));
        assert!(evicted.contains(&ShortPath::from("f4")));
    }
}
