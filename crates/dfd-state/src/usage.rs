//! Rolling-window device-time governor.
//!
//! Tracks `(start, duration)` intervals of device time consumed by past
//! defragmentations and admits a proposed one only if every configured
//! window stays under its budget after accounting for the estimate. The
//! budget shrinks toward 20% when the candidate queue is nearly empty, so
//! an idle system does not burn seeks on marginal files.

use dfd_types::DEVICE_USAGE_WINDOWS;
use std::time::Instant;

#[derive(Debug)]
pub struct UsagePolicyChecker {
    /// Past device-time intervals, pruned to the largest window.
    intervals: Vec<(Instant, f64)>,
    /// `(window_secs, allowed_fraction)`, fractions scaled by the speed
    /// multiplier.
    windows: Vec<(f64, f64)>,
}

impl UsagePolicyChecker {
    #[must_use]
    pub fn new(speed_multiplier: f64) -> Self {
        Self {
            intervals: Vec::new(),
            windows: DEVICE_USAGE_WINDOWS
                .iter()
                .map(|&(window, limit)| (window, limit * speed_multiplier))
                .collect(),
        }
    }

    /// May a defrag expected to consume `expected_secs` of device time run
    /// now? `queue_fill` is the candidate queue's fill ratio in [0, 1].
    pub fn available(&mut self, now: Instant, queue_fill: f64, expected_secs: f64) -> bool {
        let use_factor = 0.2 + 0.8 * queue_fill.clamp(0.0, 1.0);
        let max_window = self
            .windows
            .iter()
            .map(|&(window, _)| window)
            .fold(0.0, f64::max);

        // Intervals strictly older than the largest window can never
        // overlap a check again.
        self.intervals
            .retain(|&(start, duration)| rel_secs(now, start) + duration >= -max_window);

        for &(window, limit) in &self.windows {
            // The defrag would occupy [0, expected]; the window under test
            // is the trailing `window` seconds ending at its completion.
            let span_end = expected_secs;
            let span_start = expected_secs - window;
            let mut used = 0.0;
            for &(start, duration) in &self.intervals {
                let rel_start = rel_secs(now, start);
                let overlap = (rel_start + duration).min(span_end) - rel_start.max(span_start);
                if overlap > 0.0 {
                    used += overlap;
                }
            }
            if (used + expected_secs) / use_factor > window * limit {
                return false;
            }
        }
        true
    }

    /// Record device time actually consumed. Callers cap `duration_secs`
    /// at twice the estimate: the external tools may return before
    /// asynchronous device work completes.
    pub fn record(&mut self, start: Instant, duration_secs: f64) {
        self.intervals.push((start, duration_secs));
    }

    #[must_use]
    pub fn tracked_intervals(&self) -> usize {
        self.intervals.len()
    }
}

/// Seconds from `now` to `instant`, negative for the past.
fn rel_secs(now: Instant, instant: Instant) -> f64 {
    if instant <= now {
        -now.duration_since(instant).as_secs_f64()
    } else {
        instant.duration_since(now).as_secs_f64()
    }
}
