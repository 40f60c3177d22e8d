//! Running per-class weights driving the weighted round-robin between the
//! compressed and uncompressed queues.

use dfd_types::{CompressClass, TYPE_TRACKER_MEMORY};

/// One weight per compression class, aged multiplicatively so the ratio
/// tracks recent traffic rather than all of history.
#[derive(Debug, Default)]
pub struct TypeTracker {
    weights: [f64; 2],
}

impl TypeTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `weight` units of observed traffic for `class`.
    pub fn add(&mut self, class: CompressClass, weight: f64) {
        self.weights[class.index()] += weight;
        let total: f64 = self.weights.iter().sum();
        if total > TYPE_TRACKER_MEMORY {
            for entry in &mut self.weights {
                *entry /= 2.0;
            }
        }
    }

    /// Fraction of recent traffic attributed to `class`; 0.5 before any
    /// traffic has been seen.
    #[must_use]
    pub fn share(&self, class: CompressClass) -> f64 {
        let total: f64 = self.weights.iter().sum();
        if total <= 0.0 {
            0.5
        } else {
            self.weights[class.index()] / total
        }
    }

    #[must_use]
    pub fn shares(&self) -> [f64; 2] {
        [
            self.share(CompressClass::Compressed),
            self.share(CompressClass::Uncompressed),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_tracker_splits_evenly() {
        let tracker = TypeTracker::new();
        assert_eq!(tracker.share(CompressClass::Compressed), 0.5);
        assert_eq!(tracker.share(CompressClass::Uncompressed), 0.5);
    }

    #[test]
    fn shares_follow_traffic() {
        let mut tracker = TypeTracker::new();
        for _ in 0..25 {
            tracker.add(CompressClass::Compressed, 1.0);
        }
        for _ in 0..75 {
            tracker.add(CompressClass::Uncompressed, 1.0);
        }
        assert!((tracker.share(CompressClass::Compressed) - 0.25).abs() < 1e-9);
        assert!((tracker.share(CompressClass::Uncompressed) - 0.75).abs() < 1e-9);
    }

    #[test]
    fn aging_preserves_ratio_and_bounds_total() {
        let mut tracker = TypeTracker::new();
        for _ in 0..30_000 {
            tracker.add(CompressClass::Uncompressed, 1.0);
        }
        tracker.add(CompressClass::Compressed, 1.0);
        let total: f64 = tracker.weights.iter().sum();
        assert!(total <= TYPE_TRACKER_MEMORY);
        assert!(tracker.share(CompressClass::Uncompressed) > 0.99);
    }
}
