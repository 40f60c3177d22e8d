//! Cooperative stop flag shared by an orchestrator's threads.
//!
//! Threads only suspend at sleeps and external commands, so a flag checked
//! at every sleep boundary stops a filesystem's loops promptly without
//! killing in-flight subprocesses.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const SLICE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Sleep for `duration`, waking early if the flag is set. Returns true
    /// when the caller should stop.
    pub fn wait(&self, duration: Duration) -> bool {
        let mut remaining = duration;
        while !remaining.is_zero() {
            if self.is_set() {
                return true;
            }
            let slice = remaining.min(SLICE);
            std::thread::sleep(slice);
            remaining -= slice;
        }
        self.is_set()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_completes_when_unset() {
        let flag = StopFlag::new();
        assert!(!flag.wait(Duration::from_millis(1)));
    }

    #[test]
    fn set_flag_stops_waits() {
        let flag = StopFlag::new();
        flag.set();
        assert!(flag.wait(Duration::from_secs(3600)));
        assert!(flag.is_set());
    }
}
