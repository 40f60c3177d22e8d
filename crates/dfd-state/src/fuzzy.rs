//! Bounded, time-decaying membership over short paths.
//!
//! A fixed bit array of 2^18 entries of 4 bits each (128 KiB) — memory does
//! not grow with the number of tracked paths. An insertion sets the hashed
//! entry to the maximum decay level; a periodic tick decrements every live
//! entry, so an unrefreshed path falls out after 15 ticks (the configured
//! TTL). False positives from hash collisions are acceptable: the worst
//! outcome is skipping a defrag candidate for one decay window.

use dfd_types::{IGNORE_AFTER_DEFRAG_DELAY, ShortPath};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_64;

/// Number of 4-bit entries.
pub const FUZZY_ENTRIES: usize = 1 << 18;

const BITS_PER_ENTRY: u8 = 4;
const BYTE_LEN: usize = FUZZY_ENTRIES / 2;
const MAX_LEVEL: u8 = 0xF;
const DECAY_TICKS: u32 = 15;

/// Serialized form of the tracker; field mismatches on load reset it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuzzyTrackerSnapshot {
    pub bitarray: Vec<u8>,
    /// Epoch seconds of the last applied decay tick.
    pub last_tick: u64,
    pub size: u64,
    /// Seconds until an unrefreshed entry has fully decayed.
    pub ttl: u64,
    pub bits_per_entry: u8,
}

#[derive(Debug)]
pub struct FuzzyEventTracker {
    bitarray: Vec<u8>,
    last_tick: SystemTime,
    size: usize,
    ttl: Duration,
}

impl FuzzyEventTracker {
    #[must_use]
    pub fn new(now: SystemTime) -> Self {
        Self {
            bitarray: vec![0; BYTE_LEN],
            last_tick: now,
            size: 0,
            ttl: IGNORE_AFTER_DEFRAG_DELAY,
        }
    }

    /// Restore from a persisted snapshot; any shape mismatch falls back to
    /// an empty tracker.
    #[must_use]
    pub fn from_snapshot(snapshot: FuzzyTrackerSnapshot, now: SystemTime) -> Self {
        if snapshot.bitarray.len() != BYTE_LEN
            || snapshot.bits_per_entry != BITS_PER_ENTRY
            || snapshot.ttl != IGNORE_AFTER_DEFRAG_DELAY.as_secs()
        {
            warn!(
                len = snapshot.bitarray.len(),
                bits = snapshot.bits_per_entry,
                ttl = snapshot.ttl,
                "recent_tracker_snapshot_mismatch"
            );
            return Self::new(now);
        }
        let mut tracker = Self {
            bitarray: snapshot.bitarray,
            last_tick: UNIX_EPOCH + Duration::from_secs(snapshot.last_tick),
            size: usize::try_from(snapshot.size).unwrap_or(0),
            ttl: Duration::from_secs(snapshot.ttl),
        };
        tracker.advance(now);
        tracker
    }

    #[must_use]
    pub fn snapshot(&self) -> FuzzyTrackerSnapshot {
        FuzzyTrackerSnapshot {
            bitarray: self.bitarray.clone(),
            last_tick: self
                .last_tick
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            size: self.size as u64,
            ttl: self.ttl.as_secs(),
            bits_per_entry: BITS_PER_ENTRY,
        }
    }

    /// Live entries (paths inserted and not yet fully decayed, modulo
    /// collisions).
    #[must_use]
    pub fn len(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Mark a path at maximum decay level.
    pub fn event(&mut self, path: &ShortPath, now: SystemTime) {
        self.advance(now);
        let entry = Self::entry_for(path);
        if self.get(entry) == 0 {
            self.size += 1;
        }
        self.set(entry, MAX_LEVEL);
    }

    /// Is the path still within its decay window?
    #[must_use]
    pub fn recent(&self, path: &ShortPath) -> bool {
        self.get(Self::entry_for(path)) != 0
    }

    /// Apply any decay ticks that elapsed since the last call.
    pub fn advance(&mut self, now: SystemTime) {
        let tick_len = self.ttl / DECAY_TICKS;
        if tick_len.is_zero() {
            return;
        }
        let Ok(elapsed) = now.duration_since(self.last_tick) else {
            // Clock went backwards; re-anchor.
            self.last_tick = now;
            return;
        };
        let ticks = (elapsed.as_secs() / tick_len.as_secs()) as u32;
        if ticks == 0 {
            return;
        }
        if ticks >= DECAY_TICKS {
            self.bitarray.fill(0);
            self.size = 0;
            self.last_tick = now;
            debug!("recent_tracker_fully_decayed");
            return;
        }
        for _ in 0..ticks {
            self.decay_once();
        }
        self.last_tick += tick_len * ticks;
    }

    fn decay_once(&mut self) {
        for entry in 0..FUZZY_ENTRIES {
            let level = self.get(entry);
            if level > 0 {
                self.set(entry, level - 1);
                if level == 1 {
                    self.size = self.size.saturating_sub(1);
                }
            }
        }
    }

    fn entry_for(path: &ShortPath) -> usize {
        (xxh3_64(path.as_str().as_bytes()) % FUZZY_ENTRIES as u64) as usize
    }

    fn get(&self, entry: usize) -> u8 {
        let byte = self.bitarray[entry / 2];
        if entry % 2 == 0 {
            byte & 0x0F
        } else {
            byte >> 4
        }
    }

    fn set(&mut self, entry: usize, level: u8) {
        let byte = &mut self.bitarray[entry / 2];
        if entry % 2 == 0 {
            *byte = (*byte & 0xF0) | (level & 0x0F);
        } else {
            *byte = (*byte & 0x0F) | (level << 4);
        }
    }
}
