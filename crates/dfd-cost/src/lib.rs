#![forbid(unsafe_code)]
//! Fragmentation cost model for rotating magnetic disks.
//!
//! Pure functions over a nominal 7200 RPM drive geometry: given a file's
//! size and the seek pattern implied by its extent layout, produce a
//! dimensionless cost (modeled read time with seeks over without, >= 1.0)
//! and an estimated defragmentation duration the usage governor can budget
//! against.
//!
//! All durations are `f64` seconds; the quantities here are model outputs
//! fed into ratios, not wall-clock deadlines.

use dfd_types::{BLOCK_SIZE, COMPRESSED_EXTENT_BLOCKS, CompressClass, EXPECTED_COMPRESS_RATIO};

/// Bytes per track on the modeled drive.
const TRACK_SIZE: f64 = 1.25 * 1024.0 * 1024.0;

/// One full revolution at 7200 RPM.
const REVOLUTION_TIME: f64 = 1.0 / 120.0;

/// Track-to-track seek.
const MIN_SEEK: f64 = 0.002;

/// Whole-disk seek.
const MAX_SEEK: f64 = 0.016;

/// Tracks on the modeled disk (nominal 4 TiB of 1.25 MiB tracks). Only the
/// ratio of a seek distance to the whole-disk span enters the model.
const TRACK_COUNT: f64 = 4.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0 / TRACK_SIZE;

/// Rotational geometry the cost model evaluates against, scaled by the
/// configured number of drives backing the filesystem.
#[derive(Debug, Clone, Copy)]
pub struct DriveGeometry {
    drive_count: f64,
}

impl Default for DriveGeometry {
    fn default() -> Self {
        Self { drive_count: 1.0 }
    }
}

impl DriveGeometry {
    /// Geometry for `drive_count` drives. Values below 1.0 are clamped.
    #[must_use]
    pub fn new(drive_count: f64) -> Self {
        Self {
            drive_count: drive_count.max(1.0),
        }
    }

    /// Average seek: midpoint of track-to-track and whole-disk.
    #[must_use]
    pub fn seek_delay(&self) -> f64 {
        (MIN_SEEK + MAX_SEEK) / 2.0
    }

    /// Sequential transfer rate in bytes per second.
    #[must_use]
    pub fn transfer_rate(&self) -> f64 {
        TRACK_SIZE / REVOLUTION_TIME * self.drive_count
    }

    /// Modeled time to move the head from `from_block` to `to_block`
    /// (4 KiB physical block numbers), in seconds.
    ///
    /// A backward jump within [`COMPRESSED_EXTENT_BLOCKS`] is free: the
    /// extent listing reports overlapping adjacent extents for compressed
    /// files, and those are not seeks. Within one track the head just
    /// flies over data; beyond that the distance interpolates between the
    /// minimum and maximum seek.
    #[must_use]
    pub fn seek_time(&self, from_block: u64, to_block: u64) -> f64 {
        if to_block < from_block && from_block - to_block <= COMPRESSED_EXTENT_BLOCKS {
            return 0.0;
        }
        let distance = from_block.abs_diff(to_block) as f64 * BLOCK_SIZE as f64;
        if distance < TRACK_SIZE {
            REVOLUTION_TIME * distance / TRACK_SIZE
        } else {
            MIN_SEEK
                + (MAX_SEEK - MIN_SEEK) * distance
                    / (TRACK_COUNT * TRACK_SIZE * self.drive_count)
        }
    }

    /// Dimensionless fragmentation cost: modeled sequential read time with
    /// the accumulated seeks over the time without them. 1.0 for a
    /// one-extent file, growing with `total_seek_time`.
    #[must_use]
    pub fn fragmentation_cost(&self, size: u64, total_seek_time: f64) -> f64 {
        if size == 0 || total_seek_time == 0.0 {
            return 1.0;
        }
        let sequential = self.seek_delay() + size as f64 / self.transfer_rate();
        (sequential + total_seek_time) / sequential
    }

    /// Estimated duration of defragmenting a file: read it at its current
    /// cost, then write it back at the class's historically-achieved
    /// average cost. Compressed files move fewer device bytes.
    #[must_use]
    pub fn defrag_time(
        &self,
        size: u64,
        cost: f64,
        class: CompressClass,
        average_cost: f64,
    ) -> f64 {
        let transfer = size as f64 / self.transfer_rate();
        let read_time = transfer * cost + self.seek_delay();
        let write_time = transfer + self.seek_delay();
        let total = read_time + write_time * average_cost;
        match class {
            CompressClass::Compressed => total * EXPECTED_COMPRESS_RATIO,
            CompressClass::Uncompressed => total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn zero_seek_time_costs_one() {
        let geo = DriveGeometry::default();
        for size in [0_u64, 1, 4096, 10 << 20, 1 << 40] {
            assert_eq!(geo.fragmentation_cost(size, 0.0), 1.0);
        }
    }

    #[test]
    fn backward_jump_within_compressed_extent_is_free() {
        let geo = DriveGeometry::default();
        assert_eq!(geo.seek_time(1000, 1000 - COMPRESSED_EXTENT_BLOCKS), 0.0);
        assert!(geo.seek_time(1000, 1000 - COMPRESSED_EXTENT_BLOCKS - 1) > 0.0);
        // Forward jumps of the same distance are never free.
        assert!(geo.seek_time(1000, 1010) > 0.0);
    }

    #[test]
    fn same_track_seek_is_rotational() {
        let geo = DriveGeometry::default();
        // One track is 320 blocks of 4 KiB; half a track costs half a turn.
        let half_track = geo.seek_time(0, 160);
        assert!((half_track - REVOLUTION_TIME / 2.0).abs() < 1e-9);
    }

    #[test]
    fn long_seek_interpolates_between_min_and_max() {
        let geo = DriveGeometry::default();
        let one_track = geo.seek_time(0, 320);
        assert!(one_track >= MIN_SEEK);
        let far = geo.seek_time(0, 500_000_000);
        assert!(far > one_track);
        assert!(far <= MAX_SEEK + MIN_SEEK);
    }

    #[test]
    fn more_drives_shrink_long_seeks_and_transfer_time() {
        let one = DriveGeometry::new(1.0);
        let four = DriveGeometry::new(4.0);
        assert!(four.transfer_rate() > one.transfer_rate());
        assert!(four.seek_time(0, 500_000_000) < one.seek_time(0, 500_000_000));
    }

    #[test]
    fn compressed_defrag_is_cheaper() {
        let geo = DriveGeometry::default();
        let plain = geo.defrag_time(10 << 20, 2.0, CompressClass::Uncompressed, 1.1);
        let packed = geo.defrag_time(10 << 20, 2.0, CompressClass::Compressed, 1.1);
        assert!((packed - plain * EXPECTED_COMPRESS_RATIO).abs() < 1e-12);
    }

    proptest! {
        #[test]
        fn cost_is_at_least_one_and_monotonic_in_seeks(
            size in 1_u64..=(1 << 42),
            seeks in proptest::collection::vec(0.0_f64..0.05, 0..64),
        ) {
            let geo = DriveGeometry::default();
            let mut previous = 1.0_f64;
            let mut total = 0.0;
            for seek in seeks {
                total += seek;
                let cost = geo.fragmentation_cost(size, total);
                prop_assert!(cost >= 1.0);
                prop_assert!(cost >= previous - 1e-12);
                previous = cost;
            }
        }

        #[test]
        fn seek_time_is_non_negative(from in 0_u64..=(1 << 40), to in 0_u64..=(1 << 40)) {
            let geo = DriveGeometry::default();
            prop_assert!(geo.seek_time(from, to) >= 0.0);
        }
    }
}
