#![forbid(unsafe_code)]
//! Parser for the verbose output of the extent-listing tool (`filefrag -v`).
//!
//! Consumes line-oriented listings for one or many files and emits one
//! [`FragRecord`] per file: its size, its majority compression class, and
//! the fragmentation cost implied by the seeks between consecutive extents.
//! This is the only place in the workspace that understands the tool's
//! text format.
//!
//! Recognized line shapes:
//!
//! ```text
//! File size of /mnt/a/b is 1048576 (256 blocks of 4096 bytes)
//!  ext:     logical_offset:        physical_offset: length:   expected: flags:
//!    0:        0..     255:      34816..     35071:    256:             last,eof
//! /mnt/a/b: 1 extent found
//! ```
//!
//! An unrecognized line abandons the file being accumulated and is logged;
//! parsing resumes at the next `File size of` header.

use dfd_cost::DriveGeometry;
use dfd_types::{CompressClass, FragRecord, ShortPath};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Per-file accumulation between a size header and its terminator line.
#[derive(Debug)]
struct FileAccum {
    path: PathBuf,
    size: u64,
    prev_end: Option<u64>,
    seek_secs: f64,
    extents_seen: u64,
    compressed_blocks: u64,
    uncompressed_blocks: u64,
}

/// Streaming parser for one or many concatenated per-file listings.
///
/// Paths in emitted records are shortened relative to `fs_root`.
#[derive(Debug)]
pub struct ExtentParser<'a> {
    geometry: &'a DriveGeometry,
    fs_root: &'a Path,
    current: Option<FileAccum>,
}

impl<'a> ExtentParser<'a> {
    #[must_use]
    pub fn new(geometry: &'a DriveGeometry, fs_root: &'a Path) -> Self {
        Self {
            geometry,
            fs_root,
            current: None,
        }
    }

    /// Parse a complete tool output, returning one record per terminated
    /// file listing.
    pub fn parse(&mut self, output: &str) -> Vec<FragRecord> {
        output.lines().filter_map(|line| self.feed_line(line)).collect()
    }

    /// Feed one line; returns a record when the line terminates a file.
    pub fn feed_line(&mut self, line: &str) -> Option<FragRecord> {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with("Filesystem type is") {
            return None;
        }
        if let Some(rest) = line.strip_prefix("File size of ") {
            if let Some(abandoned) = self.current.take() {
                warn!(
                    path = %abandoned.path.display(),
                    "filefrag_listing_unterminated"
                );
            }
            self.current = parse_size_header(rest);
            if self.current.is_none() {
                warn!(line, "filefrag_unrecognized_line");
            }
            return None;
        }
        if trimmed.starts_with("ext:") || trimmed.contains("logical_offset") {
            // Column header row.
            return None;
        }
        if trimmed.ends_with("extents found") || trimmed.ends_with("extent found") {
            return self.finish_file(trimmed);
        }
        if let Some(extent) = parse_extent_row(line) {
            self.accumulate(extent);
            return None;
        }
        warn!(line, "filefrag_unrecognized_line");
        self.current = None;
        None
    }

    fn accumulate(&mut self, extent: ExtentRow) {
        let Some(accum) = self.current.as_mut() else {
            debug!("filefrag_extent_without_header");
            return;
        };
        if let Some(prev_end) = accum.prev_end {
            accum.seek_secs += self.geometry.seek_time(prev_end, extent.physical_start);
        }
        accum.prev_end = Some(extent.physical_end);
        accum.extents_seen += 1;
        if extent.encoded {
            accum.compressed_blocks += extent.length;
        } else {
            accum.uncompressed_blocks += extent.length;
        }
    }

    fn finish_file(&mut self, terminator: &str) -> Option<FragRecord> {
        let accum = self.current.take()?;
        if let Some(reported) = parse_terminator_count(terminator)
            && reported != accum.extents_seen
        {
            debug!(
                path = %accum.path.display(),
                reported,
                seen = accum.extents_seen,
                "filefrag_extent_count_mismatch"
            );
        }
        let class = if accum.compressed_blocks > accum.uncompressed_blocks {
            CompressClass::Compressed
        } else {
            CompressClass::Uncompressed
        };
        let cost = self.geometry.fragmentation_cost(accum.size, accum.seek_secs);
        Some(FragRecord {
            short_path: shorten(&accum.path, self.fs_root),
            size: accum.size,
            class,
            cost,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct ExtentRow {
    physical_start: u64,
    physical_end: u64,
    length: u64,
    encoded: bool,
}

/// `<path> is <size> (...)` — split on the last ` is `, since the size
/// suffix never contains one while the path may.
fn parse_size_header(rest: &str) -> Option<FileAccum> {
    let split_at = rest.rfind(" is ")?;
    let path = PathBuf::from(&rest[..split_at]);
    let size = rest[split_at + 4..]
        .split_whitespace()
        .next()?
        .parse::<u64>()
        .ok()?;
    Some(FileAccum {
        path,
        size,
        prev_end: None,
        seek_secs: 0.0,
        extents_seen: 0,
        compressed_blocks: 0,
        uncompressed_blocks: 0,
    })
}

/// Colon-separated extent row. The `expected` column is optional, so the
/// layout is identified by position from the front and flags taken from
/// the final field.
fn parse_extent_row(line: &str) -> Option<ExtentRow> {
    let parts: Vec<&str> = line.split(':').collect();
    if parts.len() < 4 {
        return None;
    }
    parts[0].trim().parse::<u64>().ok()?;
    let (physical_start, physical_end) = parse_block_range(parts.get(2)?.trim())?;
    let length = parts.get(3)?.trim().parse::<u64>().ok()?;
    let flags = parts.last().map(|raw| raw.trim()).unwrap_or_default();
    let encoded = flags
        .split(',')
        .any(|flag| flag.trim() == "encoded");
    Some(ExtentRow {
        physical_start,
        physical_end,
        length,
        encoded,
    })
}

fn parse_block_range(field: &str) -> Option<(u64, u64)> {
    let (start, end) = field.split_once("..")?;
    Some((
        start.trim().parse::<u64>().ok()?,
        end.trim().parse::<u64>().ok()?,
    ))
}

/// `<path>: N extents found` — the count sits after the last colon.
fn parse_terminator_count(line: &str) -> Option<u64> {
    let tail = line.rsplit(':').next()?;
    tail.split_whitespace().next()?.parse::<u64>().ok()
}

fn shorten(path: &Path, fs_root: &Path) -> ShortPath {
    let relative = path.strip_prefix(fs_root).unwrap_or(path);
    ShortPath(relative.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn listing_for(path: &str, size: u64, extents: &[(u64, u64, &str)]) -> String {
        let mut out = format!(
            "File size of {path} is {size} ({} blocks of 4096 bytes)\n",
            size.div_ceil(4096)
        );
        out.push_str(" ext:     logical_offset:        physical_offset: length:   expected: flags:\n");
        let mut logical = 0_u64;
        for (index, (start, end, flags)) in extents.iter().enumerate() {
            let length = end - start + 1;
            out.push_str(&format!(
                "{index:>4}: {:>8}..{:>8}: {start:>10}..{end:>10}: {length:>6}: {flags}\n",
                logical,
                logical + length - 1,
            ));
            logical += length;
        }
        out.push_str(&format!(
            "{path}: {} extent{} found\n",
            extents.len(),
            if extents.len() == 1 { "" } else { "s" }
        ));
        out
    }

    #[test]
    fn single_extent_file_costs_one() {
        let geo = DriveGeometry::default();
        let root = Path::new("/mnt/data");
        let mut parser = ExtentParser::new(&geo, root);
        let listing = listing_for("/mnt/data/a/one.bin", 1_048_576, &[(1000, 1255, "last,eof")]);
        let records = parser.parse(&listing);
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.short_path.as_str(), "a/one.bin");
        assert_eq!(record.size, 1_048_576);
        assert_eq!(record.class, CompressClass::Uncompressed);
        assert_eq!(record.cost, 1.0);
    }

    #[test]
    fn scattered_file_costs_well_over_two() {
        // 10 MiB in 100 extents spread over a 2 GiB span.
        let geo = DriveGeometry::default();
        let root = Path::new("/mnt/data");
        let mut parser = ExtentParser::new(&geo, root);
        let extents: Vec<(u64, u64, &str)> = (0..100_u64)
            .map(|i| {
                let start = i * 5_242;
                (start, start + 25, "")
            })
            .collect();
        let listing = listing_for("/mnt/data/scattered.bin", 10 << 20, &extents);
        let records = parser.parse(&listing);
        assert_eq!(records.len(), 1);
        assert!(records[0].cost > 2.0, "cost was {}", records[0].cost);
        assert_eq!(records[0].class, CompressClass::Uncompressed);
    }

    #[test]
    fn encoded_majority_lands_in_compressed_class() {
        let geo = DriveGeometry::default();
        let root = Path::new("/mnt/data");
        let mut parser = ExtentParser::new(&geo, root);
        let listing = listing_for(
            "/mnt/data/packed.bin",
            1 << 20,
            &[
                (5000, 5031, "encoded"),
                (9000, 9031, "encoded"),
                (12000, 12007, "last,eof"),
            ],
        );
        let records = parser.parse(&listing);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].class, CompressClass::Compressed);
        assert!(records[0].cost > 1.0);
    }

    #[test]
    fn expected_column_does_not_confuse_flags() {
        let geo = DriveGeometry::default();
        let root = Path::new("/mnt");
        let mut parser = ExtentParser::new(&geo, root);
        let listing = "File size of /mnt/f is 2097152 (512 blocks of 4096 bytes)\n\
                       \x20ext:     logical_offset:        physical_offset: length:   expected: flags:\n\
                       \x20  0:        0..     255:      34816..     35071:    256:\n\
                       \x20  1:      256..     511:     140960..    141215:    256:      35072: last,eof\n\
                       /mnt/f: 2 extents found\n";
        let records = parser.parse(listing);
        assert_eq!(records.len(), 1);
        assert!(records[0].cost > 1.0);
        assert_eq!(records[0].class, CompressClass::Uncompressed);
    }

    #[test]
    fn garbage_line_abandons_file_and_parsing_resumes() {
        let geo = DriveGeometry::default();
        let root = Path::new("/mnt");
        let mut parser = ExtentParser::new(&geo, root);
        let mut listing = String::from("File size of /mnt/bad is 8192 (2 blocks of 4096 bytes)\n");
        listing.push_str("complete nonsense here\n");
        listing.push_str(&listing_for("/mnt/good", 8192, &[(40, 41, "last,eof")]));
        let records = parser.parse(&listing);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].short_path.as_str(), "good");
    }

    #[test]
    fn batch_output_yields_one_record_per_file() {
        let geo = DriveGeometry::default();
        let root = Path::new("/mnt");
        let mut parser = ExtentParser::new(&geo, root);
        let mut listing = listing_for("/mnt/a", 8192, &[(10, 11, "last,eof")]);
        listing.push_str(&listing_for("/mnt/b", 16384, &[(100, 101, ""), (90_000, 90_001, "last,eof")]));
        let records = parser.parse(&listing);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].short_path.as_str(), "a");
        assert_eq!(records[1].short_path.as_str(), "b");
        assert!(records[1].cost > records[0].cost);
    }

    #[test]
    fn path_containing_is_parses() {
        let geo = DriveGeometry::default();
        let root = Path::new("/mnt");
        let mut parser = ExtentParser::new(&geo, root);
        let listing = listing_for("/mnt/this is fine.log", 8192, &[(7, 8, "last,eof")]);
        let records = parser.parse(&listing);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].short_path.as_str(), "this is fine.log");
    }

    proptest! {
        /// Synthesized geometry round-trip: the parser's cost matches the
        /// cost computed directly from the same extent walk.
        #[test]
        fn parser_cost_matches_direct_computation(
            starts in proptest::collection::vec(0_u64..2_000_000, 1..40),
            length in 1_u64..256,
            size in 4097_u64..(1 << 30),
        ) {
            let geo = DriveGeometry::default();
            let root = Path::new("/mnt");
            let extents: Vec<(u64, u64, &str)> = starts
                .iter()
                .map(|&start| (start, start + length - 1, ""))
                .collect();

            let mut expected_seeks = 0.0;
            let mut prev_end: Option<u64> = None;
            for &(start, end, _) in &extents {
                if let Some(prev) = prev_end {
                    expected_seeks += geo.seek_time(prev, start);
                }
                prev_end = Some(end);
            }
            let expected = geo.fragmentation_cost(size, expected_seeks);

            let listing = listing_for("/mnt/prop.bin", size, &extents);
            let mut parser = ExtentParser::new(&geo, root);
            let records = parser.parse(&listing);
            prop_assert_eq!(records.len(), 1);
            prop_assert!((records[0].cost - expected).abs() < 1e-9);
        }
    }
}
