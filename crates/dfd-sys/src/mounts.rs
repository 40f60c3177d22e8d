//! Kernel mount table parsing.
//!
//! Lines look like `<dev> <mountpoint> <fstype> <options> 0 0`; fields are
//! whitespace-separated with octal escapes (`\040` for a space) inside
//! paths. Later lines shadow earlier ones for the same mountpoint, so
//! lookups walk the table in reverse.

use dfd_error::{DefragError, Result};
use dfd_types::DEFAULT_COMMIT_DELAY;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

const MOUNT_TABLE_PATH: &str = "/proc/mounts";

/// One parsed mount table line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub device: String,
    pub mountpoint: PathBuf,
    pub fstype: String,
    pub options: Vec<String>,
}

impl MountEntry {
    #[must_use]
    pub fn has_option(&self, name: &str) -> bool {
        self.options.iter().any(|option| option == name)
    }
}

/// Compression algorithms the defrag command can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressAlgo {
    Zlib,
    Lzo,
}

/// The two mount options defragd cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountOptions {
    pub compress: Option<CompressAlgo>,
    pub commit_delay: Duration,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            compress: None,
            commit_delay: DEFAULT_COMMIT_DELAY,
        }
    }
}

/// Read and parse the kernel mount table.
pub fn read_mount_table() -> Result<Vec<MountEntry>> {
    let text = std::fs::read_to_string(MOUNT_TABLE_PATH)?;
    Ok(parse_mount_table(&text))
}

/// Parse a whole mount table; unparsable lines are logged and skipped.
#[must_use]
pub fn parse_mount_table(text: &str) -> Vec<MountEntry> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match parse_line(line) {
            Some(entry) => Some(entry),
            None => {
                warn!(line, "mount_table_line_unparsable");
                None
            }
        })
        .collect()
}

/// The effective entry for `mountpoint`: the last matching line wins.
#[must_use]
pub fn find_mount<'a>(entries: &'a [MountEntry], mountpoint: &Path) -> Option<&'a MountEntry> {
    entries
        .iter()
        .rev()
        .find(|entry| entry.mountpoint == mountpoint)
}

/// Extract `compress[-force]=` and `commit=` from an entry's options.
#[must_use]
pub fn parse_mount_options(entry: &MountEntry) -> MountOptions {
    let mut parsed = MountOptions::default();
    for option in &entry.options {
        if let Some(value) = option
            .strip_prefix("compress=")
            .or_else(|| option.strip_prefix("compress-force="))
        {
            // `zlib:3` carries a level suffix.
            parsed.compress = match value.split(':').next().unwrap_or_default() {
                "zlib" => Some(CompressAlgo::Zlib),
                "lzo" => Some(CompressAlgo::Lzo),
                other => {
                    warn!(algo = other, "unsupported_compress_algo");
                    parsed.compress
                }
            };
        } else if let Some(value) = option.strip_prefix("commit=") {
            match value.parse::<u64>() {
                Ok(secs) => parsed.commit_delay = Duration::from_secs(secs),
                Err(_) => warn!(option = %option, "bad_commit_option"),
            }
        }
    }
    parsed
}

/// Btrfs mounts eligible for management: not mounted with `autodefrag`
/// (the kernel is already doing the job there).
#[must_use]
pub fn managed_candidates(entries: &[MountEntry]) -> Vec<&MountEntry> {
    entries
        .iter()
        .filter(|entry| entry.fstype == "btrfs" && !entry.has_option("autodefrag"))
        .collect()
}

/// Find the effective mount options for a managed filesystem root.
pub fn options_for(entries: &[MountEntry], fs_root: &Path) -> Result<MountOptions> {
    find_mount(entries, fs_root)
        .map(parse_mount_options)
        .ok_or_else(|| DefragError::MountNotFound(fs_root.display().to_string()))
}

fn parse_line(line: &str) -> Option<MountEntry> {
    let mut fields = line.split_whitespace();
    let device = fields.next()?.to_owned();
    let mountpoint = PathBuf::from(unescape(fields.next()?));
    let fstype = fields.next()?.to_owned();
    let options = fields
        .next()?
        .split(',')
        .map(str::to_owned)
        .collect::<Vec<_>>();
    Some(MountEntry {
        device,
        mountpoint,
        fstype,
        options,
    })
}

/// Decode the `\ooo` octal escapes the kernel uses for whitespace in paths.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == b'\\'
            && index + 3 < bytes.len()
            && (b'0'..=b'3').contains(&bytes[index + 1])
            && (b'0'..=b'7').contains(&bytes[index + 2])
            && (b'0'..=b'7').contains(&bytes[index + 3])
        {
            let code = (bytes[index + 1] - b'0') * 64
                + (bytes[index + 2] - b'0') * 8
                + (bytes[index + 3] - b'0');
            out.push(code);
            index += 4;
        } else {
            out.push(bytes[index]);
            index += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "\
/dev/sda1 / ext4 rw,relatime 0 0
/dev/sdb1 /mnt/ceph-0 btrfs rw,noatime,compress=zlib:3,commit=15,space_cache=v2 0 0
/dev/sdc1 /mnt/ceph-1 btrfs rw,noatime,autodefrag 0 0
/dev/sdd1 /mnt/plain btrfs rw,noatime 0 0
/dev/sdb1 /mnt/ceph-0 btrfs rw,noatime,compress=lzo 0 0
";

    #[test]
    fn parses_all_well_formed_lines() {
        let entries = parse_mount_table(TABLE);
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[1].fstype, "btrfs");
        assert!(entries[1].has_option("noatime"));
    }

    #[test]
    fn later_lines_shadow_earlier_ones() {
        let entries = parse_mount_table(TABLE);
        let entry = find_mount(&entries, Path::new("/mnt/ceph-0")).expect("entry");
        let options = parse_mount_options(entry);
        assert_eq!(options.compress, Some(CompressAlgo::Lzo));
        assert_eq!(options.commit_delay, DEFAULT_COMMIT_DELAY);
    }

    #[test]
    fn compress_and_commit_options_parse() {
        let entries = parse_mount_table(TABLE);
        let options = parse_mount_options(&entries[1]);
        assert_eq!(options.compress, Some(CompressAlgo::Zlib));
        assert_eq!(options.commit_delay, Duration::from_secs(15));
    }

    #[test]
    fn autodefrag_mounts_are_not_candidates() {
        let entries = parse_mount_table(TABLE);
        let candidates = managed_candidates(&entries);
        let roots: Vec<&Path> = candidates
            .iter()
            .map(|entry| entry.mountpoint.as_path())
            .collect();
        assert!(roots.contains(&Path::new("/mnt/ceph-0")));
        assert!(roots.contains(&Path::new("/mnt/plain")));
        assert!(!roots.contains(&Path::new("/mnt/ceph-1")));
        assert!(!roots.contains(&Path::new("/")));
    }

    #[test]
    fn octal_escapes_decode() {
        let entries = parse_mount_table("/dev/sde1 /mnt/with\\040space btrfs rw 0 0\n");
        assert_eq!(entries[0].mountpoint, Path::new("/mnt/with space"));
    }

    #[test]
    fn garbage_lines_are_skipped() {
        let entries = parse_mount_table("garbage\n/dev/sda1 /mnt btrfs rw 0 0\n");
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn missing_mount_is_an_error() {
        let entries = parse_mount_table(TABLE);
        assert!(options_for(&entries, Path::new("/mnt/gone")).is_err());
        assert!(options_for(&entries, Path::new("/mnt/plain")).is_ok());
    }
}
