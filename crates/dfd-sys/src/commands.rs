//! Subprocess invocations of the external btrfs tooling.
//!
//! Exit codes are advisory at best here: `filefrag` fails when one file of
//! a batch vanished but still reports on the rest, and `btrfs filesystem
//! defragment` returns nonzero for files it skipped. Callers get whatever
//! output there was; a missing tool is the only hard error.

use crate::mounts::CompressAlgo;
use dfd_error::{DefragError, Result};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// The defrag/subvolume tool; also the process name filtered out of the
/// write-event stream so our own rewrites do not feed back into the queue.
pub const DEFRAG_TOOL: &str = "btrfs";

/// The extent-listing tool.
pub const FILEFRAG_TOOL: &str = "filefrag";

/// Run `filefrag -v` over a batch of paths and return its stdout.
///
/// The exit status is ignored: a vanished file fails the whole invocation
/// while the remaining listings are still usable.
pub fn run_filefrag(paths: &[PathBuf]) -> Result<String> {
    if paths.is_empty() {
        return Ok(String::new());
    }
    let output = Command::new(FILEFRAG_TOOL)
        .arg("-v")
        .args(paths)
        .output()
        .map_err(|error| DefragError::Subprocess {
            command: FILEFRAG_TOOL.to_owned(),
            detail: error.to_string(),
        })?;
    if !output.status.success() {
        debug!(status = %output.status, files = paths.len(), "filefrag_nonzero_exit");
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// The defrag invocation for one file, as argv.
#[must_use]
pub fn build_defrag_command(
    compress: Option<CompressAlgo>,
    target_extent_size: Option<&str>,
    path: &Path,
) -> Vec<String> {
    let mut argv = vec![
        DEFRAG_TOOL.to_owned(),
        "filesystem".to_owned(),
        "defragment".to_owned(),
    ];
    if compress.is_some() {
        // Compressed mounts are rewritten compressed; the tool only takes
        // zlib here regardless of the mount's algorithm.
        argv.push("-czlib".to_owned());
    }
    if let Some(extent) = target_extent_size {
        argv.push("-t".to_owned());
        argv.push(extent.to_owned());
    }
    argv.push(path.display().to_string());
    argv
}

/// Run a defrag command and return how long the call took. The exit code
/// is ignored; a nonzero exit is a noop defrag.
pub fn run_defrag(argv: &[String]) -> Result<Duration> {
    let started = Instant::now();
    let output = Command::new(&argv[0])
        .args(&argv[1..])
        .output()
        .map_err(|error| DefragError::Subprocess {
            command: argv.join(" "),
            detail: error.to_string(),
        })?;
    let elapsed = started.elapsed();
    if !output.status.success() {
        debug!(status = %output.status, command = %argv.join(" "), "defrag_nonzero_exit");
    }
    Ok(elapsed)
}

/// List subvolume paths (relative to the filesystem root) of a mounted
/// btrfs filesystem.
pub fn list_subvolumes(mountpoint: &Path) -> Result<Vec<PathBuf>> {
    let output = Command::new(DEFRAG_TOOL)
        .args(["subvolume", "list"])
        .arg(mountpoint)
        .output()
        .map_err(|error| DefragError::Subprocess {
            command: format!("{DEFRAG_TOOL} subvolume list"),
            detail: error.to_string(),
        })?;
    if !output.status.success() {
        warn!(status = %output.status, mountpoint = %mountpoint.display(), "subvolume_list_failed");
        return Err(DefragError::Subprocess {
            command: format!("{DEFRAG_TOOL} subvolume list"),
            detail: format!("exit status {}", output.status),
        });
    }
    Ok(parse_subvolume_list(&String::from_utf8_lossy(&output.stdout)))
}

/// Parse `btrfs subvolume list` output: each line ends in `path <relative>`.
#[must_use]
pub fn parse_subvolume_list(output: &str) -> Vec<PathBuf> {
    output
        .lines()
        .filter_map(|line| {
            let (_, path) = line.rsplit_once(" path ")?;
            Some(PathBuf::from(path))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defrag_command_shapes() {
        let plain = build_defrag_command(None, None, Path::new("/mnt/a/file"));
        assert_eq!(
            plain,
            vec!["btrfs", "filesystem", "defragment", "/mnt/a/file"]
        );

        let compressed = build_defrag_command(
            Some(CompressAlgo::Lzo),
            Some("32M"),
            Path::new("/mnt/a/file"),
        );
        assert_eq!(
            compressed,
            vec![
                "btrfs",
                "filesystem",
                "defragment",
                "-czlib",
                "-t",
                "32M",
                "/mnt/a/file"
            ]
        );
    }

    #[test]
    fn subvolume_list_parses_paths() {
        let output = "\
ID 257 gen 12 top level 5 path volumes/alpha
ID 258 gen 40 top level 5 path volumes/beta with space
";
        let paths = parse_subvolume_list(output);
        assert_eq!(
            paths,
            vec![
                PathBuf::from("volumes/alpha"),
                PathBuf::from("volumes/beta with space")
            ]
        );
    }

    #[test]
    fn empty_batch_skips_the_subprocess() {
        assert_eq!(run_filefrag(&[]).expect("no-op"), "");
    }
}
