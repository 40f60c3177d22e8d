//! Argv batching for the extent-listing tool.
//!
//! One invocation lists many files, but the platform bounds the total argv
//! byte length. Paths are packed greedily; an oversized single path gets a
//! batch of its own (the tool will report on it or fail in isolation).

use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use tracing::warn;

/// Pack `paths` into batches whose summed byte length (with one separator
/// per argument) stays within `max_bytes`.
#[must_use]
pub fn batch_paths(paths: Vec<PathBuf>, max_bytes: usize) -> Vec<Vec<PathBuf>> {
    let mut batches = Vec::new();
    let mut current: Vec<PathBuf> = Vec::new();
    let mut current_bytes = 0_usize;

    for path in paths {
        let cost = path.as_os_str().as_bytes().len() + 1;
        if cost > max_bytes && current.is_empty() {
            warn!(path = %path.display(), cost, "path_exceeds_argv_budget");
            batches.push(vec![path]);
            continue;
        }
        if current_bytes + cost > max_bytes && !current.is_empty() {
            batches.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current_bytes += cost;
        current.push(path);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_sets_stay_in_one_batch() {
        let paths: Vec<PathBuf> = (0..10).map(|i| PathBuf::from(format!("/mnt/f{i}"))).collect();
        let batches = batch_paths(paths, 4096);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 10);
    }

    #[test]
    fn burst_of_files_never_exceeds_the_budget() {
        // A 300-file write burst; every batch stays under the limit.
        let paths: Vec<PathBuf> = (0..300)
            .map(|i| PathBuf::from(format!("/mnt/data/db/segment-{i:06}.log")))
            .collect();
        let budget = 1024;
        let batches = batch_paths(paths.clone(), budget);
        assert!(batches.len() > 1);
        let total: usize = batches.iter().map(Vec::len).sum();
        assert_eq!(total, 300);
        for batch in &batches {
            let bytes: usize = batch
                .iter()
                .map(|path| path.as_os_str().len() + 1)
                .sum();
            assert!(bytes <= budget, "batch of {bytes} bytes over budget");
        }
    }

    #[test]
    fn oversized_path_is_isolated() {
        let long = PathBuf::from(format!("/mnt/{}", "x".repeat(300)));
        let batches = batch_paths(
            vec![PathBuf::from("/mnt/a"), long.clone(), PathBuf::from("/mnt/b")],
            128,
        );
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[1], vec![long]);
    }

    #[test]
    fn empty_input_yields_no_batches() {
        assert!(batch_paths(Vec::new(), 4096).is_empty());
    }
}
