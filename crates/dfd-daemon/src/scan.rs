//! The slow scan: a full recursive traversal of the filesystem paced to
//! complete in `SLOW_SCAN_PERIOD`.
//!
//! Directories are pruned when they are foreign mountpoints or carry a
//! `.no_defrag` marker. Surviving regular files are batched into extent
//! listings; batch size adapts upward when the pass falls behind its
//! schedule, and the persisted checkpoint lets a restarted daemon resume
//! mid-pass instead of rescanning from the root.

use crate::orchestrator::FsOrchestrator;
use dfd_error::Result;
use dfd_filefrag::ExtentParser;
use dfd_sys::run_filefrag;
use dfd_types::{
    MAX_DELAY_BETWEEN_FILEFRAGS, MIN_FILES_BATCH_SIZE, MIN_INTERESTING_FILE_SIZE, ScanCheckpoint,
    ShortPath,
};
use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Marker file whose presence excludes a directory subtree from the scan.
const NO_DEFRAG_MARKER: &str = ".no_defrag";

/// Slack added to the commit delay before trusting a file's extent data.
const COMMIT_SLACK: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct PassSummary {
    files_seen: u64,
    newly_queued: usize,
}

impl FsOrchestrator {
    pub(crate) fn slow_scan_loop(&self) {
        let mut first_pass = true;
        loop {
            if self.stop.is_set() {
                return;
            }
            let checkpoint = if first_pass {
                self.store.load_checkpoint(&self.fs_root)
            } else {
                None
            };
            if first_pass && checkpoint.is_some_and(|cp| cp.processed > 0) {
                info!(
                    fs_root = %self.fs_root.display(),
                    wait_secs = self.config.slow_start.as_secs(),
                    "slow_scan_catchup_wait"
                );
                if self.stop.wait(self.config.slow_start) {
                    return;
                }
            }
            first_pass = false;

            let pass_started = Instant::now();
            let mut pass = ScanPass::new(self, checkpoint.unwrap_or_default(), pass_started);
            match pass.run() {
                Ok(summary) => info!(
                    fs_root = %self.fs_root.display(),
                    files = summary.files_seen,
                    queued = summary.newly_queued,
                    elapsed_secs = pass_started.elapsed().as_secs(),
                    "slow_scan_pass_complete"
                ),
                Err(error) => {
                    warn!(fs_root = %self.fs_root.display(), %error, "slow_scan_pass_failed");
                }
            }
            if self.stop.is_set() {
                return;
            }

            let elapsed = pass_started.elapsed();
            if elapsed < self.config.slow_scan_period
                && self.stop.wait(self.config.slow_scan_period - elapsed)
            {
                return;
            }
        }
    }
}

struct ScanPass<'a> {
    orchestrator: &'a FsOrchestrator,
    pass_started: Instant,
    /// Total files from the previous pass; pacing denominator.
    total_estimate: u64,
    processed: u64,
    /// Files to skip when resuming from a checkpoint.
    skip_remaining: u64,
    batch: Vec<PathBuf>,
    batch_bytes: usize,
    batch_target: usize,
    newly_queued: usize,
    last_saved: ScanCheckpoint,
}

impl<'a> ScanPass<'a> {
    fn new(
        orchestrator: &'a FsOrchestrator,
        checkpoint: ScanCheckpoint,
        pass_started: Instant,
    ) -> Self {
        Self {
            orchestrator,
            pass_started,
            total_estimate: checkpoint.total,
            processed: 0,
            skip_remaining: checkpoint.processed,
            batch: Vec::new(),
            batch_bytes: 0,
            batch_target: MIN_FILES_BATCH_SIZE,
            newly_queued: 0,
            last_saved: checkpoint,
        }
    }

    fn run(&mut self) -> Result<PassSummary> {
        let orchestrator = self.orchestrator;
        let mut stack = vec![orchestrator.fs_root.clone()];

        while let Some(dir) = stack.pop() {
            if orchestrator.stop.is_set() {
                self.save_checkpoint();
                return Ok(PassSummary {
                    files_seen: self.processed,
                    newly_queued: self.newly_queued,
                });
            }
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(error) => {
                    debug!(dir = %dir.display(), %error, "scan_dir_unreadable");
                    continue;
                }
            };
            let mut files = Vec::new();
            let mut subdirs = Vec::new();
            let mut blacklisted = false;
            for entry in entries.flatten() {
                if entry.file_name() == NO_DEFRAG_MARKER {
                    blacklisted = true;
                    break;
                }
                let Ok(file_type) = entry.file_type() else {
                    continue;
                };
                if file_type.is_dir() {
                    subdirs.push(entry.path());
                } else if file_type.is_file() {
                    files.push(entry);
                }
            }
            if blacklisted {
                debug!(dir = %dir.display(), "scan_dir_blacklisted");
                continue;
            }
            for subdir in subdirs {
                if orchestrator.prune.lock().prunes(&subdir) {
                    debug!(dir = %subdir.display(), "scan_foreign_mount_pruned");
                } else {
                    stack.push(subdir);
                }
            }
            for entry in files {
                self.consider_file(entry.path(), entry.metadata().ok());
            }
        }

        self.flush_batch(false);
        // Pass complete: the next one starts from zero with a fresh total.
        let files_seen = self.processed;
        self.total_estimate = self.processed;
        self.processed = 0;
        self.save_checkpoint();
        Ok(PassSummary {
            files_seen,
            newly_queued: self.newly_queued,
        })
    }

    fn consider_file(&mut self, path: PathBuf, metadata: Option<Metadata>) {
        self.processed += 1;
        self.maybe_save_checkpoint();
        if self.skip_remaining > 0 {
            self.skip_remaining -= 1;
            return;
        }
        let orchestrator = self.orchestrator;
        let Some(metadata) = metadata else {
            return;
        };
        let Some(relative) = path
            .strip_prefix(&orchestrator.fs_root)
            .ok()
            .and_then(|relative| relative.to_str())
        else {
            // Undecodable names cannot round-trip through the tool output.
            return;
        };
        let commit_delay = orchestrator.options.lock().commit_delay;
        if !file_is_eligible(&metadata, SystemTime::now(), commit_delay) {
            return;
        }
        if orchestrator
            .state
            .recently_defragmented(&ShortPath::from(relative), SystemTime::now())
        {
            return;
        }

        self.batch_bytes += path.as_os_str().len() + 1;
        self.batch.push(path);
        if self.batch.len() >= self.batch_target
            || self.batch_bytes >= orchestrator.config.filefrag_arg_max
        {
            self.flush_batch(true);
        }
    }

    fn flush_batch(&mut self, pace: bool) {
        if self.batch.is_empty() {
            return;
        }
        let orchestrator = self.orchestrator;
        let batch = std::mem::take(&mut self.batch);
        let batch_len = batch.len();
        self.batch_bytes = 0;

        let batch_started = Instant::now();
        match run_filefrag(&batch) {
            Ok(output) => {
                let records =
                    ExtentParser::new(&orchestrator.geometry, &orchestrator.fs_root).parse(&output);
                self.newly_queued +=
                    orchestrator
                        .state
                        .update_files(records, None, SystemTime::now());
            }
            Err(error) => warn!(%error, "filefrag_batch_failed"),
        }
        let batch_secs = batch_started.elapsed().as_secs_f64();

        if !pace {
            return;
        }
        self.adapt_batch_target();
        let delay = self.inter_batch_delay(batch_len as f64, batch_secs);
        if orchestrator.stop.wait(Duration::from_secs_f64(delay)) {
            self.save_checkpoint();
        }
    }

    /// Grow the batch 10% (up to the configured ceiling) when the pass is
    /// behind its schedule.
    fn adapt_batch_target(&mut self) {
        if self.total_estimate == 0 {
            return;
        }
        let done_fraction = self.processed as f64 / self.total_estimate as f64;
        let time_fraction = self.pass_started.elapsed().as_secs_f64()
            / self.orchestrator.config.slow_scan_period.as_secs_f64();
        if done_fraction < time_fraction {
            let grown = ((self.batch_target as f64) * 1.1).ceil() as usize;
            self.batch_target = grown.min(self.orchestrator.config.max_batch_size());
        }
    }

    fn inter_batch_delay(&self, batch_len: f64, batch_secs: f64) -> f64 {
        let config = &self.orchestrator.config;
        let remaining_files = self.total_estimate.saturating_sub(self.processed).max(1) as f64;
        let remaining_time = (config.slow_scan_period.as_secs_f64()
            - self.pass_started.elapsed().as_secs_f64())
        .max(0.0);
        let budget = remaining_time * batch_len / remaining_files - batch_secs;
        budget.clamp(config.min_filefrag_delay(), MAX_DELAY_BETWEEN_FILEFRAGS)
    }

    /// Persist the checkpoint when the total changed, processed regressed,
    /// or more than 1% of the total advanced since the last save.
    fn maybe_save_checkpoint(&mut self) {
        let total_changed = self.total_estimate != self.last_saved.total;
        let regressed = self.processed < self.last_saved.processed;
        let advanced = self
            .processed
            .saturating_sub(self.last_saved.processed)
            > self.total_estimate / 100;
        if total_changed || regressed || advanced {
            self.save_checkpoint();
        }
    }

    fn save_checkpoint(&mut self) {
        let checkpoint = ScanCheckpoint {
            processed: self.processed,
            total: self.total_estimate,
        };
        if checkpoint == self.last_saved {
            return;
        }
        if let Err(error) = self
            .orchestrator
            .store
            .save_checkpoint(&self.orchestrator.fs_root, checkpoint)
        {
            warn!(%error, "checkpoint_save_failed");
        }
        self.last_saved = checkpoint;
    }
}

/// Time/size eligibility of one regular file: big enough to fragment, and
/// quiet for longer than the commit delay so the extent data is real.
fn file_is_eligible(metadata: &Metadata, now: SystemTime, commit_delay: Duration) -> bool {
    if metadata.size() <= MIN_INTERESTING_FILE_SIZE {
        return false;
    }
    let now_epoch = now
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    let settle = (commit_delay + COMMIT_SLACK).as_secs() as i64;
    let quiet_since = now_epoch - settle;
    metadata.mtime() < quiet_since && metadata.ctime() < quiet_since
}
