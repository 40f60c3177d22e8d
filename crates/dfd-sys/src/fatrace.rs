//! The write-event stream.
//!
//! `fatrace` emits one line per filesystem event:
//!
//! ```text
//! postgres(2172): CW /mnt/ceph-0/db/segment-000042.log
//! ```
//!
//! Lines from the defrag tool itself are filtered so our own rewrites do
//! not loop back into the write tracker. The stream source is flaky by
//! design (it is restarted on a TTL and babysat on failure); parsing is
//! per-line and drops what it cannot read.

use crate::commands::DEFRAG_TOOL;
use dfd_error::{DefragError, Result};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use tracing::trace;

/// One parsed event line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteEventLine {
    pub process: String,
    pub pid: u32,
    pub flags: String,
    pub path: PathBuf,
}

/// Spawn the tracer with stdout piped. The caller owns the child's
/// lifetime (TTL restarts, failure backoff).
pub fn spawn_fatrace() -> Result<Child> {
    Command::new("fatrace")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|error| DefragError::Subprocess {
            command: "fatrace".to_owned(),
            detail: error.to_string(),
        })
}

/// Parse `<process>(<pid>): <flags> <path>`; `None` for anything else,
/// including events caused by the defrag tool itself.
#[must_use]
pub fn parse_event_line(line: &str) -> Option<WriteEventLine> {
    let (head, tail) = line.split_once("): ")?;
    let (process, pid) = head.rsplit_once('(')?;
    let pid = pid.parse::<u32>().ok()?;
    if process == DEFRAG_TOOL {
        trace!(line, "own_defrag_event_ignored");
        return None;
    }
    let tail = tail.trim_start();
    let (flags, path) = tail.split_once(char::is_whitespace)?;
    let path = path.trim_start();
    if flags.is_empty() || path.is_empty() || !path.starts_with('/') {
        return None;
    }
    Some(WriteEventLine {
        process: process.to_owned(),
        pid,
        flags: flags.to_owned(),
        path: PathBuf::from(path),
    })
}

/// Did this event dirty the file? `W` is a write, `C` a close after
/// writing.
#[must_use]
pub fn has_write_flag(flags: &str) -> bool {
    flags.contains('W') || flags.contains('C')
}
