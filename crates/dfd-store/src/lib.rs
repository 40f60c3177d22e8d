#![forbid(unsafe_code)]
//! Persistent daemon state under `STORE_DIR`.
//!
//! Three JSON documents, each a map keyed by filesystem root:
//!
//! - `filecounts` — slow-scan checkpoints (`processed` / `total`);
//! - `costs` — per-class cost-achievement histories;
//! - `recent` — the recently-defragmented tracker.
//!
//! Every update is a read-modify-write of the whole document under an
//! exclusive advisory lock, finished with a truncate so a shorter rewrite
//! never leaves a stale tail. Multiple daemons pointed at the same store
//! directory serialize on the lock instead of corrupting each other.
//! A document that fails to parse is logged and treated as empty; the
//! next write replaces it.

use dfd_error::{DefragError, Result};
use dfd_state::FuzzyTrackerSnapshot;
use dfd_types::{CostAchievement, ScanCheckpoint};
use nix::fcntl::{Flock, FlockArg};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const FILECOUNTS_FILE: &str = "filecounts";
const COSTS_FILE: &str = "costs";
const RECENT_FILE: &str = "recent";

/// Per-class history lists as persisted in `costs`.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct CostsSnapshot {
    pub compressed: Vec<CostAchievement>,
    pub uncompressed: Vec<CostAchievement>,
}

/// Handle on the store directory.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    /// Open (creating if needed) the store directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    // ── Slow-scan checkpoints ───────────────────────────────────────────

    pub fn load_checkpoint(&self, fs_root: &Path) -> Option<ScanCheckpoint> {
        self.read_entry(FILECOUNTS_FILE, &key_for(fs_root))
    }

    pub fn save_checkpoint(&self, fs_root: &Path, checkpoint: ScanCheckpoint) -> Result<()> {
        self.update_entry(FILECOUNTS_FILE, &key_for(fs_root), &checkpoint)
    }

    // ── Cost-achievement histories ──────────────────────────────────────

    pub fn load_costs(&self, fs_root: &Path) -> Option<CostsSnapshot> {
        self.read_entry(COSTS_FILE, &key_for(fs_root))
    }

    pub fn save_costs(&self, fs_root: &Path, snapshot: &CostsSnapshot) -> Result<()> {
        self.update_entry(COSTS_FILE, &key_for(fs_root), snapshot)
    }

    // ── Recently-defragmented tracker ───────────────────────────────────

    pub fn load_recent(&self, fs_root: &Path) -> Option<FuzzyTrackerSnapshot> {
        self.read_entry(RECENT_FILE, &key_for(fs_root))
    }

    pub fn save_recent(&self, fs_root: &Path, snapshot: &FuzzyTrackerSnapshot) -> Result<()> {
        self.update_entry(RECENT_FILE, &key_for(fs_root), snapshot)
    }

    // ── Locked read-modify-write plumbing ───────────────────────────────

    fn read_entry<T: DeserializeOwned>(&self, file: &str, key: &str) -> Option<T> {
        let path = self.dir.join(file);
        let handle = OpenOptions::new().read(true).open(&path).ok()?;
        let mut locked = match Flock::lock(handle, FlockArg::LockShared) {
            Ok(locked) => locked,
            Err((_, errno)) => {
                warn!(file, %errno, "state_file_lock_failed");
                return None;
            }
        };
        let mut text = String::new();
        if let Err(error) = locked.read_to_string(&mut text) {
            warn!(file, %error, "state_file_read_failed");
            return None;
        }
        let map = parse_document(file, &text);
        let value = map.get(key)?.clone();
        match serde_json::from_value(value) {
            Ok(parsed) => Some(parsed),
            Err(error) => {
                warn!(file, key, %error, "state_entry_schema_mismatch");
                None
            }
        }
    }

    fn update_entry<T: Serialize>(&self, file: &str, key: &str, value: &T) -> Result<()> {
        let path = self.dir.join(file);
        let handle = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let mut locked = Flock::lock(handle, FlockArg::LockExclusive).map_err(|(_, errno)| {
            DefragError::Store {
                file: file.to_owned(),
                detail: format!("lock failed: {errno}"),
            }
        })?;

        let mut text = String::new();
        locked.read_to_string(&mut text)?;
        let mut map = parse_document(file, &text);
        let encoded = serde_json::to_value(value).map_err(|error| DefragError::Store {
            file: file.to_owned(),
            detail: format!("encode: {error}"),
        })?;
        map.insert(key.to_owned(), encoded);

        let body = serde_json::to_string(&Value::Object(map)).map_err(|error| {
            DefragError::Store {
                file: file.to_owned(),
                detail: format!("encode: {error}"),
            }
        })?;
        locked.seek(SeekFrom::Start(0))?;
        locked.write_all(body.as_bytes())?;
        // A shorter document must not leave the old tail behind.
        locked.set_len(body.len() as u64)?;
        locked.flush()?;
        debug!(file, key, bytes = body.len(), "state_file_updated");
        Ok(())
    }
}

fn parse_document(file: &str, text: &str) -> Map<String, Value> {
    if text.trim().is_empty() {
        return Map::new();
    }
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => map,
        Ok(other) => {
            warn!(file, kind = other_kind(&other), "state_file_not_a_map");
            Map::new()
        }
        Err(error) => {
            warn!(file, %error, "state_file_corrupt");
            Map::new()
        }
    }
}

fn other_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn key_for(fs_root: &Path) -> String {
    fs_root.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dfd_state::FuzzyEventTracker;
    use dfd_types::ShortPath;
    use std::time::SystemTime;

    fn store() -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = StateStore::open(dir.path().join("state")).expect("open store");
        (dir, store)
    }

    #[test]
    fn checkpoint_round_trips_per_filesystem() {
        let (_guard, store) = store();
        let a = Path::new("/mnt/a");
        let b = Path::new("/mnt/b");
        store
            .save_checkpoint(a, ScanCheckpoint { processed: 40_000, total: 100_000 })
            .expect("save a");
        store
            .save_checkpoint(b, ScanCheckpoint { processed: 7, total: 9 })
            .expect("save b");

        assert_eq!(
            store.load_checkpoint(a),
            Some(ScanCheckpoint { processed: 40_000, total: 100_000 })
        );
        assert_eq!(store.load_checkpoint(b), Some(ScanCheckpoint { processed: 7, total: 9 }));
        assert_eq!(store.load_checkpoint(Path::new("/mnt/c")), None);
    }

    #[test]
    fn rewrite_truncates_stale_tail() {
        let (_guard, store) = store();
        let root = Path::new("/mnt/a");
        let long = CostsSnapshot {
            compressed: (0..50)
                .map(|i| CostAchievement {
                    initial_cost: 2.0,
                    final_cost: 1.1,
                    size: 1000 + i,
                })
                .collect(),
            uncompressed: Vec::new(),
        };
        store.save_costs(root, &long).expect("save long");
        let short = CostsSnapshot::default();
        store.save_costs(root, &short).expect("save short");

        // The document must still parse as a whole after shrinking.
        let text = std::fs::read_to_string(store.dir.join(COSTS_FILE)).expect("read");
        let value: Value = serde_json::from_str(&text).expect("intact document");
        assert!(value.is_object());
        let loaded = store.load_costs(root).expect("load");
        assert!(loaded.compressed.is_empty());
    }

    #[test]
    fn corrupt_document_falls_back_to_defaults() {
        let (_guard, store) = store();
        std::fs::write(store.dir.join(FILECOUNTS_FILE), b"{not json").expect("write garbage");
        assert_eq!(store.load_checkpoint(Path::new("/mnt/a")), None);
        // The next write replaces the corrupt document entirely.
        store
            .save_checkpoint(Path::new("/mnt/a"), ScanCheckpoint { processed: 1, total: 2 })
            .expect("save over garbage");
        assert_eq!(
            store.load_checkpoint(Path::new("/mnt/a")),
            Some(ScanCheckpoint { processed: 1, total: 2 })
        );
    }

    #[test]
    fn recent_tracker_survives_the_store() {
        let (_guard, store) = store();
        let root = Path::new("/mnt/a");
        let now = SystemTime::now();
        let mut tracker = FuzzyEventTracker::new(now);
        tracker.event(&ShortPath::from("x/y"), now);
        store.save_recent(root, &tracker.snapshot()).expect("save");

        let restored =
            FuzzyEventTracker::from_snapshot(store.load_recent(root).expect("load"), now);
        assert!(restored.recent(&ShortPath::from("x/y")));
        assert_eq!(restored.len(), 1);
    }

    #[test]
    fn schema_mismatch_on_one_entry_is_isolated() {
        let (_guard, store) = store();
        std::fs::write(
            store.dir.join(FILECOUNTS_FILE),
            br#"{"/mnt/a": "not a checkpoint", "/mnt/b": {"processed": 1, "total": 2}}"#,
        )
        .expect("write");
        assert_eq!(store.load_checkpoint(Path::new("/mnt/a")), None);
        assert_eq!(
            store.load_checkpoint(Path::new("/mnt/b")),
            Some(ScanCheckpoint { processed: 1, total: 2 })
        );
    }
}
