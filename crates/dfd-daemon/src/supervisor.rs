//! Top-level supervisor: discovers managed filesystems, owns their
//! orchestrators, and routes the global write-event stream.
//!
//! A btrfs mount qualifies for management when it is not mounted with
//! `autodefrag` and is a *top volume*: every one of its subvolumes is
//! itself a mountpoint, the proxy check that keeps nested subvolumes from
//! being managed twice. Qualifying mounts get an orchestrator; vanished
//! mounts get theirs stopped; survivors re-detect their mount options.

use crate::orchestrator::{FsHandle, FsOrchestrator, ScanPruneSet};
use dfd_error::Result;
use dfd_state::FilesState;
use dfd_store::StateStore;
use dfd_sys::{
    MountEntry, has_write_flag, list_subvolumes, managed_candidates, parse_event_line,
    read_mount_table, spawn_fatrace,
};
use dfd_types::{Config, FATRACE_TTL, FS_DETECT_PERIOD, ShortPath};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};

/// Backoff after the tracer fails or exits early.
const FATRACE_RETRY_DELAY: Duration = Duration::from_secs(60);

/// One prefix under which writes reach a managed filesystem. `rebase` is
/// the subvolume path inside the filesystem for remapped subvolume
/// mounts, empty for the top-volume mount itself.
pub struct RouteEntry {
    pub prefix: PathBuf,
    pub rebase: PathBuf,
    pub state: Arc<FilesState>,
}

pub type RoutingTable = Vec<RouteEntry>;

pub struct Supervisor {
    config: Config,
    store: StateStore,
    managed: HashMap<PathBuf, FsHandle>,
    subvolumes: HashMap<PathBuf, Vec<PathBuf>>,
    routes: Arc<RwLock<RoutingTable>>,
}

impl Supervisor {
    /// Run forever: one mount-detection cycle every `FS_DETECT_PERIOD`,
    /// with the write-event ingest on its own thread.
    pub fn run(config: Config) -> Result<()> {
        let store = StateStore::open(&config.store_dir)?;
        let mut supervisor = Self {
            config,
            store,
            managed: HashMap::new(),
            subvolumes: HashMap::new(),
            routes: Arc::new(RwLock::new(Vec::new())),
        };

        let routes = Arc::clone(&supervisor.routes);
        let _ingest = std::thread::Builder::new()
            .name("fatrace-ingest".to_owned())
            .spawn(move || fatrace_ingest_loop(&routes))?;

        loop {
            if let Err(error) = supervisor.detect_cycle() {
                warn!(%error, "mount_detection_failed");
            }
            std::thread::sleep(FS_DETECT_PERIOD);
        }
    }

    fn detect_cycle(&mut self) -> Result<()> {
        let entries = read_mount_table()?;
        let mountpoints: HashSet<PathBuf> = entries
            .iter()
            .map(|entry| entry.mountpoint.clone())
            .collect();

        let candidates: HashSet<PathBuf> = managed_candidates(&entries)
            .into_iter()
            .map(|entry| entry.mountpoint.clone())
            .collect();

        let mut qualified: HashSet<PathBuf> = HashSet::new();
        for root in &candidates {
            match list_subvolumes(root) {
                Ok(subvolumes) => {
                    if is_top_volume(&mountpoints, root, &subvolumes) {
                        self.subvolumes.insert(root.clone(), subvolumes);
                        qualified.insert(root.clone());
                    } else {
                        debug!(fs_root = %root.display(), "not_a_top_volume");
                    }
                }
                Err(error) => debug!(fs_root = %root.display(), %error, "subvolume_list_failed"),
            }
        }

        // A transient subvolume-listing failure must not unmanage a
        // filesystem; only disappearance from the mount table does.
        let gone: Vec<PathBuf> = self
            .managed
            .keys()
            .filter(|root| !candidates.contains(*root))
            .cloned()
            .collect();
        for root in gone {
            if let Some(handle) = self.managed.remove(&root) {
                info!(fs_root = %root.display(), "filesystem_unmanaged");
                handle.stop();
            }
            self.subvolumes.remove(&root);
        }

        for root in &qualified {
            if !self.managed.contains_key(root) {
                info!(fs_root = %root.display(), "filesystem_managed");
                let handle = FsOrchestrator::start(
                    root.clone(),
                    self.config.clone(),
                    self.store.clone(),
                    &entries,
                );
                self.managed.insert(root.clone(), handle);
            }
        }

        for (root, handle) in &self.managed {
            handle.orchestrator.redetect_options(&entries);
            let rw_subvolumes = self
                .subvolumes
                .get(root)
                .map(|subvolumes| rw_subvolume_mounts(&entries, root, subvolumes))
                .unwrap_or_default();
            handle.orchestrator.set_prune_set(ScanPruneSet {
                mountpoints: mountpoints.clone(),
                rw_subvolumes,
            });
        }

        *self.routes.write() = self.build_routes(&entries);
        Ok(())
    }

    /// Routes for each managed root plus every remapped subvolume mount:
    /// a subvolume of a managed filesystem mounted elsewhere (same device,
    /// `subvol=` option) attributes its writes back to the managed mount.
    fn build_routes(&self, entries: &[MountEntry]) -> RoutingTable {
        let mut routes = Vec::new();
        for (root, handle) in &self.managed {
            routes.push(RouteEntry {
                prefix: root.clone(),
                rebase: PathBuf::new(),
                state: Arc::clone(handle.orchestrator.state()),
            });
            let Some(device) = dfd_sys::find_mount(entries, root).map(|entry| &entry.device)
            else {
                continue;
            };
            let known = self.subvolumes.get(root);
            for entry in entries {
                if entry.device != *device || entry.mountpoint == *root {
                    continue;
                }
                let Some(rebase) = subvol_option(entry) else {
                    continue;
                };
                if known.is_some_and(|subvolumes| subvolumes.contains(&rebase)) {
                    routes.push(RouteEntry {
                        prefix: entry.mountpoint.clone(),
                        rebase,
                        state: Arc::clone(handle.orchestrator.state()),
                    });
                }
            }
        }
        routes
    }
}

/// Every subvolume must itself be a mountpoint.
fn is_top_volume(mountpoints: &HashSet<PathBuf>, root: &Path, subvolumes: &[PathBuf]) -> bool {
    subvolumes
        .iter()
        .all(|relative| mountpoints.contains(&root.join(relative)))
}

/// Absolute paths of this filesystem's subvolume mounts that are mounted
/// read-write (read-only subvolumes are pruned from the scan).
fn rw_subvolume_mounts(
    entries: &[MountEntry],
    root: &Path,
    subvolumes: &[PathBuf],
) -> HashSet<PathBuf> {
    subvolumes
        .iter()
        .map(|relative| root.join(relative))
        .filter(|mountpoint| {
            dfd_sys::find_mount(entries, mountpoint)
                .is_some_and(|entry| !entry.has_option("ro"))
        })
        .collect()
}

/// The `subvol=` mount option, normalized to a relative path; `None` for
/// the top volume itself.
fn subvol_option(entry: &MountEntry) -> Option<PathBuf> {
    let value = entry
        .options
        .iter()
        .find_map(|option| option.strip_prefix("subvol="))?;
    let trimmed = value.trim_start_matches('/');
    if trimmed.is_empty() {
        None
    } else {
        Some(PathBuf::from(trimmed))
    }
}

/// Deliver one absolute written path to the filesystem managing it, if
/// any, via the longest matching route prefix.
pub fn route_event(routes: &RoutingTable, path: &Path, now: SystemTime) {
    let best = routes
        .iter()
        .filter(|route| path.starts_with(&route.prefix))
        .max_by_key(|route| route.prefix.as_os_str().len());
    let Some(route) = best else {
        return;
    };
    let Ok(rest) = path.strip_prefix(&route.prefix) else {
        return;
    };
    let short = if route.rebase.as_os_str().is_empty() {
        rest.to_path_buf()
    } else {
        route.rebase.join(rest)
    };
    route
        .state
        .file_written_to(ShortPath(short.to_string_lossy().into_owned()), now);
}

/// Babysit the tracer: restart it on the TTL, back off a minute when it
/// fails or dies early — the one external interface expected to be flaky.
fn fatrace_ingest_loop(routes: &RwLock<RoutingTable>) {
    loop {
        let mut child = match spawn_fatrace() {
            Ok(child) => child,
            Err(error) => {
                warn!(%error, "fatrace_spawn_failed");
                std::thread::sleep(FATRACE_RETRY_DELAY);
                continue;
            }
        };
        let deadline = Instant::now() + FATRACE_TTL;
        let mut hit_deadline = false;
        if let Some(stdout) = child.stdout.take() {
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else {
                    break;
                };
                if let Some(event) = parse_event_line(&line)
                    && has_write_flag(&event.flags)
                {
                    route_event(&routes.read(), &event.path, SystemTime::now());
                }
                if Instant::now() >= deadline {
                    hit_deadline = true;
                    break;
                }
            }
        }
        let _ = child.kill();
        let status = child.wait();
        if hit_deadline {
            // Planned restart; the exit status reflects our own kill.
            debug!("fatrace_ttl_restart");
            continue;
        }
        // The tracer is not supposed to exit before the TTL: any other
        // death is a failure worth backing off for.
        match status {
            Ok(status) if status.success() => warn!("fatrace_exited_early"),
            Ok(status) => warn!(%status, "fatrace_failed"),
            Err(error) => warn!(%error, "fatrace_wait_failed"),
        }
        std::thread::sleep(FATRACE_RETRY_DELAY);
    }
}
