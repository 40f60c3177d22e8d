#![forbid(unsafe_code)]
//! External collaborators behind narrow interfaces.
//!
//! Everything defragd needs from outside its own process lives here: the
//! kernel mount table, argv batching for the extent-listing tool, the
//! `filefrag`/`btrfs` subprocess invocations, and the `fatrace` write-event
//! stream. The decision engine never touches a `Command` directly.

pub mod argv;
pub mod commands;
pub mod fatrace;
pub mod mounts;

pub use argv::batch_paths;
pub use commands::{
    DEFRAG_TOOL, FILEFRAG_TOOL, build_defrag_command, list_subvolumes, parse_subvolume_list,
    run_defrag, run_filefrag,
};
pub use fatrace::{WriteEventLine, has_write_flag, parse_event_line, spawn_fatrace};
pub use mounts::{
    CompressAlgo, MountEntry, MountOptions, find_mount, managed_candidates, options_for,
    parse_mount_options, parse_mount_table, read_mount_table,
};
