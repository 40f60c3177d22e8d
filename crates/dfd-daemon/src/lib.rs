#![forbid(unsafe_code)]
//! The defragd daemon: per-filesystem orchestration and the top-level
//! supervisor.
//!
//! [`Supervisor::run`] is the process entry point after configuration:
//! it discovers managed filesystems, starts an [`FsOrchestrator`] per
//! mount, and feeds them the global write-event stream.

mod orchestrator;
mod scan;
mod stop;
mod supervisor;

pub use orchestrator::{FsHandle, FsOrchestrator, ScanPruneSet};
pub use stop::StopFlag;
pub use supervisor::{RouteEntry, RoutingTable, Supervisor, route_event};
