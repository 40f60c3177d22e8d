#![forbid(unsafe_code)]
//! Error types for defragd.
//!
//! Defines `DefragError` and a `Result<T>` alias used throughout the
//! workspace. Local anomalies (a vanished file, a garbled filefrag line)
//! are recovered inside one loop iteration; these variants exist so the
//! recovery site can log something precise.

use thiserror::Error;

/// Unified error type for all defragd operations.
#[derive(Debug, Error)]
pub enum DefragError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unrecognized extent listing line: {line:?}")]
    ExtentProtocol { line: String },

    #[error("mount table entry not found for {0}")]
    MountNotFound(String),

    #[error("malformed mount table line: {0:?}")]
    MountParse(String),

    #[error("state file {file}: {detail}")]
    Store { file: String, detail: String },

    #[error("{command} failed: {detail}")]
    Subprocess { command: String, detail: String },
}

/// Result alias using `DefragError`.
pub type Result<T> = std::result::Result<T, DefragError>;
