//! Timer service for cross-process debouncing
//!
//! This crate provides:
//! - Per-key debounce timers with cancel-and-replace semantics
//! - The single-client Unix socket server that fires notifications
//! - An instance lock so two services never fight over one socket path

pub mod lock;
pub mod server;
pub mod timers;

// Re-exports
pub use lock::{LockInfo, ServiceLock};
pub use server::{ServiceStats, TimerService};
pub use timers::{Scheduled, TimerTable};

use std::path::PathBuf;
use thiserror::Error;

/// Errors that stop the service from starting or running
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] debounce_core::ConfigError),

    /// Another service holds the lock for this socket path
    #[error("debounce service already running for {path} (pid {pid:?})")]
    AlreadyRunning { path: PathBuf, pid: Option<u32> },

    #[error("failed to lock {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Listening endpoint could not be created
    #[error("cannot bind debounce socket {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result type for service operations
pub type Result<T> = std::result::Result<T, ServiceError>;
