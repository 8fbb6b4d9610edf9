//! Client side of the debounce service
//!
//! [`ServiceProxy`] submits debounce requests to the timer service and
//! replays fire notifications through a [`CallbackRegistry`]. When the service
//! is unreachable every submission runs its callback immediately, so the
//! debounce layer never stands between application code and its side effects.
//!
//! [`CallbackRegistry`]: debounce_core::CallbackRegistry

pub mod connection;
pub mod proxy;

// Re-exports
pub use connection::{ConnectionState, Inbound};
pub use proxy::{Dispatch, ServiceProxy};

use debounce_core::ProtocolError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors seen while talking to the service
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Socket file missing or nobody listening on it
    #[error("debounce service not running at {path}: {source}")]
    ServiceUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The service turned this client away or dropped an established connection
    #[error("debounce service conflict: {0}")]
    ServiceConflict(String),

    /// The read half already belongs to a receive loop
    #[error("connection is already being read by another receive loop")]
    ReaderClaimed,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Expected while the service is starting or stopped
    pub fn is_unavailable(&self) -> bool {
        matches!(self, ProxyError::ServiceUnavailable { .. })
    }
}
