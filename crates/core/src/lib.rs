//! Shared building blocks for the debounce service and its clients
//!
//! This crate provides:
//! - Wire protocol (form-feed delimited JSON frames)
//! - Callback descriptors and the per-process callback registry
//! - Configuration shared by the service and the proxy

pub mod callback;
pub mod config;
pub mod protocol;

// Re-exports
pub use callback::{CallbackDescriptor, CallbackError, CallbackRegistry};
pub use config::{ConfigError, DebounceConfig};
pub use protocol::{DebounceEvent, FrameCodec, ProtocolError, PublishEvent, WireMessage, MAX_DELAY};
