//! One-shot connections used by `reset` and `status --check-client`

use anyhow::{Context, Result};
use debounce_core::{DebounceConfig, FrameCodec, WireMessage};
use futures::StreamExt;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio_util::codec::Framed;

pub type Connection = Framed<UnixStream, FrameCodec>;

/// How long to wait for a rejection after connecting
pub const REJECT_WINDOW: Duration = Duration::from_millis(250);

/// Connect to the service, or `None` if nothing is listening
pub async fn connect(config: &DebounceConfig) -> Result<Option<Connection>> {
    let connecting = UnixStream::connect(&config.socket_path);
    match tokio::time::timeout(config.wait_timeout(), connecting).await {
        Ok(Ok(stream)) => Ok(Some(Framed::new(stream, FrameCodec::new(config.max_frame_bytes)))),
        Ok(Err(e)) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::ConnectionRefused) => Ok(None),
        Ok(Err(e)) => {
            Err(e).with_context(|| format!("Failed to connect to {}", config.socket_path.display()))
        }
        Err(_) => Ok(None),
    }
}

/// Whether the service turns this connection away within `window`
///
/// A service with no attached client adopts the connection and stays quiet.
pub async fn is_rejected(conn: &mut Connection, window: Duration) -> bool {
    loop {
        match tokio::time::timeout(window, conn.next()).await {
            Ok(Some(Ok(frame))) => match WireMessage::decode(&frame) {
                Ok(WireMessage::RejectClient) => return true,
                Ok(other) => tracing::debug!("Ignoring {} before adoption", other.kind()),
                Err(e) => tracing::debug!("Ignoring malformed frame before adoption: {}", e),
            },
            // Closed without a rejection frame, or quiet for the whole window
            Ok(Some(Err(_))) | Ok(None) | Err(_) => return false,
        }
    }
}
