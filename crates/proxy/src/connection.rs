//! Connection slot shared by submissions and the receive loop
//!
//! The slot is guarded by an async mutex held only while fetching or opening
//! the socket. Writes go through the link's own writer lock and the read half
//! is handed to the receive loop, so a slow read never blocks a submission.

use crate::ProxyError;
use debounce_core::{FrameCodec, WireMessage};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace, warn};

/// Frame stream owned by the receive loop
pub type FrameReader = FramedRead<OwnedReadHalf, FrameCodec>;

/// How long a new connection waits for the service to turn it away
pub const REJECT_WINDOW: Duration = Duration::from_millis(100);

/// Read half handed to the receive loop
pub struct Inbound {
    pub reader: FrameReader,
    /// Frames that arrived while the connection was being checked
    pub backlog: Vec<Bytes>,
}

/// Observable connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket open
    Disconnected,
    /// Socket open, nobody reading yet
    Connected,
    /// Socket open and owned by a receive loop
    Listening,
}

/// Write side of one open socket
#[derive(Debug)]
pub struct Link {
    id: u64,
    writer: Mutex<FramedWrite<OwnedWriteHalf, FrameCodec>>,
}

impl Link {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Write one message, bounded by `within`
    pub async fn send(&self, message: WireMessage, within: Duration) -> Result<(), ProxyError> {
        let mut writer = self.writer.lock().await;
        match tokio::time::timeout(within, writer.send(message)).await {
            Ok(result) => result.map_err(ProxyError::from),
            Err(_) => Err(ProxyError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "timed out writing to debounce service",
            ))),
        }
    }
}

enum Slot {
    Disconnected,
    Connected { link: Arc<Link>, inbound: Inbound },
    Listening { link: Arc<Link> },
}

impl Slot {
    fn link(&self) -> Option<&Arc<Link>> {
        match self {
            Slot::Connected { link, .. } | Slot::Listening { link } => Some(link),
            Slot::Disconnected => None,
        }
    }
}

struct Inner {
    slot: Slot,
    /// Set after the service rejected us; no reconnects before this instant
    rejected_until: Option<Instant>,
}

impl Inner {
    fn check_cooldown(&mut self) -> Result<(), ProxyError> {
        match self.rejected_until {
            Some(until) if Instant::now() < until => Err(ProxyError::ServiceConflict(
                "another client holds the debounce service".to_string(),
            )),
            Some(_) => {
                self.rejected_until = None;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

/// Opens, hands out and tears down the proxy's single socket
pub struct Connector {
    socket_path: PathBuf,
    max_frame_bytes: usize,
    wait: Duration,
    next_id: AtomicU64,
    inner: Mutex<Inner>,
}

impl Connector {
    pub fn new(socket_path: PathBuf, max_frame_bytes: usize, wait: Duration) -> Self {
        Self {
            socket_path,
            max_frame_bytes,
            wait,
            next_id: AtomicU64::new(0),
            inner: Mutex::new(Inner {
                slot: Slot::Disconnected,
                rejected_until: None,
            }),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Current link, connecting first if needed
    pub async fn link(&self) -> Result<Arc<Link>, ProxyError> {
        let mut inner = self.inner.lock().await;
        inner.check_cooldown()?;

        if let Some(link) = inner.slot.link() {
            return Ok(link.clone());
        }

        let (link, inbound) = self.connect(&mut inner).await?;
        inner.slot = Slot::Connected {
            link: link.clone(),
            inbound,
        };
        Ok(link)
    }

    /// Take the read half for a receive loop, connecting first if needed
    pub async fn claim_reader(&self) -> Result<(Arc<Link>, Inbound), ProxyError> {
        let mut inner = self.inner.lock().await;
        inner.check_cooldown()?;

        match std::mem::replace(&mut inner.slot, Slot::Disconnected) {
            Slot::Connected { link, inbound } => {
                inner.slot = Slot::Listening { link: link.clone() };
                Ok((link, inbound))
            }
            Slot::Listening { link } => {
                inner.slot = Slot::Listening { link };
                Err(ProxyError::ReaderClaimed)
            }
            Slot::Disconnected => {
                let (link, inbound) = self.connect(&mut inner).await?;
                inner.slot = Slot::Listening { link: link.clone() };
                Ok((link, inbound))
            }
        }
    }

    /// Discard the connection if `link_id` is still the current one
    ///
    /// Returns false when the link was already replaced or closed.
    pub async fn teardown(&self, link_id: u64) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.slot.link().map(|l| l.id) != Some(link_id) {
            return false;
        }
        debug!("Discarding connection {} to {}", link_id, self.socket_path.display());
        inner.slot = Slot::Disconnected;
        true
    }

    /// Tear down `link_id` and refuse to reconnect for `cooldown`
    pub async fn reject(&self, link_id: u64, cooldown: Duration) {
        let mut inner = self.inner.lock().await;
        if inner.slot.link().map(|l| l.id) == Some(link_id) {
            inner.slot = Slot::Disconnected;
        }
        inner.rejected_until = Some(Instant::now() + cooldown);
    }

    /// Discard whatever connection is open
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(link) = inner.slot.link() {
            debug!("Closing connection {} to {}", link.id, self.socket_path.display());
        }
        inner.slot = Slot::Disconnected;
    }

    pub async fn is_current(&self, link_id: u64) -> bool {
        self.inner.lock().await.slot.link().map(|l| l.id) == Some(link_id)
    }

    /// Whether a rejection cooldown is in effect
    pub async fn in_cooldown(&self) -> bool {
        let inner = self.inner.lock().await;
        matches!(inner.rejected_until, Some(until) if Instant::now() < until)
    }

    pub async fn state(&self) -> ConnectionState {
        match self.inner.lock().await.slot {
            Slot::Disconnected => ConnectionState::Disconnected,
            Slot::Connected { .. } => ConnectionState::Connected,
            Slot::Listening { .. } => ConnectionState::Listening,
        }
    }

    /// Open a socket and wait out [`REJECT_WINDOW`] before handing it out
    ///
    /// A service already serving another client answers with `rejectClient`
    /// and closes without reading; that engages the cooldown and fails with
    /// [`ProxyError::ServiceConflict`] so nothing is written into the void.
    async fn connect(&self, inner: &mut Inner) -> Result<(Arc<Link>, Inbound), ProxyError> {
        trace!("Connecting to debounce service at {}", self.socket_path.display());

        let stream = match tokio::time::timeout(self.wait, UnixStream::connect(&self.socket_path)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) if matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused) => {
                debug!("Debounce service is not running at {}", self.socket_path.display());
                return Err(ProxyError::ServiceUnavailable {
                    path: self.socket_path.clone(),
                    source: e,
                });
            }
            Ok(Err(e)) => {
                warn!("Failed to connect to {}: {}", self.socket_path.display(), e);
                return Err(ProxyError::Io(e));
            }
            Err(_) => {
                return Err(ProxyError::ServiceUnavailable {
                    path: self.socket_path.clone(),
                    source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                });
            }
        };

        let codec = FrameCodec::new(self.max_frame_bytes);
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, codec.clone());
        let mut backlog = Vec::new();

        let window = REJECT_WINDOW.min(self.wait);
        let deadline = Instant::now() + window;
        loop {
            match tokio::time::timeout_at(deadline, reader.next()).await {
                // Quiet for the whole window: the service adopted us
                Err(_) => break,
                Ok(Some(Ok(frame))) => match WireMessage::decode(&frame) {
                    Ok(WireMessage::RejectClient) => {
                        warn!(
                            "Debounce service at {} is serving another client, running callbacks locally",
                            self.socket_path.display()
                        );
                        inner.rejected_until = Some(Instant::now() + self.wait);
                        return Err(ProxyError::ServiceConflict(
                            "another client holds the debounce service".to_string(),
                        ));
                    }
                    // Only an adopted client is ever sent anything else
                    _ => {
                        backlog.push(frame);
                        break;
                    }
                },
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(None) => {
                    return Err(ProxyError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "debounce service closed the connection",
                    )))
                }
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Connected to debounce service (connection {})", id);

        let link = Arc::new(Link {
            id,
            writer: Mutex::new(FramedWrite::new(write_half, codec)),
        });
        Ok((link, Inbound { reader, backlog }))
    }
}
