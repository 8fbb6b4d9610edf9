//! Single-client Unix socket server
//!
//! One event loop owns the listener, the timer table and the current client's
//! write half. Per-connection reader tasks only parse frames and forward them
//! over a channel, so timer state is never touched outside the loop.

use crate::lock::ServiceLock;
use crate::timers::{Scheduled, TimerTable};
use crate::{Result, ServiceError};
use debounce_core::protocol::PublishEvent;
use debounce_core::{CallbackDescriptor, DebounceConfig, FrameCodec, WireMessage};
use futures::{SinkExt, StreamExt};
use std::path::Path;
use std::time::Duration;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Capacity of the reader → event loop channel
const INBOUND_QUEUE: usize = 256;

/// Counters reported when the service stops
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ServiceStats {
    /// Timers started for a key with nothing pending
    pub scheduled: u64,
    /// Timers restarted by a newer submission
    pub replaced: u64,
    /// Notifications delivered to a client
    pub fired: u64,
    /// Notifications lost because no client was connected or the write failed
    pub dropped: u64,
    /// Resets received
    pub resets: u64,
    /// Connections turned away because a client was already attached
    pub rejected_clients: u64,
}

/// Long-lived debounce timer service
pub struct TimerService {
    config: DebounceConfig,
    listener: UnixListener,
    lock: Option<ServiceLock>,
}

/// Events forwarded from connection readers
enum Inbound {
    Message { client: u64, message: WireMessage },
    Closed { client: u64 },
}

/// The attached client
struct Client {
    id: u64,
    writer: FramedWrite<OwnedWriteHalf, FrameCodec>,
    reader: JoinHandle<()>,
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl TimerService {
    /// Lock the socket path, remove any stale socket file and bind
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(config: DebounceConfig) -> Result<Self> {
        config.validate()?;
        let lock = ServiceLock::acquire(&config.socket_path)?;
        let listener = bind_listener(&config.socket_path)?;

        Ok(Self {
            config,
            listener,
            lock: Some(lock),
        })
    }

    /// Bind without taking the instance lock
    ///
    /// For callers that serialize service instances some other way.
    pub fn bind_unlocked(config: DebounceConfig) -> Result<Self> {
        config.validate()?;
        let listener = bind_listener(&config.socket_path)?;

        Ok(Self {
            config,
            listener,
            lock: None,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// Serve until `shutdown` is cancelled
    ///
    /// The listener is closed and the socket path removed before returning.
    pub async fn run(self, shutdown: CancellationToken) -> Result<ServiceStats> {
        let TimerService {
            config,
            listener,
            lock,
        } = self;
        let write_timeout = config.wait_timeout();

        let (inbound_tx, mut inbound_rx) = mpsc::channel::<Inbound>(INBOUND_QUEUE);
        let mut timers = TimerTable::new();
        let mut client: Option<Client> = None;
        let mut next_client_id = 0u64;
        let mut stats = ServiceStats::default();

        info!("Debounce service listening on {}", config.socket_path.display());

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested");
                    break;
                }

                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        next_client_id += 1;
                        let codec = FrameCodec::new(config.max_frame_bytes);
                        if client.is_some() {
                            stats.rejected_clients += 1;
                            warn!("Rejecting connection {}: a client is already attached", next_client_id);
                            tokio::spawn(reject(stream, codec));
                        } else {
                            info!("Client {} connected", next_client_id);
                            client = Some(attach(next_client_id, stream, codec, inbound_tx.clone()));
                        }
                    }
                    Err(e) => warn!("Failed to accept connection: {}", e),
                },

                Some(inbound) = inbound_rx.recv() => match inbound {
                    Inbound::Message { client: id, message } => {
                        if client.as_ref().map(|c| c.id) != Some(id) {
                            debug!("Ignoring {} from detached client {}", message.kind(), id);
                            continue;
                        }
                        handle_message(message, &mut timers, &mut stats);
                    }
                    Inbound::Closed { client: id } => {
                        if client.as_ref().map(|c| c.id) == Some(id) {
                            info!("Client {} disconnected ({} timers still pending)", id, timers.len());
                            client = None;
                        }
                    }
                },

                Some((key, callback)) = timers.next_expired(), if !timers.is_empty() => {
                    debug!("Debounce period expired for {}", key);
                    if publish(&mut client, &key, callback, write_timeout).await {
                        stats.fired += 1;
                    } else {
                        stats.dropped += 1;
                    }
                }
            }
        }

        drop(client);
        drop(listener);
        match std::fs::remove_file(&config.socket_path) {
            Ok(()) => debug!("Removed socket {}", config.socket_path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove socket {}: {}", config.socket_path.display(), e),
        }
        drop(lock);

        info!(
            "Debounce service stopped: {} scheduled, {} replaced, {} fired, {} dropped, {} resets, {} rejected clients",
            stats.scheduled,
            stats.replaced,
            stats.fired,
            stats.dropped,
            stats.resets,
            stats.rejected_clients
        );
        Ok(stats)
    }
}

fn bind_listener(socket_path: &Path) -> Result<UnixListener> {
    let bind_err = |source: std::io::Error| ServiceError::Bind {
        path: socket_path.to_path_buf(),
        source,
    };

    if let Some(parent) = socket_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(bind_err)?;
    }

    if socket_path.symlink_metadata().is_ok() {
        info!("Removing stale socket file {}", socket_path.display());
        std::fs::remove_file(socket_path).map_err(bind_err)?;
    }

    UnixListener::bind(socket_path).map_err(bind_err)
}

fn handle_message(message: WireMessage, timers: &mut TimerTable, stats: &mut ServiceStats) {
    match message {
        WireMessage::DebounceEvent(event) => {
            let delay = match event.delay() {
                Ok(delay) => delay,
                Err(e) => {
                    warn!("Dropping debounce request: {}", e);
                    return;
                }
            };
            trace!("Debouncing {} for {:?} ({})", event.descriptor, delay, event.callback);
            match timers.debounce(event.descriptor, delay, event.callback) {
                Scheduled::New => stats.scheduled += 1,
                Scheduled::Replaced => stats.replaced += 1,
            }
        }
        WireMessage::Reset => {
            let cancelled = timers.reset();
            stats.resets += 1;
            info!("Reset: cancelled {} pending timers", cancelled);
        }
        other => warn!("Unexpected {} message from client", other.kind()),
    }
}

/// Send a fire notification to the attached client
///
/// Returns false when the notification was dropped. A failed write detaches
/// the client.
async fn publish(
    client: &mut Option<Client>,
    key: &str,
    callback: CallbackDescriptor,
    write_timeout: Duration,
) -> bool {
    let Some(attached) = client.as_mut() else {
        debug!("No client connected; dropping notification for {}", key);
        return false;
    };

    let message = WireMessage::PublishEvent(PublishEvent { callback });
    let outcome = tokio::time::timeout(write_timeout, attached.writer.send(message)).await;
    let id = attached.id;

    match outcome {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!("Failed to notify client {} for {}: {}", id, key, e);
            *client = None;
            false
        }
        Err(_) => {
            warn!("Timed out notifying client {} for {}", id, key);
            *client = None;
            false
        }
    }
}

fn attach(id: u64, stream: UnixStream, codec: FrameCodec, inbound: mpsc::Sender<Inbound>) -> Client {
    let (read_half, write_half) = stream.into_split();
    let reader = tokio::spawn(read_client(id, read_half, codec.clone(), inbound));
    Client {
        id,
        writer: FramedWrite::new(write_half, codec),
        reader,
    }
}

async fn read_client(id: u64, read_half: OwnedReadHalf, codec: FrameCodec, inbound: mpsc::Sender<Inbound>) {
    let mut frames = FramedRead::new(read_half, codec);

    while let Some(frame) = frames.next().await {
        match frame {
            Ok(bytes) => match WireMessage::decode(&bytes) {
                Ok(message) => {
                    trace!("Client {} sent {}", id, message.kind());
                    if inbound.send(Inbound::Message { client: id, message }).await.is_err() {
                        return;
                    }
                }
                Err(e) => warn!("Dropping message from client {}: {}", id, e),
            },
            Err(e) => {
                warn!("Connection error from client {}: {}", id, e);
                break;
            }
        }
    }

    let _ = inbound.send(Inbound::Closed { client: id }).await;
}

/// Tell a surplus connection to go away, then close it
async fn reject(stream: UnixStream, codec: FrameCodec) {
    let mut framed = Framed::new(stream, codec);
    if let Err(e) = framed.send(WireMessage::RejectClient).await {
        debug!("Failed to send rejection: {}", e);
    }
    let _ = framed.close().await;
}
