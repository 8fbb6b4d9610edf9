//! Debounce requests out, fire notifications in

use crate::connection::{ConnectionState, Connector};
use crate::ProxyError;
use debounce_core::{
    CallbackDescriptor, CallbackError, CallbackRegistry, DebounceConfig, DebounceEvent, WireMessage, MAX_DELAY,
};
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// How a submission was handled
#[derive(Debug)]
pub enum Dispatch {
    /// Handed to the service; the callback runs when its timer fires
    Deferred,
    /// Service unreachable, so the callback ran in the caller's task
    Immediate(Result<(), CallbackError>),
}

impl Dispatch {
    pub fn is_deferred(&self) -> bool {
        matches!(self, Dispatch::Deferred)
    }
}

/// Client handle for one debounce service
///
/// Shared behind an `Arc` between application code calling [`submit`] and the
/// task spawned by [`start_receiving`].
///
/// [`submit`]: ServiceProxy::submit
/// [`start_receiving`]: ServiceProxy::start_receiving
pub struct ServiceProxy {
    config: DebounceConfig,
    registry: Arc<CallbackRegistry>,
    connector: Connector,
    listener: Mutex<Option<CancellationToken>>,
}

impl ServiceProxy {
    pub fn new(config: DebounceConfig, registry: Arc<CallbackRegistry>) -> Self {
        let connector = Connector::new(
            config.socket_path.clone(),
            config.max_frame_bytes,
            config.wait_timeout(),
        );
        Self {
            config,
            registry,
            connector,
            listener: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &DebounceConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<CallbackRegistry> {
        &self.registry
    }

    /// Ask the service to run `callback` once `key` has been quiet for `delay`
    ///
    /// Falls back to running the callback right away when the service cannot
    /// be reached, the write fails, or `delay` is longer than [`MAX_DELAY`].
    pub async fn submit(&self, key: impl Into<String>, delay: Duration, callback: CallbackDescriptor) -> Dispatch {
        let key = key.into();

        if delay > MAX_DELAY {
            warn!(
                "Delay {:?} for '{}' exceeds the {:?} maximum, running {} locally",
                delay,
                key,
                MAX_DELAY,
                callback.target()
            );
            return self.run_locally(&callback);
        }

        let link = match self.connector.link().await {
            Ok(link) => link,
            Err(e) => {
                log_unreachable(&e);
                return self.run_locally(&callback);
            }
        };

        let event = WireMessage::DebounceEvent(DebounceEvent::new(key.clone(), delay, callback.clone()));
        match link.send(event, self.config.wait_timeout()).await {
            Ok(()) => {
                trace!("Debouncing '{}' for {:?} ({})", key, delay, callback.target());
                Dispatch::Deferred
            }
            Err(e) => {
                warn!("Failed to send debounce request for '{}': {}", key, e);
                self.connector.teardown(link.id()).await;
                self.run_locally(&callback)
            }
        }
    }

    /// Cancel every pending timer on the service
    ///
    /// Returns whether the request was sent.
    pub async fn reset_remote(&self) -> bool {
        let link = match self.connector.link().await {
            Ok(link) => link,
            Err(e) => {
                debug!("Skipping reset: {}", e);
                return false;
            }
        };

        match link.send(WireMessage::Reset, self.config.wait_timeout()).await {
            Ok(()) => {
                debug!("Sent reset to debounce service");
                true
            }
            Err(e) => {
                warn!("Failed to send reset: {}", e);
                self.connector.teardown(link.id()).await;
                false
            }
        }
    }

    /// Spawn the receive loop
    ///
    /// The token is kept so [`stop_receiving`](Self::stop_receiving) can
    /// cancel it later.
    pub fn start_receiving(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        if let Some(previous) = self.listener.lock().replace(token.clone()) {
            previous.cancel();
        }
        let proxy = Arc::clone(self);
        tokio::spawn(async move { proxy.receive(token).await })
    }

    /// Cancel the loop started by [`start_receiving`](Self::start_receiving)
    pub fn stop_receiving(&self) {
        if let Some(token) = self.listener.lock().take() {
            token.cancel();
        }
    }

    /// Read fire notifications until `token` is cancelled
    ///
    /// Reconnects after the wait interval whenever the service is missing or
    /// the connection drops. The connection is closed on exit.
    pub async fn receive(&self, token: CancellationToken) {
        let wait = self.config.wait_timeout();
        let mut current = None;

        info!("Listening for debounce notifications on {}", self.connector.socket_path().display());

        while !token.is_cancelled() {
            if current.is_none() {
                match self.connector.claim_reader().await {
                    Ok((link, inbound)) => {
                        for frame in &inbound.backlog {
                            self.handle_frame(link.id(), frame, wait).await;
                        }
                        current = Some((link.id(), inbound.reader));
                    }
                    Err(e) => {
                        log_unreachable(&e);
                        if sleep_or_cancel(&token, wait).await {
                            break;
                        }
                    }
                }
                continue;
            }
            let Some((link_id, reader)) = current.as_mut() else {
                continue;
            };
            let link_id = *link_id;

            let next = tokio::select! {
                _ = token.cancelled() => break,
                next = tokio::time::timeout(wait, reader.next()) => next,
            };

            match next {
                // Quiet interval; drop the reader if someone else closed the link
                Err(_) => {
                    if !self.connector.is_current(link_id).await {
                        current = None;
                    }
                }
                Ok(None) => {
                    warn!("Debounce service closed the connection");
                    self.connector.teardown(link_id).await;
                    current = None;
                }
                Ok(Some(Err(e))) => {
                    warn!("Lost connection to debounce service: {}", e);
                    self.connector.teardown(link_id).await;
                    current = None;
                }
                Ok(Some(Ok(frame))) => {
                    if !self.handle_frame(link_id, &frame, wait).await {
                        current = None;
                    }
                }
            }
        }

        self.connector.close().await;
        info!("Stopped listening for debounce notifications");
    }

    /// Discard the connection
    pub async fn close(&self) {
        self.connector.close().await;
    }

    pub async fn state(&self) -> ConnectionState {
        self.connector.state().await
    }

    /// Whether the service recently turned this client away
    pub async fn is_conflicted(&self) -> bool {
        self.connector.in_cooldown().await
    }

    /// Act on one frame from the service; false once the link is unusable
    async fn handle_frame(&self, link_id: u64, frame: &[u8], wait: Duration) -> bool {
        match WireMessage::decode(frame) {
            Ok(WireMessage::PublishEvent(event)) => self.dispatch(&event.callback),
            Ok(WireMessage::RejectClient) => {
                warn!(
                    "Debounce service at {} is serving another client, running callbacks locally",
                    self.connector.socket_path().display()
                );
                self.connector.reject(link_id, wait).await;
                return false;
            }
            Ok(other) => warn!("Ignoring unexpected {} message from service", other.kind()),
            Err(e) => warn!("Dropping malformed message: {}", e),
        }
        true
    }

    fn dispatch(&self, callback: &CallbackDescriptor) {
        trace!("Publishing {}", callback.target());
        if let Err(e) = self.registry.invoke(callback) {
            error!("Debounced callback failed: {}", e);
        }
    }

    fn run_locally(&self, callback: &CallbackDescriptor) -> Dispatch {
        let result = self.registry.invoke(callback);
        if let Err(e) = &result {
            error!("Local callback failed: {}", e);
        }
        Dispatch::Immediate(result)
    }
}

fn log_unreachable(e: &ProxyError) {
    match e {
        ProxyError::ServiceUnavailable { .. } => debug!("{}", e),
        ProxyError::ServiceConflict(_) => debug!("{}", e),
        _ => warn!("Cannot reach debounce service: {}", e),
    }
}

/// Returns true if the token was cancelled before `wait` elapsed
async fn sleep_or_cancel(token: &CancellationToken, wait: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => true,
        _ = tokio::time::sleep(wait) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    fn recording_registry() -> (Arc<CallbackRegistry>, Arc<StdMutex<Vec<Value>>>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let mut registry = CallbackRegistry::new();
        registry
            .register_static("Recorder", "record", move |params| {
                sink.lock().unwrap().push(params.clone());
                Ok(())
            })
            .register_static("Recorder", "fail", |_| anyhow::bail!("refused"));
        (Arc::new(registry), seen)
    }

    fn offline_proxy(dir: &TempDir) -> (ServiceProxy, Arc<StdMutex<Vec<Value>>>) {
        let (registry, seen) = recording_registry();
        let config = DebounceConfig::new(dir.path().join("nobody.sock")).with_wait_timeout(Duration::from_millis(50));
        (ServiceProxy::new(config, registry), seen)
    }

    #[tokio::test]
    async fn test_submit_without_service_runs_immediately() {
        let dir = TempDir::new().unwrap();
        let (proxy, seen) = offline_proxy(&dir);

        for i in 0..3 {
            let cb = CallbackDescriptor::new("Recorder", "record").with_method_params(json!(i));
            let dispatch = proxy.submit("same-key", Duration::from_secs(1), cb).await;
            assert!(matches!(dispatch, Dispatch::Immediate(Ok(()))));
        }

        assert_eq!(*seen.lock().unwrap(), vec![json!(0), json!(1), json!(2)]);
        assert_eq!(proxy.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_local_callback_error_is_returned_not_raised() {
        let dir = TempDir::new().unwrap();
        let (proxy, _) = offline_proxy(&dir);

        let dispatch = proxy
            .submit("k", Duration::from_secs(1), CallbackDescriptor::new("Recorder", "fail"))
            .await;
        assert!(matches!(dispatch, Dispatch::Immediate(Err(CallbackError::Failed { .. }))));

        let dispatch = proxy
            .submit("k", Duration::from_secs(1), CallbackDescriptor::new("Missing", "record"))
            .await;
        assert!(matches!(dispatch, Dispatch::Immediate(Err(CallbackError::UnknownTarget(_)))));
    }

    #[tokio::test]
    async fn test_reset_without_service_is_noop() {
        let dir = TempDir::new().unwrap();
        let (proxy, _) = offline_proxy(&dir);
        assert!(!proxy.reset_remote().await);
    }

    #[tokio::test]
    async fn test_stop_receiving_ends_retry_loop() {
        let dir = TempDir::new().unwrap();
        let (proxy, _) = offline_proxy(&dir);
        let proxy = Arc::new(proxy);

        let handle = proxy.start_receiving(CancellationToken::new());
        tokio::time::sleep(Duration::from_millis(120)).await;
        proxy.stop_receiving();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("receive loop did not stop")
            .unwrap();
    }
}
