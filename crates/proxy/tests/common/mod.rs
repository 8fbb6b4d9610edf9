//! Common utilities for integration tests
//!
//! Runs a real timer service on a temporary socket and builds proxies whose
//! registry records every `TestEvent` it publishes.

#![allow(dead_code)]

use anyhow::{Context, Result};
use debounce_core::{CallbackDescriptor, CallbackRegistry, DebounceConfig};
use debounce_proxy::{ConnectionState, ServiceProxy};
use debounce_service::{ServiceStats, TimerService};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Callback target used throughout the tests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestEvent {
    pub test_id: String,
}

impl TestEvent {
    pub fn callback(test_id: &str) -> CallbackDescriptor {
        CallbackDescriptor::for_instance(
            "TestEvent",
            "publish",
            &TestEvent {
                test_id: test_id.to_string(),
            },
        )
        .expect("TestEvent serializes")
    }
}

/// Every test_id published, in order
#[derive(Debug, Clone, Default)]
pub struct Recorder(Arc<Mutex<Vec<String>>>);

impl Recorder {
    pub fn ids(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    /// Poll until at least `n` events were recorded
    pub async fn wait_for(&self, n: usize, within: Duration) -> bool {
        wait_until(within, || self.count() >= n).await
    }
}

/// Registry with `TestEvent#publish` plus two misbehaving targets
pub fn registry(recorder: &Recorder) -> CallbackRegistry {
    let sink = recorder.0.clone();
    let mut registry = CallbackRegistry::new();
    registry
        .register_method("TestEvent", "publish", move |event: TestEvent, _| {
            sink.lock().unwrap().push(event.test_id);
            Ok(())
        })
        .register_static("Faulty", "fail", |_| anyhow::bail!("deliberate failure"))
        .register_static("Faulty", "panic", |_| panic!("deliberate panic"));
    registry
}

/// A temp directory holding the socket shared by services and proxies
pub struct TestEnv {
    dir: TempDir,
    pub config: DebounceConfig,
}

impl TestEnv {
    pub fn new(wait: Duration) -> Result<Self> {
        let dir = TempDir::new().context("Failed to create temp dir")?;
        let config = DebounceConfig::new(dir.path().join("debounce.sock")).with_wait_timeout(wait);
        Ok(Self { dir, config })
    }

    pub fn start_service(&self) -> Result<RunningService> {
        let service = TimerService::bind(self.config.clone()).context("Failed to bind service")?;
        let token = CancellationToken::new();
        let handle = tokio::spawn(service.run(token.clone()));
        Ok(RunningService { token, handle })
    }

    pub fn proxy(&self) -> (Arc<ServiceProxy>, Recorder) {
        self.proxy_with(self.config.clone())
    }

    pub fn proxy_with(&self, config: DebounceConfig) -> (Arc<ServiceProxy>, Recorder) {
        let recorder = Recorder::default();
        let proxy = ServiceProxy::new(config, Arc::new(registry(&recorder)));
        (Arc::new(proxy), recorder)
    }
}

/// Service running on a background task
pub struct RunningService {
    token: CancellationToken,
    handle: JoinHandle<debounce_service::Result<ServiceStats>>,
}

impl RunningService {
    pub async fn stop(self) -> Result<ServiceStats> {
        self.token.cancel();
        let stats = self.handle.await.context("Service task panicked")??;
        Ok(stats)
    }
}

/// Poll `condition` every 20ms until it holds or `within` passes
pub async fn wait_until(within: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

/// Wait for the proxy's receive loop to own a connection
pub async fn wait_until_listening(proxy: &ServiceProxy, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if proxy.state().await == ConnectionState::Listening {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
