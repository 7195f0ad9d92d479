// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The router: composition and lifecycle.
//!
//! A [`Router`] owns the [`BackendRegistry`] and, once started, two kinds of
//! background work: one task per configured discoverer (initial snapshot plus
//! the watch loop) and a periodic health loop. `start` and `stop` are
//! idempotent; `stop` cancels everything and waits for the tasks to exit.
//!
//! The HTTP surface is independent of the lifecycle: the shared
//! [`State`](crate::http::service::State) keeps serving lookups whether or
//! not the background loops are running.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use derive_builder::Builder;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::backend::{Backend, BackendError, BackendType, GenericBackend};
use crate::discovery::{Discoverer, DiscoveryEvent};
use crate::http::service::State;
use crate::registry::BackendRegistry;

const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Router options.
///
/// Build one through [`Router::builder`]; every option has a default except
/// that a fleet without discoverers only changes via the manual
/// [`Router::add_backend`]/[`Router::remove_backend`] surface.
#[derive(Clone, Builder)]
#[builder(pattern = "owned", build_fn(private, name = "build_internal"))]
pub struct RouterConfig {
    /// Transport used by backends created through the router.
    #[builder(default)]
    http_client: Option<reqwest::Client>,

    /// Interval between health-loop ticks.
    #[builder(default = "DEFAULT_HEALTH_CHECK_INTERVAL")]
    health_check_interval: Duration,

    /// Backend id to fall back to when model lookup fails.
    #[builder(setter(into, strip_option), default)]
    default_backend: Option<String>,

    #[builder(setter(custom), default)]
    discoverers: Vec<Arc<dyn Discoverer>>,

    /// Routes requests carrying `X-Session-ID` via consistent hashing.
    #[builder(default)]
    session_affinity: bool,
}

impl RouterConfigBuilder {
    /// Adds a discoverer. May be called multiple times.
    pub fn discoverer(mut self, discoverer: Arc<dyn Discoverer>) -> Self {
        self.discoverers
            .get_or_insert_with(Vec::new)
            .push(discoverer);
        self
    }

    pub fn build(self) -> anyhow::Result<Router> {
        let config = self.build_internal()?;

        let http_client = match config.http_client {
            Some(client) => client,
            None => reqwest::Client::builder()
                .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
                .build()?,
        };

        let registry = Arc::new(BackendRegistry::new());
        let state = Arc::new(State::new(
            registry.clone(),
            config.default_backend,
            config.session_affinity,
        ));

        Ok(Router {
            registry,
            state,
            discoverers: config.discoverers,
            http_client,
            health_check_interval: config.health_check_interval,
            started: AtomicBool::new(false),
            lifecycle: Mutex::new(None),
        })
    }
}

struct Lifecycle {
    cancel: CancellationToken,
    tracker: TaskTracker,
}

/// The OpenAI-compatible proxy: registry plus background lifecycle.
pub struct Router {
    registry: Arc<BackendRegistry>,
    state: Arc<State>,
    discoverers: Vec<Arc<dyn Discoverer>>,
    http_client: reqwest::Client,
    health_check_interval: Duration,

    started: AtomicBool,
    lifecycle: Mutex<Option<Lifecycle>>,
}

impl Router {
    pub fn builder() -> RouterConfigBuilder {
        RouterConfigBuilder::default()
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// Shared state for the HTTP service.
    pub fn state(&self) -> Arc<State> {
        self.state.clone()
    }

    pub fn http_client(&self) -> &reqwest::Client {
        &self.http_client
    }

    /// Manually registers a backend.
    pub async fn add_backend(&self, backend: Arc<dyn Backend>) {
        self.registry.register(backend).await;
    }

    /// Registers a [`GenericBackend`] at `base_url` using the router's
    /// transport.
    pub async fn add_backend_url(
        &self,
        id: impl Into<String>,
        base_url: &str,
        backend_type: BackendType,
    ) -> Result<(), BackendError> {
        let backend = GenericBackend::new(id, base_url)?
            .with_backend_type(backend_type)
            .with_client(self.http_client.clone());
        self.registry.register(Arc::new(backend)).await;
        Ok(())
    }

    /// Manually unregisters a backend.
    pub async fn remove_backend(&self, id: &str) {
        self.registry.unregister(id).await;
    }

    /// Launches discovery and health monitoring. Idempotent; returns without
    /// waiting for initial discovery to complete.
    pub fn start(&self) {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        for discoverer in &self.discoverers {
            tracker.spawn(run_discoverer(
                discoverer.clone(),
                self.registry.clone(),
                cancel.clone(),
            ));
        }

        tracker.spawn(health_loop(
            self.registry.clone(),
            self.health_check_interval,
            cancel.clone(),
        ));

        tracker.close();
        *self.lifecycle.lock().unwrap() = Some(Lifecycle { cancel, tracker });
    }

    /// Cancels background work and waits for every spawned task to exit.
    /// Idempotent. Callers that need a deadline can wrap this in
    /// [`tokio::time::timeout`].
    pub async fn stop(&self) {
        if self
            .started
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let lifecycle = self.lifecycle.lock().unwrap().take();
        if let Some(lifecycle) = lifecycle {
            lifecycle.cancel.cancel();
            lifecycle.tracker.wait().await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

async fn run_discoverer(
    discoverer: Arc<dyn Discoverer>,
    registry: Arc<BackendRegistry>,
    cancel: CancellationToken,
) {
    let name = discoverer.name().to_string();

    tokio::select! {
        _ = cancel.cancelled() => return,
        result = discoverer.discover() => match result {
            Ok(backends) => {
                for backend in backends {
                    tracing::info!(
                        id = %backend.id(),
                        backend_type = %backend.backend_type(),
                        url = %backend.base_url(),
                        discoverer = %name,
                        "registered backend"
                    );
                    registry.register(backend).await;
                }
            }
            Err(err) => {
                tracing::warn!(discoverer = %name, error = format!("{err:#}"), "initial discovery failed");
            }
        }
    }

    let events = tokio::select! {
        _ = cancel.cancelled() => return,
        result = discoverer.watch(cancel.child_token()) => match result {
            Ok(events) => events,
            Err(err) => {
                tracing::warn!(discoverer = %name, error = format!("{err:#}"), "failed to start watch");
                return;
            }
        }
    };

    watch_events(registry, name, events, cancel).await;
}

async fn watch_events(
    registry: Arc<BackendRegistry>,
    discoverer: String,
    mut events: tokio::sync::mpsc::Receiver<DiscoveryEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            event = events.recv() => {
                let Some(event) = event else { return };
                match event {
                    DiscoveryEvent::Added(backend) => {
                        tracing::info!(id = %backend.id(), discoverer = %discoverer, "backend added");
                        registry.register(backend).await;
                    }
                    DiscoveryEvent::Removed(backend) => {
                        tracing::info!(id = %backend.id(), discoverer = %discoverer, "backend removed");
                        registry.unregister(backend.id()).await;
                    }
                    DiscoveryEvent::Updated(backend) => {
                        if let Err(err) = registry.refresh_models(backend.id()).await {
                            tracing::warn!(
                                id = %backend.id(),
                                discoverer = %discoverer,
                                error = %err,
                                "failed to refresh models"
                            );
                        }
                    }
                }
            }
        }
    }
}

/// Probes every registered backend on a fixed interval, flipping health bits
/// only. Removal stays the discoverer's job.
async fn health_loop(
    registry: Arc<BackendRegistry>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately; wait a full interval instead.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                for backend in registry.all_backends().await {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        result = backend.health_check() => {
                            if let Err(err) = result {
                                tracing::debug!(id = %backend.id(), error = %err, "health check failed");
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockBackend;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct ChannelDiscoverer {
        initial: Vec<Arc<dyn Backend>>,
        events: Mutex<Option<mpsc::Receiver<DiscoveryEvent>>>,
    }

    impl ChannelDiscoverer {
        fn new(
            initial: Vec<Arc<dyn Backend>>,
        ) -> (Arc<Self>, mpsc::Sender<DiscoveryEvent>) {
            let (tx, rx) = mpsc::channel(10);
            (
                Arc::new(Self {
                    initial,
                    events: Mutex::new(Some(rx)),
                }),
                tx,
            )
        }
    }

    #[async_trait]
    impl Discoverer for ChannelDiscoverer {
        fn name(&self) -> &str {
            "channel"
        }

        async fn discover(&self) -> anyhow::Result<Vec<Arc<dyn Backend>>> {
            Ok(self.initial.clone())
        }

        async fn watch(
            &self,
            _cancel: CancellationToken,
        ) -> anyhow::Result<mpsc::Receiver<DiscoveryEvent>> {
            Ok(self
                .events
                .lock()
                .unwrap()
                .take()
                .expect("watch opened twice"))
        }
    }

    async fn wait_until<F, Fut>(mut condition: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..500 {
            if condition().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let router = Router::builder().build().unwrap();

        router.start();
        router.start();
        assert!(router.is_running());

        tokio::time::timeout(Duration::from_secs(1), router.stop())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), router.stop())
            .await
            .unwrap();
        assert!(!router.is_running());
    }

    #[tokio::test]
    async fn discovery_events_reconcile_the_registry() {
        let backend_a: Arc<MockBackend> = Arc::new(MockBackend::new("backend-a", true));
        let backend_b: Arc<MockBackend> = Arc::new(MockBackend::new("backend-b", true));

        let (discoverer, tx) = ChannelDiscoverer::new(vec![backend_a.clone()]);
        let router = Router::builder().discoverer(discoverer).build().unwrap();
        router.start();

        wait_until(|| async { router.registry().count().await == 1 }).await;

        tx.send(DiscoveryEvent::Added(backend_b.clone()))
            .await
            .unwrap();
        wait_until(|| async { router.registry().count().await == 2 }).await;

        tx.send(DiscoveryEvent::Removed(backend_a.clone()))
            .await
            .unwrap();
        wait_until(|| async { router.registry().lookup_by_id("backend-a").await.is_none() }).await;

        backend_b.set_models(&["renamed-model"]);
        tx.send(DiscoveryEvent::Updated(backend_b.clone()))
            .await
            .unwrap();
        wait_until(|| async {
            router
                .registry()
                .lookup_by_model("renamed-model")
                .await
                .is_some()
        })
        .await;
        assert!(router
            .registry()
            .lookup_by_model("test-model")
            .await
            .is_none());

        tokio::time::timeout(Duration::from_secs(1), router.stop())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn health_loop_flips_health_bits_without_removal() {
        let backend: Arc<MockBackend> = Arc::new(MockBackend::new("backend-a", true));

        let router = Router::builder()
            .health_check_interval(Duration::from_millis(10))
            .build()
            .unwrap();
        router.add_backend(backend.clone()).await;
        router.start();

        backend.set_fail_probe(true);
        wait_until(|| async { !backend.is_healthy() }).await;
        assert!(router.registry().lookup_by_id("backend-a").await.is_some());

        backend.set_fail_probe(false);
        wait_until(|| async { backend.is_healthy() }).await;

        tokio::time::timeout(Duration::from_secs(1), router.stop())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn manual_add_and_remove_work_without_start() {
        let router = Router::builder().build().unwrap();

        router
            .add_backend(Arc::new(MockBackend::new("backend-a", true)))
            .await;
        assert_eq!(router.registry().count().await, 1);
        assert!(router
            .registry()
            .lookup_by_model("test-model")
            .await
            .is_some());

        router.remove_backend("backend-a").await;
        assert_eq!(router.registry().count().await, 0);
    }

    #[tokio::test]
    async fn add_backend_url_registers_even_when_unreachable() {
        let router = Router::builder().build().unwrap();

        // Nothing listens here; the backend registers without models and
        // waits for the health loop to flag it.
        router
            .add_backend_url("vllm-0", "http://127.0.0.1:1", BackendType::Vllm)
            .await
            .unwrap();

        let backend = router.registry().lookup_by_id("vllm-0").await.unwrap();
        assert_eq!(backend.backend_type(), BackendType::Vllm);
        assert_eq!(router.registry().model_count().await, 0);

        assert!(router
            .add_backend_url("bad", "not a url", BackendType::Generic)
            .await
            .is_err());
    }
}
