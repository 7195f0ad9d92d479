// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! OpenAI-compatible HTTP service.
//!
//! The service is thin glue over the shared [`State`]: it decodes request
//! envelopes, resolves a backend through the registry, and forwards unary or
//! streaming. It works in any router lifecycle state; without the background
//! loops the registry simply stops receiving updates.

mod openai;

pub mod error;
pub mod health;
pub mod metrics;

use std::sync::Arc;

use anyhow::Result;
use derive_builder::Builder;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::registry::BackendRegistry;

pub use metrics::Metrics;

/// Documentation for a route.
#[derive(Debug, Clone)]
pub struct RouteDoc {
    method: axum::http::Method,
    path: String,
}

impl std::fmt::Display for RouteDoc {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

impl RouteDoc {
    pub fn new<T: Into<String>>(method: axum::http::Method, path: T) -> Self {
        RouteDoc {
            method,
            path: path.into(),
        }
    }
}

/// State shared with every request handler.
pub struct State {
    registry: Arc<BackendRegistry>,
    metrics: Arc<Metrics>,
    default_backend: Option<String>,
    session_affinity: bool,
}

impl State {
    pub fn new(
        registry: Arc<BackendRegistry>,
        default_backend: Option<String>,
        session_affinity: bool,
    ) -> Self {
        Self {
            registry,
            metrics: Arc::new(Metrics::default()),
            default_backend,
            session_affinity,
        }
    }

    pub fn registry(&self) -> &BackendRegistry {
        Arc::as_ref(&self.registry)
    }

    pub fn metrics_clone(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn default_backend(&self) -> Option<&str> {
        self.default_backend.as_deref()
    }

    pub fn session_affinity(&self) -> bool {
        self.session_affinity
    }
}

#[derive(Clone)]
pub struct HttpService {
    // The state we share with every request handler
    state: Arc<State>,

    router: axum::Router,
    port: u16,
    host: String,
    route_docs: Vec<RouteDoc>,
}

#[derive(Clone, Builder)]
#[builder(pattern = "owned", build_fn(private, name = "build_internal"))]
pub struct HttpServiceConfig {
    #[builder(default = "8080")]
    port: u16,

    #[builder(setter(into), default = "String::from(\"0.0.0.0\")")]
    host: String,

    state: Arc<State>,
}

impl HttpService {
    pub fn builder() -> HttpServiceConfigBuilder {
        HttpServiceConfigBuilder::default()
    }

    pub fn state_clone(&self) -> Arc<State> {
        self.state.clone()
    }

    pub fn state(&self) -> &State {
        Arc::as_ref(&self.state)
    }

    /// The assembled axum router; useful for embedding the service in an
    /// existing server instead of calling [`HttpService::run`].
    pub fn axum_router(&self) -> axum::Router {
        self.router.clone()
    }

    /// Documentation of exposed HTTP endpoints.
    pub fn route_docs(&self) -> &[RouteDoc] {
        &self.route_docs
    }

    pub async fn spawn(&self, cancel_token: CancellationToken) -> JoinHandle<Result<()>> {
        let this = self.clone();
        tokio::spawn(async move { this.run(cancel_token).await })
    }

    pub async fn run(&self, cancel_token: CancellationToken) -> Result<()> {
        let address = format!("{}:{}", self.host, self.port);
        tracing::info!(address, "starting HTTP service");

        let listener = tokio::net::TcpListener::bind(address.as_str()).await?;

        let router = self.router.clone();
        let observer = cancel_token.child_token();

        axum::serve(listener, router)
            .with_graceful_shutdown(observer.cancelled_owned())
            .await
            .inspect_err(|_| cancel_token.cancel())?;

        Ok(())
    }
}

impl HttpServiceConfigBuilder {
    pub fn build(self) -> Result<HttpService> {
        let config: HttpServiceConfig = self.build_internal()?;
        let state = config.state;

        // enable prometheus metrics
        let registry = metrics::Registry::new();
        state.metrics_clone().register(&registry)?;

        let mut router = axum::Router::new();
        let mut all_docs = Vec::new();

        let routes = vec![
            metrics::router(registry),
            openai::chat_completions_router(state.clone()),
            openai::completions_router(state.clone()),
            openai::embeddings_router(state.clone()),
            openai::models_router(state.clone()),
            health::health_check_router(state.clone()),
        ];

        for (route_docs, route) in routes.into_iter() {
            router = router.merge(route);
            all_docs.extend(route_docs);
        }

        Ok(HttpService {
            state,
            router,
            port: config.port,
            host: config.host,
            route_docs: all_docs,
        })
    }
}
