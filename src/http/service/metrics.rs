// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Instant;

use axum::{extract, http::Method, http::StatusCode, response::IntoResponse, routing::get};
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts};

pub use prometheus::Registry;

use super::RouteDoc;

const METRIC_PREFIX: &str = "llm_router";

/// Value for the `status` label in the request counter for successful requests
pub const REQUEST_STATUS_SUCCESS: &str = "success";

/// Value for the `status` label in the request counter if the request failed
pub const REQUEST_STATUS_ERROR: &str = "error";

pub struct Metrics {
    request_counter: IntCounterVec,
    inflight_gauge: IntGaugeVec,
    request_duration: HistogramVec,
}

/// RAII object for the inflight gauge and request counter.
///
/// If dropped without [`InflightGuard::mark_ok`] the request is counted with
/// the error status; a client that disconnects mid-stream therefore shows up
/// as an error.
pub struct InflightGuard {
    metrics: Arc<Metrics>,
    model: String,
    endpoint: Endpoint,
    request_type: RequestType,
    status: Status,
    timer: Instant,
}

/// Requests are labelled by the endpoint they hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Completions,
    ChatCompletions,
    Embeddings,
}

#[derive(Debug, Clone, Copy)]
pub enum RequestType {
    Unary,
    Stream,
}

#[derive(Debug, Clone, Copy)]
pub enum Status {
    Success,
    Error,
}

impl Endpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::Completions => "completions",
            Endpoint::ChatCompletions => "chat_completions",
            Endpoint::Embeddings => "embeddings",
        }
    }
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::Unary => "unary",
            RequestType::Stream => "stream",
        }
    }
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Success => REQUEST_STATUS_SUCCESS,
            Status::Error => REQUEST_STATUS_ERROR,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Creates the metric families:
    /// - `llm_router_requests_total`: requests processed, by
    ///   model/endpoint/request_type/status
    /// - `llm_router_inflight_requests`: inflight requests, by model
    /// - `llm_router_request_duration_seconds`: request duration, by model
    pub fn new() -> Self {
        let request_counter = IntCounterVec::new(
            Opts::new(
                format!("{METRIC_PREFIX}_requests_total"),
                "Total number of LLM requests processed",
            ),
            &["model", "endpoint", "request_type", "status"],
        )
        .unwrap();

        let inflight_gauge = IntGaugeVec::new(
            Opts::new(
                format!("{METRIC_PREFIX}_inflight_requests"),
                "Number of inflight requests",
            ),
            &["model"],
        )
        .unwrap();

        let buckets = vec![0.0, 1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0, 256.0];
        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                format!("{METRIC_PREFIX}_request_duration_seconds"),
                "Duration of LLM requests",
            )
            .buckets(buckets),
            &["model"],
        )
        .unwrap();

        Self {
            request_counter,
            inflight_gauge,
            request_duration,
        }
    }

    pub fn register(&self, registry: &Registry) -> anyhow::Result<()> {
        registry.register(Box::new(self.request_counter.clone()))?;
        registry.register(Box::new(self.inflight_gauge.clone()))?;
        registry.register(Box::new(self.request_duration.clone()))?;
        Ok(())
    }

    pub fn get_request_counter(
        &self,
        model: &str,
        endpoint: Endpoint,
        request_type: RequestType,
        status: Status,
    ) -> u64 {
        self.request_counter
            .with_label_values(&[
                model,
                endpoint.as_str(),
                request_type.as_str(),
                status.as_str(),
            ])
            .get()
    }

    pub fn get_inflight_count(&self, model: &str) -> i64 {
        self.inflight_gauge.with_label_values(&[model]).get()
    }

    pub fn create_inflight_guard(
        self: Arc<Self>,
        model: &str,
        endpoint: Endpoint,
        streaming: bool,
    ) -> InflightGuard {
        let request_type = if streaming {
            RequestType::Stream
        } else {
            RequestType::Unary
        };

        self.inflight_gauge.with_label_values(&[model]).inc();

        InflightGuard {
            metrics: self,
            model: model.to_string(),
            endpoint,
            request_type,
            status: Status::Error,
            timer: Instant::now(),
        }
    }
}

impl InflightGuard {
    pub fn mark_ok(&mut self) {
        self.status = Status::Success;
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.metrics
            .inflight_gauge
            .with_label_values(&[&self.model])
            .dec();

        self.metrics
            .request_counter
            .with_label_values(&[
                &self.model,
                self.endpoint.as_str(),
                self.request_type.as_str(),
                self.status.as_str(),
            ])
            .inc();

        self.metrics
            .request_duration
            .with_label_values(&[&self.model])
            .observe(self.timer.elapsed().as_secs_f64());
    }
}

pub fn router(registry: Registry) -> (Vec<RouteDoc>, axum::Router) {
    let path = "/metrics";
    let docs = vec![RouteDoc::new(Method::GET, path)];

    let router = axum::Router::new()
        .route(path, get(handler_metrics))
        .with_state(registry);

    (docs, router)
}

/// Serves the prometheus text exposition format.
async fn handler_metrics(
    extract::State(registry): extract::State<Registry>,
) -> impl IntoResponse {
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&registry.gather(), &mut buffer) {
        tracing::error!(error = %err, "failed to encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, String::new());
    }

    match String::from_utf8(buffer) {
        Ok(body) => (StatusCode::OK, body),
        Err(err) => {
            tracing::error!(error = %err, "metrics were not valid utf-8");
            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
        }
    }
}
