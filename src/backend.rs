// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Backend handles.
//!
//! A [`Backend`] represents one upstream inference server: a stable identity,
//! an atomically observable health bit, and the OpenAI-compatible wire calls.
//! The registry holds backends as `Arc<dyn Backend>`, so a handle returned by
//! a lookup stays valid even if the backend is concurrently unregistered.

mod generic;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::protocols::{Model, RequestEnvelope};

pub use generic::GenericBackend;

/// Identifies the backend server software. Used for logging and default-port
/// selection only; routing never branches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    Vllm,
    Ollama,
    LlamaCpp,
    LmStudio,
    Generic,
}

impl BackendType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendType::Vllm => "vllm",
            BackendType::Ollama => "ollama",
            BackendType::LlamaCpp => "llamacpp",
            BackendType::LmStudio => "lmstudio",
            BackendType::Generic => "generic",
        }
    }

    /// The port the server software listens on by default.
    pub fn default_port(&self) -> u16 {
        match self {
            BackendType::Vllm => 8000,
            BackendType::Ollama => 11434,
            BackendType::LlamaCpp => 8080,
            BackendType::LmStudio => 1234,
            BackendType::Generic => 8000,
        }
    }
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by backend wire calls.
///
/// Data-plane failures never touch the health bit; only
/// [`Backend::health_check`] moves it. A single failed request must not evict
/// a backend; that is the health loop's job.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The upstream answered with a non-2xx status.
    #[error("upstream returned {status}: {body}")]
    Upstream {
        status: reqwest::StatusCode,
        body: String,
    },

    /// The request never produced a usable response (connect, I/O, decode).
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("invalid base URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Error carried by a terminal [`StreamEvent`].
#[derive(Debug, Clone, Error)]
pub enum StreamError {
    #[error("stream cancelled")]
    Cancelled,

    #[error("stream read failed: {0}")]
    Read(String),
}

/// One event in a streaming response.
///
/// Streams are lazy, finite, and non-restartable: after an event with
/// `done == true` the channel closes.
#[derive(Debug, Clone, Default)]
pub struct StreamEvent {
    /// Raw SSE payload: a JSON chunk, or `[DONE]` for the terminator.
    pub data: String,

    /// Set if the stream ended because of an error.
    pub err: Option<StreamError>,

    /// True for the final event of the stream.
    pub done: bool,
}

impl StreamEvent {
    pub(crate) fn data(payload: &str) -> Self {
        Self {
            data: payload.to_string(),
            ..Default::default()
        }
    }

    /// Clean termination: the upstream reached EOF without sending `[DONE]`.
    pub(crate) fn finished() -> Self {
        Self {
            done: true,
            ..Default::default()
        }
    }

    /// The upstream sent its `[DONE]` terminator.
    pub(crate) fn terminator() -> Self {
        Self {
            data: crate::streaming::DONE_MARKER.to_string(),
            done: true,
            ..Default::default()
        }
    }

    pub(crate) fn failed(err: StreamError) -> Self {
        Self {
            err: Some(err),
            done: true,
            ..Default::default()
        }
    }
}

/// An upstream inference server.
///
/// Implementations own their transport client. All methods are safe to call
/// concurrently; `is_healthy` is an atomic load and may be read while another
/// task runs `health_check`.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Stable identity, unique per registration.
    fn id(&self) -> &str;

    fn backend_type(&self) -> BackendType;

    fn base_url(&self) -> &Url;

    fn is_healthy(&self) -> bool;

    /// Probes the backend (canonically by listing models). Sets the health
    /// bit to the outcome and returns the underlying error on failure.
    async fn health_check(&self) -> Result<(), BackendError>;

    /// Fetches the current model list from the upstream `/v1/models`.
    async fn models(&self) -> Result<Vec<Model>, BackendError>;

    async fn chat_completion(&self, request: &RequestEnvelope) -> Result<Value, BackendError>;

    /// Opens a streaming chat completion. A non-2xx status on the initial
    /// response is returned synchronously; otherwise the returned channel
    /// follows the termination contract of [`crate::streaming`].
    async fn chat_completion_stream(
        &self,
        request: &RequestEnvelope,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamEvent>, BackendError>;

    async fn completion(&self, request: &RequestEnvelope) -> Result<Value, BackendError>;

    async fn completion_stream(
        &self,
        request: &RequestEnvelope,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamEvent>, BackendError>;

    async fn embeddings(&self, request: &RequestEnvelope) -> Result<Value, BackendError>;
}

#[cfg(test)]
pub(crate) mod mock {
    use std::sync::atomic::{AtomicBool, Ordering};

    use serde_json::json;

    use super::*;

    /// In-memory backend for registry/router tests.
    pub(crate) struct MockBackend {
        id: String,
        base_url: Url,
        healthy: AtomicBool,
        fail_probe: AtomicBool,
        models: std::sync::Mutex<Vec<Model>>,
    }

    fn models_from(ids: &[&str]) -> Vec<Model> {
        ids.iter()
            .map(|id| Model {
                id: id.to_string(),
                object: "model".to_string(),
                created: 0,
                owned_by: "test".to_string(),
            })
            .collect()
    }

    impl MockBackend {
        pub(crate) fn new(id: &str, healthy: bool) -> Self {
            Self {
                id: id.to_string(),
                base_url: Url::parse("http://localhost:8080").unwrap(),
                healthy: AtomicBool::new(healthy),
                fail_probe: AtomicBool::new(false),
                models: std::sync::Mutex::new(models_from(&["test-model"])),
            }
        }

        pub(crate) fn with_models(self, ids: &[&str]) -> Self {
            self.set_models(ids);
            self
        }

        pub(crate) fn set_models(&self, ids: &[&str]) {
            *self.models.lock().unwrap() = models_from(ids);
        }

        pub(crate) fn set_healthy(&self, healthy: bool) {
            self.healthy.store(healthy, Ordering::SeqCst);
        }

        /// Makes subsequent health probes fail (and mark the backend down).
        pub(crate) fn set_fail_probe(&self, fail: bool) {
            self.fail_probe.store(fail, Ordering::SeqCst);
        }

        fn stream_of(&self, events: Vec<StreamEvent>) -> mpsc::Receiver<StreamEvent> {
            let (tx, rx) = mpsc::channel(events.len().max(1));
            for event in events {
                tx.try_send(event).unwrap();
            }
            rx
        }
    }

    #[async_trait]
    impl Backend for MockBackend {
        fn id(&self) -> &str {
            &self.id
        }

        fn backend_type(&self) -> BackendType {
            BackendType::Generic
        }

        fn base_url(&self) -> &Url {
            &self.base_url
        }

        fn is_healthy(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }

        async fn health_check(&self) -> Result<(), BackendError> {
            if self.fail_probe.load(Ordering::SeqCst) {
                self.set_healthy(false);
                return Err(BackendError::Upstream {
                    status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
                    body: "probe failed".to_string(),
                });
            }
            self.set_healthy(true);
            Ok(())
        }

        async fn models(&self) -> Result<Vec<Model>, BackendError> {
            Ok(self.models.lock().unwrap().clone())
        }

        async fn chat_completion(&self, _request: &RequestEnvelope) -> Result<Value, BackendError> {
            Ok(json!({"served_by": self.id}))
        }

        async fn chat_completion_stream(
            &self,
            _request: &RequestEnvelope,
            _cancel: CancellationToken,
        ) -> Result<mpsc::Receiver<StreamEvent>, BackendError> {
            Ok(self.stream_of(vec![
                StreamEvent::data(&json!({"served_by": self.id}).to_string()),
                StreamEvent::terminator(),
            ]))
        }

        async fn completion(&self, _request: &RequestEnvelope) -> Result<Value, BackendError> {
            Ok(json!({"served_by": self.id}))
        }

        async fn completion_stream(
            &self,
            request: &RequestEnvelope,
            cancel: CancellationToken,
        ) -> Result<mpsc::Receiver<StreamEvent>, BackendError> {
            self.chat_completion_stream(request, cancel).await
        }

        async fn embeddings(&self, _request: &RequestEnvelope) -> Result<Value, BackendError> {
            Ok(json!({"served_by": self.id}))
        }
    }
}
