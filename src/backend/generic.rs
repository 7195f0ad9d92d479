// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Generic OpenAI-compatible backend.
//!
//! Proxies requests to any server that exposes the canonical OpenAI paths
//! under its base URL: `GET /v1/models`, `POST /v1/chat/completions`,
//! `POST /v1/completions`, `POST /v1/embeddings`.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::header::ACCEPT;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::protocols::{Model, ModelList, RequestEnvelope};
use crate::streaming;

use super::{Backend, BackendError, BackendType, StreamEvent};

/// Unary requests get a generous deadline because completions are long-lived.
/// Streaming requests carry no deadline at all; they are bounded by
/// cancellation instead, so long streams are never truncated by the client.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A [`Backend`] that talks the OpenAI wire protocol over reqwest.
pub struct GenericBackend {
    id: String,
    backend_type: BackendType,
    base_url: Url,
    client: reqwest::Client,
    request_timeout: Duration,

    healthy: AtomicBool,
    models: Mutex<Vec<Model>>,
}

impl GenericBackend {
    pub fn new(id: impl Into<String>, base_url: &str) -> Result<Self, BackendError> {
        let base_url = Url::parse(base_url)?;

        // No total timeout on the client itself: streaming responses are
        // bounded by cancellation, unary calls by a per-request deadline.
        let client = reqwest::Client::builder()
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .build()?;

        Ok(Self {
            id: id.into(),
            backend_type: BackendType::Generic,
            base_url,
            client,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            healthy: AtomicBool::new(true),
            models: Mutex::new(Vec::new()),
        })
    }

    pub fn with_backend_type(mut self, backend_type: BackendType) -> Self {
        self.backend_type = backend_type;
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// The model list from the last successful [`Backend::models`] call.
    pub fn cached_models(&self) -> Vec<Model> {
        self.models.lock().unwrap().clone()
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.as_str().trim_end_matches('/'), path)
    }

    async fn unary_request(
        &self,
        path: &str,
        request: &RequestEnvelope,
    ) -> Result<Value, BackendError> {
        let response = self
            .client
            .post(self.endpoint(path))
            .timeout(self.request_timeout)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Upstream { status, body });
        }

        Ok(response.json().await?)
    }

    async fn stream_request(
        &self,
        path: &str,
        request: &RequestEnvelope,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamEvent>, BackendError> {
        let mut request = request.clone();
        request.stream = true;

        let response = self
            .client
            .post(self.endpoint(path))
            .header(ACCEPT, "text/event-stream")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Upstream { status, body });
        }

        let body = response.bytes_stream().map_err(io::Error::other);
        Ok(streaming::spawn_sse_reader(body, cancel))
    }
}

#[async_trait]
impl Backend for GenericBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn backend_type(&self) -> BackendType {
        self.backend_type
    }

    fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    async fn health_check(&self) -> Result<(), BackendError> {
        let result = self.models().await;
        self.healthy.store(result.is_ok(), Ordering::SeqCst);
        result.map(|_| ())
    }

    async fn models(&self) -> Result<Vec<Model>, BackendError> {
        let response = self
            .client
            .get(self.endpoint("/v1/models"))
            .timeout(self.request_timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Upstream { status, body });
        }

        let list: ModelList = response.json().await?;
        *self.models.lock().unwrap() = list.data.clone();
        Ok(list.data)
    }

    async fn chat_completion(&self, request: &RequestEnvelope) -> Result<Value, BackendError> {
        self.unary_request("/v1/chat/completions", request).await
    }

    async fn chat_completion_stream(
        &self,
        request: &RequestEnvelope,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamEvent>, BackendError> {
        self.stream_request("/v1/chat/completions", request, cancel)
            .await
    }

    async fn completion(&self, request: &RequestEnvelope) -> Result<Value, BackendError> {
        self.unary_request("/v1/completions", request).await
    }

    async fn completion_stream(
        &self,
        request: &RequestEnvelope,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamEvent>, BackendError> {
        self.stream_request("/v1/completions", request, cancel).await
    }

    async fn embeddings(&self, request: &RequestEnvelope) -> Result<Value, BackendError> {
        self.unary_request("/v1/embeddings", request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_joins_without_duplicate_slash() {
        let backend = GenericBackend::new("b1", "http://localhost:8000/").unwrap();
        assert_eq!(
            backend.endpoint("/v1/models"),
            "http://localhost:8000/v1/models"
        );
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        assert!(GenericBackend::new("b1", "not a url").is_err());
    }

    #[test]
    fn backend_starts_healthy() {
        let backend = GenericBackend::new("b1", "http://localhost:8000").unwrap();
        assert!(backend.is_healthy());
    }
}
