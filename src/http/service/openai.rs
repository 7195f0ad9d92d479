// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract,
    http::{HeaderMap, HeaderValue, Method},
    response::{sse::Sse, IntoResponse, Response},
    routing::{get, post},
    Json,
};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, BackendError};
use crate::protocols::{Model, ModelList, RequestEnvelope};
use crate::registry::{LookupResult, SESSION_BROKEN_HEADER, SESSION_HEADER};
use crate::streaming;

use super::error::{ApiError, ErrorResponse};
use super::metrics::Endpoint;
use super::{RouteDoc, State};

pub fn chat_completions_router(state: Arc<State>) -> (Vec<RouteDoc>, axum::Router) {
    let path = "/v1/chat/completions";
    let docs = vec![RouteDoc::new(Method::POST, path)];

    let router = axum::Router::new()
        .route(path, post(chat_completions))
        .with_state(state);

    (docs, router)
}

pub fn completions_router(state: Arc<State>) -> (Vec<RouteDoc>, axum::Router) {
    let path = "/v1/completions";
    let docs = vec![RouteDoc::new(Method::POST, path)];

    let router = axum::Router::new()
        .route(path, post(completions))
        .with_state(state);

    (docs, router)
}

pub fn embeddings_router(state: Arc<State>) -> (Vec<RouteDoc>, axum::Router) {
    let path = "/v1/embeddings";
    let docs = vec![RouteDoc::new(Method::POST, path)];

    let router = axum::Router::new()
        .route(path, post(embeddings))
        .with_state(state);

    (docs, router)
}

pub fn models_router(state: Arc<State>) -> (Vec<RouteDoc>, axum::Router) {
    let list_path = "/v1/models";
    // Catch-all: model ids routinely contain slashes (e.g.
    // meta-llama/Llama-3.1-8B), which a single-segment parameter won't match.
    let get_path = "/v1/models/{*model}";
    let docs = vec![
        RouteDoc::new(Method::GET, list_path),
        RouteDoc::new(Method::GET, get_path),
    ];

    let router = axum::Router::new()
        .route(list_path, get(list_models))
        .route(get_path, get(get_model))
        .with_state(state);

    (docs, router)
}

async fn chat_completions(
    extract::State(state): extract::State<Arc<State>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ErrorResponse> {
    inference_request(state, headers, body, Endpoint::ChatCompletions).await
}

async fn completions(
    extract::State(state): extract::State<Arc<State>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ErrorResponse> {
    inference_request(state, headers, body, Endpoint::Completions).await
}

/// Shared handler for the two endpoints that support streaming.
///
/// Dispatch: decode the envelope, resolve a backend, then forward unary or
/// open an SSE relay depending on the `stream` flag.
async fn inference_request(
    state: Arc<State>,
    headers: HeaderMap,
    body: Bytes,
    endpoint: Endpoint,
) -> Result<Response, ErrorResponse> {
    let request = decode_request(&body)?;
    let (backend, session_broken) = resolve_backend(&state, &headers, &request.model).await?;

    let mut inflight =
        state
            .metrics_clone()
            .create_inflight_guard(&request.model, endpoint, request.stream);

    let mut response = if request.stream {
        // The producer task keeps running after this handler returns; the
        // token is cancelled when the response body is dropped, which covers
        // both normal completion and client disconnect.
        let cancel = CancellationToken::new();
        let events = if endpoint == Endpoint::ChatCompletions {
            backend
                .chat_completion_stream(&request, cancel.child_token())
                .await
        } else {
            backend
                .completion_stream(&request, cancel.child_token())
                .await
        };
        let events =
            events.map_err(|err| upstream_failure(&*backend, "stream request failed", err))?;

        let relay = async_stream::stream! {
            let _cancel_on_drop = cancel.drop_guard();
            let mut inflight = inflight;
            let mut events = std::pin::pin!(streaming::relay_events(events));
            while let Some(event) = events.next().await {
                yield event;
            }
            inflight.mark_ok();
        };

        let mut response = Sse::new(relay).into_response();
        streaming::set_sse_headers(response.headers_mut());
        response
    } else {
        let result = if endpoint == Endpoint::ChatCompletions {
            backend.chat_completion(&request).await
        } else {
            backend.completion(&request).await
        };
        let value = result.map_err(|err| upstream_failure(&*backend, "request failed", err))?;
        inflight.mark_ok();
        Json(value).into_response()
    };

    if session_broken {
        response
            .headers_mut()
            .insert(SESSION_BROKEN_HEADER, HeaderValue::from_static("true"));
    }
    Ok(response)
}

/// Embeddings are unary only; a `stream` flag in the body is ignored.
async fn embeddings(
    extract::State(state): extract::State<Arc<State>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ErrorResponse> {
    let request = decode_request(&body)?;
    let (backend, session_broken) = resolve_backend(&state, &headers, &request.model).await?;

    let mut inflight =
        state
            .metrics_clone()
            .create_inflight_guard(&request.model, Endpoint::Embeddings, false);

    let value = backend
        .embeddings(&request)
        .await
        .map_err(|err| upstream_failure(&*backend, "embeddings request failed", err))?;
    inflight.mark_ok();

    let mut response = Json(value).into_response();
    if session_broken {
        response
            .headers_mut()
            .insert(SESSION_BROKEN_HEADER, HeaderValue::from_static("true"));
    }
    Ok(response)
}

async fn list_models(extract::State(state): extract::State<Arc<State>>) -> Json<ModelList> {
    Json(ModelList::new(state.registry().all_models().await))
}

async fn get_model(
    extract::State(state): extract::State<Arc<State>>,
    extract::Path(model_id): extract::Path<String>,
) -> Result<Json<Model>, ErrorResponse> {
    state
        .registry()
        .all_models()
        .await
        .into_iter()
        .find(|model| model.id == model_id)
        .map(Json)
        .ok_or_else(|| ApiError::model_not_found(&model_id))
}

fn decode_request(body: &Bytes) -> Result<RequestEnvelope, ErrorResponse> {
    serde_json::from_slice(body)
        .map_err(|err| ApiError::invalid_request(format!("invalid request body: {err}")))
}

/// Resolves `(model, session?)` to a backend.
///
/// With session affinity enabled the `X-Session-ID` header picks the
/// consistent-hash path; otherwise first-healthy. When the model is unknown
/// the configured default backend is resolved by id, bypassing the model
/// index so a missing default still reads as "model not found".
async fn resolve_backend(
    state: &State,
    headers: &HeaderMap,
    model: &str,
) -> Result<(Arc<dyn Backend>, bool), ErrorResponse> {
    let lookup = if state.session_affinity() {
        let session_id = headers
            .get(SESSION_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        state.registry().lookup_with_session(model, session_id).await
    } else {
        state
            .registry()
            .lookup_by_model(model)
            .await
            .map(|backend| LookupResult {
                backend,
                session_broken: false,
            })
    };

    if let Some(result) = lookup {
        return Ok((result.backend, result.session_broken));
    }

    if let Some(default_id) = state.default_backend() {
        if let Some(backend) = state.registry().lookup_by_id(default_id).await {
            return Ok((backend, false));
        }
    }

    Err(ApiError::model_not_found(model))
}

fn upstream_failure(backend: &dyn Backend, context: &str, err: BackendError) -> ErrorResponse {
    tracing::error!(backend = backend.id(), error = %err, "{context}");
    ApiError::server_error(format!("backend error: {err}"))
}
