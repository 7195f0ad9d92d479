// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use axum::{extract, http::Method, response::IntoResponse, routing::get, Json};
use serde::{Deserialize, Serialize};

use super::{RouteDoc, State};

/// Shape of the `/health` response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub backends_total: usize,
    pub backends_healthy: usize,
    pub models_available: usize,
}

pub fn health_check_router(state: Arc<State>) -> (Vec<RouteDoc>, axum::Router) {
    let path = "/health";
    let docs = vec![RouteDoc::new(Method::GET, path)];

    let router = axum::Router::new()
        .route(path, get(health_handler))
        .with_state(state);

    (docs, router)
}

async fn health_handler(extract::State(state): extract::State<Arc<State>>) -> impl IntoResponse {
    let backends = state.registry().all_backends().await;
    let healthy = backends.iter().filter(|b| b.is_healthy()).count();

    // Degraded means we know about backends but none of them is answering.
    let status = if healthy == 0 && !backends.is_empty() {
        "degraded"
    } else {
        "ok"
    };

    Json(HealthStatus {
        status: status.to_string(),
        backends_total: backends.len(),
        backends_healthy: healthy,
        models_available: state.registry().model_count().await,
    })
}
