// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! OpenAI wire types.
//!
//! The router treats request and response bodies as opaque JSON. The only
//! fields it reads are `model` (to route) and `stream` (to pick the unary or
//! streaming path); everything else passes through untouched via
//! [`RequestEnvelope::rest`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A model advertised by a backend via `GET /v1/models`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub owned_by: String,
}

/// Response shape of `GET /v1/models`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<Model>,
}

impl ModelList {
    pub fn new(data: Vec<Model>) -> Self {
        Self {
            object: "list".to_string(),
            data,
        }
    }
}

/// An opaque request body for the chat/completion/embedding endpoints.
///
/// Only `model` and `stream` are interpreted; the remaining fields are
/// captured verbatim and forwarded to the selected backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub model: String,
    #[serde(default)]
    pub stream: bool,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_roundtrips_unknown_fields() {
        let body = json!({
            "model": "llama3",
            "messages": [{"role": "user", "content": "hi"}],
            "temperature": 0.2,
        });
        let envelope: RequestEnvelope = serde_json::from_value(body.clone()).unwrap();
        assert_eq!(envelope.model, "llama3");
        assert!(!envelope.stream);

        let forwarded = serde_json::to_value(&envelope).unwrap();
        assert_eq!(forwarded["messages"], body["messages"]);
        assert_eq!(forwarded["temperature"], body["temperature"]);
    }

    #[test]
    fn envelope_requires_model() {
        let err = serde_json::from_value::<RequestEnvelope>(json!({"stream": true}));
        assert!(err.is_err());
    }

    #[test]
    fn model_tolerates_sparse_upstream_entries() {
        // Some servers only send the id; every other field defaults.
        let model: Model = serde_json::from_value(json!({"id": "llama3"})).unwrap();
        assert_eq!(model.id, "llama3");
        assert_eq!(model.object, "");
        assert_eq!(model.created, 0);
        assert_eq!(model.owned_by, "");
    }
}
