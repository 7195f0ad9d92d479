// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The OpenAI error envelope: `{"error":{"message","type","param","code"}}`.
//!
//! Errors are surfaced to clients in this shape with the matching HTTP
//! status. They are never retried here; retry is a caller concern.

use axum::{http::StatusCode, Json};
use serde::{Deserialize, Serialize};

pub const ERROR_TYPE_INVALID_REQUEST: &str = "invalid_request_error";
pub const ERROR_TYPE_NOT_FOUND: &str = "not_found_error";
pub const ERROR_TYPE_SERVER: &str = "server_error";

pub type ErrorResponse = (StatusCode, Json<ApiError>);

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    pub param: Option<String>,
    pub code: Option<String>,
}

impl ApiError {
    fn new(message: impl Into<String>, error_type: &str, code: Option<String>) -> Self {
        Self {
            error: ErrorDetail {
                message: message.into(),
                error_type: error_type.to_string(),
                param: None,
                code,
            },
        }
    }

    /// Malformed request body; 400.
    pub fn invalid_request(message: impl Into<String>) -> ErrorResponse {
        (
            StatusCode::BAD_REQUEST,
            Json(Self::new(message, ERROR_TYPE_INVALID_REQUEST, None)),
        )
    }

    /// Lookup returned nothing and no default backend resolved; 404.
    pub fn model_not_found(model: &str) -> ErrorResponse {
        (
            StatusCode::NOT_FOUND,
            Json(Self::new(
                format!("model not found: {model}"),
                ERROR_TYPE_NOT_FOUND,
                Some("model_not_found".to_string()),
            )),
        )
    }

    /// A backend call failed; 500. The backend's health bit is not touched.
    pub fn server_error(message: impl Into<String>) -> ErrorResponse {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(Self::new(message, ERROR_TYPE_SERVER, None)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_shape_matches_the_openai_wire() {
        let (status, Json(body)) = ApiError::model_not_found("llama3");
        assert_eq!(status, StatusCode::NOT_FOUND);

        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["error"]["message"], "model not found: llama3");
        assert_eq!(value["error"]["type"], "not_found_error");
        assert_eq!(value["error"]["code"], "model_not_found");
        assert!(value["error"]["param"].is_null());
    }
}
