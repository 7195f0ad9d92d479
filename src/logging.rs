// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Logging bootstrap.
//!
//! Filters come from `RUST_LOG` (default `info`). Set `LLM_ROUTER_LOG_JSONL=1`
//! to emit JSON lines instead of the human-readable format. Initialization is
//! idempotent so libraries and tests can call it freely.

use std::sync::Once;

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Environment variable that switches the log format to JSON lines.
pub const JSONL_ENV: &str = "LLM_ROUTER_LOG_JSONL";

static INIT: Once = Once::new();

pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        if jsonl_enabled() {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    });
}

fn jsonl_enabled() -> bool {
    std::env::var(JSONL_ENV).map(|v| v == "1").unwrap_or(false)
}
