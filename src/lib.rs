// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! # llm-router
//!
//! An OpenAI-compatible HTTP reverse proxy that fronts a dynamic fleet of LLM
//! inference servers (vLLM, Ollama, llama.cpp, LM Studio, or anything else
//! that speaks the OpenAI wire protocol).
//!
//! Clients issue standard chat/completion/embedding requests; the router picks
//! a healthy backend serving the requested model and forwards the request,
//! relaying server-sent events back unchanged when the client asks for
//! streaming.
//!
//! The crate is organized around a routing and lifecycle plane:
//!
//! - [`registry::BackendRegistry`] indexes backends by id and by the models
//!   they serve, and resolves `(model, session?)` to a backend under
//!   concurrent reads and mutation.
//! - [`discovery::Discoverer`] implementations feed add/remove/update events
//!   into the registry.
//! - [`router::Router`] composes the registry, the discovery fan-in, and a
//!   periodic health loop behind an idempotent start/stop surface.
//! - [`http::service::HttpService`] exposes the OpenAI-compatible endpoints
//!   over axum.
//!
//! Session affinity uses FNV-1a 32-bit consistent hashing over the sorted
//! backend fleet, so the same `X-Session-ID` lands on the same backend until
//! its health changes, and returns to it once it recovers.

pub mod backend;
pub mod discovery;
pub mod http;
pub mod logging;
pub mod protocols;
pub mod registry;
pub mod router;
pub mod streaming;

pub use backend::{Backend, BackendError, BackendType, GenericBackend, StreamError, StreamEvent};
pub use discovery::{Discoverer, DiscoveryEvent, StaticDiscoverer};
pub use registry::{
    BackendRegistry, LookupResult, RegistryError, SESSION_BROKEN_HEADER, SESSION_HEADER,
};
pub use router::Router;
