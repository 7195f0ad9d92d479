// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Backend registry and model-to-backend routing.
//!
//! The registry indexes backends two ways: by id, and by the models each one
//! advertises. Both indexes live behind a single reader-writer lock; every
//! operation takes the lock for its whole duration, so readers never observe
//! partial state. Mutation paths fetch `/v1/models` while holding the write
//! lock, which is why the lock is async.
//!
//! Lock order is registry then backend, never the reverse.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;

use crate::backend::{Backend, BackendError};
use crate::protocols::Model;

/// HTTP header carrying the client's session id for affinity routing.
pub const SESSION_HEADER: &str = "X-Session-ID";

/// Response header set when session affinity could not be maintained.
pub const SESSION_BROKEN_HEADER: &str = "X-Session-Broken";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("backend not found: {0}")]
    BackendNotFound(String),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Result of a session-affinity lookup.
pub struct LookupResult {
    pub backend: Arc<dyn Backend>,

    /// True when a session was supplied but its preferred backend was
    /// unhealthy, so a fallback was used (or no healthy backend exists).
    pub session_broken: bool,
}

#[derive(Default)]
struct RegistryIndex {
    /// backend id -> handle
    backends: HashMap<String, Arc<dyn Backend>>,
    /// model id -> backend ids, in insertion order
    models: HashMap<String, Vec<String>>,
}

impl RegistryIndex {
    fn add_model_mapping(&mut self, model_id: &str, backend_id: &str) {
        let backends = self.models.entry(model_id.to_string()).or_default();
        if !backends.iter().any(|id| id == backend_id) {
            backends.push(backend_id.to_string());
        }
    }

    fn remove_backend_mappings(&mut self, backend_id: &str) {
        self.models.retain(|_, backend_ids| {
            backend_ids.retain(|id| id != backend_id);
            !backend_ids.is_empty()
        });
    }
}

/// Indexes backends and resolves `(model, session?)` to a handle.
///
/// Put it in an `Arc`; lookups return `Arc<dyn Backend>` clones that stay
/// valid even if the backend is unregistered while a request is in flight.
pub struct BackendRegistry {
    inner: RwLock<RegistryIndex>,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryIndex::default()),
        }
    }

    /// Adds a backend and indexes its models.
    ///
    /// Registering an id that already exists replaces the old handle; its
    /// model mappings are pruned first so a backend that now serves fewer
    /// models leaves no stale routes. Failure to fetch the model list is
    /// non-fatal: the backend stays registered and serves no models until a
    /// refresh succeeds.
    pub async fn register(&self, backend: Arc<dyn Backend>) {
        let mut inner = self.inner.write().await;

        let id = backend.id().to_string();
        if inner.backends.contains_key(&id) {
            inner.remove_backend_mappings(&id);
        }
        inner.backends.insert(id.clone(), backend.clone());

        match backend.models().await {
            Ok(models) => {
                for model in &models {
                    inner.add_model_mapping(&model.id, &id);
                }
            }
            Err(err) => {
                tracing::debug!(id = %id, error = %err, "backend registered without models");
            }
        }
    }

    /// Removes a backend and every model mapping that references it.
    pub async fn unregister(&self, id: &str) {
        let mut inner = self.inner.write().await;
        inner.backends.remove(id);
        inner.remove_backend_mappings(id);
    }

    /// Drops all model mappings for a backend and re-indexes from a fresh
    /// fetch. A failed fetch leaves the backend with no models indexed; a
    /// failed refresh must not leave stale routes.
    pub async fn refresh_models(&self, id: &str) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().await;

        let backend = inner
            .backends
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::BackendNotFound(id.to_string()))?;

        inner.remove_backend_mappings(id);

        let models = backend.models().await?;
        for model in &models {
            inner.add_model_mapping(&model.id, id);
        }
        Ok(())
    }

    /// Finds the first healthy backend serving `model_id`, scanning in
    /// insertion order. If none is healthy the first backend is returned
    /// anyway so the caller can surface a meaningful upstream error rather
    /// than a 404.
    pub async fn lookup_by_model(&self, model_id: &str) -> Option<Arc<dyn Backend>> {
        let inner = self.inner.read().await;

        let backend_ids = inner.models.get(model_id)?;
        if backend_ids.is_empty() {
            return None;
        }

        for id in backend_ids {
            if let Some(backend) = inner.backends.get(id) {
                if backend.is_healthy() {
                    return Some(backend.clone());
                }
            }
        }

        inner.backends.get(&backend_ids[0]).cloned()
    }

    /// Session-affinity lookup via consistent hashing.
    ///
    /// An empty `session_id` behaves exactly like [`Self::lookup_by_model`].
    /// Otherwise the preferred backend is the session hash over *all*
    /// backends for the model, sorted by id so the result is independent of
    /// registration order. Hashing over all backends (not just healthy ones)
    /// before checking health means sessions return to their preferred
    /// backend when it recovers. While it is down, the hash is re-taken over
    /// the healthy subset, which redistributes those sessions
    /// deterministically and marks them broken.
    pub async fn lookup_with_session(
        &self,
        model_id: &str,
        session_id: &str,
    ) -> Option<LookupResult> {
        let inner = self.inner.read().await;

        let backend_ids = inner.models.get(model_id)?;
        if backend_ids.is_empty() {
            return None;
        }

        if session_id.is_empty() {
            for id in backend_ids {
                if let Some(backend) = inner.backends.get(id) {
                    if backend.is_healthy() {
                        return Some(LookupResult {
                            backend: backend.clone(),
                            session_broken: false,
                        });
                    }
                }
            }
            return inner
                .backends
                .get(&backend_ids[0])
                .map(|backend| LookupResult {
                    backend: backend.clone(),
                    session_broken: false,
                });
        }

        let mut all: Vec<Arc<dyn Backend>> = Vec::with_capacity(backend_ids.len());
        let mut healthy: Vec<Arc<dyn Backend>> = Vec::new();
        for id in backend_ids {
            let Some(backend) = inner.backends.get(id) else {
                continue;
            };
            all.push(backend.clone());
            if backend.is_healthy() {
                healthy.push(backend.clone());
            }
        }

        if all.is_empty() {
            return None;
        }

        all.sort_by(|a, b| a.id().cmp(b.id()));
        healthy.sort_by(|a, b| a.id().cmp(b.id()));

        let preferred = all[session_index(session_id, all.len())].clone();
        if preferred.is_healthy() {
            return Some(LookupResult {
                backend: preferred,
                session_broken: false,
            });
        }

        if !healthy.is_empty() {
            let fallback = healthy[session_index(session_id, healthy.len())].clone();
            return Some(LookupResult {
                backend: fallback,
                session_broken: true,
            });
        }

        // No healthy option at all; hand back the preferred backend and let
        // the caller fail upstream or attempt anyway.
        Some(LookupResult {
            backend: preferred,
            session_broken: true,
        })
    }

    pub async fn lookup_by_id(&self, id: &str) -> Option<Arc<dyn Backend>> {
        self.inner.read().await.backends.get(id).cloned()
    }

    pub async fn all_backends(&self) -> Vec<Arc<dyn Backend>> {
        self.inner.read().await.backends.values().cloned().collect()
    }

    /// The deduplicated union of every responding backend's model list.
    ///
    /// As a side effect the model index is refreshed for each backend that
    /// answers, so lookups work even if a backend registered before its
    /// models were available.
    pub async fn all_models(&self) -> Vec<Model> {
        let mut inner = self.inner.write().await;

        let mut backends: Vec<Arc<dyn Backend>> = inner.backends.values().cloned().collect();
        backends.sort_by(|a, b| a.id().cmp(b.id()));

        let mut seen = HashSet::new();
        let mut all_models = Vec::new();

        for backend in backends {
            let models = match backend.models().await {
                Ok(models) => models,
                Err(_) => continue,
            };
            for model in models {
                inner.add_model_mapping(&model.id, backend.id());
                if seen.insert(model.id.clone()) {
                    all_models.push(model);
                }
            }
        }

        all_models
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.backends.len()
    }

    /// The number of distinct models currently indexed.
    pub async fn model_count(&self) -> usize {
        self.inner.read().await.models.len()
    }
}

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// FNV-1a 32-bit over the UTF-8 bytes of the input.
///
/// The exact function matters: it keeps session routing reproducible across
/// restarts and across implementations in other languages.
fn fnv1a_32(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

fn session_index(session_id: &str, count: usize) -> usize {
    (fnv1a_32(session_id.as_bytes()) % count as u32) as usize
}
