// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Backend discovery.
//!
//! A [`Discoverer`] produces the fleet: an initial snapshot via
//! [`Discoverer::discover`] and push updates via [`Discoverer::watch`]. The
//! router fans events from every configured discoverer into the registry:
//! `Added` registers, `Removed` unregisters, `Updated` refreshes the model
//! index.
//!
//! `discover` and `watch` need not be mutually consistent; the registry
//! tolerates duplicate adds (idempotent) and removes of unknown ids (no-op).
//! Event channels are bounded; a discoverer that floods may drop events at
//! its own boundary, and the resulting gaps heal on the next full snapshot.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;

const EVENT_CHANNEL_CAPACITY: usize = 10;

/// A backend fleet change, as reported by a discoverer.
#[derive(Clone)]
pub enum DiscoveryEvent {
    Added(Arc<dyn Backend>),
    Removed(Arc<dyn Backend>),
    Updated(Arc<dyn Backend>),
}

impl DiscoveryEvent {
    pub fn backend(&self) -> &Arc<dyn Backend> {
        match self {
            DiscoveryEvent::Added(backend)
            | DiscoveryEvent::Removed(backend)
            | DiscoveryEvent::Updated(backend) => backend,
        }
    }
}

impl std::fmt::Debug for DiscoveryEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (kind, backend) = match self {
            DiscoveryEvent::Added(b) => ("Added", b),
            DiscoveryEvent::Removed(b) => ("Removed", b),
            DiscoveryEvent::Updated(b) => ("Updated", b),
        };
        write!(f, "DiscoveryEvent::{kind}({})", backend.id())
    }
}

/// Finds and monitors LLM backends.
#[async_trait]
pub trait Discoverer: Send + Sync {
    fn name(&self) -> &str;

    /// Initial snapshot of the fleet.
    async fn discover(&self) -> anyhow::Result<Vec<Arc<dyn Backend>>>;

    /// Opens a push channel for fleet changes. The channel closes when the
    /// discoverer shuts down or `cancel` fires.
    async fn watch(&self, cancel: CancellationToken)
        -> anyhow::Result<mpsc::Receiver<DiscoveryEvent>>;
}

/// A discoverer for a fleet that is fixed at construction time.
///
/// `discover` returns the configured backends; `watch` stays silent until
/// cancellation. Useful when the fleet comes from static configuration
/// rather than a runtime source.
pub struct StaticDiscoverer {
    backends: Vec<Arc<dyn Backend>>,
}

impl StaticDiscoverer {
    pub fn new(backends: Vec<Arc<dyn Backend>>) -> Self {
        Self { backends }
    }
}

#[async_trait]
impl Discoverer for StaticDiscoverer {
    fn name(&self) -> &str {
        "static"
    }

    async fn discover(&self) -> anyhow::Result<Vec<Arc<dyn Backend>>> {
        Ok(self.backends.clone())
    }

    async fn watch(
        &self,
        cancel: CancellationToken,
    ) -> anyhow::Result<mpsc::Receiver<DiscoveryEvent>> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        // Hold the sender open until shutdown so the watch task stays alive;
        // no events are ever produced for a static fleet.
        tokio::spawn(async move {
            cancel.cancelled().await;
            drop(tx);
        });
        Ok(rx)
    }
}
