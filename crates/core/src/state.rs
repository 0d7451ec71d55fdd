// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::RelayConfig;
use crate::health::HealthBackend;
use crate::ingress::upstream::UpstreamClient;
use crate::persistence::PersistenceSink;
use crate::router::fallback::FallbackController;
use crate::router::ModelRouter;
use crate::session::SessionRegistry;
use crate::stop::bus::ClusterBus;
use crate::stop::StopPlane;

/// Top-level `Arc`'d bag tying every subsystem together, handed to axum as
/// shared state.
pub struct RelayState {
    pub config: RelayConfig,
    pub registry: Arc<SessionRegistry>,
    pub router: Arc<ModelRouter>,
    pub stop_plane: StopPlane,
    pub upstream_client: UpstreamClient,
    pub cluster_bus: Option<Arc<dyn ClusterBus>>,
    pub fallback_controller: Arc<FallbackController>,
    pub shutdown: CancellationToken,
}

impl RelayState {
    pub fn new(
        config: RelayConfig,
        registry: Arc<SessionRegistry>,
        router: Arc<ModelRouter>,
        upstream_client: UpstreamClient,
        health_backend: Arc<dyn HealthBackend>,
        cluster_bus: Option<Arc<dyn ClusterBus>>,
        shutdown: CancellationToken,
    ) -> Self {
        let stop_plane = StopPlane::new(
            Arc::clone(&registry),
            cluster_bus.clone(),
            config.distributed_cancel_timeout(),
        );
        let fallback_controller = FallbackController::new(
            Arc::clone(&router),
            health_backend,
            config.fallback_check_interval(),
        );
        Self {
            config,
            registry,
            router,
            stop_plane,
            upstream_client,
            cluster_bus,
            fallback_controller,
            shutdown,
        }
    }
}

/// `persistence` is owned by the `SessionRegistry` (every `StreamSession` it
/// creates shares one sink), not by `RelayState` directly — kept here as a
/// type alias so callers building a registry don't need to import the trait
/// from two places.
pub type Persistence = Arc<dyn PersistenceSink>;
