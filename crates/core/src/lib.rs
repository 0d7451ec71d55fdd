// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! streamrelay: stream session broadcast, registry, model routing with
//! fallback, and cross-instance stop plane for a chat-completion gateway.

pub mod config;
pub mod error;
pub mod health;
pub mod ingress;
pub mod persistence;
pub mod router;
pub mod session;
pub mod state;
pub mod stop;
pub mod transport;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::RelayConfig;
use crate::health::{HealthBackend, NoopHealthBackend, PrometheusHealthBackend};
use crate::ingress::upstream::UpstreamClient;
use crate::persistence::NoopPersistenceSink;
use crate::router::{ModelRouter, RoutingTable};
use crate::session::SessionRegistry;
use crate::state::RelayState;
use crate::transport::build_router;

/// Run the relay until shutdown.
pub async fn run(config: RelayConfig) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let shutdown = CancellationToken::new();

    let routing_table = match &config.routes_config {
        Some(path) => {
            let contents = std::fs::read_to_string(path)?;
            serde_json::from_str(&contents)?
        }
        None => RoutingTable::default(),
    };
    let router = ModelRouter::new(routing_table);

    let registry = SessionRegistry::new(
        config.session_pending_ttl(),
        config.session_terminal_grace(),
        config.upstream_max_bytes,
        Arc::new(NoopPersistenceSink),
    );

    let upstream_client = UpstreamClient::new(&config)?;

    let health_backend: Arc<dyn HealthBackend> = match &config.fallback_prometheus_url {
        Some(url) => {
            Arc::new(PrometheusHealthBackend::new(url.clone(), config.fallback_prometheus_token.clone()))
        }
        None => Arc::new(NoopHealthBackend),
    };

    let cluster_bus: Option<Arc<dyn crate::stop::bus::ClusterBus>> =
        connect_cluster_bus(&config, Arc::clone(&registry), shutdown.clone()).await?;

    let state = Arc::new(RelayState::new(
        config,
        Arc::clone(&registry),
        Arc::clone(&router),
        upstream_client,
        health_backend,
        cluster_bus,
        shutdown.clone(),
    ));

    Arc::clone(&registry).spawn_reaper(shutdown.clone());
    state.fallback_controller.spawn_workers(shutdown.clone()).await;

    tracing::info!(%addr, "streamrelay listening");
    let router = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, router).with_graceful_shutdown(shutdown.cancelled_owned()).await?;

    Ok(())
}

#[cfg(feature = "cluster-bus")]
async fn connect_cluster_bus(
    config: &RelayConfig,
    registry: Arc<SessionRegistry>,
    shutdown: CancellationToken,
) -> anyhow::Result<Option<Arc<dyn crate::stop::bus::ClusterBus>>> {
    let Some(url) = &config.cluster_bus_url else { return Ok(None) };
    let instance_id = uuid::Uuid::new_v4().to_string();
    let bus = crate::stop::bus::NatsClusterBus::connect(
        url,
        config.cluster_bus_prefix.clone(),
        instance_id,
        None,
    )
    .await?;
    bus.spawn_responder(registry, shutdown);
    Ok(Some(bus as Arc<dyn crate::stop::bus::ClusterBus>))
}

#[cfg(not(feature = "cluster-bus"))]
async fn connect_cluster_bus(
    config: &RelayConfig,
    _registry: Arc<SessionRegistry>,
    _shutdown: CancellationToken,
) -> anyhow::Result<Option<Arc<dyn crate::stop::bus::ClusterBus>>> {
    if config.cluster_bus_url.is_some() {
        tracing::warn!("RELAY_CLUSTER_BUS_URL set but built without the cluster-bus feature");
    }
    Ok(None)
}
