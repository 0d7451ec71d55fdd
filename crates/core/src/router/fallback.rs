// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-endpoint background worker that queries an external health-signal
//! backend and flips the endpoint active/inactive with hysteresis.
//!
//! A `tokio::time::sleep` driving a `tokio::select!` against a shutdown
//! signal, except the tick period itself changes after each event (the
//! dwell), and the decision drives a routing-table flip rather than a
//! simple counter.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::health::HealthBackend;

use super::{Endpoint, ModelRouter};

/// Hysteresis state for a single endpoint's health worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    Normal,
    Fallback,
}

pub struct FallbackController {
    router: Arc<ModelRouter>,
    backend: Arc<dyn HealthBackend>,
    default_check_interval: Duration,
}

impl FallbackController {
    pub fn new(
        router: Arc<ModelRouter>,
        backend: Arc<dyn HealthBackend>,
        default_check_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self { router, backend, default_check_interval })
    }

    /// Spawns one worker per endpoint currently carrying a `fallback`
    /// config. Endpoints added later via `SetRoutes` are not picked up
    /// until the controller is respawned — acceptable since routes are
    /// loaded once at startup in this deployment shape.
    pub async fn spawn_workers(
        self: &Arc<Self>,
        shutdown: CancellationToken,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let endpoints = self.router.fallback_endpoints().await;
        endpoints
            .into_iter()
            .map(|(model_id, endpoint)| {
                let controller = Arc::clone(self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { controller.run_worker(model_id, endpoint, shutdown).await })
            })
            .collect()
    }

    async fn run_worker(self: Arc<Self>, model_id: String, endpoint: Endpoint, shutdown: CancellationToken) {
        let Some(cfg) = endpoint.fallback.clone() else { return };
        let provider = endpoint.provider;
        let mut state = WorkerState::Normal;
        let mut wait = Duration::from_millis(cfg.check_interval_ms);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }

            let query = match state {
                WorkerState::Normal => &cfg.trigger_query,
                WorkerState::Fallback => &cfg.recover_query,
            };
            let timeout =
                Duration::from_millis(cfg.check_interval_ms).max(self.default_check_interval);

            let samples = tokio::select! {
                _ = shutdown.cancelled() => return,
                result = self.backend.query(query, timeout) => result,
            };

            match samples {
                Ok(samples) => {
                    let event = samples.first().is_some_and(|v| *v >= 1.0);
                    if event {
                        state = match state {
                            WorkerState::Normal => {
                                self.router.trigger_fallback(&model_id, &provider).await;
                                WorkerState::Fallback
                            }
                            WorkerState::Fallback => {
                                self.router.recover_fallback(&model_id, &provider).await;
                                WorkerState::Normal
                            }
                        };
                        wait = Duration::from_millis(cfg.dwell_ms);
                    } else {
                        wait = Duration::from_millis(cfg.check_interval_ms);
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        model_id = %model_id,
                        provider = %provider,
                        error = %err,
                        "fallback health query failed"
                    );
                    wait = Duration::from_millis(cfg.check_interval_ms);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use crate::router::{EndpointFallback, PlatformAffinity, Route, RoutingTable};

    use super::*;

    struct ScriptedBackend {
        calls: AtomicU32,
    }

    #[async_trait]
    impl HealthBackend for ScriptedBackend {
        async fn query(&self, _expr: &str, _timeout: Duration) -> anyhow::Result<Vec<f64>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            // First tick fires the trigger event, every later tick is quiet.
            Ok(if n == 0 { vec![1.0] } else { vec![0.0] })
        }
    }

    fn endpoint(provider: &str, fallback: Option<EndpointFallback>) -> Endpoint {
        Endpoint {
            provider: provider.to_owned(),
            base_url: "https://example.com".to_owned(),
            api_key: "key".to_owned(),
            model: "gpt".to_owned(),
            api_type: "openai".to_owned(),
            token_multiplier: 1.0,
            platform_affinity: PlatformAffinity::Any,
            fallback,
        }
    }

    #[tokio::test]
    async fn trigger_event_moves_primary_out_and_backup_in() {
        let mut table = RoutingTable::default();
        table.routes.insert(
            "gpt-4".to_owned(),
            Route {
                active_endpoints: vec![endpoint(
                    "primary",
                    Some(EndpointFallback {
                        trigger_query: "trigger".to_owned(),
                        recover_query: "recover".to_owned(),
                        check_interval_ms: 10,
                        dwell_ms: 10_000,
                    }),
                )],
                inactive_endpoints: vec![endpoint("backup", None)],
                ..Default::default()
            },
        );
        let router = ModelRouter::new(table);
        let backend = Arc::new(ScriptedBackend { calls: AtomicU32::new(0) });
        let controller = FallbackController::new(Arc::clone(&router), backend, Duration::from_millis(10));

        let shutdown = CancellationToken::new();
        let handles = controller.spawn_workers(shutdown.clone()).await;

        tokio::time::sleep(Duration::from_millis(60)).await;
        shutdown.cancel();
        for handle in handles {
            let _ = handle.await;
        }

        let routes = router.get_routes().await;
        let route = routes.routes.get("gpt-4").unwrap();
        assert_eq!(route.active_endpoints.len(), 1);
        assert_eq!(route.active_endpoints[0].provider, "backup");
        assert_eq!(route.inactive_endpoints[0].provider, "primary");
    }
}
