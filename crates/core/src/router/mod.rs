// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Maps `(modelId, platform)` to a provider endpoint via platform-affinity
//! filtering and round-robin. The routing table is swapped copy-on-write
//! under a single lock: writers clone-mutate-replace the `Arc`, readers
//! never block.

pub mod fallback;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::RelayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformAffinity {
    Mobile,
    Desktop,
    Any,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub provider: String,
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub api_type: String,
    pub token_multiplier: f64,
    pub platform_affinity: PlatformAffinity,
    pub fallback: Option<EndpointFallback>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointFallback {
    pub trigger_query: String,
    pub recover_query: String,
    pub check_interval_ms: u64,
    pub dwell_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Route {
    pub active_endpoints: Vec<Endpoint>,
    pub inactive_endpoints: Vec<Endpoint>,
    #[serde(skip)]
    pub round_robin_counter: Arc<AtomicUsize>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct RoutingTable {
    pub routes: HashMap<String, Route>,
}

pub struct ModelRouter {
    table: RwLock<Arc<RoutingTable>>,
}

impl ModelRouter {
    pub fn new(initial: RoutingTable) -> Arc<Self> {
        Arc::new(Self { table: RwLock::new(Arc::new(initial)) })
    }

    /// `RouteModel`: platform-affinity filter, falling back to any-affinity
    /// endpoints, then round-robin among the survivors.
    pub async fn route_model(
        &self,
        model_id: &str,
        platform: PlatformAffinity,
    ) -> Result<Endpoint, RelayError> {
        let table = self.get_routes().await;
        let route = table.routes.get(model_id).ok_or(RelayError::NoProvider)?;

        let affine: Vec<&Endpoint> = route
            .active_endpoints
            .iter()
            .filter(|e| e.platform_affinity == platform)
            .collect();
        let candidates: Vec<&Endpoint> = if affine.is_empty() {
            route.active_endpoints.iter().filter(|e| e.platform_affinity == PlatformAffinity::Any).collect()
        } else {
            affine
        };

        if candidates.is_empty() {
            return Err(RelayError::NoActiveEndpoint);
        }

        let idx = route.round_robin_counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Ok(candidates[idx].clone())
    }

    pub async fn get_routes(&self) -> Arc<RoutingTable> {
        Arc::clone(&*self.table.read().await)
    }

    /// `SetRoutes`: copy-on-write swap of the entire table.
    pub async fn set_routes(&self, routes: RoutingTable) {
        *self.table.write().await = Arc::new(routes);
    }

    /// Fallback Controller trigger event: move `provider`'s endpoint for
    /// `model_id` active → inactive, then move one backup (an inactive
    /// endpoint with no `fallback` config) inactive → active.
    pub async fn trigger_fallback(&self, model_id: &str, provider: &str) {
        self.mutate_route(model_id, |route| {
            if let Some(pos) = route.active_endpoints.iter().position(|e| e.provider == provider) {
                let endpoint = route.active_endpoints.remove(pos);
                route.inactive_endpoints.push(endpoint);
                if let Some(backup_pos) =
                    route.inactive_endpoints.iter().position(|e| e.fallback.is_none())
                {
                    let backup = route.inactive_endpoints.remove(backup_pos);
                    route.active_endpoints.push(backup);
                }
            }
        })
        .await;
    }

    /// Fallback Controller recover event: the reverse of `trigger_fallback`.
    pub async fn recover_fallback(&self, model_id: &str, provider: &str) {
        self.mutate_route(model_id, |route| {
            if let Some(pos) = route.inactive_endpoints.iter().position(|e| e.provider == provider) {
                let endpoint = route.inactive_endpoints.remove(pos);
                route.active_endpoints.push(endpoint);
                if let Some(backup_pos) =
                    route.active_endpoints.iter().position(|e| e.fallback.is_none())
                {
                    let backup = route.active_endpoints.remove(backup_pos);
                    route.inactive_endpoints.push(backup);
                }
            }
        })
        .await;
    }

    /// All endpoints across every route that carry a `fallback` config,
    /// for the controller to spawn one worker per endpoint at startup.
    pub async fn fallback_endpoints(&self) -> Vec<(String, Endpoint)> {
        let table = self.get_routes().await;
        table
            .routes
            .iter()
            .flat_map(|(model_id, route)| {
                route
                    .active_endpoints
                    .iter()
                    .chain(route.inactive_endpoints.iter())
                    .filter(|e| e.fallback.is_some())
                    .map(move |e| (model_id.clone(), e.clone()))
            })
            .collect()
    }

    async fn mutate_route(&self, model_id: &str, f: impl FnOnce(&mut Route)) {
        let mut guard = self.table.write().await;
        let mut table = (**guard).clone();
        if let Some(route) = table.routes.get_mut(model_id) {
            f(route);
        }
        *guard = Arc::new(table);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(name: &str, affinity: PlatformAffinity) -> Endpoint {
        Endpoint {
            provider: name.to_owned(),
            base_url: format!("https://{name}.example.com"),
            api_key: "key".to_owned(),
            model: "gpt".to_owned(),
            api_type: "openai".to_owned(),
            token_multiplier: 1.0,
            platform_affinity: affinity,
            fallback: None,
        }
    }

    #[tokio::test]
    async fn no_route_is_no_provider() {
        let router = ModelRouter::new(RoutingTable::default());
        let err = router.route_model("gpt-4", PlatformAffinity::Any).await.unwrap_err();
        assert_eq!(err, RelayError::NoProvider);
    }

    #[tokio::test]
    async fn empty_active_list_is_no_active_endpoint() {
        let mut table = RoutingTable::default();
        table.routes.insert("gpt-4".to_owned(), Route::default());
        let router = ModelRouter::new(table);
        let err = router.route_model("gpt-4", PlatformAffinity::Any).await.unwrap_err();
        assert_eq!(err, RelayError::NoActiveEndpoint);
    }

    #[tokio::test]
    async fn round_robin_distributes_evenly() {
        let mut table = RoutingTable::default();
        table.routes.insert(
            "gpt-4".to_owned(),
            Route {
                active_endpoints: vec![
                    endpoint("a", PlatformAffinity::Any),
                    endpoint("b", PlatformAffinity::Any),
                ],
                ..Default::default()
            },
        );
        let router = ModelRouter::new(table);

        let mut counts = HashMap::new();
        for _ in 0..20 {
            let ep = router.route_model("gpt-4", PlatformAffinity::Any).await.unwrap();
            *counts.entry(ep.provider).or_insert(0) += 1;
        }
        assert_eq!(counts.get("a"), Some(&10));
        assert_eq!(counts.get("b"), Some(&10));
    }

    #[tokio::test]
    async fn platform_affinity_falls_back_to_any() {
        let mut table = RoutingTable::default();
        table.routes.insert(
            "gpt-4".to_owned(),
            Route {
                active_endpoints: vec![endpoint("a", PlatformAffinity::Any)],
                ..Default::default()
            },
        );
        let router = ModelRouter::new(table);
        let ep = router.route_model("gpt-4", PlatformAffinity::Mobile).await.unwrap();
        assert_eq!(ep.provider, "a");
    }

    fn round_robin_counts(n_endpoints: usize, rounds: usize) -> HashMap<String, usize> {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let active: Vec<Endpoint> = (0..n_endpoints)
                .map(|i| endpoint(&format!("ep{i}"), PlatformAffinity::Any))
                .collect();
            let mut table = RoutingTable::default();
            table.routes.insert(
                "gpt-4".to_owned(),
                Route { active_endpoints: active, ..Default::default() },
            );
            let router = ModelRouter::new(table);

            let mut counts = HashMap::new();
            for _ in 0..(n_endpoints * rounds) {
                let ep = router.route_model("gpt-4", PlatformAffinity::Any).await.unwrap();
                *counts.entry(ep.provider).or_insert(0usize) += 1;
            }
            counts
        })
    }

    proptest::proptest! {
        /// Whatever the active-endpoint count, N consecutive calls through a
        /// fresh router visit every endpoint the same number of times
        /// (N divisible by the count) — round-robin never skews.
        #[test]
        fn round_robin_is_fair_for_any_endpoint_count(n_endpoints in 1usize..8, rounds in 1usize..6) {
            let counts = round_robin_counts(n_endpoints, rounds);
            proptest::prop_assert_eq!(counts.len(), n_endpoints);
            for count in counts.values() {
                proptest::prop_assert_eq!(*count, rounds);
            }
        }
    }
}
