// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! External health-signal backend: a capability interface so the fallback
//! controller can be tested against a mock instead of a real Prometheus
//! instance.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

/// A query evaluates to a vector of numeric samples. The fallback controller
/// treats a non-empty vector whose first sample is `>= 1.0` as "event fired".
#[async_trait]
pub trait HealthBackend: Send + Sync {
    async fn query(&self, expr: &str, timeout: Duration) -> anyhow::Result<Vec<f64>>;
}

/// Queries a Prometheus-compatible instant-query endpoint.
pub struct PrometheusHealthBackend {
    base_url: String,
    bearer_token: Option<String>,
    client: reqwest::Client,
}

impl PrometheusHealthBackend {
    pub fn new(base_url: impl Into<String>, bearer_token: Option<String>) -> Self {
        Self { base_url: base_url.into(), bearer_token, client: reqwest::Client::new() }
    }
}

#[derive(Deserialize)]
struct InstantQueryResponse {
    data: InstantQueryData,
}

#[derive(Deserialize)]
struct InstantQueryData {
    result: Vec<InstantQueryResult>,
}

#[derive(Deserialize)]
struct InstantQueryResult {
    // Prometheus encodes `[timestamp, "value"]`; we only need the value.
    value: (f64, String),
}

/// Backend used when no Prometheus URL is configured: every query comes
/// back empty, so fallback workers never trigger. `FallbackController`
/// still spawns one worker per configured endpoint; they just never fire.
pub struct NoopHealthBackend;

#[async_trait]
impl HealthBackend for NoopHealthBackend {
    async fn query(&self, _expr: &str, _timeout: Duration) -> anyhow::Result<Vec<f64>> {
        Ok(Vec::new())
    }
}

#[async_trait]
impl HealthBackend for PrometheusHealthBackend {
    async fn query(&self, expr: &str, timeout: Duration) -> anyhow::Result<Vec<f64>> {
        let url = format!("{}/api/v1/query", self.base_url.trim_end_matches('/'));
        let mut req = self.client.get(url).query(&[("query", expr)]).timeout(timeout);
        if let Some(token) = &self.bearer_token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?.error_for_status()?;
        let parsed: InstantQueryResponse = resp.json().await?;
        parsed
            .data
            .result
            .into_iter()
            .map(|r| r.value.1.parse::<f64>().map_err(anyhow::Error::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_prometheus_instant_query_shape() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/api/v1/query"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "success",
                "data": {
                    "resultType": "vector",
                    "result": [{"metric": {}, "value": [1_700_000_000.0, "1"]}]
                }
            })))
            .mount(&server)
            .await;

        let backend = PrometheusHealthBackend::new(server.uri(), None);
        let samples = backend.query("up{job=\"primary\"}", Duration::from_secs(1)).await.unwrap();
        assert_eq!(samples, vec![1.0]);
    }
}
