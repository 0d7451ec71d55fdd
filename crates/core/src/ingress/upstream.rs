// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The detached upstream-request task: a streaming request's upstream HTTP
//! call is owned by a task independent of the client's request lifecycle, so
//! the canonical transcript survives client disconnect.

use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::session::UpstreamBody;

/// An owned HTTP client independent of any single client request, built
/// once at startup from the connection-pool settings in `RelayConfig`.
#[derive(Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    response_header_timeout: Duration,
}

impl UpstreamClient {
    pub fn new(config: &RelayConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(config.proxy_max_idle_conns_per_host)
            .pool_idle_timeout(config.proxy_idle_conn_timeout())
            .build()?;
        Ok(Self { client, response_header_timeout: config.response_header_timeout() })
    }

    /// Issues the upstream chat-completions request and returns a boxed
    /// byte stream of the (SSE) response body once headers arrive. The
    /// request's own HTTP context ends here; everything after this call is
    /// driven by `StreamSession::attach_upstream_and_start`.
    pub async fn start_streaming_request(
        &self,
        url: &str,
        api_key: &str,
        body: Vec<u8>,
    ) -> Result<UpstreamBody, RelayError> {
        let request = self
            .client
            .post(url)
            .bearer_auth(api_key)
            .header("accept", "text/event-stream")
            .header("content-type", "application/json")
            .timeout(self.response_header_timeout)
            .body(body);

        let response = request.send().await.map_err(|err| {
            tracing::warn!(url, error = %err, "upstream dial failed");
            RelayError::UpstreamDial
        })?;

        let response = response.error_for_status().map_err(|err| {
            tracing::warn!(url, error = %err, "upstream returned an error status");
            RelayError::UpstreamHeader
        })?;

        let stream = response.bytes_stream().map(|item| {
            item.map_err(|err: reqwest::Error| err.to_string()).map(|b: Bytes| b)
        });
        Ok(Box::pin(stream))
    }

    /// Non-streaming passthrough: collects the whole response body and
    /// returns it verbatim for the caller to extract content/usage from.
    pub async fn send_non_streaming_request(
        &self,
        url: &str,
        api_key: &str,
        body: Vec<u8>,
    ) -> Result<Bytes, RelayError> {
        let response = self
            .client
            .post(url)
            .bearer_auth(api_key)
            .header("content-type", "application/json")
            .timeout(self.response_header_timeout)
            .body(body)
            .send()
            .await
            .map_err(|err| {
                tracing::warn!(url, error = %err, "upstream dial failed");
                RelayError::UpstreamDial
            })?;

        let response = response.error_for_status().map_err(|_| RelayError::UpstreamHeader)?;
        response.bytes().await.map_err(|_| RelayError::UpstreamRead)
    }
}
