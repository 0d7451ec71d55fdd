// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

/// Configuration for the streamrelay proxy.
#[derive(Debug, Clone, clap::Args)]
pub struct RelayConfig {
    /// Host to bind on.
    #[arg(long, default_value = "0.0.0.0", env = "RELAY_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8080, env = "RELAY_PORT")]
    pub port: u16,

    /// Bearer token for API auth. If unset, auth is disabled.
    #[arg(long, env = "RELAY_AUTH_TOKEN")]
    pub auth_token: Option<String>,

    /// How long a pending session may wait for its upstream to attach before
    /// being force-completed with `PendingTimeout`.
    #[arg(long, default_value_t = 30_000, env = "RELAY_SESSION_PENDING_TTL_MS")]
    pub session_pending_ttl_ms: u64,

    /// How long a terminal session remains reachable for status/replay
    /// before the registry reaper evicts it.
    #[arg(long, default_value_t = 300_000, env = "RELAY_SESSION_TERMINAL_GRACE_MS")]
    pub session_terminal_grace_ms: u64,

    /// Per-subscriber bounded-queue capacity.
    #[arg(long, default_value_t = 100, env = "RELAY_SUBSCRIBER_BUFFER_SIZE")]
    pub subscriber_buffer_size: usize,

    /// Per-session cap on stored chunk bytes before the session errors out
    /// with `OversizedStream`.
    #[arg(long, default_value_t = 16 * 1024 * 1024, env = "RELAY_UPSTREAM_MAX_BYTES")]
    pub upstream_max_bytes: usize,

    /// Upstream HTTP connection-pool: max idle connections per host.
    #[arg(long, default_value_t = 32, env = "RELAY_PROXY_MAX_IDLE_CONNS_PER_HOST")]
    pub proxy_max_idle_conns_per_host: usize,

    /// Upstream HTTP connection-pool: idle connection timeout in milliseconds.
    #[arg(long, default_value_t = 90_000, env = "RELAY_PROXY_IDLE_CONN_TIMEOUT_MS")]
    pub proxy_idle_conn_timeout_ms: u64,

    /// Deadline for the upstream to send response headers.
    #[arg(long, default_value_t = 120_000, env = "RELAY_RESPONSE_HEADER_TIMEOUT_MS")]
    pub response_header_timeout_ms: u64,

    /// Default fallback-controller check period; also the health-query timeout.
    #[arg(long, default_value_t = 15_000, env = "RELAY_FALLBACK_CHECK_INTERVAL_MS")]
    pub fallback_check_interval_ms: u64,

    /// Prometheus-compatible health-signal backend URL.
    #[arg(long, env = "RELAY_FALLBACK_PROMETHEUS_URL")]
    pub fallback_prometheus_url: Option<String>,

    /// Bearer token for the health-signal backend, if it requires auth.
    #[arg(long, env = "RELAY_FALLBACK_PROMETHEUS_TOKEN")]
    pub fallback_prometheus_token: Option<String>,

    /// Maximum accepted byte length for `chatId`.
    #[arg(long, default_value_t = 256, env = "RELAY_MAX_CHAT_ID_LENGTH")]
    pub max_chat_id_length: usize,

    /// Maximum accepted byte length for `messageId`.
    #[arg(long, default_value_t = 256, env = "RELAY_MAX_MESSAGE_ID_LENGTH")]
    pub max_message_id_length: usize,

    /// NATS URL for the distributed-cancel cluster bus. If unset, `Stop`
    /// never attempts a cross-instance cancel.
    #[arg(long, env = "RELAY_CLUSTER_BUS_URL")]
    pub cluster_bus_url: Option<String>,

    /// Subject prefix for cluster-bus cancel requests/replies.
    #[arg(long, default_value = "streamrelay", env = "RELAY_CLUSTER_BUS_PREFIX")]
    pub cluster_bus_prefix: String,

    /// Round-trip deadline for a distributed cancel request.
    #[arg(long, default_value_t = 2_000, env = "RELAY_DISTRIBUTED_CANCEL_TIMEOUT_MS")]
    pub distributed_cancel_timeout_ms: u64,

    /// Path to the model routing table, as JSON (`{modelId: Route}`). If
    /// unset, the router starts with an empty table.
    #[arg(long, env = "RELAY_ROUTES_CONFIG")]
    pub routes_config: Option<std::path::PathBuf>,
}

impl RelayConfig {
    pub fn session_pending_ttl(&self) -> Duration {
        Duration::from_millis(self.session_pending_ttl_ms)
    }

    pub fn session_terminal_grace(&self) -> Duration {
        Duration::from_millis(self.session_terminal_grace_ms)
    }

    pub fn proxy_idle_conn_timeout(&self) -> Duration {
        Duration::from_millis(self.proxy_idle_conn_timeout_ms)
    }

    pub fn response_header_timeout(&self) -> Duration {
        Duration::from_millis(self.response_header_timeout_ms)
    }

    pub fn fallback_check_interval(&self) -> Duration {
        Duration::from_millis(self.fallback_check_interval_ms)
    }

    pub fn distributed_cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.distributed_cancel_timeout_ms)
    }
}
