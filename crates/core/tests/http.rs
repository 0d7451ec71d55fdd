// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use axum_test::TestServer;
use streamrelay::config::RelayConfig;
use streamrelay::health::NoopHealthBackend;
use streamrelay::ingress::upstream::UpstreamClient;
use streamrelay::persistence::NoopPersistenceSink;
use streamrelay::router::{ModelRouter, RoutingTable};
use streamrelay::session::SessionRegistry;
use streamrelay::state::RelayState;
use streamrelay::transport::build_router;

fn test_config(auth_token: Option<&str>) -> RelayConfig {
    RelayConfig {
        host: "127.0.0.1".to_owned(),
        port: 0,
        auth_token: auth_token.map(str::to_owned),
        session_pending_ttl_ms: 30_000,
        session_terminal_grace_ms: 300_000,
        subscriber_buffer_size: 100,
        upstream_max_bytes: 16 * 1024 * 1024,
        proxy_max_idle_conns_per_host: 32,
        proxy_idle_conn_timeout_ms: 90_000,
        response_header_timeout_ms: 120_000,
        fallback_check_interval_ms: 15_000,
        fallback_prometheus_url: None,
        fallback_prometheus_token: None,
        max_chat_id_length: 256,
        max_message_id_length: 256,
        cluster_bus_url: None,
        cluster_bus_prefix: "streamrelay".to_owned(),
        distributed_cancel_timeout_ms: 2_000,
        routes_config: None,
    }
}

fn test_server(auth_token: Option<&str>) -> TestServer {
    let config = test_config(auth_token);
    let registry = SessionRegistry::new(
        config.session_pending_ttl(),
        config.session_terminal_grace(),
        config.upstream_max_bytes,
        Arc::new(NoopPersistenceSink),
    );
    let router = ModelRouter::new(RoutingTable::default());
    let upstream_client = UpstreamClient::new(&config).unwrap();
    let shutdown = tokio_util::sync::CancellationToken::new();
    let state = Arc::new(RelayState::new(
        config,
        registry,
        router,
        upstream_client,
        Arc::new(NoopHealthBackend),
        None,
        shutdown,
    ));
    TestServer::new(build_router(state)).unwrap()
}

#[tokio::test]
async fn health_endpoint_requires_no_auth() {
    let server = test_server(Some("secret-token"));
    let response = server.get("/api/v1/health").await;
    response.assert_status_ok();
}

#[tokio::test]
async fn protected_route_without_bearer_token_is_unauthorized() {
    let server = test_server(Some("secret-token"));
    let response = server.get("/api/v1/routes").await;
    response.assert_status_unauthorized();
}

#[tokio::test]
async fn protected_route_with_correct_bearer_token_succeeds() {
    let server = test_server(Some("secret-token"));
    let response =
        server.get("/api/v1/routes").add_header("authorization", "Bearer secret-token").await;
    response.assert_status_ok();
}

#[tokio::test]
async fn session_status_for_unknown_session_is_not_found() {
    let server = test_server(None);
    let response = server.get("/api/v1/sessions/chat-1/msg-1").await;
    response.assert_status_not_found();
}

#[tokio::test]
async fn stop_for_unknown_session_is_not_found() {
    let server = test_server(None);
    let response = server.post("/api/v1/chats/chat-1/messages/msg-1/stop").await;
    response.assert_status_not_found();
}
