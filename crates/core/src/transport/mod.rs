// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP + WebSocket transport for the relay.

pub mod auth;
pub mod ws;

use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::ingress::http;
use crate::state::RelayState;

/// Build the axum `Router` with all relay routes.
pub fn build_router(state: Arc<RelayState>) -> Router {
    Router::new()
        // Health (no auth)
        .route("/api/v1/health", get(http::health))
        // Ingress
        .route("/api/v1/chat/completions", post(http::chat_completions))
        // Stop plane
        .route("/api/v1/chats/{chat_id}/messages/{message_id}/stop", post(http::stop_stream))
        // Session registry reads
        .route("/api/v1/sessions/{chat_id}/{message_id}", get(http::get_session_status))
        .route("/api/v1/chats/{chat_id}/sessions", get(http::get_active_for_chat))
        // Model router
        .route("/api/v1/routes", get(http::get_routes))
        // WebSocket subscribe (alternative to SSE)
        .route("/ws/{chat_id}/{message_id}", get(ws::ws_handler))
        // Middleware
        .layer(middleware::from_fn_with_state(state.clone(), auth::auth_layer))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
