// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket subscribe path: reuses the same `Subscribe`/replay contract as
//! the SSE path so a client can receive the transcript over either
//! transport. Upgrade auth is a query-param token since the browser
//! WebSocket API can't set an Authorization header.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use crate::session::{Delivery, SubscribeOptions};
use crate::state::RelayState;
use crate::transport::auth;

#[derive(Debug, Clone, Deserialize)]
pub struct StreamWsQuery {
    pub token: Option<String>,
    #[serde(default)]
    pub replay_from_start: Option<bool>,
}

/// `GET /ws/{chatId}/{messageId}` — subscribe to a session's transcript over
/// a WebSocket instead of SSE.
pub async fn ws_handler(
    State(state): State<Arc<RelayState>>,
    Path((chat_id, message_id)): Path<(String, String)>,
    Query(query): Query<StreamWsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let query_str = query.token.as_ref().map(|t| format!("token={t}")).unwrap_or_default();
    if auth::validate_ws_query(&query_str, state.config.auth_token.as_deref()).is_err() {
        return (axum::http::StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }

    let session = match state.registry.get(&chat_id, &message_id).await {
        Some(s) => s,
        None => return (axum::http::StatusCode::NOT_FOUND, "session not found").into_response(),
    };

    let opts = SubscribeOptions {
        replay_from_start: query.replay_from_start.unwrap_or(true),
        buffer_size: state.config.subscriber_buffer_size,
    };

    ws.on_upgrade(move |socket| handle_ws(socket, session, opts)).into_response()
}

async fn handle_ws(
    socket: WebSocket,
    session: Arc<crate::session::StreamSession>,
    opts: SubscribeOptions,
) {
    let mut subscriber = session.subscribe(opts);
    let (mut ws_tx, _ws_rx) = futures_util::StreamExt::split(socket);

    while let Some(item) = subscriber.rx.recv().await {
        let done = matches!(item, Delivery::Terminal);
        let line = match item {
            Delivery::Chunk(chunk) => chunk.line,
            Delivery::Terminal => "data: [DONE]".to_owned(),
        };
        if futures_util::SinkExt::send(&mut ws_tx, Message::Text(line.into())).await.is_err() {
            break;
        }
        if done {
            break;
        }
    }

    session.unsubscribe(subscriber.id);
}
