// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Ingress handlers: reads the request body, selects a route, creates a
//! pending Session ahead of the upstream call, and dispatches streaming vs
//! non-streaming requests independently of each other.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use futures_util::Stream;
use serde::Deserialize;

use crate::error::RelayError;
use crate::router::PlatformAffinity;
use crate::session::{Delivery, SubscribeOptions, Subscriber};
use crate::state::RelayState;

#[derive(Debug, Deserialize)]
struct ChatCompletionsRequest {
    model: String,
    #[serde(default)]
    stream: bool,
    #[serde(default)]
    #[serde(alias = "chatId")]
    chat_id: Option<String>,
    #[serde(default)]
    #[serde(alias = "messageId")]
    message_id: Option<String>,
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn platform_from_headers(headers: &HeaderMap) -> PlatformAffinity {
    match header_str(headers, "x-client-platform") {
        Some("mobile") => PlatformAffinity::Mobile,
        Some("desktop") => PlatformAffinity::Desktop,
        _ => PlatformAffinity::Any,
    }
}

fn validate_id_lengths(
    chat_id: &str,
    message_id: &str,
    state: &RelayState,
) -> Result<(), Response> {
    if chat_id.len() > state.config.max_chat_id_length
        || message_id.len() > state.config.max_message_id_length
    {
        return Err(RelayError::BadRequest
            .to_http_response("chatId/messageId exceed the configured length limit")
            .into_response());
    }
    Ok(())
}

pub async fn health(State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    let metrics = state.registry.metrics().await;
    Json(serde_json::json!({
        "status": "ok",
        "active_session_count": metrics.pending + metrics.streaming,
    }))
}

pub async fn get_session_status(
    State(state): State<Arc<RelayState>>,
    Path((chat_id, message_id)): Path<(String, String)>,
) -> Response {
    if let Err(resp) = validate_id_lengths(&chat_id, &message_id, &state) {
        return resp;
    }
    match state.registry.get(&chat_id, &message_id).await {
        Some(session) => Json(session.get_info()).into_response(),
        None => RelayError::SessionNotFound.to_http_response("session not found").into_response(),
    }
}

pub async fn get_active_for_chat(
    State(state): State<Arc<RelayState>>,
    Path(chat_id): Path<String>,
) -> Response {
    let sessions = state.registry.get_active_for_chat(&chat_id).await;
    let infos: Vec<_> = sessions.iter().map(|s| s.get_info()).collect();
    Json(infos).into_response()
}

pub async fn get_routes(State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    let table = state.router.get_routes().await;
    Json((*table).clone())
}

pub async fn stop_stream(
    State(state): State<Arc<RelayState>>,
    Path((chat_id, message_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = validate_id_lengths(&chat_id, &message_id, &state) {
        return resp;
    }
    let actor = header_str(&headers, "x-user-id").unwrap_or("anonymous");

    match state.stop_plane.stop(&chat_id, &message_id, actor).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "stopped": outcome.stopped,
                "message_id": outcome.message_id,
                "chunks_generated": outcome.chunks_generated,
                "partial_content_stored": outcome.chunks_generated > 0,
                "subscriber_count": outcome.subscriber_count,
            })),
        )
            .into_response(),
        Err(RelayError::NotFound) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "Stream not found", "message_id": message_id})),
        )
            .into_response(),
        Err(RelayError::AlreadyCompleted) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({
                "error": "Stream already completed",
                "message_id": message_id,
                "completed": true,
            })),
        )
            .into_response(),
        Err(RelayError::AlreadyStopped) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({
                "error": "Stream already stopped",
                "message_id": message_id,
                "stopped": true,
            })),
        )
            .into_response(),
        Err(err) => err.to_http_response(err.to_string()).into_response(),
    }
}

pub async fn chat_completions(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let parsed: ChatCompletionsRequest = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(_) => {
            return RelayError::BadRequest.to_http_response("invalid JSON body").into_response()
        }
    };

    let chat_id =
        header_str(&headers, "x-chat-id").map(str::to_owned).or_else(|| parsed.chat_id.clone());
    let message_id = header_str(&headers, "x-message-id")
        .map(str::to_owned)
        .or_else(|| parsed.message_id.clone());
    let user_id = header_str(&headers, "x-user-message-id").map(str::to_owned);
    let platform = platform_from_headers(&headers);

    if let (Some(chat_id), Some(message_id)) = (&chat_id, &message_id) {
        if let Err(resp) = validate_id_lengths(chat_id, message_id, &state) {
            return resp;
        }
    }

    let endpoint = match state.router.route_model(&parsed.model, platform).await {
        Ok(endpoint) => endpoint,
        Err(err) => return err.to_http_response(err.to_string()).into_response(),
    };

    if !parsed.stream {
        return proxy_non_streaming(&state, &endpoint.base_url, &endpoint.api_key, body.to_vec())
            .await;
    }

    let (chat_id, message_id) = match (chat_id, message_id) {
        (Some(c), Some(m)) => (c, m),
        _ => {
            return RelayError::BadRequest
                .to_http_response("chatId/messageId are required for streaming requests")
                .into_response()
        }
    };

    // CreatePending before calling upstream — this is what lets an early
    // Stop race the dial and still find a session to cancel.
    let session = state.registry.create_pending(&chat_id, &message_id).await;
    if let Some(user_id) = user_id {
        let _ = session.set_user_id(user_id);
    }
    let _ = session.set_model(endpoint.model.clone());
    let _ = session.set_upstream_url(endpoint.base_url.clone());

    let upstream_client = state.upstream_client.clone();
    let url = endpoint.base_url.clone();
    let api_key = endpoint.api_key.clone();
    let dispatch_body = body.to_vec();
    let dispatch_session = Arc::clone(&session);
    tokio::spawn(async move {
        match upstream_client.start_streaming_request(&url, &api_key, dispatch_body).await {
            Ok(upstream_body) => {
                if let Err(err) = dispatch_session.attach_upstream_and_start(upstream_body) {
                    tracing::warn!(error = %err, "failed to attach upstream body to session");
                }
            }
            Err(err) => {
                let _ = dispatch_session.force_complete(err);
            }
        }
    });

    let subscriber = session.subscribe(SubscribeOptions {
        replay_from_start: true,
        buffer_size: state.config.subscriber_buffer_size,
    });
    let body = axum::body::Body::from_stream(subscriber_to_sse_stream(subscriber));

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .header("x-accel-buffering", "no")
        .header("connection", "keep-alive")
        .body(body)
        .unwrap_or_else(|_| RelayError::Internal.to_http_response("response build failed").into_response())
}

/// Turns a client's Subscriber into the verbatim SSE byte stream axum wants
/// for the response body — one `unfold` step per delivered item, matching
/// the `stream::unfold` shape used to wrap SSE framing elsewhere in this
/// crate.
fn subscriber_to_sse_stream(
    subscriber: Subscriber,
) -> impl Stream<Item = Result<Bytes, std::convert::Infallible>> {
    futures_util::stream::unfold(Some(subscriber), |state| async move {
        let mut subscriber = state?;
        match subscriber.rx.recv().await {
            Some(Delivery::Chunk(chunk)) => {
                let bytes = Bytes::from(format!("{}\n", chunk.line));
                Some((Ok(bytes), Some(subscriber)))
            }
            Some(Delivery::Terminal) | None => None,
        }
    })
}

async fn proxy_non_streaming(
    state: &Arc<RelayState>,
    url: &str,
    api_key: &str,
    body: Vec<u8>,
) -> Response {
    match state.upstream_client.send_non_streaming_request(url, api_key, body).await {
        Ok(bytes) => {
            (StatusCode::OK, [("content-type", "application/json")], bytes).into_response()
        }
        Err(err) => err.to_http_response(err.to_string()).into_response(),
    }
}
