// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Persistence defined by interface only: the core never speaks to a
//! datastore directly. Swap in a real adapter by implementing
//! `PersistenceSink`; `NoopPersistenceSink` lets the crate run standalone.

use async_trait::async_trait;

use crate::error::RelayError;
use crate::session::sse::TokenUsage;

/// Canonical transcript handed to the persistence adapter exactly once per
/// terminal Session (see `StreamSession`'s persist latch).
#[derive(Debug, Clone)]
pub struct PersistPayload {
    pub chat_id: String,
    pub message_id: String,
    pub user_id: String,
    pub content: String,
    pub token_usage: Option<TokenUsage>,
    pub response_id: Option<String>,
    pub stopped: bool,
    pub stopped_by: Option<String>,
    pub stop_reason: Option<String>,
    pub error: Option<RelayError>,
    pub model: Option<String>,
}

#[async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn save(&self, payload: PersistPayload);
}

/// Logs and drops. Used when no real adapter is configured.
#[derive(Debug, Default)]
pub struct NoopPersistenceSink;

#[async_trait]
impl PersistenceSink for NoopPersistenceSink {
    async fn save(&self, payload: PersistPayload) {
        tracing::info!(
            chat_id = %payload.chat_id,
            message_id = %payload.message_id,
            content_len = payload.content.len(),
            stopped = payload.stopped,
            error = ?payload.error,
            "persistence sink is a no-op; discarding transcript"
        );
    }
}
