// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The hub that owns the upstream body reader, fans chunks out to
//! Subscribers, and latches terminal state + persistence exactly once.
//!
//! Mutation of `chunks`/`subscribers`/`state` is confined to a single
//! `std::sync::Mutex` critical section per operation (never held across an
//! `.await`), matching the "writer owns mutation, observers take immutable
//! snapshots" rule from the concurrency model this is built against.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use futures_util::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::RelayError;
use crate::persistence::{PersistPayload, PersistenceSink};

use super::chunk_store::{ChunkStore, StoredChunk};
use super::sse::{self, SseLineBuffer, TokenUsage};
use super::subscriber::{new_subscriber, Delivery, SubscribeOptions, Subscriber};

/// A boxed stream of upstream body bytes, owned independently of the
/// originating client request (see the ingress handler's detached dispatch).
pub type UpstreamBody = Pin<Box<dyn Stream<Item = Result<bytes::Bytes, String>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Pending,
    Streaming,
    Completed,
    Stopped,
    Errored,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Stopped | Self::Errored)
    }
}

#[derive(Debug, Clone, Default)]
struct StopRequest {
    actor: String,
    reason: String,
}

struct Inner {
    state: SessionState,
    chunks: ChunkStore,
    content: String,
    token_usage: Option<TokenUsage>,
    response_id: Option<String>,
    subscribers: HashMap<u64, super::subscriber::SubscriberHandle>,
    original_request_body: Option<Vec<u8>>,
    upstream_url: Option<String>,
    upstream_api_key: Option<String>,
    user_id: Option<String>,
    model: Option<String>,
    started_at: Option<SystemTime>,
    completed_at: Option<SystemTime>,
    error: Option<RelayError>,
    stop_request: Option<StopRequest>,
    stopped_by: Option<String>,
    stop_reason: Option<String>,
    persisted: bool,
}

enum IngestOutcome {
    Continue,
    Done,
    Oversized,
}

enum FanoutOutcome {
    Cancelled,
    Done,
    Eof,
    ReadError(String),
    Oversized,
}

/// Snapshot of a Session's observational state, for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub chat_id: String,
    pub message_id: String,
    pub state: SessionState,
    pub subscriber_count: usize,
    pub content_len: usize,
    pub chunk_count: usize,
    pub token_usage: Option<TokenUsage>,
    pub response_id: Option<String>,
    pub error: Option<RelayError>,
    pub stopped_by: Option<String>,
    pub stop_reason: Option<String>,
    #[serde(skip)]
    pub completed_at: Option<SystemTime>,
}

pub struct StreamSession {
    pub chat_id: String,
    pub message_id: String,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<SessionState>,
    upstream_cancel: CancellationToken,
    next_subscriber_id: AtomicU64,
    persistence: Arc<dyn PersistenceSink>,
    max_bytes: usize,
}

impl StreamSession {
    /// `NewPending`: a session in `Pending`, fan-out loop not yet started.
    pub fn new_pending(
        chat_id: impl Into<String>,
        message_id: impl Into<String>,
        max_bytes: usize,
        persistence: Arc<dyn PersistenceSink>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(SessionState::Pending);
        Arc::new(Self {
            chat_id: chat_id.into(),
            message_id: message_id.into(),
            inner: Mutex::new(Inner {
                state: SessionState::Pending,
                chunks: ChunkStore::new(max_bytes),
                content: String::new(),
                token_usage: None,
                response_id: None,
                subscribers: HashMap::new(),
                original_request_body: None,
                upstream_url: None,
                upstream_api_key: None,
                user_id: None,
                model: None,
                started_at: None,
                completed_at: None,
                error: None,
                stop_request: None,
                stopped_by: None,
                stop_reason: None,
                persisted: false,
            }),
            state_tx,
            upstream_cancel: CancellationToken::new(),
            next_subscriber_id: AtomicU64::new(1),
            persistence,
            max_bytes,
        })
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().unwrap().state
    }

    /// Idempotent: attaches the upstream body and starts the fan-out task.
    /// Errors if already streaming (`Internal`, a caller bug) or terminal
    /// (`AlreadyCompleted`).
    pub fn attach_upstream_and_start(
        self: &Arc<Self>,
        body: UpstreamBody,
    ) -> Result<(), RelayError> {
        {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                SessionState::Pending => {
                    inner.state = SessionState::Streaming;
                    inner.started_at = Some(SystemTime::now());
                }
                SessionState::Streaming => return Err(RelayError::Internal),
                _ => return Err(RelayError::AlreadyCompleted),
            }
        }
        let _ = self.state_tx.send(SessionState::Streaming);

        let session = Arc::clone(self);
        tokio::spawn(async move { session.run_fanout(body).await });
        Ok(())
    }

    /// `Subscribe`: enrolls a subscriber, optionally replaying the current
    /// snapshot first. Enrollment and the replay burst happen under one
    /// critical section so no live chunk can be missed or duplicated.
    pub fn subscribe(self: &Arc<Self>, opts: SubscribeOptions) -> Subscriber {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (handle, subscriber) = new_subscriber(id, opts.buffer_size);
        let mut inner = self.inner.lock().unwrap();

        if opts.replay_from_start {
            for chunk in inner.chunks.snapshot() {
                if !handle.try_deliver(Delivery::Chunk(chunk)) {
                    return subscriber;
                }
            }
        }

        if inner.state.is_terminal() {
            let _ = handle.try_deliver(Delivery::Terminal);
            return subscriber;
        }

        inner.subscribers.insert(id, handle);
        subscriber
    }

    pub fn unsubscribe(&self, id: u64) {
        self.inner.lock().unwrap().subscribers.remove(&id);
    }

    /// `Stop`: terminal transition requested by a user or operator.
    /// Idempotent — a second call returns `AlreadyStopped`/`AlreadyCompleted`.
    pub fn stop(
        self: &Arc<Self>,
        actor: impl Into<String>,
        reason: impl Into<String>,
    ) -> Result<(), RelayError> {
        let payload = {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                SessionState::Completed | SessionState::Errored => {
                    return Err(RelayError::AlreadyCompleted)
                }
                SessionState::Stopped => return Err(RelayError::AlreadyStopped),
                _ => {}
            }
            inner.stop_request = Some(StopRequest { actor: actor.into(), reason: reason.into() });
            // Pending and Streaming both finalize here, synchronously, under
            // this lock — a concurrent or repeated Stop call always observes
            // Stopped (or another terminal state) rather than racing the
            // fan-out task's own finalize on cancellation.
            let req = inner.stop_request.clone().unwrap_or_default();
            inner.stopped_by = Some(req.actor);
            inner.stop_reason = Some(req.reason);
            self.finalize_locked(&mut inner, SessionState::Stopped, None)
        };
        self.upstream_cancel.cancel();
        if let Some(payload) = payload {
            self.spawn_persist(payload);
        }
        Ok(())
    }

    /// `ForceComplete`: terminal transition for upstream-error paths that
    /// never reach the fan-out loop (e.g. a dial failure on a Pending
    /// session). Idempotent.
    pub fn force_complete(self: &Arc<Self>, err: RelayError) -> Result<(), RelayError> {
        let payload = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state.is_terminal() {
                return Err(RelayError::AlreadyCompleted);
            }
            self.finalize_locked(&mut inner, SessionState::Errored, Some(err))
        };
        self.upstream_cancel.cancel();
        if let Some(payload) = payload {
            self.spawn_persist(payload);
        }
        Ok(())
    }

    pub async fn wait_for_completion(self: &Arc<Self>) {
        let mut rx = self.state_tx.subscribe();
        if rx.borrow().is_terminal() {
            return;
        }
        while rx.changed().await.is_ok() {
            if rx.borrow().is_terminal() {
                return;
            }
        }
    }

    pub fn get_info(&self) -> SessionInfo {
        let inner = self.inner.lock().unwrap();
        SessionInfo {
            chat_id: self.chat_id.clone(),
            message_id: self.message_id.clone(),
            state: inner.state,
            subscriber_count: inner.subscribers.len(),
            content_len: inner.content.len(),
            chunk_count: inner.chunks.len(),
            token_usage: inner.token_usage,
            response_id: inner.response_id.clone(),
            error: inner.error,
            stopped_by: inner.stopped_by.clone(),
            stop_reason: inner.stop_reason.clone(),
            completed_at: inner.completed_at,
        }
    }

    pub fn get_stored_chunks(&self) -> Vec<StoredChunk> {
        self.inner.lock().unwrap().chunks.snapshot()
    }

    pub fn get_content(&self) -> String {
        self.inner.lock().unwrap().content.clone()
    }

    pub fn get_token_usage(&self) -> Option<TokenUsage> {
        self.inner.lock().unwrap().token_usage
    }

    pub fn get_response_id(&self) -> Option<String> {
        self.inner.lock().unwrap().response_id.clone()
    }

    pub fn get_stop_info(&self) -> Option<(String, String)> {
        let inner = self.inner.lock().unwrap();
        Some((inner.stopped_by.clone()?, inner.stop_reason.clone().unwrap_or_default()))
    }

    pub fn get_error(&self) -> Option<RelayError> {
        self.inner.lock().unwrap().error
    }

    pub fn set_original_request_body(&self, body: Vec<u8>) -> Result<(), RelayError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state.is_terminal() {
            return Err(RelayError::AlreadyCompleted);
        }
        inner.original_request_body = Some(body);
        Ok(())
    }

    pub fn set_upstream_url(&self, url: impl Into<String>) -> Result<(), RelayError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state.is_terminal() {
            return Err(RelayError::AlreadyCompleted);
        }
        inner.upstream_url = Some(url.into());
        Ok(())
    }

    pub fn set_upstream_api_key(&self, key: impl Into<String>) -> Result<(), RelayError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state.is_terminal() {
            return Err(RelayError::AlreadyCompleted);
        }
        inner.upstream_api_key = Some(key.into());
        Ok(())
    }

    pub fn set_user_id(&self, user_id: impl Into<String>) -> Result<(), RelayError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state.is_terminal() {
            return Err(RelayError::AlreadyCompleted);
        }
        inner.user_id = Some(user_id.into());
        Ok(())
    }

    pub fn set_model(&self, model: impl Into<String>) -> Result<(), RelayError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state.is_terminal() {
            return Err(RelayError::AlreadyCompleted);
        }
        inner.model = Some(model.into());
        Ok(())
    }

    async fn run_fanout(self: Arc<Self>, mut body: UpstreamBody) {
        let mut parser = SseLineBuffer::new();

        let outcome = 'drive: loop {
            tokio::select! {
                biased;
                _ = self.upstream_cancel.cancelled() => break 'drive FanoutOutcome::Cancelled,
                next = body.next() => match next {
                    Some(Ok(bytes)) => {
                        let mut broke = None;
                        for line in parser.feed(&bytes) {
                            match self.ingest_line(line) {
                                IngestOutcome::Oversized => broke = Some(FanoutOutcome::Oversized),
                                IngestOutcome::Done => broke = Some(FanoutOutcome::Done),
                                IngestOutcome::Continue => {}
                            }
                            if broke.is_some() {
                                break;
                            }
                        }
                        if let Some(outcome) = broke {
                            break 'drive outcome;
                        }
                    }
                    Some(Err(err)) => break 'drive FanoutOutcome::ReadError(err),
                    None => {
                        if let Some(trailing) = parser.flush() {
                            if let IngestOutcome::Oversized = self.ingest_line(trailing) {
                                break 'drive FanoutOutcome::Oversized;
                            }
                        }
                        break 'drive FanoutOutcome::Eof;
                    }
                },
            }
        };

        let payload = {
            let mut inner = self.inner.lock().unwrap();
            match outcome {
                FanoutOutcome::Cancelled => {
                    let req = inner.stop_request.clone().unwrap_or_default();
                    inner.stopped_by = Some(req.actor);
                    inner.stop_reason = Some(req.reason);
                    self.finalize_locked(&mut inner, SessionState::Stopped, None)
                }
                FanoutOutcome::Done | FanoutOutcome::Eof => {
                    self.finalize_locked(&mut inner, SessionState::Completed, None)
                }
                FanoutOutcome::Oversized => self.finalize_locked(
                    &mut inner,
                    SessionState::Errored,
                    Some(RelayError::OversizedStream),
                ),
                FanoutOutcome::ReadError(msg) => {
                    tracing::warn!(
                        chat_id = %self.chat_id,
                        message_id = %self.message_id,
                        error = %msg,
                        "upstream read error terminated session"
                    );
                    self.finalize_locked(
                        &mut inner,
                        SessionState::Errored,
                        Some(RelayError::UpstreamRead),
                    )
                }
            }
        };

        if let Some(payload) = payload {
            self.spawn_persist(payload);
        }
    }

    /// Append one line, extract its fields, and deliver it to every current
    /// subscriber in the same critical section as the append — this is what
    /// makes replay + live delivery gap-free and duplicate-free.
    fn ingest_line(&self, line: String) -> IngestOutcome {
        let is_final = line == sse::DONE_LINE;
        let extracted = sse::extract(&line);

        let mut inner = self.inner.lock().unwrap();
        let stored = match inner.chunks.append(line, is_final) {
            Ok(chunk) => chunk,
            Err(()) => return IngestOutcome::Oversized,
        };

        if let Some(extracted) = extracted {
            if let Some(content) = extracted.content {
                inner.content.push_str(&content);
            }
            if let Some(usage) = extracted.usage {
                inner.token_usage = Some(usage);
            }
            if inner.response_id.is_none() {
                if let Some(id) = extracted.response_id {
                    inner.response_id = Some(id);
                }
            }
        }

        inner.subscribers.retain(|_, handle| handle.try_deliver(Delivery::Chunk(stored.clone())));

        if is_final {
            IngestOutcome::Done
        } else {
            IngestOutcome::Continue
        }
    }

    /// Transitions to a terminal state exactly once, broadcasts the terminal
    /// marker, and returns a persist payload iff the persist latch fires on
    /// this call. No-op (returns `None`) if already terminal.
    fn finalize_locked(
        &self,
        inner: &mut Inner,
        state: SessionState,
        error: Option<RelayError>,
    ) -> Option<PersistPayload> {
        if inner.state.is_terminal() {
            return None;
        }
        inner.state = state;
        inner.completed_at = Some(SystemTime::now());
        inner.error = error;
        let _ = self.state_tx.send(state);

        for (_, handle) in inner.subscribers.drain() {
            let _ = handle.try_deliver(Delivery::Terminal);
        }

        if inner.persisted {
            return None;
        }
        let user_id = inner.user_id.clone()?;
        let stopped = state == SessionState::Stopped;
        if inner.content.is_empty() && inner.error.is_none() && !stopped {
            return None;
        }
        inner.persisted = true;
        Some(PersistPayload {
            chat_id: self.chat_id.clone(),
            message_id: self.message_id.clone(),
            user_id,
            content: inner.content.clone(),
            token_usage: inner.token_usage,
            response_id: inner.response_id.clone(),
            stopped,
            stopped_by: inner.stopped_by.clone(),
            stop_reason: inner.stop_reason.clone(),
            error: inner.error,
            model: inner.model.clone(),
        })
    }

    fn spawn_persist(self: &Arc<Self>, payload: PersistPayload) {
        let sink = Arc::clone(&self.persistence);
        tokio::spawn(async move { sink.save(payload).await });
    }

    #[cfg(test)]
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::stream;

    use crate::persistence::NoopPersistenceSink;

    use super::*;

    fn body_from_lines(lines: Vec<&'static str>) -> UpstreamBody {
        Box::pin(stream::iter(lines.into_iter().map(|l| Ok(bytes::Bytes::from(l)))))
    }

    fn session() -> Arc<StreamSession> {
        StreamSession::new_pending("chat-1", "msg-1", 1024 * 1024, Arc::new(NoopPersistenceSink))
    }

    #[tokio::test]
    async fn completes_on_done_and_accumulates_content() {
        let session = session();
        session.set_user_id("user-1").unwrap();
        let body = body_from_lines(vec![
            "data: {\"id\":\"resp-1\",\"choices\":[{\"delta\":{\"content\":\"he\"}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"llo\"}}]}\n",
            "data: {\"usage\":{\"prompt_tokens\":1,\"completion_tokens\":2,\"total_tokens\":3}}\n",
            "data: [DONE]\n",
        ]);
        session.attach_upstream_and_start(body).unwrap();
        session.wait_for_completion().await;

        assert_eq!(session.state(), SessionState::Completed);
        assert_eq!(session.get_content(), "hello");
        assert_eq!(session.get_response_id().as_deref(), Some("resp-1"));
        assert_eq!(session.get_token_usage().unwrap().total_tokens, 3);
    }

    #[tokio::test]
    async fn replay_then_live_is_gap_free() {
        let session = session();
        let body = body_from_lines(vec!["data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n"]);
        session.attach_upstream_and_start(body).unwrap();

        // Give the fan-out task a chance to ingest the first chunk before
        // a late subscriber joins.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut late = session.subscribe(SubscribeOptions::default());
        let first = late.rx.recv().await.unwrap();
        match first {
            Delivery::Chunk(c) => assert!(c.line.contains("\"a\"")),
            Delivery::Terminal => panic!("expected a chunk first"),
        }
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let session = session();
        assert!(session.stop("user-1", "user_cancelled").is_ok());
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(session.stop("user-1", "user_cancelled").unwrap_err(), RelayError::AlreadyStopped);
    }

    #[tokio::test]
    async fn stop_on_streaming_session_finalizes_synchronously() {
        let session = session();
        // A body that never yields: the session stays Streaming until Stop
        // cancels the upstream token, so this exercises the race Stop must
        // close without relying on the fan-out task ever being polled again.
        let body: UpstreamBody = Box::pin(stream::pending::<Result<bytes::Bytes, String>>());
        session.attach_upstream_and_start(body).unwrap();
        assert_eq!(session.state(), SessionState::Streaming);

        assert!(session.stop("user-1", "user_cancelled").is_ok());
        // The transition to Stopped is visible immediately, before the
        // fan-out task is ever polled again.
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(
            session.stop("user-1", "user_cancelled").unwrap_err(),
            RelayError::AlreadyStopped
        );
    }

    #[tokio::test]
    async fn late_subscriber_after_terminal_gets_replay_and_terminal_marker() {
        let session = session();
        session.stop("user-1", "user_cancelled").unwrap();

        let mut sub = session.subscribe(SubscribeOptions::default());
        let only = sub.rx.recv().await.unwrap();
        assert!(matches!(only, Delivery::Terminal));
    }

    #[tokio::test]
    async fn oversized_stream_errors_out() {
        let session = StreamSession::new_pending("c", "m", 4, Arc::new(NoopPersistenceSink));
        let body = body_from_lines(vec!["data: 1234567890\n"]);
        session.attach_upstream_and_start(body).unwrap();
        session.wait_for_completion().await;
        assert_eq!(session.state(), SessionState::Errored);
        assert_eq!(session.get_error(), Some(RelayError::OversizedStream));
    }

    #[tokio::test]
    async fn double_attach_is_rejected() {
        let session = session();
        let body_a = body_from_lines(vec!["data: [DONE]\n"]);
        session.attach_upstream_and_start(body_a).unwrap();
        let body_b = body_from_lines(vec!["data: [DONE]\n"]);
        assert_eq!(
            session.attach_upstream_and_start(body_b).unwrap_err(),
            RelayError::Internal
        );
    }
}
