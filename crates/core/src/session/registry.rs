// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process-wide directory of active sessions keyed by `(chatId, messageId)`.
//! A single `RwLock<HashMap<..>>` — sessions may alternatively be sharded by
//! chatId, but a single lock keeps cross-chat metrics and iteration simple.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::RelayError;
use crate::persistence::PersistenceSink;

use super::stream_session::{SessionState, StreamSession, UpstreamBody};

type SessionKey = (String, String);

struct Entry {
    session: Arc<StreamSession>,
    created_at: Instant,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct RegistryMetrics {
    pub total: usize,
    pub pending: usize,
    pub streaming: usize,
    pub terminal: usize,
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionKey, Entry>>,
    pending_ttl: Duration,
    terminal_grace: Duration,
    max_chunk_bytes: usize,
    persistence: Arc<dyn PersistenceSink>,
}

impl SessionRegistry {
    pub fn new(
        pending_ttl: Duration,
        terminal_grace: Duration,
        max_chunk_bytes: usize,
        persistence: Arc<dyn PersistenceSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            pending_ttl,
            terminal_grace,
            max_chunk_bytes,
            persistence,
        })
    }

    /// `CreatePending`: registers a new session in `Pending`, or returns the
    /// existing one for this key unchanged.
    pub async fn create_pending(
        self: &Arc<Self>,
        chat_id: &str,
        message_id: &str,
    ) -> Arc<StreamSession> {
        let key = (chat_id.to_owned(), message_id.to_owned());
        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.get(&key) {
            return Arc::clone(&entry.session);
        }
        let session = StreamSession::new_pending(
            chat_id,
            message_id,
            self.max_chunk_bytes,
            Arc::clone(&self.persistence),
        );
        sessions.insert(key, Entry { session: Arc::clone(&session), created_at: Instant::now() });
        session
    }

    /// `GetOrCreate`: atomic lookup-or-create, attaching the upstream body
    /// only when the existing (or freshly created) session is still
    /// `Pending`.
    pub async fn get_or_create(
        self: &Arc<Self>,
        chat_id: &str,
        message_id: &str,
        body: UpstreamBody,
    ) -> Result<(Arc<StreamSession>, bool), RelayError> {
        let key = (chat_id.to_owned(), message_id.to_owned());
        let mut sessions = self.sessions.write().await;

        if let Some(entry) = sessions.get(&key) {
            let session = Arc::clone(&entry.session);
            let is_new = false;
            if session.state() == SessionState::Pending {
                session.attach_upstream_and_start(body)?;
            }
            return Ok((session, is_new));
        }

        let session = StreamSession::new_pending(
            chat_id,
            message_id,
            self.max_chunk_bytes,
            Arc::clone(&self.persistence),
        );
        session.attach_upstream_and_start(body)?;
        sessions.insert(key, Entry { session: Arc::clone(&session), created_at: Instant::now() });
        Ok((session, true))
    }

    pub async fn get(&self, chat_id: &str, message_id: &str) -> Option<Arc<StreamSession>> {
        let key = (chat_id.to_owned(), message_id.to_owned());
        self.sessions.read().await.get(&key).map(|e| Arc::clone(&e.session))
    }

    pub async fn get_active_for_chat(&self, chat_id: &str) -> Vec<Arc<StreamSession>> {
        self.sessions
            .read()
            .await
            .iter()
            .filter(|((c, _), entry)| c == chat_id && !entry.session.state().is_terminal())
            .map(|(_, entry)| Arc::clone(&entry.session))
            .collect()
    }

    pub async fn delete(&self, chat_id: &str, message_id: &str) {
        let key = (chat_id.to_owned(), message_id.to_owned());
        self.sessions.write().await.remove(&key);
    }

    pub async fn metrics(&self) -> RegistryMetrics {
        let sessions = self.sessions.read().await;
        let mut metrics = RegistryMetrics { total: sessions.len(), ..Default::default() };
        for entry in sessions.values() {
            match entry.session.state() {
                SessionState::Pending => metrics.pending += 1,
                SessionState::Streaming => metrics.streaming += 1,
                _ => metrics.terminal += 1,
            }
        }
        metrics
    }

    /// TTL reaper: force-completes stale Pending sessions and evicts
    /// terminal sessions past their retention grace.
    pub fn spawn_reaper(self: Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => self.reap_once().await,
                }
            }
        })
    }

    async fn reap_once(self: &Arc<Self>) {
        let now = Instant::now();
        let snapshot: Vec<(SessionKey, Arc<StreamSession>, Instant)> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .map(|(k, e)| (k.clone(), Arc::clone(&e.session), e.created_at))
                .collect()
        };

        let mut to_delete = Vec::new();
        for (key, session, created_at) in snapshot {
            match session.state() {
                SessionState::Pending => {
                    if now.duration_since(created_at) >= self.pending_ttl {
                        let _ = session.force_complete(RelayError::PendingTimeout);
                    }
                }
                state if state.is_terminal() => {
                    let completed_at = session.get_info().completed_at.unwrap_or_else(SystemTime::now);
                    if completed_at.elapsed().unwrap_or_default() >= self.terminal_grace {
                        to_delete.push(key);
                    }
                }
                _ => {}
            }
        }

        if !to_delete.is_empty() {
            let mut sessions = self.sessions.write().await;
            for key in to_delete {
                sessions.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::stream;

    use crate::persistence::NoopPersistenceSink;

    use super::*;

    fn empty_body() -> UpstreamBody {
        Box::pin(stream::iter(vec![Ok(bytes::Bytes::from("data: [DONE]\n"))]))
    }

    #[tokio::test]
    async fn get_or_create_is_atomic_and_single_session_per_key() {
        let registry =
            SessionRegistry::new(Duration::from_secs(30), Duration::from_secs(300), 4096, Arc::new(NoopPersistenceSink));
        let (first, is_new_first) = registry.get_or_create("chat", "msg", empty_body()).await.unwrap();
        let (second, is_new_second) = registry.get_or_create("chat", "msg", empty_body()).await.unwrap();
        assert!(is_new_first);
        assert!(!is_new_second);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn create_pending_then_get_returns_same_session() {
        let registry =
            SessionRegistry::new(Duration::from_secs(30), Duration::from_secs(300), 4096, Arc::new(NoopPersistenceSink));
        let pending = registry.create_pending("chat", "msg").await;
        let fetched = registry.get("chat", "msg").await.unwrap();
        assert!(Arc::ptr_eq(&pending, &fetched));
        assert_eq!(fetched.state(), SessionState::Pending);
    }

    #[tokio::test]
    async fn metrics_counts_by_state() {
        let registry =
            SessionRegistry::new(Duration::from_secs(30), Duration::from_secs(300), 4096, Arc::new(NoopPersistenceSink));
        registry.create_pending("c1", "m1").await;
        registry.get_or_create("c2", "m2", empty_body()).await.unwrap();
        let metrics = registry.metrics().await;
        assert_eq!(metrics.total, 2);
        assert_eq!(metrics.pending, 1);
    }
}
