// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! User-initiated cancellation: a local Registry lookup first, falling back
//! to a cluster-bus cancel request when the session isn't owned by this
//! instance.

pub mod bus;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use crate::error::RelayError;
use crate::session::SessionRegistry;

use bus::{CancelRequest, ClusterBus};

#[derive(Debug, Clone, Serialize)]
pub struct StopOutcome {
    pub stopped: bool,
    pub message_id: String,
    pub chunks_generated: usize,
    pub subscriber_count: usize,
}

pub struct StopPlane {
    registry: Arc<SessionRegistry>,
    cluster_bus: Option<Arc<dyn ClusterBus>>,
    distributed_cancel_timeout: Duration,
}

impl StopPlane {
    pub fn new(
        registry: Arc<SessionRegistry>,
        cluster_bus: Option<Arc<dyn ClusterBus>>,
        distributed_cancel_timeout: Duration,
    ) -> Self {
        Self { registry, cluster_bus, distributed_cancel_timeout }
    }

    /// `Stop(chatId, messageId, actorUserID)`. Authorization is an external
    /// collaborator's job — by the time this is called `actor_user_id` is
    /// already authenticated and authorized for the chat.
    pub async fn stop(
        &self,
        chat_id: &str,
        message_id: &str,
        actor_user_id: &str,
    ) -> Result<StopOutcome, RelayError> {
        if let Some(session) = self.registry.get(chat_id, message_id).await {
            let subscriber_count = session.get_info().subscriber_count;
            session.stop(actor_user_id.to_owned(), "user_cancelled")?;
            return Ok(StopOutcome {
                stopped: true,
                message_id: message_id.to_owned(),
                chunks_generated: session.get_stored_chunks().len(),
                subscriber_count,
            });
        }

        if let Some(bus) = &self.cluster_bus {
            let request = CancelRequest {
                chat_id: chat_id.to_owned(),
                message_id: message_id.to_owned(),
                user_id: actor_user_id.to_owned(),
                deadline_unix_ms: 0,
                request_id: Uuid::new_v4().to_string(),
            };
            let reply = bus
                .request_cancel(request, self.distributed_cancel_timeout)
                .await
                .map_err(|_| RelayError::Internal)?;

            if let Some(reply) = reply {
                if reply.found {
                    return if reply.success {
                        Ok(StopOutcome {
                            stopped: true,
                            message_id: message_id.to_owned(),
                            chunks_generated: reply.chunks_generated,
                            subscriber_count: 0,
                        })
                    } else if reply.already_stopped {
                        Err(RelayError::AlreadyStopped)
                    } else if reply.already_complete {
                        Err(RelayError::AlreadyCompleted)
                    } else {
                        Err(RelayError::Internal)
                    };
                }
            }
        }

        Err(RelayError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::persistence::NoopPersistenceSink;

    use super::*;

    struct NeverFoundBus;

    #[async_trait]
    impl ClusterBus for NeverFoundBus {
        async fn request_cancel(
            &self,
            _request: CancelRequest,
            _timeout: Duration,
        ) -> anyhow::Result<Option<bus::CancelReply>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn local_session_stops_without_touching_bus() {
        let registry = SessionRegistry::new(
            Duration::from_secs(30),
            Duration::from_secs(300),
            4096,
            Arc::new(NoopPersistenceSink),
        );
        registry.create_pending("chat", "msg").await;
        let plane =
            StopPlane::new(Arc::clone(&registry), None, Duration::from_secs(2));

        let outcome = plane.stop("chat", "msg", "user-1").await.unwrap();
        assert!(outcome.stopped);

        let err = plane.stop("chat", "msg", "user-1").await.unwrap_err();
        assert_eq!(err, RelayError::AlreadyStopped);
    }

    #[tokio::test]
    async fn absent_session_without_bus_is_not_found() {
        let registry = SessionRegistry::new(
            Duration::from_secs(30),
            Duration::from_secs(300),
            4096,
            Arc::new(NoopPersistenceSink),
        );
        let plane = StopPlane::new(registry, None, Duration::from_secs(2));
        let err = plane.stop("chat", "missing", "user-1").await.unwrap_err();
        assert_eq!(err, RelayError::NotFound);
    }

    #[tokio::test]
    async fn absent_session_with_unresponsive_bus_is_not_found() {
        let registry = SessionRegistry::new(
            Duration::from_secs(30),
            Duration::from_secs(300),
            4096,
            Arc::new(NoopPersistenceSink),
        );
        let plane =
            StopPlane::new(registry, Some(Arc::new(NeverFoundBus)), Duration::from_millis(50));
        let err = plane.stop("chat", "missing", "user-1").await.unwrap_err();
        assert_eq!(err, RelayError::NotFound);
    }
}
