// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Distributed cancel: a request/reply round trip over a messaging fabric.
//!
//! Generalized from fire-and-forget event publication to a bounded
//! request/reply — the requester side rides `async_nats::Client::request`
//! (NATS' built-in reply-inbox convenience), the responder side is a manual
//! subscribe loop.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelRequest {
    pub chat_id: String,
    pub message_id: String,
    pub user_id: String,
    pub deadline_unix_ms: u64,
    pub request_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelReply {
    pub request_id: String,
    pub found: bool,
    pub success: bool,
    pub already_complete: bool,
    pub already_stopped: bool,
    pub instance_id: String,
    pub chunks_generated: usize,
    pub error: Option<String>,
}

/// Capability interface so `StopPlane` can be tested without a real NATS
/// connection.
#[async_trait]
pub trait ClusterBus: Send + Sync {
    /// Publish a cancel request and wait at most `timeout` for a single
    /// authoritative reply. `Ok(None)` means the deadline elapsed with no
    /// instance claiming ownership.
    async fn request_cancel(
        &self,
        request: CancelRequest,
        timeout: Duration,
    ) -> anyhow::Result<Option<CancelReply>>;
}

pub const CANCEL_REQUEST_SUBJECT_SUFFIX: &str = "stream.cancel.request";

#[cfg(feature = "cluster-bus")]
mod nats_impl {
    use std::sync::Arc;

    use futures_util::StreamExt;
    use tokio_util::sync::CancellationToken;

    use crate::error::RelayError;
    use crate::session::SessionRegistry;

    use super::*;

    pub struct NatsClusterBus {
        client: async_nats::Client,
        prefix: String,
        instance_id: String,
    }

    impl NatsClusterBus {
        pub async fn connect(
            url: &str,
            prefix: impl Into<String>,
            instance_id: impl Into<String>,
            token: Option<String>,
        ) -> anyhow::Result<Arc<Self>> {
            let mut options = async_nats::ConnectOptions::new().retry_on_initial_connect();
            if let Some(token) = token {
                options = options.token(token);
            }
            let client = options.connect(url).await?;
            Ok(Arc::new(Self { client, prefix: prefix.into(), instance_id: instance_id.into() }))
        }

        fn subject(&self) -> String {
            format!("{}.{}", self.prefix, CANCEL_REQUEST_SUBJECT_SUFFIX)
        }

        /// Instance-side responder: every instance subscribes to the same
        /// subject, looks the session up locally, and replies on the
        /// request's own reply-to inbox. Exactly one instance should find
        /// it — sessions are sticky to the instance that started upstream.
        pub fn spawn_responder(
            self: &Arc<Self>,
            registry: Arc<SessionRegistry>,
            shutdown: CancellationToken,
        ) -> tokio::task::JoinHandle<()> {
            let bus = Arc::clone(self);
            tokio::spawn(async move {
                let mut sub = match bus.client.subscribe(bus.subject()).await {
                    Ok(sub) => sub,
                    Err(err) => {
                        tracing::error!(error = %err, "cancel-request subscribe failed");
                        return;
                    }
                };
                loop {
                    let message = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        message = sub.next() => message,
                    };
                    let Some(message) = message else { break };
                    let Some(reply_to) = message.reply.clone() else { continue };

                    let request: CancelRequest = match serde_json::from_slice(&message.payload) {
                        Ok(r) => r,
                        Err(_) => continue,
                    };

                    let reply = bus.handle_request(&registry, request).await;
                    if let Ok(payload) = serde_json::to_vec(&reply) {
                        let _ = bus.client.publish(reply_to, payload.into()).await;
                    }
                }
            })
        }

        async fn handle_request(
            &self,
            registry: &SessionRegistry,
            request: CancelRequest,
        ) -> CancelReply {
            let not_found = || CancelReply {
                request_id: request.request_id.clone(),
                found: false,
                success: false,
                already_complete: false,
                already_stopped: false,
                instance_id: self.instance_id.clone(),
                chunks_generated: 0,
                error: None,
            };

            let Some(session) = registry.get(&request.chat_id, &request.message_id).await else {
                return not_found();
            };

            match session.stop(request.user_id.clone(), "distributed_cancel") {
                Ok(()) => CancelReply {
                    request_id: request.request_id,
                    found: true,
                    success: true,
                    already_complete: false,
                    already_stopped: false,
                    instance_id: self.instance_id.clone(),
                    chunks_generated: session.get_stored_chunks().len(),
                    error: None,
                },
                Err(RelayError::AlreadyStopped) => CancelReply {
                    request_id: request.request_id,
                    found: true,
                    success: false,
                    already_complete: false,
                    already_stopped: true,
                    instance_id: self.instance_id.clone(),
                    chunks_generated: session.get_stored_chunks().len(),
                    error: None,
                },
                Err(RelayError::AlreadyCompleted) => CancelReply {
                    request_id: request.request_id,
                    found: true,
                    success: false,
                    already_complete: true,
                    already_stopped: false,
                    instance_id: self.instance_id.clone(),
                    chunks_generated: session.get_stored_chunks().len(),
                    error: None,
                },
                Err(err) => CancelReply {
                    request_id: request.request_id,
                    found: true,
                    success: false,
                    already_complete: false,
                    already_stopped: false,
                    instance_id: self.instance_id.clone(),
                    chunks_generated: session.get_stored_chunks().len(),
                    error: Some(err.to_string()),
                },
            }
        }
    }

    #[async_trait]
    impl ClusterBus for NatsClusterBus {
        async fn request_cancel(
            &self,
            request: CancelRequest,
            timeout: Duration,
        ) -> anyhow::Result<Option<CancelReply>> {
            let payload = serde_json::to_vec(&request)?;
            let request_fut = self.client.request(self.subject(), payload.into());
            match tokio::time::timeout(timeout, request_fut).await {
                Ok(Ok(message)) => Ok(Some(serde_json::from_slice(&message.payload)?)),
                Ok(Err(err)) => Err(err.into()),
                Err(_) => Ok(None),
            }
        }
    }
}

#[cfg(feature = "cluster-bus")]
pub use nats_impl::NatsClusterBus;

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysFoundBus;

    #[async_trait]
    impl ClusterBus for AlwaysFoundBus {
        async fn request_cancel(
            &self,
            request: CancelRequest,
            _timeout: Duration,
        ) -> anyhow::Result<Option<CancelReply>> {
            Ok(Some(CancelReply {
                request_id: request.request_id,
                found: true,
                success: true,
                already_complete: false,
                already_stopped: false,
                instance_id: "other-instance".to_owned(),
                chunks_generated: 3,
                error: None,
            }))
        }
    }

    #[tokio::test]
    async fn mock_bus_reports_found_and_success() {
        let bus = AlwaysFoundBus;
        let reply = bus
            .request_cancel(
                CancelRequest {
                    chat_id: "c".to_owned(),
                    message_id: "m".to_owned(),
                    user_id: "u".to_owned(),
                    deadline_unix_ms: 0,
                    request_id: "r".to_owned(),
                },
                Duration::from_secs(1),
            )
            .await
            .unwrap()
            .unwrap();
        assert!(reply.found);
        assert!(reply.success);
        assert_eq!(reply.chunks_generated, 3);
    }
}
