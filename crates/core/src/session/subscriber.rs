// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-client delivery handle: a bounded queue the fan-out loop pushes into
//! and the client-facing task drains from. The writer never blocks on a
//! subscriber — a full queue gets the subscriber dropped (see `try_send` use
//! in `StreamSession::broadcast`).

use tokio::sync::mpsc;

use super::chunk_store::StoredChunk;

/// Options controlling how a subscriber is enrolled.
#[derive(Debug, Clone, Copy)]
pub struct SubscribeOptions {
    /// Deliver a replay of every chunk stored so far before live chunks.
    pub replay_from_start: bool,
    /// Bounded queue capacity.
    pub buffer_size: usize,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self { replay_from_start: true, buffer_size: 100 }
    }
}

/// A delivered item: either a chunk line or the terminal marker.
#[derive(Debug, Clone)]
pub enum Delivery {
    Chunk(StoredChunk),
    Terminal,
}

/// Server-side half of a subscriber: the sending end the writer uses.
pub struct SubscriberHandle {
    pub id: u64,
    tx: mpsc::Sender<Delivery>,
}

impl SubscriberHandle {
    /// Attempt to deliver without blocking. Returns `false` if the
    /// subscriber's queue is full or closed — the caller must then drop this
    /// subscriber from the session's subscriber set.
    pub fn try_deliver(&self, item: Delivery) -> bool {
        self.tx.try_send(item).is_ok()
    }
}

/// Client-side half of a subscriber: what `Subscribe` hands back to the caller.
pub struct Subscriber {
    pub id: u64,
    pub rx: mpsc::Receiver<Delivery>,
}

/// Create a new subscriber pair with the given id and bounded capacity.
pub fn new_subscriber(id: u64, buffer_size: usize) -> (SubscriberHandle, Subscriber) {
    let (tx, rx) = mpsc::channel(buffer_size.max(1));
    (SubscriberHandle { id, tx }, Subscriber { id, rx })
}
