// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

pub mod chunk_store;
pub mod registry;
pub mod sse;
pub mod stream_session;
pub mod subscriber;

pub use registry::SessionRegistry;
pub use stream_session::{SessionState, StreamSession, UpstreamBody};
pub use subscriber::{Delivery, SubscribeOptions, Subscriber};
