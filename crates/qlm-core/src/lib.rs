// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! QLM Gateway Core
//!
//! Latest-value store and delivery pipeline for an IoT gateway. Nodes report
//! measurements with Write envelopes; clients Read (subscribe or poll) and
//! Cancel over one long-lived connection.
//!
//! # Components
//!
//! - **[`InMemoryStore`]**: latest value per (node, measurement), subscription
//!   index and request id table behind the [`Datastore`] trait
//! - **[`IntervalScheduler`]**: one task per periodic subscription, draining
//!   updates on every tick
//! - **[`ConnectionSession`]**: splits a transport into an inbound dispatch
//!   loop and a single writer
//! - **[`MessageDispatcher`]**: runs decoded envelopes against the store
//!
//! Transports plug in through [`FrameSource`] / [`FrameSink`], wire formats
//! through [`EnvelopeCodec`].
//!
//! # Example
//!
//! ```no_run
//! use qlm_core::{ConnectionSession, InMemoryStore, JsonCodec, MessageDispatcher, SessionConfig};
//! use std::sync::Arc;
//!
//! # async fn serve<S: qlm_core::FrameSource, K: qlm_core::FrameSink + 'static>(source: S, sink: K) {
//! let dispatcher = Arc::new(MessageDispatcher::new(
//!     Arc::new(InMemoryStore::new()),
//!     Arc::new(JsonCodec),
//! ));
//! let session = ConnectionSession::new(dispatcher, SessionConfig::default());
//! let _ = session.run(source, sink).await;
//! # }
//! ```

pub mod codec;
pub mod dispatcher;
pub mod error;
pub mod protocol;
pub mod scheduler;
pub mod session;
pub mod store;

pub use codec::{EnvelopeCodec, JsonCodec};
pub use dispatcher::MessageDispatcher;
pub use error::{CodecError, SessionError, StoreError, StoreResult};
pub use protocol::{
    batch_to_objects, DataPoint, Envelope, InfoItem, MeasurementKey, Object, ReturnCode,
    RequestResult, Response, Update, Value, MIN_INTERVAL,
};
pub use scheduler::IntervalScheduler;
pub use session::{
    ConnectionSession, Frame, FrameSink, FrameSource, OutboundSink, SessionConfig,
    SessionContext, WeakOutbound,
};
pub use store::{
    Datastore, InMemoryStore, StoreConfig, StoreStats, SubscribeOptions, Subscribed,
    WriteSummary,
};
