// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-connection session.
//!
//! A session splits one bidirectional transport into:
//! - an inbound loop reading frames and handing payloads to the dispatcher
//! - a writer task that exclusively owns the transport's sending half
//!
//! Everything sent to the client goes through the session's [`OutboundSink`],
//! so writes on one transport are never interleaved. Either half failing ends
//! both; the writer closes the transport exactly once on its way out, and the
//! subscriptions owned by the session are cancelled.
//!
//! After an orderly close the writer gets [`SessionConfig::flush_timeout`] to
//! send what is still queued. A transport that stops accepting frames is then
//! abandoned, so a session always ends.

use crate::dispatcher::MessageDispatcher;
use crate::error::SessionError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// One inbound transport frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Binary(Vec<u8>),
    Text(String),
    Ping,
    Pong,
    Close,
}

/// Receiving half of a transport.
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame; `None` once the transport is finished.
    async fn next_frame(&mut self) -> Option<Result<Frame, SessionError>>;
}

/// Sending half of a transport.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_frame(&mut self, payload: Vec<u8>) -> Result<(), SessionError>;

    async fn close(&mut self) -> Result<(), SessionError>;
}

/// Handle for queueing outbound messages on a session.
#[derive(Debug, Clone)]
pub struct OutboundSink {
    tx: mpsc::Sender<Vec<u8>>,
}

impl OutboundSink {
    /// Bounded sink and the receiver its writer drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue one message, waiting for room if the sink is full.
    pub async fn deliver(&self, payload: Vec<u8>) -> Result<(), SessionError> {
        self.tx
            .send(payload)
            .await
            .map_err(|_| SessionError::Delivery("outbound sink closed".into()))
    }

    /// Non-owning handle; does not keep the session's writer alive.
    pub fn downgrade(&self) -> WeakOutbound {
        WeakOutbound {
            tx: self.tx.downgrade(),
        }
    }
}

/// Non-owning [`OutboundSink`] handle held by interval tasks.
#[derive(Debug, Clone)]
pub struct WeakOutbound {
    tx: mpsc::WeakSender<Vec<u8>>,
}

impl WeakOutbound {
    pub fn upgrade(&self) -> Option<OutboundSink> {
        self.tx.upgrade().map(|tx| OutboundSink { tx })
    }
}

/// What the dispatcher knows about the requesting connection.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: String,
    pub outbound: OutboundSink,
}

impl SessionContext {
    pub fn new(session_id: impl Into<String>, outbound: OutboundSink) -> Self {
        Self {
            session_id: session_id.into(),
            outbound,
        }
    }
}

/// Session limits.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub outbound_queue_capacity: usize,
    /// Larger inbound payloads are answered with bad-request
    pub max_frame_size: usize,
    /// Bound on flushing queued frames (and on the final close) once the
    /// inbound side has ended
    pub flush_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: 256,
            max_frame_size: 1024 * 1024,
            flush_timeout: Duration::from_secs(5),
        }
    }
}

/// Short random session id.
pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}

/// A connected client.
pub struct ConnectionSession {
    session_id: String,
    dispatcher: Arc<MessageDispatcher>,
    config: SessionConfig,
}

impl ConnectionSession {
    pub fn new(dispatcher: Arc<MessageDispatcher>, config: SessionConfig) -> Self {
        let session_id = new_session_id();
        info!("[{}] New session created", session_id);
        Self {
            session_id,
            dispatcher,
            config,
        }
    }

    pub fn id(&self) -> &str {
        &self.session_id
    }

    /// Serve the connection until close, read error or delivery error.
    ///
    /// Returns `Ok` on an orderly close.
    pub async fn run<S, K>(self, mut source: S, sink: K) -> Result<(), SessionError>
    where
        S: FrameSource,
        K: FrameSink + 'static,
    {
        let (outbound, rx) = OutboundSink::channel(self.config.outbound_queue_capacity);
        let shutdown = CancellationToken::new();
        let mut writer = tokio::spawn(write_loop(
            self.session_id.clone(),
            sink,
            rx,
            shutdown.clone(),
            self.config.flush_timeout,
        ));
        let ctx = SessionContext::new(self.session_id.clone(), outbound);

        let inbound: Result<(), SessionError> = loop {
            let frame = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                frame = source.next_frame() => frame,
            };

            let payload = match frame {
                None => {
                    info!("[{}] Transport finished", self.session_id);
                    break Ok(());
                }
                Some(Err(e)) => {
                    error!("[{}] Transport error: {}", self.session_id, e);
                    break Err(e);
                }
                Some(Ok(Frame::Close)) => {
                    info!("[{}] Client closed connection", self.session_id);
                    break Ok(());
                }
                Some(Ok(Frame::Ping)) | Some(Ok(Frame::Pong)) => continue,
                Some(Ok(Frame::Binary(bytes))) => bytes,
                Some(Ok(Frame::Text(text))) => text.into_bytes(),
            };

            debug!("[{}] Frame of {} bytes", self.session_id, payload.len());
            let handled = if payload.len() > self.config.max_frame_size {
                warn!(
                    "[{}] Frame of {} bytes exceeds limit {}",
                    self.session_id,
                    payload.len(),
                    self.config.max_frame_size
                );
                self.dispatcher
                    .reject(&ctx, format!("frame exceeds {} bytes", self.config.max_frame_size))
                    .await
            } else {
                self.dispatcher.process(&payload, &ctx).await
            };

            if let Err(e) = handled {
                warn!("[{}] {}", self.session_id, e);
                break Err(e);
            }
        };

        // Cleanup: on an orderly end the writer flushes what is queued and
        // stops once the last sender is gone, within the flush timeout.
        let released = self.dispatcher.release(&self.session_id);
        drop(ctx);
        if inbound.is_err() {
            shutdown.cancel();
        }

        let joined = match tokio::time::timeout(self.config.flush_timeout, &mut writer).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!(
                    "[{}] Outbound flush exceeded {:?}, abandoning transport",
                    self.session_id, self.config.flush_timeout
                );
                shutdown.cancel();
                writer.await
            }
        };
        let written = match joined {
            Ok(result) => result,
            Err(e) => Err(SessionError::Delivery(format!("writer task failed: {}", e))),
        };

        info!(
            "[{}] Session ended ({} subscription(s) cancelled)",
            self.session_id,
            released.len()
        );
        inbound.and(written)
    }
}

/// Drain the outbound sink into the transport until shutdown or failure.
async fn write_loop<K: FrameSink>(
    session_id: String,
    mut sink: K,
    mut rx: mpsc::Receiver<Vec<u8>>,
    shutdown: CancellationToken,
    close_timeout: Duration,
) -> Result<(), SessionError> {
    let result = loop {
        let payload = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break Ok(()),
            msg = rx.recv() => match msg {
                Some(payload) => payload,
                None => break Ok(()),
            },
        };

        let sent = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                break Err(SessionError::Delivery("send interrupted by shutdown".into()))
            }
            sent = sink.send_frame(payload) => sent,
        };
        if let Err(e) = sent {
            debug!("[{}] Send failed, closing: {}", session_id, e);
            shutdown.cancel();
            break Err(e);
        }
    };

    match tokio::time::timeout(close_timeout, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("[{}] Close failed: {}", session_id, e),
        Err(_) => debug!("[{}] Close timed out", session_id),
    }
    result
}
