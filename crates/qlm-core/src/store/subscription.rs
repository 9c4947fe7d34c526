// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Subscription records and request id allocation.

use crate::protocol::{MeasurementKey, Update};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TryRecvError, TrySendError};
use tokio_util::sync::CancellationToken;

/// Allocates `REQ0000001`, `REQ0000002`, ... Never reuses an id.
#[derive(Debug, Default)]
pub struct RequestIdGenerator {
    last: AtomicU64,
}

impl RequestIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> String {
        let n = self.last.fetch_add(1, Ordering::Relaxed) + 1;
        format!("REQ{:07}", n)
    }
}

/// Result of offering one update to a subscription's reply sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    /// Queued for the next drain.
    Queued,
    /// Sink full; parked in the backlog until [`SubscriptionRecord::flush`].
    Deferred,
    /// Subscription was cancelled before the update could be queued.
    Closed,
}

/// What a backlog flush did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub delivered: usize,
    pub dropped: usize,
}

/// One live subscription.
///
/// The reply sink is a bounded channel owned by the record: publishers hold
/// the sender, [`drain`](Self::drain) empties the receiver without blocking.
/// Closing the receiver on cancel makes every later (or pending) send fail, so
/// nothing is queued for a request id once its cancel has returned.
///
/// Updates that find the sink full wait in a per-record backlog. While the
/// backlog is non-empty every new update joins its tail, so the sink always
/// sees updates in offer order.
#[derive(Debug)]
pub struct SubscriptionRecord {
    request_id: String,
    keys: Vec<MeasurementKey>,
    owner: Option<String>,
    interval: Option<Duration>,
    tx: mpsc::Sender<Update>,
    rx: Mutex<mpsc::Receiver<Update>>,
    backlog: Mutex<VecDeque<Update>>,
    flushing: tokio::sync::Mutex<()>,
    stop: CancellationToken,
}

impl SubscriptionRecord {
    pub fn new(
        request_id: String,
        keys: Vec<MeasurementKey>,
        owner: Option<String>,
        interval: Option<Duration>,
        capacity: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            request_id,
            keys,
            owner,
            interval,
            tx,
            rx: Mutex::new(rx),
            backlog: Mutex::new(VecDeque::new()),
            flushing: tokio::sync::Mutex::new(()),
            stop: CancellationToken::new(),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn keys(&self) -> &[MeasurementKey] {
        &self.keys
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    /// Periodic delivery interval, for subscriptions served by the scheduler.
    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Token cancelled when the subscription is torn down.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Hand an update over without waiting.
    ///
    /// Called with the store lock held, which fixes the offer order.
    pub fn offer(&self, update: Update) -> Offer {
        let mut backlog = self.backlog.lock();
        if !backlog.is_empty() {
            backlog.push_back(update);
            return Offer::Deferred;
        }
        match self.tx.try_send(update) {
            Ok(()) => Offer::Queued,
            Err(TrySendError::Full(update)) => {
                backlog.push_back(update);
                Offer::Deferred
            }
            Err(TrySendError::Closed(_)) => Offer::Closed,
        }
    }

    /// Move the backlog into the sink, oldest first.
    ///
    /// Each update waits at most `timeout` for room. When one times out the
    /// subscriber is stalled and the whole backlog is discarded.
    pub async fn flush(&self, timeout: Duration) -> FlushReport {
        let _turn = self.flushing.lock().await;
        let mut report = FlushReport::default();

        loop {
            // The head stays parked until it is sent, so concurrent offers
            // keep queueing behind it.
            let head = self.backlog.lock().front().cloned();
            let Some(update) = head else { break };

            match self.tx.send_timeout(update, timeout).await {
                Ok(()) => {
                    self.backlog.lock().pop_front();
                    report.delivered += 1;
                }
                Err(SendTimeoutError::Timeout(_)) => {
                    let mut backlog = self.backlog.lock();
                    report.dropped += backlog.len();
                    backlog.clear();
                    break;
                }
                Err(SendTimeoutError::Closed(_)) => {
                    self.backlog.lock().clear();
                    break;
                }
            }
        }

        report
    }

    /// Take everything queued so far, oldest first. Never blocks on an empty sink.
    pub fn drain(&self) -> Vec<Update> {
        let mut rx = self.rx.lock();
        let mut batch = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(update) => batch.push(update),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        batch
    }

    /// Refuse further offers and signal the interval task, if any.
    pub fn close(&self) {
        self.rx.lock().close();
        self.backlog.lock().clear();
        self.stop.cancel();
    }
}
