// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Periodic delivery of accumulated subscription updates.
//!
//! One task per interval-bearing subscription. Each tick drains the
//! subscription with `read_immediate` and delivers the batch as a response
//! envelope on the owning connection's outbound sink. Empty batches are still
//! sent, acting as a heartbeat.
//!
//! # Lifecycle
//!
//! A task is armed until its stop token fires (cancel, owner teardown, or
//! [`IntervalScheduler::stop_all`]) or a delivery fails. However the task
//! ends, its registration guard removes it from the registry and cancels the
//! subscription if nothing else did. Periods below [`MIN_INTERVAL`] are
//! raised to it.
//!
//! # Late delivery
//!
//! The stop token is checked before each tick, never during one. A tick that
//! has already drained its batch when the token fires still hands that batch
//! to the outbound sink, so a subscriber may see at most one delivery after
//! its cancel returned. No tick starts after the stop is observed.

use crate::codec::EnvelopeCodec;
use crate::protocol::{batch_to_objects, Envelope, RequestResult, Response, MIN_INTERVAL};
use crate::session::WeakOutbound;
use crate::store::Datastore;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct TaskEntry {
    period: Duration,
    stop: CancellationToken,
}

/// Removes a task from the registry when the task ends, including by panic.
struct Registration {
    request_id: String,
    stop: CancellationToken,
    store: Arc<dyn Datastore>,
    tasks: Arc<DashMap<String, TaskEntry>>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.tasks.remove(&self.request_id);
        if !self.stop.is_cancelled() && self.store.cancel(&self.request_id).is_ok() {
            info!("Cancelled {} after its interval task ended", self.request_id);
        }
        debug!("Interval task {} stopped", self.request_id);
    }
}

/// Registry and spawner of interval tasks.
#[derive(Clone)]
pub struct IntervalScheduler {
    store: Arc<dyn Datastore>,
    codec: Arc<dyn EnvelopeCodec>,
    tasks: Arc<DashMap<String, TaskEntry>>,
}

impl IntervalScheduler {
    pub fn new(store: Arc<dyn Datastore>, codec: Arc<dyn EnvelopeCodec>) -> Self {
        Self {
            store,
            codec,
            tasks: Arc::new(DashMap::new()),
        }
    }

    /// Spawn the periodic task for `request_id`.
    ///
    /// The first delivery happens one `period` after start. `stop` is the
    /// subscription's token, so cancelling the subscription ends the task.
    pub fn start(
        &self,
        request_id: String,
        period: Duration,
        stop: CancellationToken,
        outbound: WeakOutbound,
    ) -> JoinHandle<()> {
        let period = period.max(MIN_INTERVAL);
        self.tasks.insert(
            request_id.clone(),
            TaskEntry {
                period,
                stop: stop.clone(),
            },
        );
        info!("Interval task {} armed ({:?})", request_id, period);

        let store = Arc::clone(&self.store);
        let codec = Arc::clone(&self.codec);
        let registration = Registration {
            request_id: request_id.clone(),
            stop: stop.clone(),
            store: Arc::clone(&self.store),
            tasks: Arc::clone(&self.tasks),
        };

        tokio::spawn(async move {
            let _registration = registration;
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        if !deliver_tick(&request_id, store.as_ref(), codec.as_ref(), &outbound).await {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Whether a task for `request_id` is still registered.
    pub fn is_running(&self, request_id: &str) -> bool {
        self.tasks.contains_key(request_id)
    }

    /// Period of the task for `request_id`.
    pub fn period(&self, request_id: &str) -> Option<Duration> {
        self.tasks.get(request_id).map(|entry| entry.period)
    }

    pub fn active_count(&self) -> usize {
        self.tasks.len()
    }

    /// Signal every task to stop. Tasks deregister themselves as they exit.
    pub fn stop_all(&self) {
        for entry in self.tasks.iter() {
            entry.stop.cancel();
        }
    }
}

/// One tick. Returns false when the task must end.
async fn deliver_tick(
    request_id: &str,
    store: &dyn Datastore,
    codec: &dyn EnvelopeCodec,
    outbound: &WeakOutbound,
) -> bool {
    let batch = match store.read_immediate(request_id) {
        Ok(batch) => batch,
        Err(e) => {
            debug!("Interval task {}: {}", request_id, e);
            return false;
        }
    };

    let result = RequestResult::success()
        .with_request_id(request_id)
        .with_objects(batch_to_objects(batch));
    let bytes = match codec.encode(&Envelope::Response(Response::single(result))) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Interval task {}: {}", request_id, e);
            return true;
        }
    };

    let Some(sink) = outbound.upgrade() else {
        debug!("Interval task {}: connection gone", request_id);
        return false;
    };
    match sink.deliver(bytes).await {
        Ok(()) => true,
        Err(e) => {
            warn!("Interval task {}: {}", request_id, e);
            false
        }
    }
}
