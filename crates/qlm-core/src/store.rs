// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Subscription-aware latest-value store.
//!
//! # Write semantics
//!
//! A write for node N is a full-state replace: measurements of N missing from
//! the write are deleted, and subscriptions left with none of their keys still
//! indexed are cancelled. Surviving and new values are then published to every
//! subscription of their key.
//!
//! # Locking
//!
//! Three pieces of shared state (latest values, key -> subscription index,
//! request id -> record table) sit behind one `RwLock`. It is never held
//! across an `.await`. A write mutates the maps and offers each new value to
//! the subscribers of its key under the exclusive lock. Offers never wait, so
//! every reply sink sees updates in the order the writes were accepted.
//!
//! # Slow subscribers
//!
//! Each reply sink is bounded. An update that finds it full is parked in that
//! subscription's backlog, and the write flushes the backlog after releasing
//! the store lock. A flush waits up to the configured timeout for room, then
//! drops the backlog and counts it in [`StoreStats`]. Only writers feeding the
//! stalled subscription wait; other keys and nodes are unaffected.

pub mod subscription;

pub use subscription::{FlushReport, Offer, RequestIdGenerator, SubscriptionRecord};

use crate::error::{StoreError, StoreResult};
use crate::protocol::{unix_now, DataPoint, MeasurementKey, Update};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Store tuning.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Pending updates per subscription before new ones are parked
    pub subscription_queue_capacity: usize,
    /// How long a parked update may wait on a full reply sink
    pub publish_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            subscription_queue_capacity: 4096,
            publish_timeout: Duration::from_millis(1000),
        }
    }
}

/// Extra parameters of a subscription.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Session that owns the subscription (torn down with it)
    pub owner: Option<String>,
    /// Periodic delivery interval, recorded for introspection
    pub interval: Option<Duration>,
}

impl SubscribeOptions {
    pub fn owned_by(owner: impl Into<String>) -> Self {
        Self {
            owner: Some(owner.into()),
            interval: None,
        }
    }

    pub fn with_interval(mut self, interval: Option<Duration>) -> Self {
        self.interval = interval;
        self
    }
}

/// A freshly registered subscription.
#[derive(Debug, Clone)]
pub struct Subscribed {
    pub request_id: String,
    /// Cancelled when the subscription is torn down
    pub stop: CancellationToken,
}

/// What a write did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteSummary {
    /// Measurements stored by this write
    pub stored: usize,
    /// Measurements deleted because the write omitted them
    pub pruned: Vec<String>,
    /// Subscriptions cancelled because all their keys were pruned
    pub cancelled: Vec<String>,
    /// Updates queued on reply sinks
    pub delivered: usize,
    /// Updates dropped on full reply sinks
    pub dropped: usize,
}

/// Store counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub nodes: usize,
    pub measurements: usize,
    pub subscriptions: usize,
    /// Subscriptions served by periodic delivery
    pub interval_subscriptions: usize,
    pub dropped_updates: u64,
}

/// Latest-value store with publish/subscribe fan-out.
///
/// Shared as `Arc<dyn Datastore>`; the dispatcher and scheduler only see this
/// trait, which also lets tests substitute a counting store.
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Replace the stored measurement set of `node` and publish the new values.
    async fn write(&self, node: &str, points: Vec<DataPoint>) -> StoreResult<WriteSummary>;

    /// Register one subscription spanning `measurements` of `node`.
    ///
    /// An empty list covers every measurement the node has right now. Names
    /// not stored yet are indexed and simply never receive publishes until
    /// written.
    fn subscribe(
        &self,
        node: &str,
        measurements: &[String],
        options: SubscribeOptions,
    ) -> StoreResult<Subscribed>;

    /// Drain the updates accumulated for `request_id` without blocking.
    fn read_immediate(&self, request_id: &str) -> StoreResult<Vec<Update>>;

    /// Current values of `measurements` of `node` (all of them if empty).
    fn latest(&self, node: &str, measurements: &[String]) -> StoreResult<Vec<Update>>;

    /// Tear down a subscription. A second cancel of the same id fails.
    fn cancel(&self, request_id: &str) -> StoreResult<()>;

    /// Cancel every subscription owned by `owner`; returns their ids.
    fn cancel_owned_by(&self, owner: &str) -> Vec<String>;

    fn node_list(&self) -> Vec<String>;

    fn source_list(&self, node: &str) -> StoreResult<Vec<String>>;

    fn stats(&self) -> StoreStats;
}

#[derive(Default)]
struct StoreState {
    /// node -> measurement -> latest point
    values: HashMap<String, BTreeMap<String, DataPoint>>,
    /// key -> subscriptions indexed under it
    index: HashMap<MeasurementKey, Vec<Arc<SubscriptionRecord>>>,
    /// request id -> record
    tracking: HashMap<String, Arc<SubscriptionRecord>>,
}

impl StoreState {
    fn is_indexed(&self, record: &Arc<SubscriptionRecord>) -> bool {
        record.keys().iter().any(|key| {
            self.index
                .get(key)
                .map(|subs| subs.iter().any(|s| Arc::ptr_eq(s, record)))
                .unwrap_or(false)
        })
    }

    fn unregister(&mut self, request_id: &str) -> Option<Arc<SubscriptionRecord>> {
        let record = self.tracking.remove(request_id)?;
        for key in record.keys() {
            if let Some(subs) = self.index.get_mut(key) {
                subs.retain(|s| !Arc::ptr_eq(s, &record));
                if subs.is_empty() {
                    self.index.remove(key);
                }
            }
        }
        Some(record)
    }
}

/// In-process [`Datastore`].
pub struct InMemoryStore {
    state: RwLock<StoreState>,
    ids: RequestIdGenerator,
    dropped: AtomicU64,
    config: StoreConfig,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    pub fn with_config(config: StoreConfig) -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            ids: RequestIdGenerator::new(),
            dropped: AtomicU64::new(0),
            config,
        }
    }

    /// Look up a live subscription record.
    pub fn subscription(&self, request_id: &str) -> Option<Arc<SubscriptionRecord>> {
        self.state.read().tracking.get(request_id).cloned()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Datastore for InMemoryStore {
    async fn write(&self, node: &str, points: Vec<DataPoint>) -> StoreResult<WriteSummary> {
        if node.is_empty() {
            return Err(StoreError::InvalidNode("empty node id".into()));
        }

        let now = unix_now();
        let points: Vec<DataPoint> = points
            .into_iter()
            .map(|mut p| {
                if p.timestamp < 1 {
                    p.timestamp = now;
                }
                p
            })
            .collect();

        let mut summary = WriteSummary::default();
        let mut deferred: Vec<Arc<SubscriptionRecord>> = Vec::new();
        let mut orphaned: Vec<Arc<SubscriptionRecord>> = Vec::new();

        {
            let mut state = self.state.write();

            let pruned: Vec<String> = {
                let keep: HashSet<&str> =
                    points.iter().map(|p| p.measurement.as_str()).collect();
                let stored = state.values.entry(node.to_string()).or_default();
                let pruned: Vec<String> = stored
                    .keys()
                    .filter(|m| !keep.contains(m.as_str()))
                    .cloned()
                    .collect();
                for m in &pruned {
                    stored.remove(m);
                }
                pruned
            };

            let mut touched: Vec<Arc<SubscriptionRecord>> = Vec::new();
            for m in &pruned {
                let key = MeasurementKey::new(node, m.as_str());
                if let Some(subs) = state.index.remove(&key) {
                    touched.extend(subs);
                }
            }
            for record in touched {
                if !record.is_closed()
                    && !orphaned.iter().any(|o| Arc::ptr_eq(o, &record))
                    && !state.is_indexed(&record)
                {
                    state.unregister(record.request_id());
                    orphaned.push(record);
                }
            }

            for point in points {
                let key = MeasurementKey::new(node, point.measurement.as_str());
                if let Some(subs) = state.index.get(&key) {
                    for record in subs {
                        let update = Update {
                            node: node.to_string(),
                            measurement: point.measurement.clone(),
                            value: point.value.clone(),
                            timestamp: point.timestamp,
                        };
                        match record.offer(update) {
                            Offer::Queued => summary.delivered += 1,
                            Offer::Deferred => {
                                if !deferred.iter().any(|d| Arc::ptr_eq(d, record)) {
                                    deferred.push(Arc::clone(record));
                                }
                            }
                            Offer::Closed => {}
                        }
                    }
                }
                if let Some(stored) = state.values.get_mut(node) {
                    stored.insert(point.measurement.clone(), point);
                    summary.stored += 1;
                }
            }

            summary.pruned = pruned;
        }

        for record in orphaned {
            record.close();
            tracing::info!(
                "Cancelled {} (node {} no longer reports its measurements)",
                record.request_id(),
                node
            );
            summary.cancelled.push(record.request_id().to_string());
        }

        for record in deferred {
            let report = record.flush(self.config.publish_timeout).await;
            summary.delivered += report.delivered;
            if report.dropped > 0 {
                summary.dropped += report.dropped;
                self.dropped
                    .fetch_add(report.dropped as u64, Ordering::Relaxed);
                tracing::warn!(
                    "Reply sink of {} full for {:?}, {} update(s) dropped",
                    record.request_id(),
                    self.config.publish_timeout,
                    report.dropped
                );
            }
        }

        tracing::debug!(
            "Write {}: {} stored, {} pruned, {} delivered",
            node,
            summary.stored,
            summary.pruned.len(),
            summary.delivered
        );
        Ok(summary)
    }

    fn subscribe(
        &self,
        node: &str,
        measurements: &[String],
        options: SubscribeOptions,
    ) -> StoreResult<Subscribed> {
        let mut state = self.state.write();

        let stored = state
            .values
            .get(node)
            .ok_or_else(|| StoreError::UnknownNode(node.to_string()))?;

        let mut names: Vec<String> = if measurements.is_empty() {
            stored.keys().cloned().collect()
        } else {
            measurements.to_vec()
        };
        let mut seen = HashSet::new();
        names.retain(|n| seen.insert(n.clone()));

        let keys: Vec<MeasurementKey> = names
            .iter()
            .map(|m| MeasurementKey::new(node, m.as_str()))
            .collect();

        let request_id = self.ids.next_id();
        let record = Arc::new(SubscriptionRecord::new(
            request_id.clone(),
            keys,
            options.owner,
            options.interval,
            self.config.subscription_queue_capacity,
        ));

        for key in record.keys() {
            state
                .index
                .entry(key.clone())
                .or_default()
                .push(Arc::clone(&record));
        }
        state.tracking.insert(request_id.clone(), Arc::clone(&record));

        tracing::info!(
            "Subscribed {} to {} ({} measurement(s))",
            request_id,
            node,
            names.len()
        );

        Ok(Subscribed {
            request_id,
            stop: record.stop_token(),
        })
    }

    fn read_immediate(&self, request_id: &str) -> StoreResult<Vec<Update>> {
        let record = self
            .subscription(request_id)
            .ok_or_else(|| StoreError::UnknownSubscription(request_id.to_string()))?;
        Ok(record.drain())
    }

    fn latest(&self, node: &str, measurements: &[String]) -> StoreResult<Vec<Update>> {
        let state = self.state.read();
        let stored = state
            .values
            .get(node)
            .ok_or_else(|| StoreError::UnknownNode(node.to_string()))?;

        let to_update = |p: &DataPoint| Update {
            node: node.to_string(),
            measurement: p.measurement.clone(),
            value: p.value.clone(),
            timestamp: p.timestamp,
        };

        if measurements.is_empty() {
            return Ok(stored.values().map(to_update).collect());
        }
        Ok(measurements
            .iter()
            .filter_map(|m| stored.get(m))
            .map(to_update)
            .collect())
    }

    fn cancel(&self, request_id: &str) -> StoreResult<()> {
        let record = self
            .state
            .write()
            .unregister(request_id)
            .ok_or_else(|| StoreError::UnknownSubscription(request_id.to_string()))?;
        record.close();
        tracing::info!("Cancelled {}", request_id);
        Ok(())
    }

    fn cancel_owned_by(&self, owner: &str) -> Vec<String> {
        let records: Vec<Arc<SubscriptionRecord>> = {
            let mut state = self.state.write();
            let mut ids: Vec<String> = state
                .tracking
                .values()
                .filter(|r| r.owner() == Some(owner))
                .map(|r| r.request_id().to_string())
                .collect();
            ids.sort();
            let records: Vec<Arc<SubscriptionRecord>> =
                ids.iter().filter_map(|id| state.unregister(id)).collect();
            records
        };

        for record in &records {
            record.close();
        }
        if !records.is_empty() {
            tracing::info!(
                "Cancelled {} subscription(s) owned by {}",
                records.len(),
                owner
            );
        }
        records
            .iter()
            .map(|r| r.request_id().to_string())
            .collect()
    }

    fn node_list(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self.state.read().values.keys().cloned().collect();
        nodes.sort();
        nodes
    }

    fn source_list(&self, node: &str) -> StoreResult<Vec<String>> {
        self.state
            .read()
            .values
            .get(node)
            .map(|stored| stored.keys().cloned().collect())
            .ok_or_else(|| StoreError::UnknownNode(node.to_string()))
    }

    fn stats(&self) -> StoreStats {
        let state = self.state.read();
        StoreStats {
            nodes: state.values.len(),
            measurements: state.values.values().map(|m| m.len()).sum(),
            subscriptions: state.tracking.len(),
            interval_subscriptions: state
                .tracking
                .values()
                .filter(|r| r.interval().is_some())
                .count(),
            dropped_updates: self.dropped.load(Ordering::Relaxed),
        }
    }
}
