// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Envelope -> store glue.
//!
//! The dispatcher decodes inbound bytes, runs the request against the
//! [`Datastore`] and queues the response envelope on the requester's outbound
//! sink. Store errors are mapped to response codes; nothing here is retried.
//!
//! | Request | Store calls | Results |
//! |---------|-------------|---------|
//! | Cancel  | `cancel` per id | one per id, 404 if unknown |
//! | Read (objects) | `subscribe` per object, then `latest` or an interval task | one per object |
//! | Read (requestIds only) | `read_immediate` per id | one per id |
//! | Write   | `write` per object | one per object |
//! | Empty   | none | success |
//!
//! A decode failure is answered with bad-request before any store call.

use crate::codec::EnvelopeCodec;
use crate::error::{SessionError, StoreError};
use crate::protocol::{
    batch_to_objects, CancelRequest, DataPoint, Envelope, Object, ReadRequest, RequestResult,
    Response, WriteRequest,
};
use crate::scheduler::IntervalScheduler;
use crate::session::{new_session_id, OutboundSink, SessionContext};
use crate::store::{Datastore, SubscribeOptions};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Map a store error onto a result code.
fn store_error_result(err: StoreError) -> RequestResult {
    match err {
        StoreError::UnknownNode(_) | StoreError::UnknownSubscription(_) => {
            RequestResult::not_found(err.to_string())
        }
        StoreError::InvalidNode(_) => RequestResult::bad_request(err.to_string()),
    }
}

/// Interprets envelopes against a store.
pub struct MessageDispatcher {
    store: Arc<dyn Datastore>,
    codec: Arc<dyn EnvelopeCodec>,
    scheduler: IntervalScheduler,
}

impl MessageDispatcher {
    pub fn new(store: Arc<dyn Datastore>, codec: Arc<dyn EnvelopeCodec>) -> Self {
        let scheduler = IntervalScheduler::new(Arc::clone(&store), Arc::clone(&codec));
        Self {
            store,
            codec,
            scheduler,
        }
    }

    pub fn store(&self) -> &Arc<dyn Datastore> {
        &self.store
    }

    pub fn codec(&self) -> &Arc<dyn EnvelopeCodec> {
        &self.codec
    }

    pub fn scheduler(&self) -> &IntervalScheduler {
        &self.scheduler
    }

    /// Decode `bytes`, handle the envelope and queue the response.
    ///
    /// Only a failure to queue the response is returned; it ends the session.
    pub async fn process(&self, bytes: &[u8], ctx: &SessionContext) -> Result<(), SessionError> {
        let response = self.answer(bytes, ctx).await;
        self.respond(response, ctx).await
    }

    async fn answer(&self, bytes: &[u8], ctx: &SessionContext) -> Response {
        match self.codec.decode(bytes) {
            Ok(envelope) => {
                debug!("[{}] Received {}", ctx.session_id, envelope.kind());
                self.handle(envelope, ctx).await
            }
            Err(e) => {
                debug!("[{}] {}", ctx.session_id, e);
                Response::single(RequestResult::bad_request(e.to_string()))
            }
        }
    }

    /// Answer with bad-request without looking at the payload.
    pub async fn reject(
        &self,
        ctx: &SessionContext,
        description: impl Into<String>,
    ) -> Result<(), SessionError> {
        let response = Response::single(RequestResult::bad_request(description));
        self.respond(response, ctx).await
    }

    /// Cancel everything the session owned. Returns the cancelled ids.
    pub fn release(&self, session_id: &str) -> Vec<String> {
        self.store.cancel_owned_by(session_id)
    }

    /// Stop every interval task.
    pub fn shutdown(&self) {
        self.scheduler.stop_all();
    }

    /// Run one request outside any persistent connection.
    ///
    /// Returns the encoded response envelope. Subscriptions created by the
    /// request are cancelled before returning. The request gets an outbound
    /// sink with no reader, so interval tasks it starts end on their first
    /// tick and nothing ever waits on that sink.
    pub async fn request_once(&self, bytes: &[u8]) -> Vec<u8> {
        let (outbound, rx) = OutboundSink::channel(1);
        drop(rx);
        let ctx = SessionContext::new(format!("once-{}", new_session_id()), outbound);

        let response = self.answer(bytes, &ctx).await;
        let released = self.release(&ctx.session_id);
        if !released.is_empty() {
            debug!("[{}] Released {} subscription(s)", ctx.session_id, released.len());
        }

        self.encode_response(response)
            .or_else(|| {
                self.encode_response(Response::single(RequestResult::internal_error(
                    "response could not be encoded",
                )))
            })
            .unwrap_or_default()
    }

    /// Handle a decoded envelope.
    pub async fn handle(&self, envelope: Envelope, ctx: &SessionContext) -> Response {
        match envelope {
            Envelope::Cancel(req) => self.handle_cancel(req),
            Envelope::Read(req) => self.handle_read(req, ctx),
            Envelope::Write(req) => self.handle_write(req).await,
            Envelope::Empty => Response::single(RequestResult::success()),
            Envelope::Response(_) => Response::single(RequestResult::bad_request(
                "response envelopes are not accepted as requests",
            )),
        }
    }

    fn handle_cancel(&self, req: CancelRequest) -> Response {
        if req.request_ids.is_empty() {
            return Response::single(RequestResult::bad_request("cancel without requestIds"));
        }

        let results = req
            .request_ids
            .into_iter()
            .map(|id| match self.store.cancel(&id) {
                Ok(()) => RequestResult::success().with_request_id(id),
                Err(e) => store_error_result(e).with_request_id(id),
            })
            .collect();
        Response::from_results(results)
    }

    fn handle_read(&self, req: ReadRequest, ctx: &SessionContext) -> Response {
        if req.objects.is_empty() && req.request_ids.is_empty() {
            return Response::single(RequestResult::bad_request(
                "read without objects or requestIds",
            ));
        }

        let period = match req.checked_period() {
            Ok(period) => period,
            Err(reason) => return Response::single(RequestResult::bad_request(reason)),
        };
        let mut results: Vec<RequestResult> = req
            .objects
            .iter()
            .map(|object| self.subscribe_object(object, period, ctx))
            .collect();

        results.extend(req.request_ids.into_iter().map(|id| {
            match self.store.read_immediate(&id) {
                Ok(batch) => RequestResult::success()
                    .with_request_id(id)
                    .with_objects(batch_to_objects(batch)),
                Err(e) => store_error_result(e).with_request_id(id),
            }
        }));

        Response::from_results(results)
    }

    fn subscribe_object(
        &self,
        object: &Object,
        period: Option<Duration>,
        ctx: &SessionContext,
    ) -> RequestResult {
        let names = object.item_names();
        let options = SubscribeOptions::owned_by(ctx.session_id.as_str()).with_interval(period);

        let sub = match self.store.subscribe(&object.id, &names, options) {
            Ok(sub) => sub,
            Err(e) => return store_error_result(e),
        };

        match period {
            Some(period) => {
                self.scheduler.start(
                    sub.request_id.clone(),
                    period,
                    sub.stop,
                    ctx.outbound.downgrade(),
                );
                RequestResult::success().with_request_id(sub.request_id)
            }
            None => match self.store.latest(&object.id, &names) {
                Ok(snapshot) => RequestResult::success()
                    .with_request_id(sub.request_id)
                    .with_objects(batch_to_objects(snapshot)),
                Err(e) => store_error_result(e).with_request_id(sub.request_id),
            },
        }
    }

    async fn handle_write(&self, req: WriteRequest) -> Response {
        if req.objects.is_empty() {
            return Response::single(RequestResult::bad_request("write without objects"));
        }

        let mut results = Vec::with_capacity(req.objects.len());
        for object in req.objects {
            let node = Object::new(object.id.as_str());

            let mut points = Vec::with_capacity(object.info_items.len());
            let mut missing = None;
            for item in object.info_items {
                // Latest-value store: the last value of an item wins
                match item.values.last() {
                    Some(value) => points.push(DataPoint::at(
                        item.name.as_str(),
                        value.text.as_str(),
                        value.timestamp.unwrap_or(0),
                    )),
                    None => {
                        missing = Some(item.name);
                        break;
                    }
                }
            }

            let result = match missing {
                Some(name) => RequestResult::bad_request(format!("info item {} has no value", name)),
                None => match self.store.write(&object.id, points).await {
                    Ok(_) => RequestResult::success(),
                    Err(e) => store_error_result(e),
                },
            };
            results.push(result.with_objects(vec![node]));
        }
        Response::from_results(results)
    }

    fn encode_response(&self, response: Response) -> Option<Vec<u8>> {
        match self.codec.encode(&Envelope::Response(response)) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                error!("Failed to encode response: {}", e);
                None
            }
        }
    }

    async fn respond(&self, response: Response, ctx: &SessionContext) -> Result<(), SessionError> {
        match self.encode_response(response) {
            Some(bytes) => ctx.outbound.deliver(bytes).await,
            None => Ok(()),
        }
    }
}
