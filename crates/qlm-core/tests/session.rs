// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Drives ConnectionSession over an in-memory transport built from channels.

use async_trait::async_trait;
use qlm_core::protocol::DataPoint;
use qlm_core::{
    ConnectionSession, Datastore, Envelope, EnvelopeCodec, Frame, FrameSink, FrameSource,
    InMemoryStore, JsonCodec, MessageDispatcher, Response, ReturnCode, SessionConfig,
    SessionError,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct ChannelSource {
    rx: mpsc::Receiver<Frame>,
}

#[async_trait]
impl FrameSource for ChannelSource {
    async fn next_frame(&mut self) -> Option<Result<Frame, SessionError>> {
        self.rx.recv().await.map(Ok)
    }
}

struct ChannelSink {
    tx: mpsc::Sender<Vec<u8>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send_frame(&mut self, payload: Vec<u8>) -> Result<(), SessionError> {
        self.tx
            .send(payload)
            .await
            .map_err(|_| SessionError::Delivery("peer gone".into()))
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(SessionError::Transport("closed twice".into()));
        }
        Ok(())
    }
}

/// Client end of an in-memory connection.
struct Client {
    to_server: mpsc::Sender<Frame>,
    from_server: mpsc::Receiver<Vec<u8>>,
    closed: Arc<AtomicBool>,
    task: JoinHandle<Result<(), SessionError>>,
}

impl Client {
    fn connect(dispatcher: Arc<MessageDispatcher>) -> Self {
        let (to_server, rx) = mpsc::channel(16);
        let (tx, from_server) = mpsc::channel(16);
        let closed = Arc::new(AtomicBool::new(false));

        let session = ConnectionSession::new(dispatcher, SessionConfig::default());
        let task = tokio::spawn(session.run(
            ChannelSource { rx },
            ChannelSink {
                tx,
                closed: closed.clone(),
            },
        ));

        Self {
            to_server,
            from_server,
            closed,
            task,
        }
    }

    async fn send(&self, json: &str) {
        self.to_server
            .send(Frame::Binary(json.as_bytes().to_vec()))
            .await
            .expect("session alive");
    }

    async fn recv(&mut self) -> Response {
        let bytes = tokio::time::timeout(Duration::from_secs(5), self.from_server.recv())
            .await
            .expect("response in time")
            .expect("session open");
        match JsonCodec.decode(&bytes).expect("decode") {
            Envelope::Response(r) => r,
            other => panic!("Expected Response, got {:?}", other),
        }
    }
}

fn dispatcher(store: Arc<InMemoryStore>) -> Arc<MessageDispatcher> {
    Arc::new(MessageDispatcher::new(store, Arc::new(JsonCodec)))
}

#[tokio::test]
async fn test_write_read_cancel_over_session() {
    let store = Arc::new(InMemoryStore::new());
    let mut client = Client::connect(dispatcher(store.clone()));

    client
        .send(r#"{"write": {"objects": [{"id": "n1", "infoItems": [{"name": "temp", "values": [{"text": "20"}]}]}]}}"#)
        .await;
    assert_eq!(client.recv().await.primary_code(), ReturnCode::Success);

    client
        .send(r#"{"read": {"objects": [{"id": "n1", "infoItems": [{"name": "temp"}]}]}}"#)
        .await;
    let read = client.recv().await;
    let request_id = read.results[0].request_id.clone().unwrap();
    let objects = read.results[0].objects.as_ref().unwrap();
    assert_eq!(objects[0].info_items[0].values[0].text, "20");

    client
        .send(&format!(r#"{{"cancel": {{"requestIds": ["{}"]}}}}"#, request_id))
        .await;
    assert_eq!(client.recv().await.primary_code(), ReturnCode::Success);

    client
        .send(&format!(r#"{{"cancel": {{"requestIds": ["{}"]}}}}"#, request_id))
        .await;
    assert_eq!(client.recv().await.primary_code(), ReturnCode::NotFound);

    client.to_server.send(Frame::Close).await.unwrap();
    client.task.await.unwrap().unwrap();
    assert!(client.closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_malformed_frame_keeps_session_open() {
    let store = Arc::new(InMemoryStore::new());
    let mut client = Client::connect(dispatcher(store));

    client.send("not an envelope").await;
    assert_eq!(client.recv().await.primary_code(), ReturnCode::BadRequest);

    client.send("{}").await;
    assert_eq!(client.recv().await.primary_code(), ReturnCode::Success);

    drop(client.to_server);
    client.task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_tears_down_interval_subscriptions() {
    let store = Arc::new(InMemoryStore::new());
    store
        .write("n1", vec![DataPoint::new("temp", "20")])
        .await
        .unwrap();
    let dispatcher = dispatcher(store.clone());
    let mut client = Client::connect(dispatcher.clone());

    client
        .send(r#"{"read": {"interval": 1, "objects": [{"id": "n1"}]}}"#)
        .await;
    let ack = client.recv().await;
    let request_id = ack.results[0].request_id.clone().unwrap();
    assert!(dispatcher.scheduler().is_running(&request_id));

    store
        .write("n1", vec![DataPoint::new("temp", "23")])
        .await
        .unwrap();
    let batch = client.recv().await;
    assert_eq!(batch.results[0].request_id.as_deref(), Some(request_id.as_str()));
    let objects = batch.results[0].objects.as_ref().unwrap();
    assert_eq!(objects[0].info_items[0].values[0].text, "23");

    client.to_server.send(Frame::Close).await.unwrap();
    client.task.await.unwrap().unwrap();

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(store.stats().subscriptions, 0);
    assert!(!dispatcher.scheduler().is_running(&request_id));
}

#[tokio::test]
async fn test_peer_gone_ends_session() {
    let store = Arc::new(InMemoryStore::new());
    let client = Client::connect(dispatcher(store));
    let Client {
        to_server,
        from_server,
        closed,
        task,
    } = client;

    drop(from_server);
    to_server
        .send(Frame::Text("{}".into()))
        .await
        .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("session ends")
        .unwrap();
    assert!(matches!(result, Err(SessionError::Delivery(_))));
    assert!(closed.load(Ordering::SeqCst));
}
