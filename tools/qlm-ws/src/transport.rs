// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! axum WebSocket halves as session frame source / sink.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use qlm_core::{Frame, FrameSink, FrameSource, SessionError};

/// Split a socket into the halves a `ConnectionSession` runs on.
pub fn split(socket: WebSocket) -> (WsSource, WsSink) {
    let (tx, rx) = socket.split();
    (WsSource { rx }, WsSink { tx })
}

pub struct WsSource {
    rx: SplitStream<WebSocket>,
}

#[async_trait]
impl FrameSource for WsSource {
    async fn next_frame(&mut self) -> Option<Result<Frame, SessionError>> {
        let msg = self.rx.next().await?;
        Some(
            msg.map(into_frame)
                .map_err(|e| SessionError::Transport(e.to_string())),
        )
    }
}

pub struct WsSink {
    tx: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_frame(&mut self, payload: Vec<u8>) -> Result<(), SessionError> {
        self.tx
            .send(Message::Binary(payload))
            .await
            .map_err(|e| SessionError::Delivery(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        self.tx
            .close()
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))
    }
}

fn into_frame(msg: Message) -> Frame {
    match msg {
        Message::Binary(bytes) => Frame::Binary(bytes),
        Message::Text(text) => Frame::Text(text),
        // axum answers pings itself
        Message::Ping(_) => Frame::Ping,
        Message::Pong(_) => Frame::Pong,
        Message::Close(_) => Frame::Close,
    }
}
