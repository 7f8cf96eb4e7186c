// SPDX-License-Identifier: MIT OR Apache-2.0
//! WebSocket adapters: one text message per frame, binary rejected.

use std::io;

use async_trait::async_trait;
use axum::extract::ws::{Message as AxMessage, WebSocket};
use cw_rpc::{FrameSink, FrameSource, RpcSession, SessionConfig};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as TungMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::AppState;

fn broken_pipe(e: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, e.to_string())
}

fn binary_rejected() -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        "binary messages are not accepted",
    )
}

// ---------------------------------------------------------------------------
// Server side (axum)
// ---------------------------------------------------------------------------

struct ServerSink {
    tx: SplitSink<WebSocket, AxMessage>,
}

#[async_trait]
impl FrameSink for ServerSink {
    async fn send(&mut self, line: String) -> io::Result<()> {
        let text = line.trim_end().to_owned();
        self.tx
            .send(AxMessage::Text(text.into()))
            .await
            .map_err(broken_pipe)
    }
}

struct ServerSource {
    rx: SplitStream<WebSocket>,
}

#[async_trait]
impl FrameSource for ServerSource {
    async fn recv(&mut self) -> io::Result<Option<String>> {
        loop {
            match self.rx.next().await {
                None => return Ok(None),
                Some(Err(e)) => return Err(broken_pipe(e)),
                Some(Ok(AxMessage::Text(text))) => return Ok(Some(text.to_string())),
                Some(Ok(AxMessage::Close(_))) => return Ok(None),
                Some(Ok(AxMessage::Binary(_))) => return Err(binary_rejected()),
                // Ping/pong are the transport's business.
                Some(Ok(_)) => {}
            }
        }
    }
}

/// Serve one accepted WebSocket as a server-side session; resolves when
/// the session tears down.
pub(crate) async fn serve_socket(socket: WebSocket, state: AppState) {
    let (tx, rx) = socket.split();
    let session = RpcSession::spawn(
        ServerSink { tx },
        ServerSource { rx },
        SessionConfig::server().with_local_main(state.new_main()),
    );
    debug!(target: "cw_server", "websocket session started");
    session.closed().await;
    debug!(target: "cw_server", "websocket session ended");
}

// ---------------------------------------------------------------------------
// Client side (tokio-tungstenite)
// ---------------------------------------------------------------------------

type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct ClientSink {
    tx: SplitSink<ClientStream, TungMessage>,
}

#[async_trait]
impl FrameSink for ClientSink {
    async fn send(&mut self, line: String) -> io::Result<()> {
        let text = line.trim_end().to_owned();
        self.tx
            .send(TungMessage::Text(text.into()))
            .await
            .map_err(broken_pipe)
    }
}

struct ClientSource {
    rx: SplitStream<ClientStream>,
}

#[async_trait]
impl FrameSource for ClientSource {
    async fn recv(&mut self) -> io::Result<Option<String>> {
        loop {
            match self.rx.next().await {
                None => return Ok(None),
                Some(Err(e)) => return Err(broken_pipe(e)),
                Some(Ok(TungMessage::Text(text))) => return Ok(Some(text.to_string())),
                Some(Ok(TungMessage::Close(_))) => return Ok(None),
                Some(Ok(TungMessage::Binary(_))) => return Err(binary_rejected()),
                Some(Ok(_)) => {}
            }
        }
    }
}

/// Wrap an established client WebSocket in a session.
pub(crate) fn client_session(stream: ClientStream, config: SessionConfig) -> RpcSession {
    let (tx, rx) = stream.split();
    RpcSession::spawn(ClientSink { tx }, ClientSource { rx }, config)
}
