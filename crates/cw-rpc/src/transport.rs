// SPDX-License-Identifier: MIT OR Apache-2.0
//! Transport traits the session drives.
//!
//! The session core is transport-oblivious: it is given a sink and a source
//! that move one JSON document per message. Adapters exist for in-memory
//! channels (testing), WebSocket connections, and buffered batch bodies.

use async_trait::async_trait;
use std::io;

/// The outgoing half of a frame channel.
///
/// `send` receives exactly one newline-terminated JSON document per call.
/// Transports that frame messages themselves (e.g. WebSocket) may trim the
/// newline.
#[async_trait]
pub trait FrameSink: Send + 'static {
    /// Write one frame. An error means the channel is unusable; the session
    /// tears down with `Disconnected`.
    async fn send(&mut self, line: String) -> io::Result<()>;
}

/// The incoming half of a frame channel.
#[async_trait]
pub trait FrameSource: Send + 'static {
    /// Read the next frame, or `None` once the channel is exhausted.
    async fn recv(&mut self) -> io::Result<Option<String>>;
}

// ---------------------------------------------------------------------------
// Channel-backed implementations
// ---------------------------------------------------------------------------

/// Sink half of an in-process frame channel.
pub struct ChannelSink {
    tx: tokio::sync::mpsc::Sender<String>,
}

/// Source half of an in-process frame channel.
pub struct ChannelSource {
    rx: tokio::sync::mpsc::Receiver<String>,
}

/// Create a one-directional in-process frame channel.
///
/// Two of these back to back form the duplex pair used to wire two sessions
/// together in tests; `cw-testkit` wraps that as `memory_transport`.
pub fn frame_channel(capacity: usize) -> (ChannelSink, ChannelSource) {
    let (tx, rx) = tokio::sync::mpsc::channel(capacity);
    (ChannelSink { tx }, ChannelSource { rx })
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send(&mut self, line: String) -> io::Result<()> {
        self.tx
            .send(line)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer dropped the channel"))
    }
}

#[async_trait]
impl FrameSource for ChannelSource {
    async fn recv(&mut self) -> io::Result<Option<String>> {
        Ok(self.rx.recv().await)
    }
}
