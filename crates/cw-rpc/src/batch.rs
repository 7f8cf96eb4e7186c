// SPDX-License-Identifier: MIT OR Apache-2.0
//! Single-shot batch adaptation of the session.
//!
//! A batch session is driven by one request/response: the request body
//! carries push frames, the response body carries everything the session
//! emitted until the input was exhausted and the accepted calls finished.
//! The channel is simplex, so capabilities in a batch response cannot be
//! called again; stubs decoded from one fail with `Disconnected`.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use cw_error::RpcError;
use tokio::sync::mpsc;

use crate::codec::{self, DecodeCx, DecodeOrigin};
use crate::config::{EofPolicy, SessionConfig, Side};
use crate::frame::{Frame, JsonlCodec, PushPayload};
use crate::session::RpcSession;
use crate::tables::{ExportTable, ImportTable};
use crate::target::RpcTarget;
use crate::transport::{FrameSink, FrameSource};
use crate::value::Value;

// ---------------------------------------------------------------------------
// Server side
// ---------------------------------------------------------------------------

struct BufferSink {
    buf: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl FrameSink for BufferSink {
    async fn send(&mut self, line: String) -> io::Result<()> {
        self.buf.lock().expect("batch buffer poisoned").push(line);
        Ok(())
    }
}

struct BodySource {
    lines: std::vec::IntoIter<String>,
}

#[async_trait]
impl FrameSource for BodySource {
    async fn recv(&mut self) -> io::Result<Option<String>> {
        Ok(self.lines.next())
    }
}

/// Run a server-side session against one batch request body.
///
/// The session treats the body as the incoming half of a duplex channel;
/// outgoing frames buffer until the input is exhausted and every accepted
/// call has settled, then come back as the response body. Malformed input
/// aborts the session and the abort frame ends the response.
pub async fn serve_batch(local_main: Arc<dyn RpcTarget>, body: &str) -> String {
    let buf = Arc::new(Mutex::new(Vec::new()));
    let sink = BufferSink {
        buf: Arc::clone(&buf),
    };
    let source = BodySource {
        lines: body
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect::<Vec<_>>()
            .into_iter(),
    };

    let mut config = SessionConfig::server().with_local_main(local_main);
    config.eof = EofPolicy::Drain;

    let session = RpcSession::spawn(sink, source, config);
    session.closed().await;

    let lines = buf.lock().expect("batch buffer poisoned");
    lines.concat()
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

/// Client-side batch builder: queue calls, take the body, apply the
/// response.
///
/// The builder owns a private pair of tables so queued arguments may carry
/// capabilities, and response decoding follows the same codec rules as a
/// live session. Because no channel remains open afterwards, any stub in a
/// response is implicitly released and fails with `Disconnected` when
/// invoked.
pub struct BatchClient {
    exports: ExportTable,
    imports: ImportTable,
    next_call_id: u64,
    frames: Vec<Frame>,
    expected: Vec<u64>,
}

impl BatchClient {
    /// Create an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self {
            exports: ExportTable::new(Side::Client, None),
            imports: ImportTable::new(),
            next_call_id: 1,
            frames: Vec::new(),
            expected: Vec::new(),
        }
    }

    /// Queue a call, returning its index into the eventual result list.
    pub fn push(
        &mut self,
        target_id: i64,
        method: &str,
        args: Vec<Value>,
    ) -> Result<usize, RpcError> {
        let value = Value::List(args);
        let encoded = codec::encode_value(&value, &mut self.exports)?;
        Ok(self.queue(Frame::Push {
            call_id: 0, // patched by queue
            target_id,
            method: Some(method.to_owned()),
            payload: PushPayload::Call(encoded),
        }))
    }

    /// Queue a property read, returning its index into the result list.
    pub fn push_get(&mut self, target_id: i64, name: &str) -> usize {
        self.queue(Frame::Push {
            call_id: 0, // patched by queue
            target_id,
            method: Some(name.to_owned()),
            payload: PushPayload::Get,
        })
    }

    fn queue(&mut self, mut frame: Frame) -> usize {
        let call_id = self.next_call_id;
        self.next_call_id += 1;
        if let Frame::Push {
            call_id: ref mut id,
            ..
        } = frame
        {
            *id = call_id;
        }
        self.frames.push(frame);
        self.expected.push(call_id);
        self.expected.len() - 1
    }

    /// The newline-delimited request body for the queued calls.
    #[must_use]
    pub fn body(&self) -> String {
        self.frames.iter().map(JsonlCodec::encode).collect()
    }

    /// Number of queued calls.
    #[must_use]
    pub fn len(&self) -> usize {
        self.expected.len()
    }

    /// `true` when no calls are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.expected.is_empty()
    }

    /// Decode a response body into one outcome per queued call, in queue
    /// order.
    ///
    /// Releases in the response settle this side's export table (running
    /// disposers as usual); an abort frame fails the whole batch.
    pub fn apply_response(
        mut self,
        body: &str,
    ) -> Result<Vec<Result<Value, RpcError>>, RpcError> {
        let frames = JsonlCodec::parse_lines(body)?;
        let mut results: HashMap<u64, Result<Value, RpcError>> = HashMap::new();

        // The stubs decoded here outlive no session; their drops go to a
        // channel nobody reads, which is the implicit release the simplex
        // transport implies.
        let (ops_tx, _ops_rx) = mpsc::unbounded_channel();
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let session = Weak::new();

        for frame in frames {
            match frame {
                Frame::Pull { call_id, result } => {
                    let mut cx = DecodeCx {
                        imports: &mut self.imports,
                        exports: &self.exports,
                        session: &session,
                        ops: &ops_tx,
                        out: &out_tx,
                        origin: DecodeOrigin::Result,
                    };
                    let value = codec::decode_value(&result, &mut cx)?;
                    let outcome = match value {
                        Value::Error(err) => Err(err),
                        other => Ok(other),
                    };
                    results.insert(call_id, outcome);
                }
                Frame::Release { id, count } => {
                    if let Some(target) = self.exports.release(id, count)? {
                        target.disposed();
                    }
                }
                Frame::Abort { error } => {
                    return Err(codec::parse_error_node(&error)
                        .unwrap_or_else(|_| RpcError::disconnected("batch aborted by peer")));
                }
                Frame::Push { .. } => {
                    return Err(RpcError::protocol("unexpected push in batch response"));
                }
            }
        }

        Ok(self
            .expected
            .iter()
            .map(|call_id| {
                results
                    .remove(call_id)
                    .unwrap_or_else(|| Err(RpcError::disconnected("call received no reply")))
            })
            .collect())
    }
}

impl Default for BatchClient {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
