// SPDX-License-Identifier: MIT OR Apache-2.0
//! The session dispatcher.
//!
//! A session owns one duplex frame channel. A reader task consumes inbound
//! frames and spawns one handler task per inbound call; a single writer task
//! drains the outgoing queue so the channel only ever sees whole JSON
//! documents. Table operations run under one mutex held only across
//! synchronous sections. Stub drops never take that mutex; they notify the
//! reader through the session's op channel instead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use cw_error::RpcError;
use serde_json::Value as Json;
use tokio::sync::{Notify, Semaphore, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::MAIN_ID;
use crate::codec::{self, DecodeCx, DecodeOrigin};
use crate::config::{DisconnectHook, EofPolicy, SessionConfig};
use crate::frame::{Frame, JsonlCodec, PushPayload};
use crate::stub::Stub;
use crate::tables::{ExportTable, ImportTable};
use crate::target::RpcTarget;
use crate::transport::{FrameSink, FrameSource};
use crate::value::Value;

/// Control messages delivered to the reader task.
pub(crate) enum SessionOp {
    /// The last stub for an import dropped; emit its release.
    ImportDropped(i64),
    /// Local request to shut the session down.
    Close,
    /// The writer lost the channel.
    TransportFailed(String),
}

/// Messages on the single-writer outgoing queue.
#[derive(Debug)]
pub(crate) enum OutMsg {
    Frame(Frame),
    Shutdown,
}

/// A counter snapshot of one session's tables and in-flight work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    /// Live export entries (including the pinned main, when bound).
    pub exports: usize,
    /// Live import entries.
    pub imports: usize,
    /// Import entries still awaiting resolution.
    pub pending_imports: usize,
    /// Outbound calls awaiting their `pull`.
    pub pending_calls: usize,
    /// Inbound calls currently running.
    pub inflight_calls: usize,
}

pub(crate) struct SessionState {
    pub(crate) exports: ExportTable,
    pub(crate) imports: ImportTable,
    calls: HashMap<u64, oneshot::Sender<Result<Value, RpcError>>>,
    next_call_id: u64,
    aborted: Option<RpcError>,
    input_closed: bool,
}

pub(crate) struct SessionShared {
    pub(crate) state: Mutex<SessionState>,
    pub(crate) out_tx: mpsc::UnboundedSender<OutMsg>,
    pub(crate) ops_tx: mpsc::UnboundedSender<SessionOp>,
    self_weak: Weak<SessionShared>,
    inflight: AtomicUsize,
    handlers_done: Notify,
    handler_slots: Option<Arc<Semaphore>>,
    on_disconnect: Option<DisconnectHook>,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
}

/// An inbound invocation decoded from a `push`.
enum Invocation {
    Call {
        method: Option<String>,
        args: Vec<Value>,
    },
    Get {
        name: String,
    },
}

/// How the reader loop ended.
enum LoopEnd {
    /// A fatal local error: tell the peer via `abort`, then stop.
    Fatal(RpcError),
    /// The peer sent `abort`.
    PeerAborted(RpcError),
    /// The transport failed.
    Lost(String),
    /// The source reported end of input.
    Eof,
    /// Local `close()`.
    Closed,
}

enum Flow {
    Continue,
    PeerAborted(RpcError),
}

// ---------------------------------------------------------------------------
// RpcSession
// ---------------------------------------------------------------------------

/// A live RPC session over one frame channel.
///
/// Cloneable handle; the session itself runs on background tasks and keeps
/// serving inbound calls until the channel ends, the peer aborts, or
/// [`close`](RpcSession::close) is called.
#[derive(Clone)]
pub struct RpcSession {
    shared: Arc<SessionShared>,
}

impl RpcSession {
    /// Start a session over the given channel halves.
    pub fn spawn<S, R>(sink: S, source: R, config: SessionConfig) -> Self
    where
        S: FrameSink,
        R: FrameSource,
    {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);

        let shared = Arc::new_cyclic(|self_weak| SessionShared {
            state: Mutex::new(SessionState {
                exports: ExportTable::new(config.side, config.local_main),
                imports: ImportTable::new(),
                calls: HashMap::new(),
                next_call_id: 1,
                aborted: None,
                input_closed: false,
            }),
            out_tx,
            ops_tx: ops_tx.clone(),
            self_weak: self_weak.clone(),
            inflight: AtomicUsize::new(0),
            handlers_done: Notify::new(),
            handler_slots: config
                .max_inflight_calls
                .map(|n| Arc::new(Semaphore::new(n))),
            on_disconnect: config.on_disconnect,
            closed_tx,
            closed_rx,
        });

        let writer = tokio::spawn(write_loop(Box::new(sink), out_rx, ops_tx));
        tokio::spawn(read_loop(
            Arc::clone(&shared),
            Box::new(source),
            ops_rx,
            writer,
            config.eof,
        ));

        Self { shared }
    }

    /// A stub for the peer's main capability (id 0).
    pub fn remote_main(&self) -> Stub {
        let mut st = self.shared.state.lock().expect("session state poisoned");
        let SessionState { imports, .. } = &mut *st;
        imports.adopt(
            MAIN_ID,
            &self.shared.self_weak,
            &self.shared.ops_tx,
            &self.shared.out_tx,
            false,
        )
    }

    /// Invoke `method` on the peer target `target_id`.
    pub async fn call(
        &self,
        target_id: i64,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, RpcError> {
        self.shared.call_remote(target_id, Some(method), args).await
    }

    /// Apply the peer target `target_id` directly (a `null`-method call).
    pub async fn apply(&self, target_id: i64, args: Vec<Value>) -> Result<Value, RpcError> {
        self.shared.call_remote(target_id, None, args).await
    }

    /// Read property `name` of the peer target `target_id`.
    pub async fn get_property(&self, target_id: i64, name: &str) -> Result<Value, RpcError> {
        self.shared.get_remote(target_id, name).await
    }

    /// Shut the session down and wait for teardown to finish. Pending
    /// waiters fail with `Disconnected`.
    pub async fn close(&self) {
        let _ = self.shared.ops_tx.send(SessionOp::Close);
        self.closed().await;
    }

    /// Wait until the session has fully torn down.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// `true` once the session has torn down.
    pub fn is_closed(&self) -> bool {
        *self.shared.closed_rx.borrow()
    }

    /// Snapshot the table sizes and in-flight counters.
    pub fn stats(&self) -> SessionStats {
        let st = self.shared.state.lock().expect("session state poisoned");
        SessionStats {
            exports: st.exports.len(),
            imports: st.imports.len(),
            pending_imports: st.imports.pending_count(),
            pending_calls: st.calls.len(),
            inflight_calls: self.shared.inflight.load(Ordering::SeqCst),
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound calls
// ---------------------------------------------------------------------------

impl SessionShared {
    pub(crate) async fn call_remote(
        &self,
        target_id: i64,
        method: Option<&str>,
        args: Vec<Value>,
    ) -> Result<Value, RpcError> {
        let rx = self.start_call(target_id, method.map(str::to_owned), Some(args))?;
        await_waiter(rx).await
    }

    pub(crate) async fn get_remote(&self, target_id: i64, name: &str) -> Result<Value, RpcError> {
        let rx = self.start_call(target_id, Some(name.to_owned()), None)?;
        await_waiter(rx).await
    }

    /// Allocate a call id, encode the arguments, register the waiter, and
    /// enqueue the `push`. Everything up to the enqueue is atomic with
    /// respect to other session tasks.
    fn start_call(
        &self,
        target_id: i64,
        method: Option<String>,
        args: Option<Vec<Value>>,
    ) -> Result<oneshot::Receiver<Result<Value, RpcError>>, RpcError> {
        let (tx, rx) = oneshot::channel();
        let (frame, args_guard) = {
            let mut st = self.state.lock().expect("session state poisoned");
            if let Some(reason) = &st.aborted {
                return Err(reason.clone());
            }
            if st.input_closed {
                return Err(RpcError::disconnected("batch input exhausted"));
            }
            let (payload, guard) = match args {
                Some(items) => {
                    let value = Value::List(items);
                    let encoded = codec::encode_value(&value, &mut st.exports)?;
                    (PushPayload::Call(encoded), Some(value))
                }
                None => (PushPayload::Get, None),
            };
            let call_id = st.next_call_id;
            st.next_call_id += 1;
            st.calls.insert(call_id, tx);
            (
                Frame::Push {
                    call_id,
                    target_id,
                    method,
                    payload,
                },
                guard,
            )
        };
        let _ = self.out_tx.send(OutMsg::Frame(frame));
        // The argument values outlive the enqueue: any stub they contain
        // must not release before the push that references it.
        drop(args_guard);
        Ok(rx)
    }
}

async fn await_waiter(
    rx: oneshot::Receiver<Result<Value, RpcError>>,
) -> Result<Value, RpcError> {
    match rx.await {
        Ok(outcome) => outcome,
        Err(_) => Err(RpcError::disconnected("session dropped the call")),
    }
}

// ---------------------------------------------------------------------------
// Inbound frames
// ---------------------------------------------------------------------------

impl SessionShared {
    fn handle_line(&self, line: &str) -> Result<Flow, RpcError> {
        let frame = JsonlCodec::decode(line)?;
        debug!(target: "cw_rpc", frame = ?frame, "frame received");
        match frame {
            Frame::Push {
                call_id,
                target_id,
                method,
                payload,
            } => {
                self.handle_push(call_id, target_id, method, payload)?;
                Ok(Flow::Continue)
            }
            Frame::Pull { call_id, result } => {
                self.handle_pull(call_id, &result)?;
                Ok(Flow::Continue)
            }
            Frame::Release { id, count } => {
                self.handle_release(id, count)?;
                Ok(Flow::Continue)
            }
            Frame::Abort { error } => {
                let reason = codec::parse_error_node(&error)
                    .unwrap_or_else(|_| RpcError::disconnected("session aborted by peer"));
                Ok(Flow::PeerAborted(reason))
            }
        }
    }

    fn handle_push(
        &self,
        call_id: u64,
        target_id: i64,
        method: Option<String>,
        payload: PushPayload,
    ) -> Result<(), RpcError> {
        let (target, invocation) = {
            let mut st = self.state.lock().expect("session state poisoned");
            if st.aborted.is_some() {
                return Ok(());
            }
            let Some(target) = st.exports.get(target_id) else {
                drop(st);
                self.send_pull(
                    call_id,
                    codec::error_node(&RpcError::not_found(format!(
                        "unknown target {target_id}"
                    ))),
                );
                return Ok(());
            };
            let invocation = match payload {
                PushPayload::Get => {
                    let name = method
                        .ok_or_else(|| RpcError::protocol("property access requires a name"))?;
                    Invocation::Get { name }
                }
                PushPayload::Call(raw) => {
                    let SessionState {
                        exports, imports, ..
                    } = &mut *st;
                    let mut cx = DecodeCx {
                        imports,
                        exports,
                        session: &self.self_weak,
                        ops: &self.ops_tx,
                        out: &self.out_tx,
                        origin: DecodeOrigin::Args,
                    };
                    let decoded = codec::decode_value(&raw, &mut cx)?;
                    let Value::List(args) = decoded else {
                        return Err(RpcError::protocol("push arguments must be a list"));
                    };
                    Invocation::Call { method, args }
                }
            };
            (target, invocation)
        };
        self.spawn_handler(call_id, target, invocation);
        Ok(())
    }

    /// Run one inbound call on its own task so a slow target never blocks
    /// unrelated frames.
    fn spawn_handler(&self, call_id: u64, target: Arc<dyn RpcTarget>, invocation: Invocation) {
        let Some(shared) = self.self_weak.upgrade() else {
            return;
        };
        self.inflight.fetch_add(1, Ordering::SeqCst);
        let slots = self.handler_slots.clone();
        tokio::spawn(async move {
            let _permit = match slots {
                Some(sem) => sem.acquire_owned().await.ok(),
                None => None,
            };
            let outcome = match invocation {
                Invocation::Call { method, args } => target.call(method.as_deref(), args).await,
                Invocation::Get { name } => target.get_property(&name),
            };
            shared.finish_handler(call_id, outcome);
        });
    }

    fn finish_handler(&self, call_id: u64, outcome: Result<Value, RpcError>) {
        let node = {
            let mut st = self.state.lock().expect("session state poisoned");
            if st.aborted.is_some() {
                None
            } else {
                Some(match &outcome {
                    Ok(value) => codec::encode_value(value, &mut st.exports)
                        .unwrap_or_else(|e| codec::error_node(&e)),
                    Err(e) => codec::error_node(e),
                })
            }
        };
        if let Some(node) = node {
            self.send_pull(call_id, node);
        }
        // `outcome` drops here, after its pull is queued.
        drop(outcome);
        self.inflight.fetch_sub(1, Ordering::SeqCst);
        self.handlers_done.notify_one();
    }

    fn handle_pull(&self, call_id: u64, result: &Json) -> Result<(), RpcError> {
        let (tx, decoded) = {
            let mut st = self.state.lock().expect("session state poisoned");
            let Some(tx) = st.calls.remove(&call_id) else {
                return Err(RpcError::protocol(format!(
                    "pull for unknown call {call_id}"
                )));
            };
            let SessionState {
                exports, imports, ..
            } = &mut *st;
            let mut cx = DecodeCx {
                imports,
                exports,
                session: &self.self_weak,
                ops: &self.ops_tx,
                out: &self.out_tx,
                origin: DecodeOrigin::Result,
            };
            (tx, codec::decode_value(result, &mut cx))
        };
        match decoded {
            Ok(Value::Error(err)) => {
                let _ = tx.send(Err(err));
                Ok(())
            }
            Ok(value) => {
                // A dropped waiter is fine: the reply is consumed either way
                // so the call-record map stays bounded.
                let _ = tx.send(Ok(value));
                Ok(())
            }
            Err(fatal) => {
                let _ = tx.send(Err(fatal.clone()));
                Err(fatal)
            }
        }
    }

    fn handle_release(&self, id: i64, count: u64) -> Result<(), RpcError> {
        let disposed = {
            self.state
                .lock()
                .expect("session state poisoned")
                .exports
                .release(id, count)?
        };
        if let Some(target) = disposed {
            // The disposer is user code; run it outside the session lock.
            target.disposed();
        }
        Ok(())
    }

    fn send_pull(&self, call_id: u64, result: Json) {
        let _ = self.out_tx.send(OutMsg::Frame(Frame::Pull { call_id, result }));
    }

    fn import_dropped(&self, id: i64) {
        let (count, aborted) = {
            let mut st = self.state.lock().expect("session state poisoned");
            (st.imports.drop_handle(id), st.aborted.is_some())
        };
        if let Some(count) = count
            && !aborted
        {
            let _ = self.out_tx.send(OutMsg::Frame(Frame::Release { id, count }));
        }
    }
}

// ---------------------------------------------------------------------------
// Reader / writer loops
// ---------------------------------------------------------------------------

async fn write_loop(
    mut sink: Box<dyn FrameSink>,
    mut rx: mpsc::UnboundedReceiver<OutMsg>,
    ops: mpsc::UnboundedSender<SessionOp>,
) {
    while let Some(msg) = rx.recv().await {
        match msg {
            OutMsg::Frame(frame) => {
                let line = JsonlCodec::encode(&frame);
                if let Err(e) = sink.send(line).await {
                    let _ = ops.send(SessionOp::TransportFailed(e.to_string()));
                    break;
                }
            }
            OutMsg::Shutdown => break,
        }
    }
}

async fn read_loop(
    shared: Arc<SessionShared>,
    mut source: Box<dyn FrameSource>,
    mut ops_rx: mpsc::UnboundedReceiver<SessionOp>,
    writer: JoinHandle<()>,
    eof: EofPolicy,
) {
    let end = loop {
        tokio::select! {
            op = ops_rx.recv() => match op {
                Some(SessionOp::ImportDropped(id)) => shared.import_dropped(id),
                Some(SessionOp::Close) | None => break LoopEnd::Closed,
                Some(SessionOp::TransportFailed(msg)) => break LoopEnd::Lost(msg),
            },
            line = source.recv() => match line {
                Ok(Some(line)) => match shared.handle_line(&line) {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::PeerAborted(reason)) => break LoopEnd::PeerAborted(reason),
                    Err(fatal) => break LoopEnd::Fatal(fatal),
                },
                Ok(None) => break LoopEnd::Eof,
                Err(e) => break LoopEnd::Lost(e.to_string()),
            },
        }
    };

    match end {
        LoopEnd::Fatal(reason) => {
            warn!(target: "cw_rpc", reason = %reason, "aborting session");
            let _ = shared.out_tx.send(OutMsg::Frame(Frame::Abort {
                error: codec::error_node(&reason),
            }));
            shared.teardown(reason, true, writer).await;
        }
        LoopEnd::PeerAborted(reason) => {
            shared.teardown(reason, true, writer).await;
        }
        LoopEnd::Lost(msg) => {
            shared
                .teardown(RpcError::disconnected(msg), true, writer)
                .await;
        }
        LoopEnd::Eof => match eof {
            EofPolicy::Disconnect => {
                shared
                    .teardown(RpcError::disconnected("channel closed"), true, writer)
                    .await;
            }
            EofPolicy::Drain => {
                shared.drain(&mut ops_rx).await;
                shared
                    .teardown(
                        RpcError::disconnected("batch input exhausted"),
                        false,
                        writer,
                    )
                    .await;
            }
        },
        LoopEnd::Closed => {
            shared
                .teardown(RpcError::disconnected("session closed"), false, writer)
                .await;
        }
    }
}

impl SessionShared {
    /// Batch mode: input is exhausted. Fail outbound waiters (no pull can
    /// ever arrive), then let the accepted inbound calls finish while their
    /// releases keep flowing.
    async fn drain(&self, ops_rx: &mut mpsc::UnboundedReceiver<SessionOp>) {
        let reason = RpcError::disconnected("batch input exhausted");
        let waiters = {
            let mut st = self.state.lock().expect("session state poisoned");
            st.input_closed = true;
            st.calls.drain().map(|(_, tx)| tx).collect::<Vec<_>>()
        };
        for tx in waiters {
            let _ = tx.send(Err(reason.clone()));
        }

        while self.inflight.load(Ordering::SeqCst) > 0 {
            tokio::select! {
                op = ops_rx.recv() => {
                    if let Some(SessionOp::ImportDropped(id)) = op {
                        self.import_dropped(id);
                    }
                },
                () = self.handlers_done.notified() => {},
            }
        }
        while let Ok(op) = ops_rx.try_recv() {
            if let SessionOp::ImportDropped(id) = op {
                self.import_dropped(id);
            }
        }
    }

    async fn teardown(&self, reason: RpcError, notify_hook: bool, writer: JoinHandle<()>) {
        let waiters = {
            let mut st = self.state.lock().expect("session state poisoned");
            if st.aborted.is_none() {
                st.aborted = Some(reason.clone());
            }
            st.imports.mark_all_broken();
            st.calls.drain().map(|(_, tx)| tx).collect::<Vec<_>>()
        };
        for tx in waiters {
            let _ = tx.send(Err(reason.clone()));
        }
        let _ = self.out_tx.send(OutMsg::Shutdown);
        let _ = writer.await;
        let _ = self.closed_tx.send(true);
        if notify_hook && let Some(hook) = &self.on_disconnect {
            hook(&reason);
        }
        debug!(target: "cw_rpc", reason = %reason, "session closed");
    }
}
