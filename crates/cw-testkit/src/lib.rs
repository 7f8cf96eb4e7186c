// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cw_error::RpcError;
use cw_rpc::{
    ChannelSink, ChannelSource, RpcSession, RpcTarget, SessionConfig, Stub, Value, frame_channel,
};

// ---------------------------------------------------------------------------
// Transport helpers
// ---------------------------------------------------------------------------

/// One end of an in-memory duplex connection.
pub type MemoryPeer = (ChannelSink, ChannelSource);

/// Create an in-memory duplex connection: two sink/source pairs wired
/// back to back.
#[must_use]
pub fn memory_transport() -> (MemoryPeer, MemoryPeer) {
    let (a_sink, b_source) = frame_channel(64);
    let (b_sink, a_source) = frame_channel(64);
    ((a_sink, a_source), (b_sink, b_source))
}

/// Spawn a connected client/server session pair over an in-memory duplex.
#[must_use]
pub fn connected_pair(
    client_cfg: SessionConfig,
    server_cfg: SessionConfig,
) -> (RpcSession, RpcSession) {
    let ((c_sink, c_source), (s_sink, s_source)) = memory_transport();
    let client = RpcSession::spawn(c_sink, c_source, client_cfg);
    let server = RpcSession::spawn(s_sink, s_source, server_cfg);
    (client, server)
}

// ---------------------------------------------------------------------------
// TestTarget
// ---------------------------------------------------------------------------

/// The main capability the interop suites call into.
///
/// Mirrors the server-side surface the protocol compliance tests exercise,
/// including counter capabilities and the registered-callback round trip.
pub struct TestTarget {
    callback: Mutex<Option<Stub>>,
    counter_disposals: Arc<AtomicUsize>,
}

impl TestTarget {
    /// A fresh target with no registered callback.
    #[must_use]
    pub fn new() -> Self {
        Self {
            callback: Mutex::new(None),
            counter_disposals: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared counter-disposal tally, bumped once per released counter.
    #[must_use]
    pub fn counter_disposals(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.counter_disposals)
    }
}

impl Default for TestTarget {
    fn default() -> Self {
        Self::new()
    }
}

/// Read an argument as either an integer or a double.
fn number_arg(args: &[Value], index: usize, method: &str) -> Result<f64, RpcError> {
    args.get(index)
        .and_then(Value::as_f64)
        .ok_or_else(|| RpcError::application(format!("{method} expects a number argument")))
}

/// Re-wrap an f64 result, keeping integer results integral.
fn number_value(f: f64) -> Result<Value, RpcError> {
    if f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 {
        #[allow(clippy::cast_possible_truncation)]
        Ok(Value::from(f as i64))
    } else {
        Value::float(f)
    }
}

#[async_trait]
impl RpcTarget for TestTarget {
    async fn call(&self, method: Option<&str>, args: Vec<Value>) -> Result<Value, RpcError> {
        match method {
            Some("echo") => Ok(args.into_iter().next().unwrap_or(Value::Null)),
            Some("square") => {
                let n = number_arg(&args, 0, "square")?;
                number_value(n * n)
            }
            Some("add") => {
                let a = number_arg(&args, 0, "add")?;
                let b = number_arg(&args, 1, "add")?;
                number_value(a + b)
            }
            Some("greet") => {
                let name = args
                    .first()
                    .and_then(Value::as_str)
                    .ok_or_else(|| RpcError::application("greet expects a string"))?;
                Ok(Value::from(format!("Hello, {name}!")))
            }
            Some("generateFibonacci") => {
                let n = args
                    .first()
                    .and_then(Value::as_i64)
                    .filter(|n| *n >= 0)
                    .ok_or_else(|| {
                        RpcError::application("generateFibonacci expects a non-negative integer")
                    })?;
                let mut out = Vec::new();
                let (mut a, mut b) = (0i64, 1i64);
                for _ in 0..n {
                    out.push(Value::from(a));
                    let next = a.checked_add(b).ok_or_else(|| {
                        RpcError::application("generateFibonacci overflowed i64")
                    })?;
                    a = b;
                    b = next;
                }
                Ok(Value::List(out))
            }
            Some("makeCounter") => {
                let start = args.first().and_then(Value::as_i64).unwrap_or(0);
                Ok(Value::Cap(Stub::local(Arc::new(Counter::with_disposals(
                    start,
                    Arc::clone(&self.counter_disposals),
                )))))
            }
            Some("registerCallback") => {
                let stub = args
                    .first()
                    .and_then(Value::as_cap)
                    .ok_or_else(|| RpcError::application("registerCallback expects a capability"))?
                    .clone();
                *self.callback.lock().expect("callback slot poisoned") = Some(stub);
                Ok(Value::Null)
            }
            Some("triggerCallback") => {
                let stub = self
                    .callback
                    .lock()
                    .expect("callback slot poisoned")
                    .clone()
                    .ok_or_else(|| RpcError::application("no callback registered"))?;
                stub.call("notify", vec![Value::from("ping")]).await?;
                Ok(Value::from("Got: ping"))
            }
            Some("throwError") => Err(RpcError::application("Test error")),
            Some("returnNull") => Ok(Value::Null),
            other => Err(RpcError::not_found(format!("unknown method {other:?}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Counter
// ---------------------------------------------------------------------------

/// The capability `makeCounter` returns: `increment()` plus the `value`
/// property.
pub struct Counter {
    value: AtomicI64,
    disposals: Arc<AtomicUsize>,
}

impl Counter {
    /// A counter starting at `start`.
    #[must_use]
    pub fn new(start: i64) -> Self {
        Self::with_disposals(start, Arc::new(AtomicUsize::new(0)))
    }

    fn with_disposals(start: i64, disposals: Arc<AtomicUsize>) -> Self {
        Self {
            value: AtomicI64::new(start),
            disposals,
        }
    }
}

#[async_trait]
impl RpcTarget for Counter {
    async fn call(&self, method: Option<&str>, _args: Vec<Value>) -> Result<Value, RpcError> {
        match method {
            Some("increment") => Ok(Value::from(self.value.fetch_add(1, Ordering::SeqCst) + 1)),
            other => Err(RpcError::not_found(format!("unknown method {other:?}"))),
        }
    }

    fn get_property(&self, name: &str) -> Result<Value, RpcError> {
        match name {
            "value" => Ok(Value::from(self.value.load(Ordering::SeqCst))),
            _ => Err(RpcError::not_found(format!("unknown property {name:?}"))),
        }
    }

    fn disposed(&self) {
        self.disposals.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// CallbackRecorder
// ---------------------------------------------------------------------------

/// Client-side callback target: records every `notify` and answers
/// `pong-N`.
pub struct CallbackRecorder {
    notifications: Mutex<Vec<String>>,
}

impl CallbackRecorder {
    /// A recorder with an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self {
            notifications: Mutex::new(Vec::new()),
        }
    }

    /// Messages received so far, in arrival order.
    #[must_use]
    pub fn notifications(&self) -> Vec<String> {
        self.notifications
            .lock()
            .expect("notification log poisoned")
            .clone()
    }

    /// Number of `notify` calls received.
    #[must_use]
    pub fn ping_count(&self) -> usize {
        self.notifications
            .lock()
            .expect("notification log poisoned")
            .len()
    }
}

impl Default for CallbackRecorder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RpcTarget for CallbackRecorder {
    async fn call(&self, method: Option<&str>, args: Vec<Value>) -> Result<Value, RpcError> {
        match method {
            Some("notify") => {
                let msg = args
                    .first()
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned();
                let mut log = self.notifications.lock().expect("notification log poisoned");
                log.push(msg);
                Ok(Value::from(format!("pong-{}", log.len())))
            }
            Some("echo") => Ok(args.into_iter().next().unwrap_or(Value::Null)),
            other => Err(RpcError::not_found(format!("unknown method {other:?}"))),
        }
    }

    fn get_property(&self, name: &str) -> Result<Value, RpcError> {
        match name {
            "pingCount" => Ok(Value::from(
                self.notifications
                    .lock()
                    .expect("notification log poisoned")
                    .len() as u64,
            )),
            _ => Err(RpcError::not_found(format!("unknown property {name:?}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
