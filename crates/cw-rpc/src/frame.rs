// SPDX-License-Identifier: MIT OR Apache-2.0
//! Frame definitions and the newline-delimited JSON codec.
//!
//! A frame is a single JSON document, the smallest unit the dispatcher
//! reads or writes. On the wire every frame is a JSON array whose first
//! element is the kind tag.

use cw_error::RpcError;
use serde_json::{Value as Json, json};

/// The argument slot of a `push` frame.
///
/// A call carries the encoded argument list; a property access carries JSON
/// `null` in the same slot, which is unambiguous because encoded argument
/// lists are always arrays.
#[derive(Debug, Clone, PartialEq)]
pub enum PushPayload {
    /// Invoke `call` with the encoded argument list (left raw here; the
    /// session decodes it against its tables).
    Call(Json),
    /// Invoke `get_property` with the frame's method name.
    Get,
}

/// One wire frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// `["push", call_id, target_id, method, args]`: invoke a method (or
    /// read a property) on the receiver's export `target_id`. A `null`
    /// method means "apply the target directly".
    Push {
        /// Caller-allocated id correlating the eventual `pull`.
        call_id: u64,
        /// Id of the target in the receiver's export table.
        target_id: i64,
        /// Method name, or `None` to apply the target itself.
        method: Option<String>,
        /// Encoded arguments, or the property-access marker.
        payload: PushPayload,
    },
    /// `["pull", call_id, result]`: reply to a `push`; `result` is the
    /// encoded return value or an error node.
    Pull {
        /// The `push` this answers.
        call_id: u64,
        /// Encoded outcome (left raw here).
        result: Json,
    },
    /// `["release", id, count]`: drop `count` references to the receiver's
    /// export `id`.
    Release {
        /// Export id in the receiver's table.
        id: i64,
        /// Number of references released; always at least 1.
        count: u64,
    },
    /// `["abort", error]`: terminate the session; no more frames follow.
    Abort {
        /// Encoded error node carrying the reason.
        error: Json,
    },
}

impl Frame {
    /// Encode to the JSON wire shape.
    pub fn to_value(&self) -> Json {
        match self {
            Frame::Push {
                call_id,
                target_id,
                method,
                payload,
            } => {
                let args = match payload {
                    PushPayload::Call(args) => args.clone(),
                    PushPayload::Get => Json::Null,
                };
                json!(["push", call_id, target_id, method, args])
            }
            Frame::Pull { call_id, result } => json!(["pull", call_id, result]),
            Frame::Release { id, count } => json!(["release", id, count]),
            Frame::Abort { error } => json!(["abort", error]),
        }
    }

    /// Decode from the JSON wire shape, validating structure only.
    pub fn from_value(value: &Json) -> Result<Self, RpcError> {
        let items = value
            .as_array()
            .ok_or_else(|| RpcError::protocol("frame must be a JSON array"))?;
        let tag = items
            .first()
            .and_then(Json::as_str)
            .ok_or_else(|| RpcError::protocol("frame must start with a string tag"))?;

        match tag {
            "push" => {
                if items.len() != 5 {
                    return Err(RpcError::protocol("push frame must have 5 elements"));
                }
                let call_id = expect_u64(&items[1], "push call id")?;
                let target_id = expect_i64(&items[2], "push target id")?;
                let method = match &items[3] {
                    Json::Null => None,
                    Json::String(s) => Some(s.clone()),
                    _ => return Err(RpcError::protocol("push method must be a string or null")),
                };
                let payload = if items[4].is_null() {
                    if method.is_none() {
                        return Err(RpcError::protocol(
                            "push property access requires a method name",
                        ));
                    }
                    PushPayload::Get
                } else {
                    PushPayload::Call(items[4].clone())
                };
                Ok(Frame::Push {
                    call_id,
                    target_id,
                    method,
                    payload,
                })
            }
            "pull" => {
                if items.len() != 3 {
                    return Err(RpcError::protocol("pull frame must have 3 elements"));
                }
                Ok(Frame::Pull {
                    call_id: expect_u64(&items[1], "pull call id")?,
                    result: items[2].clone(),
                })
            }
            "release" => {
                if items.len() != 3 {
                    return Err(RpcError::protocol("release frame must have 3 elements"));
                }
                let count = expect_u64(&items[2], "release count")?;
                if count == 0 {
                    return Err(RpcError::protocol("release count must be positive"));
                }
                Ok(Frame::Release {
                    id: expect_i64(&items[1], "release id")?,
                    count,
                })
            }
            "abort" => {
                if items.len() != 2 {
                    return Err(RpcError::protocol("abort frame must have 2 elements"));
                }
                Ok(Frame::Abort {
                    error: items[1].clone(),
                })
            }
            other => Err(RpcError::protocol(format!("unknown frame tag {other:?}"))),
        }
    }
}

fn expect_u64(value: &Json, what: &str) -> Result<u64, RpcError> {
    value
        .as_u64()
        .ok_or_else(|| RpcError::protocol(format!("{what} must be a non-negative integer")))
}

fn expect_i64(value: &Json, what: &str) -> Result<i64, RpcError> {
    value
        .as_i64()
        .ok_or_else(|| RpcError::protocol(format!("{what} must be an integer")))
}

// ---------------------------------------------------------------------------
// JsonlCodec
// ---------------------------------------------------------------------------

/// Stateless newline-delimited JSON codec for [`Frame`] values.
pub struct JsonlCodec;

impl JsonlCodec {
    /// Serialize a [`Frame`] to a newline-terminated JSON string.
    pub fn encode(frame: &Frame) -> String {
        let mut s = frame.to_value().to_string();
        s.push('\n');
        s
    }

    /// Deserialize a single JSON line into a [`Frame`].
    pub fn decode(line: &str) -> Result<Frame, RpcError> {
        let value: Json = serde_json::from_str(line.trim_end())
            .map_err(|e| RpcError::protocol(format!("malformed frame: {e}")))?;
        Frame::from_value(&value)
    }

    /// Parse a newline-delimited body into frames, skipping blank lines.
    ///
    /// A trailing newline on the final frame is not required.
    pub fn parse_lines(body: &str) -> Result<Vec<Frame>, RpcError> {
        body.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(Self::decode)
            .collect()
    }
}
