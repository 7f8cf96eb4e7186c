// SPDX-License-Identifier: MIT OR Apache-2.0
//! The value codec: application values to and from wire JSON.
//!
//! A JSON array in the encoded form is always a typed node, never a raw
//! list. Lists are escaped by wrapping: `[1, 2]` encodes as `[[1, 2]]`.
//! Capability references encode as `["export", id]` or `["import", id]`
//! depending on which side allocated the id; error markers as
//! `["error", kind, message]` with an optional stack element.

use std::collections::BTreeMap;
use std::sync::Weak;

use cw_error::{ErrorKind, RpcError};
use serde_json::{Value as Json, json};
use tokio::sync::mpsc;

use crate::session::{OutMsg, SessionOp, SessionShared};
use crate::stub::StubView;
use crate::tables::{ExportTable, ImportTable};
use crate::value::Value;

/// Whether a decode is reading call arguments or a call result. Imports
/// discovered in a result are resolved by definition; argument imports stay
/// pending until the peer settles them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DecodeOrigin {
    Args,
    Result,
}

/// Everything a decode needs: the tables to register capabilities in and
/// the session plumbing new stubs hang on to.
pub(crate) struct DecodeCx<'a> {
    pub(crate) imports: &'a mut ImportTable,
    pub(crate) exports: &'a ExportTable,
    pub(crate) session: &'a Weak<SessionShared>,
    pub(crate) ops: &'a mpsc::UnboundedSender<SessionOp>,
    pub(crate) out: &'a mpsc::UnboundedSender<OutMsg>,
    pub(crate) origin: DecodeOrigin,
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encode a value graph, exporting any local capabilities it contains.
pub(crate) fn encode_value(value: &Value, exports: &mut ExportTable) -> Result<Json, RpcError> {
    match value {
        Value::Null => Ok(Json::Null),
        Value::Bool(b) => Ok(Json::Bool(*b)),
        Value::Number(n) => Ok(Json::Number(n.clone())),
        Value::String(s) => Ok(Json::String(s.clone())),
        Value::List(items) => {
            let inner = items
                .iter()
                .map(|item| encode_value(item, exports))
                .collect::<Result<Vec<_>, _>>()?;
            // Array escaping: one wrapper so the decoder can tell lists
            // from typed nodes.
            Ok(Json::Array(vec![Json::Array(inner)]))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key.clone(), encode_value(item, exports)?);
            }
            Ok(Json::Object(out))
        }
        Value::Cap(stub) => match stub.view() {
            StubView::Local(target) => Ok(json!(["export", exports.export(target)])),
            StubView::Remote(id) => Ok(json!(["import", id])),
        },
        Value::Error(err) => Ok(error_node(err)),
    }
}

/// Encode an error marker. Needs no tables, so the session can build error
/// replies without touching its state.
pub(crate) fn error_node(err: &RpcError) -> Json {
    match &err.stack {
        Some(stack) => json!(["error", err.kind.as_wire_str(), err.message, stack]),
        None => json!(["error", err.kind.as_wire_str(), err.message]),
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode wire JSON, registering imports as capability references appear.
pub(crate) fn decode_value(json: &Json, cx: &mut DecodeCx<'_>) -> Result<Value, RpcError> {
    match json {
        Json::Null => Ok(Value::Null),
        Json::Bool(b) => Ok(Value::Bool(*b)),
        Json::Number(n) => Ok(Value::Number(n.clone())),
        Json::String(s) => Ok(Value::String(s.clone())),
        Json::Object(map) => {
            let mut out = BTreeMap::new();
            for (key, item) in map {
                out.insert(key.clone(), decode_value(item, cx)?);
            }
            Ok(Value::Object(out))
        }
        Json::Array(items) => decode_array(items, cx),
    }
}

fn decode_array(items: &[Json], cx: &mut DecodeCx<'_>) -> Result<Value, RpcError> {
    let Some(first) = items.first() else {
        return Err(RpcError::protocol("empty array is not a valid wire node"));
    };

    // The escape form: a single-element array whose element is an array.
    if items.len() == 1
        && let Json::Array(inner) = first
    {
        let list = inner
            .iter()
            .map(|item| decode_value(item, cx))
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(Value::List(list));
    }

    let Json::String(tag) = first else {
        return Err(RpcError::protocol(
            "typed node must start with a string tag",
        ));
    };

    match tag.as_str() {
        "export" => {
            // The peer's export becomes our import.
            let id = node_id(items, "export")?;
            Ok(Value::Cap(cx.imports.adopt(
                id,
                cx.session,
                cx.ops,
                cx.out,
                cx.origin == DecodeOrigin::Result,
            )))
        }
        "import" => {
            // The peer is handing our own reference back; no refcount
            // movement.
            let id = node_id(items, "import")?;
            let target = cx.exports.get(id).ok_or_else(|| {
                RpcError::protocol(format!("import node references unknown export {id}"))
            })?;
            Ok(Value::Cap(crate::stub::Stub::local(target)))
        }
        "error" => decode_error_items(items).map(Value::Error),
        other => Err(RpcError::protocol(format!("unknown node tag {other:?}"))),
    }
}

fn node_id(items: &[Json], tag: &str) -> Result<i64, RpcError> {
    if items.len() != 2 {
        return Err(RpcError::protocol(format!(
            "{tag} node must have exactly one id"
        )));
    }
    items[1]
        .as_i64()
        .ok_or_else(|| RpcError::protocol(format!("{tag} node id must be an integer")))
}

fn decode_error_items(items: &[Json]) -> Result<RpcError, RpcError> {
    if items.len() != 3 && items.len() != 4 {
        return Err(RpcError::protocol("error node must have 3 or 4 elements"));
    }
    let kind = items[1]
        .as_str()
        .map(ErrorKind::from_wire_str)
        .ok_or_else(|| RpcError::protocol("error node kind must be a string"))?;
    let message = items[2]
        .as_str()
        .ok_or_else(|| RpcError::protocol("error node message must be a string"))?;
    let mut err = RpcError::new(kind, message);
    if let Some(stack) = items.get(3) {
        let stack = stack
            .as_str()
            .ok_or_else(|| RpcError::protocol("error node stack must be a string"))?;
        err = err.with_stack(stack);
    }
    Ok(err)
}

/// Parse a standalone error node without a session, as carried by abort
/// frames.
pub(crate) fn parse_error_node(json: &Json) -> Result<RpcError, RpcError> {
    let items = json
        .as_array()
        .ok_or_else(|| RpcError::protocol("abort payload must be an error node"))?;
    match items.first() {
        Some(Json::String(tag)) if tag == "error" => decode_error_items(items),
        _ => Err(RpcError::protocol("abort payload must be an error node")),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
