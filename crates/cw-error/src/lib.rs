// SPDX-License-Identifier: MIT OR Apache-2.0
//! Error taxonomy with stable wire tags for the capnweb RPC runtime.
//!
//! Every RPC error carries an [`ErrorKind`] (a machine-readable, stable
//! snake_case tag that is what travels inside `["error", kind, message]`
//! wire nodes), a human-readable message, and an optional stack string.
//! Kinds classify as *fatal* (an inbound occurrence tears the session
//! down) or *per-call* (the call fails and the session continues).

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// Machine-readable, stable error kind.
///
/// Each variant serialises to a snake_case string that is guaranteed not to
/// change across patch releases; the same string is the `kind` element of the
/// wire error node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A `push` referenced an unknown target id, method, or property.
    NotFound,
    /// The encoder was fed a value the wire format cannot represent
    /// (NaN, infinity, or similar).
    InvalidValue,
    /// Malformed frame, unknown typed-node tag, release underflow, or an
    /// unmatched `pull`. Fatal: the session aborts.
    Protocol,
    /// A target method raised. Carries the message and, when available,
    /// a stack string.
    Application,
    /// The channel closed or the session aborted; fails all pending calls.
    Disconnected,
    /// Surfaced only by callers layering deadlines around call futures.
    Timeout,
}

impl ErrorKind {
    /// Stable `&'static str` wire tag (e.g. `"not_found"`).
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::InvalidValue => "invalid_value",
            Self::Protocol => "protocol",
            Self::Application => "application",
            Self::Disconnected => "disconnected",
            Self::Timeout => "timeout",
        }
    }

    /// Parse a wire tag. Unknown tags decode as [`ErrorKind::Application`]
    /// so that peers with a richer taxonomy still interoperate.
    pub fn from_wire_str(s: &str) -> Self {
        match s {
            "not_found" => Self::NotFound,
            "invalid_value" => Self::InvalidValue,
            "protocol" => Self::Protocol,
            "disconnected" => Self::Disconnected,
            "timeout" => Self::Timeout,
            _ => Self::Application,
        }
    }

    /// `true` for kinds that abort the session when they occur on inbound
    /// data ([`Protocol`](Self::Protocol) and
    /// [`InvalidValue`](Self::InvalidValue)).
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Protocol | Self::InvalidValue)
    }

    /// `true` for kinds that fail a single call and leave the session
    /// usable ([`NotFound`](Self::NotFound) and
    /// [`Application`](Self::Application)).
    pub fn is_per_call(&self) -> bool {
        matches!(self, Self::NotFound | Self::Application)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire_str())
    }
}

// ---------------------------------------------------------------------------
// RpcError
// ---------------------------------------------------------------------------

/// An RPC error: stable kind, human-readable message, optional stack.
///
/// `RpcError` doubles as the payload of wire error nodes, so it is `Clone`
/// and compares structurally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("[{kind}] {message}")]
pub struct RpcError {
    /// Machine-readable kind.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
    /// Optional stack string carried from the raising side.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl RpcError {
    /// Create an error with the given kind and message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stack: None,
        }
    }

    /// A [`ErrorKind::NotFound`] error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// An [`ErrorKind::InvalidValue`] error.
    pub fn invalid_value(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidValue, message)
    }

    /// An [`ErrorKind::Protocol`] error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, message)
    }

    /// An [`ErrorKind::Application`] error.
    pub fn application(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Application, message)
    }

    /// An [`ErrorKind::Disconnected`] error.
    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Disconnected, message)
    }

    /// An [`ErrorKind::Timeout`] error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// Attach a stack string.
    #[must_use]
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Shorthand for `self.kind.is_fatal()`.
    pub fn is_fatal(&self) -> bool {
        self.kind.is_fatal()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    /// All kinds for exhaustive iteration in tests.
    const ALL_KINDS: &[ErrorKind] = &[
        ErrorKind::NotFound,
        ErrorKind::InvalidValue,
        ErrorKind::Protocol,
        ErrorKind::Application,
        ErrorKind::Disconnected,
        ErrorKind::Timeout,
    ];

    // -- Construction & Display -----------------------------------------

    #[test]
    fn basic_construction() {
        let err = RpcError::new(ErrorKind::Application, "boom");
        assert_eq!(err.kind, ErrorKind::Application);
        assert_eq!(err.message, "boom");
        assert!(err.stack.is_none());
    }

    #[test]
    fn display_format() {
        let err = RpcError::not_found("no such target");
        assert_eq!(err.to_string(), "[not_found] no such target");
    }

    #[test]
    fn constructors_set_kind() {
        assert_eq!(RpcError::not_found("x").kind, ErrorKind::NotFound);
        assert_eq!(RpcError::invalid_value("x").kind, ErrorKind::InvalidValue);
        assert_eq!(RpcError::protocol("x").kind, ErrorKind::Protocol);
        assert_eq!(RpcError::application("x").kind, ErrorKind::Application);
        assert_eq!(RpcError::disconnected("x").kind, ErrorKind::Disconnected);
        assert_eq!(RpcError::timeout("x").kind, ErrorKind::Timeout);
    }

    #[test]
    fn with_stack_attaches() {
        let err = RpcError::application("raise").with_stack("at line 3");
        assert_eq!(err.stack.as_deref(), Some("at line 3"));
    }

    // -- Classification --------------------------------------------------

    #[test]
    fn fatal_kinds() {
        assert!(ErrorKind::Protocol.is_fatal());
        assert!(ErrorKind::InvalidValue.is_fatal());
        assert!(!ErrorKind::NotFound.is_fatal());
        assert!(!ErrorKind::Application.is_fatal());
        assert!(!ErrorKind::Disconnected.is_fatal());
        assert!(!ErrorKind::Timeout.is_fatal());
    }

    #[test]
    fn per_call_kinds() {
        assert!(ErrorKind::NotFound.is_per_call());
        assert!(ErrorKind::Application.is_per_call());
        assert!(!ErrorKind::Protocol.is_per_call());
        assert!(!ErrorKind::Disconnected.is_per_call());
    }

    #[test]
    fn error_is_fatal_shorthand() {
        assert!(RpcError::protocol("bad frame").is_fatal());
        assert!(!RpcError::application("boom").is_fatal());
    }

    // -- Wire tags --------------------------------------------------------

    #[test]
    fn all_kinds_have_unique_wire_tags() {
        let mut seen = HashSet::new();
        for kind in ALL_KINDS {
            let s = kind.as_wire_str();
            assert!(seen.insert(s), "duplicate wire tag: {s}");
        }
        assert_eq!(seen.len(), ALL_KINDS.len());
    }

    #[test]
    fn wire_tags_round_trip() {
        for kind in ALL_KINDS {
            assert_eq!(ErrorKind::from_wire_str(kind.as_wire_str()), *kind);
        }
    }

    #[test]
    fn unknown_wire_tag_falls_back_to_application() {
        assert_eq!(
            ErrorKind::from_wire_str("some_future_kind"),
            ErrorKind::Application
        );
        assert_eq!(ErrorKind::from_wire_str(""), ErrorKind::Application);
    }

    #[test]
    fn display_matches_wire_tag() {
        for kind in ALL_KINDS {
            assert_eq!(kind.to_string(), kind.as_wire_str());
        }
    }

    #[test]
    fn serde_matches_wire_tag() {
        for kind in ALL_KINDS {
            let json = serde_json::to_string(kind).unwrap();
            assert_eq!(json, format!(r#""{}""#, kind.as_wire_str()));
            let back: ErrorKind = serde_json::from_str(&json).unwrap();
            assert_eq!(back, *kind);
        }
    }

    #[test]
    fn kind_count() {
        // Ensure we don't silently drop a variant from ALL_KINDS.
        assert_eq!(ALL_KINDS.len(), 6);
    }

    // -- Serialization ----------------------------------------------------

    #[test]
    fn error_serde_round_trip() {
        let err = RpcError::application("boom").with_stack("trace");
        let json = serde_json::to_string(&err).unwrap();
        let back: RpcError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn stack_omitted_when_absent() {
        let err = RpcError::not_found("missing");
        let json = serde_json::to_string(&err).unwrap();
        assert!(!json.contains("stack"));
    }
}
