// SPDX-License-Identifier: MIT OR Apache-2.0
//! User-visible capability handles.

use std::fmt;
use std::sync::{Arc, Weak};

use cw_error::RpcError;
use tokio::sync::mpsc;

use crate::session::{SessionOp, SessionShared};
use crate::target::RpcTarget;
use crate::value::Value;

/// A capability handle.
///
/// A stub either wraps a local target (an object on this side that may be
/// exported when sent to the peer) or a remote import (a peer-exported id).
/// Stubs are freely cloneable; each clone contributes one reference, and
/// dropping the last handle for an import triggers the release frame.
#[derive(Clone)]
pub struct Stub {
    kind: StubKind,
}

#[derive(Clone)]
enum StubKind {
    Local(Arc<dyn RpcTarget>),
    Remote(Arc<ImportRef>),
}

/// Shared core of every stub pointing at one import entry.
///
/// All stubs for an id hold the same `Arc<ImportRef>`, so the live-handle
/// count is the strong count. Dropping the last one notifies the session,
/// which emits the release frame and removes the entry. The drop path only
/// sends on a channel; it never takes the session lock.
pub(crate) struct ImportRef {
    pub(crate) id: i64,
    pub(crate) session: Weak<SessionShared>,
    pub(crate) ops: mpsc::UnboundedSender<SessionOp>,
}

impl Drop for ImportRef {
    fn drop(&mut self) {
        let _ = self.ops.send(SessionOp::ImportDropped(self.id));
    }
}

/// How the codec sees a stub: a local target to export, or a
/// peer-allocated id to re-send.
pub(crate) enum StubView<'a> {
    Local(&'a Arc<dyn RpcTarget>),
    Remote(i64),
}

impl Stub {
    /// Wrap a local target. Sending the stub to the peer exports the target.
    pub fn local(target: Arc<dyn RpcTarget>) -> Self {
        Self {
            kind: StubKind::Local(target),
        }
    }

    pub(crate) fn remote(import: Arc<ImportRef>) -> Self {
        Self {
            kind: StubKind::Remote(import),
        }
    }

    /// `true` if this stub points at a peer-exported capability.
    pub fn is_remote(&self) -> bool {
        matches!(self.kind, StubKind::Remote(_))
    }

    /// The peer-allocated import id, for remote stubs.
    pub fn import_id(&self) -> Option<i64> {
        match &self.kind {
            StubKind::Remote(import) => Some(import.id),
            StubKind::Local(_) => None,
        }
    }

    pub(crate) fn view(&self) -> StubView<'_> {
        match &self.kind {
            StubKind::Local(target) => StubView::Local(target),
            StubKind::Remote(import) => StubView::Remote(import.id),
        }
    }

    /// Invoke `method` on the capability.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        self.invoke(Some(method), args).await
    }

    /// Apply the capability directly (a `null`-method call).
    pub async fn apply(&self, args: Vec<Value>) -> Result<Value, RpcError> {
        self.invoke(None, args).await
    }

    async fn invoke(&self, method: Option<&str>, args: Vec<Value>) -> Result<Value, RpcError> {
        match &self.kind {
            StubKind::Local(target) => target.call(method, args).await,
            StubKind::Remote(import) => {
                let session = upgrade(&import.session)?;
                session.call_remote(import.id, method, args).await
            }
        }
    }

    /// Read a named property of the capability.
    pub async fn get(&self, name: &str) -> Result<Value, RpcError> {
        match &self.kind {
            StubKind::Local(target) => target.get_property(name),
            StubKind::Remote(import) => {
                let session = upgrade(&import.session)?;
                session.get_remote(import.id, name).await
            }
        }
    }

    /// Clone the handle, adding one reference.
    #[must_use]
    pub fn dup(&self) -> Self {
        self.clone()
    }

    /// Drop this handle. Equivalent to letting the stub go out of scope;
    /// the release frame goes out when the last handle for the id is gone.
    pub fn dispose(self) {
        drop(self);
    }

    /// `true` if both stubs refer to the same capability.
    pub fn same_target(&self, other: &Stub) -> bool {
        match (&self.kind, &other.kind) {
            (StubKind::Local(a), StubKind::Local(b)) => Arc::ptr_eq(a, b),
            (StubKind::Remote(a), StubKind::Remote(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

fn upgrade(session: &Weak<SessionShared>) -> Result<Arc<SessionShared>, RpcError> {
    session
        .upgrade()
        .ok_or_else(|| RpcError::disconnected("session is gone"))
}

impl fmt::Debug for Stub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            StubKind::Local(_) => f.write_str("Stub::Local"),
            StubKind::Remote(import) => write!(f, "Stub::Remote({})", import.id),
        }
    }
}
