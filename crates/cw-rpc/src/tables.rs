// SPDX-License-Identifier: MIT OR Apache-2.0
//! The bidirectional import/export tables.
//!
//! These tables are the correctness centre of the session: they own the
//! refcounts that keep release frames and live references in agreement on
//! both sides of the connection.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use cw_error::RpcError;
use tokio::sync::mpsc;
use tracing::debug;

use crate::MAIN_ID;
use crate::config::Side;
use crate::frame::Frame;
use crate::session::{OutMsg, SessionOp, SessionShared};
use crate::stub::{ImportRef, Stub};
use crate::target::RpcTarget;

// ---------------------------------------------------------------------------
// ExportTable
// ---------------------------------------------------------------------------

struct ExportEntry {
    target: Arc<dyn RpcTarget>,
    refcount: u64,
}

/// Local targets the peer may reference, keyed by locally-allocated id.
///
/// The same target exported twice shares one entry (identity dedup), so the
/// release discipline stays symmetric. Ids are monotone and never reused;
/// the client side allocates positive ids, the server side negative ones.
/// Id 0 is pre-bound to the local main capability and never released.
pub(crate) struct ExportTable {
    entries: HashMap<i64, ExportEntry>,
    by_identity: HashMap<usize, i64>,
    side: Side,
    next_magnitude: i64,
}

fn identity(target: &Arc<dyn RpcTarget>) -> usize {
    Arc::as_ptr(target) as *const () as usize
}

impl ExportTable {
    pub(crate) fn new(side: Side, local_main: Option<Arc<dyn RpcTarget>>) -> Self {
        let mut table = Self {
            entries: HashMap::new(),
            by_identity: HashMap::new(),
            side,
            next_magnitude: 0,
        };
        if let Some(main) = local_main {
            table.by_identity.insert(identity(&main), MAIN_ID);
            table.entries.insert(
                MAIN_ID,
                ExportEntry {
                    target: main,
                    refcount: 1,
                },
            );
        }
        table
    }

    /// Export a target: a fresh id at refcount 1, or the existing id with
    /// its refcount bumped.
    pub(crate) fn export(&mut self, target: &Arc<dyn RpcTarget>) -> i64 {
        let key = identity(target);
        if let Some(&id) = self.by_identity.get(&key) {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.refcount += 1;
                return id;
            }
        }
        self.next_magnitude += 1;
        let id = match self.side {
            Side::Client => self.next_magnitude,
            Side::Server => -self.next_magnitude,
        };
        self.by_identity.insert(key, id);
        self.entries.insert(
            id,
            ExportEntry {
                target: Arc::clone(target),
                refcount: 1,
            },
        );
        debug!(target: "cw_rpc", id, "exported target");
        id
    }

    pub(crate) fn get(&self, id: i64) -> Option<Arc<dyn RpcTarget>> {
        self.entries.get(&id).map(|e| Arc::clone(&e.target))
    }

    /// Apply a release frame.
    ///
    /// Returns the target when its refcount reached zero so the caller can
    /// invoke the disposer outside the session lock. Releases addressed to
    /// the main id are ignored; unknown ids and underflow are protocol
    /// errors that abort the session.
    pub(crate) fn release(
        &mut self,
        id: i64,
        count: u64,
    ) -> Result<Option<Arc<dyn RpcTarget>>, RpcError> {
        if id == MAIN_ID {
            return Ok(None);
        }
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or_else(|| RpcError::protocol(format!("release of unknown export {id}")))?;
        if count > entry.refcount {
            return Err(RpcError::protocol(format!(
                "release underflow for export {id}: count {count} exceeds refcount {}",
                entry.refcount
            )));
        }
        entry.refcount -= count;
        if entry.refcount > 0 {
            return Ok(None);
        }
        let Some(entry) = self.entries.remove(&id) else {
            return Ok(None);
        };
        self.by_identity.remove(&identity(&entry.target));
        debug!(target: "cw_rpc", id, "export released");
        Ok(Some(entry.target))
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

// ---------------------------------------------------------------------------
// ImportTable
// ---------------------------------------------------------------------------

/// Lifecycle of an import entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ImportState {
    Pending,
    Resolved,
    Broken,
}

struct ImportEntry {
    /// All live stubs for this id share one [`ImportRef`]; a dead weak means
    /// the last stub dropped and the release is in flight.
    handle: Weak<ImportRef>,
    /// How many times this side decoded the id: the count owed to the peer
    /// in the eventual release frame.
    remote_refs: u64,
    state: ImportState,
}

/// Peer targets this side holds handles to, keyed by peer-allocated id.
pub(crate) struct ImportTable {
    entries: HashMap<i64, ImportEntry>,
}

impl ImportTable {
    pub(crate) fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Register one decode of `id` and hand back a stub.
    ///
    /// The same id decoded twice resolves to a single entry whose reference
    /// counts grow. If the previous last stub already dropped but its
    /// release has not been processed yet, the owed release is flushed here
    /// and the entry starts over.
    pub(crate) fn adopt(
        &mut self,
        id: i64,
        session: &Weak<SessionShared>,
        ops: &mpsc::UnboundedSender<SessionOp>,
        out: &mpsc::UnboundedSender<OutMsg>,
        resolved: bool,
    ) -> Stub {
        let state = if resolved {
            ImportState::Resolved
        } else {
            ImportState::Pending
        };

        if let Some(entry) = self.entries.get_mut(&id) {
            if let Some(handle) = entry.handle.upgrade() {
                entry.remote_refs += 1;
                if resolved && entry.state == ImportState::Pending {
                    entry.state = ImportState::Resolved;
                }
                return Stub::remote(handle);
            }
            // Last stub gone, release op still queued: settle the old debt
            // now so the fresh handle starts a clean count.
            if id != MAIN_ID {
                let _ = out.send(OutMsg::Frame(Frame::Release {
                    id,
                    count: entry.remote_refs,
                }));
            }
        }

        let handle = Arc::new(ImportRef {
            id,
            session: session.clone(),
            ops: ops.clone(),
        });
        self.entries.insert(
            id,
            ImportEntry {
                handle: Arc::downgrade(&handle),
                remote_refs: 1,
                state,
            },
        );
        debug!(target: "cw_rpc", id, "import adopted");
        Stub::remote(handle)
    }

    /// Process a dropped-handle notification.
    ///
    /// Returns the release count to send, or `None` when the entry was
    /// re-adopted in the meantime (its debt was flushed by [`adopt`]) or
    /// refers to the peer's main capability.
    pub(crate) fn drop_handle(&mut self, id: i64) -> Option<u64> {
        let entry = self.entries.get(&id)?;
        if entry.handle.upgrade().is_some() {
            return None;
        }
        let count = entry.remote_refs;
        self.entries.remove(&id);
        debug!(target: "cw_rpc", id, count, "import dropped");
        if id == MAIN_ID { None } else { Some(count) }
    }

    /// Session teardown: every surviving import is broken.
    pub(crate) fn mark_all_broken(&mut self) {
        for entry in self.entries.values_mut() {
            entry.state = ImportState::Broken;
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Imports still awaiting resolution.
    pub(crate) fn pending_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.state == ImportState::Pending)
            .count()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Dummy {
        disposals: AtomicUsize,
    }

    impl Dummy {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                disposals: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl RpcTarget for Dummy {
        async fn call(&self, _method: Option<&str>, _args: Vec<Value>) -> Result<Value, RpcError> {
            Ok(Value::Null)
        }

        fn disposed(&self) {
            self.disposals.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn as_target(dummy: &Arc<Dummy>) -> Arc<dyn RpcTarget> {
        Arc::clone(dummy) as Arc<dyn RpcTarget>
    }

    // -- ExportTable ------------------------------------------------------

    #[test]
    fn client_allocates_positive_ids_server_negative() {
        let a = Dummy::new();
        let b = Dummy::new();

        let mut client = ExportTable::new(Side::Client, None);
        assert_eq!(client.export(&as_target(&a)), 1);
        assert_eq!(client.export(&as_target(&b)), 2);

        let mut server = ExportTable::new(Side::Server, None);
        assert_eq!(server.export(&as_target(&a)), -1);
        assert_eq!(server.export(&as_target(&b)), -2);
    }

    #[test]
    fn export_dedups_by_identity() {
        let dummy = Dummy::new();
        let mut table = ExportTable::new(Side::Client, None);
        let first = table.export(&as_target(&dummy));
        let second = table.export(&as_target(&dummy));
        assert_eq!(first, second);
        assert_eq!(table.len(), 1);

        // Two releases bring it back to zero.
        assert!(table.release(first, 1).unwrap().is_none());
        assert!(table.release(first, 1).unwrap().is_some());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn release_supports_counts_above_one() {
        let dummy = Dummy::new();
        let mut table = ExportTable::new(Side::Client, None);
        let id = table.export(&as_target(&dummy));
        table.export(&as_target(&dummy));
        table.export(&as_target(&dummy));
        let target = table.release(id, 3).unwrap();
        assert!(target.is_some());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn release_underflow_is_protocol_error() {
        let dummy = Dummy::new();
        let mut table = ExportTable::new(Side::Client, None);
        let id = table.export(&as_target(&dummy));
        let err = table.release(id, 2).unwrap_err();
        assert_eq!(err.kind, cw_error::ErrorKind::Protocol);
    }

    #[test]
    fn release_of_unknown_id_is_protocol_error() {
        let mut table = ExportTable::new(Side::Client, None);
        assert!(table.release(17, 1).is_err());
    }

    #[test]
    fn main_id_is_pinned() {
        let main = Dummy::new();
        let mut table = ExportTable::new(Side::Server, Some(as_target(&main)));
        assert!(table.get(MAIN_ID).is_some());

        // Releases to id 0 are ignored, however large.
        assert!(table.release(MAIN_ID, 100).unwrap().is_none());
        assert!(table.get(MAIN_ID).is_some());
    }

    #[test]
    fn id_zero_never_reallocated() {
        let main = Dummy::new();
        let other = Dummy::new();
        let mut table = ExportTable::new(Side::Client, Some(as_target(&main)));
        assert_eq!(table.export(&as_target(&other)), 1);
        // Re-exporting the main target reuses id 0.
        assert_eq!(table.export(&as_target(&main)), MAIN_ID);
    }

    #[test]
    fn ids_are_never_reused() {
        let mut table = ExportTable::new(Side::Client, None);
        let a = Dummy::new();
        let id_a = table.export(&as_target(&a));
        table.release(id_a, 1).unwrap();
        let b = Dummy::new();
        let id_b = table.export(&as_target(&b));
        assert_ne!(id_a, id_b);
    }

    // -- ImportTable ------------------------------------------------------

    fn channels() -> (
        mpsc::UnboundedSender<SessionOp>,
        mpsc::UnboundedReceiver<SessionOp>,
        mpsc::UnboundedSender<OutMsg>,
        mpsc::UnboundedReceiver<OutMsg>,
    ) {
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        (ops_tx, ops_rx, out_tx, out_rx)
    }

    #[test]
    fn adopt_dedups_and_counts_decodes() {
        let (ops_tx, _ops_rx, out_tx, _out_rx) = channels();
        let session = Weak::new();
        let mut table = ImportTable::new();

        let first = table.adopt(5, &session, &ops_tx, &out_tx, false);
        let second = table.adopt(5, &session, &ops_tx, &out_tx, false);
        assert!(first.same_target(&second));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn last_drop_reports_accumulated_count() {
        let (ops_tx, mut ops_rx, out_tx, _out_rx) = channels();
        let session = Weak::new();
        let mut table = ImportTable::new();

        let first = table.adopt(5, &session, &ops_tx, &out_tx, false);
        let second = table.adopt(5, &session, &ops_tx, &out_tx, false);
        let third = first.dup();

        drop(first);
        drop(third);
        assert!(
            ops_rx.try_recv().is_err(),
            "no notification while a stub is live"
        );
        assert!(table.drop_handle(5).is_none(), "a stub is still live");

        drop(second);
        let SessionOp::ImportDropped(id) = ops_rx.try_recv().expect("last drop notifies") else {
            panic!("unexpected op");
        };
        assert_eq!(table.drop_handle(id), Some(2));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn readopt_after_drop_flushes_old_debt() {
        let (ops_tx, _ops_rx, out_tx, mut out_rx) = channels();
        let session = Weak::new();
        let mut table = ImportTable::new();

        let stub = table.adopt(9, &session, &ops_tx, &out_tx, false);
        let dup = table.adopt(9, &session, &ops_tx, &out_tx, false);
        drop(stub);
        drop(dup);

        // The release op has not been processed; a fresh decode arrives.
        let fresh = table.adopt(9, &session, &ops_tx, &out_tx, false);
        match out_rx.try_recv() {
            Ok(OutMsg::Frame(Frame::Release { id, count })) => {
                assert_eq!(id, 9);
                assert_eq!(count, 2);
            }
            other => panic!("expected flushed release, got {other:?}"),
        }

        // The stale drop notification is now a no-op.
        assert!(table.drop_handle(9).is_none());
        assert_eq!(table.len(), 1);
        drop(fresh);
        assert_eq!(table.drop_handle(9), Some(1));
    }

    #[test]
    fn main_import_never_releases() {
        let (ops_tx, _ops_rx, out_tx, _out_rx) = channels();
        let session = Weak::new();
        let mut table = ImportTable::new();

        let main = table.adopt(MAIN_ID, &session, &ops_tx, &out_tx, false);
        drop(main);
        assert!(table.drop_handle(MAIN_ID).is_none());
    }

    #[test]
    fn result_imports_are_resolved_arg_imports_pending() {
        let (ops_tx, _ops_rx, out_tx, _out_rx) = channels();
        let session = Weak::new();
        let mut table = ImportTable::new();

        let _args = table.adopt(1, &session, &ops_tx, &out_tx, false);
        let _result = table.adopt(2, &session, &ops_tx, &out_tx, true);
        assert_eq!(table.entries[&1].state, ImportState::Pending);
        assert_eq!(table.entries[&2].state, ImportState::Resolved);

        // A pending import resolves when the same id arrives in a result.
        let _again = table.adopt(1, &session, &ops_tx, &out_tx, true);
        assert_eq!(table.entries[&1].state, ImportState::Resolved);

        table.mark_all_broken();
        assert_eq!(table.entries[&1].state, ImportState::Broken);
        assert_eq!(table.entries[&2].state, ImportState::Broken);
    }
}
