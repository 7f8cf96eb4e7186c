// SPDX-License-Identifier: MIT OR Apache-2.0
//! The dispatch surface local objects implement to be callable.

use async_trait::async_trait;
use cw_error::RpcError;

use crate::value::Value;

/// A local object the peer may invoke through an export.
///
/// The surface is intentionally narrow: applications implement it
/// explicitly rather than by reflection. Targets are shared with the
/// session and must tolerate concurrent `call` invocations.
#[async_trait]
pub trait RpcTarget: Send + Sync {
    /// Invoke `method` with `args`. A `None` method means "apply the target
    /// directly" for function-like capabilities.
    async fn call(&self, method: Option<&str>, args: Vec<Value>) -> Result<Value, RpcError>;

    /// Read a named property. Synchronous; field access on capability
    /// objects goes through here.
    fn get_property(&self, name: &str) -> Result<Value, RpcError> {
        Err(RpcError::not_found(format!("unknown property {name:?}")))
    }

    /// Hook invoked at most once, when the peer releases the last reference
    /// to this target's export entry.
    fn disposed(&self) {}
}

impl std::fmt::Debug for dyn RpcTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn RpcTarget").finish_non_exhaustive()
    }
}
