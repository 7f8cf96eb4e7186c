// SPDX-License-Identifier: MIT OR Apache-2.0
//! Session construction options.

use std::fmt;
use std::sync::Arc;

use cw_error::RpcError;

use crate::target::RpcTarget;

/// Which side of the connection this session is.
///
/// The two sides partition the capability id space without a handshake: the
/// client allocates strictly positive export ids, the server strictly
/// negative ones. Id 0 is reserved for the main capability on each side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Allocates positive export ids.
    Client,
    /// Allocates negative export ids.
    Server,
}

/// Callback invoked once when the session terminates on a disconnect or
/// abort, with the termination reason.
pub type DisconnectHook = Arc<dyn Fn(&RpcError) + Send + Sync>;

/// What the dispatcher does when the frame source reports end of input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EofPolicy {
    /// Streaming transports: EOF is a disconnect; fail every waiter.
    Disconnect,
    /// Batch transports: EOF means input is exhausted; finish serving the
    /// inbound calls already accepted, flush the outgoing queue, stop.
    Drain,
}

/// Options for [`RpcSession::spawn`](crate::session::RpcSession::spawn).
#[derive(Clone)]
pub struct SessionConfig {
    pub(crate) side: Side,
    pub(crate) local_main: Option<Arc<dyn RpcTarget>>,
    pub(crate) on_disconnect: Option<DisconnectHook>,
    pub(crate) max_inflight_calls: Option<usize>,
    pub(crate) eof: EofPolicy,
}

impl SessionConfig {
    /// Options for the client side of a connection.
    #[must_use]
    pub fn client() -> Self {
        Self::new(Side::Client)
    }

    /// Options for the server side of a connection.
    #[must_use]
    pub fn server() -> Self {
        Self::new(Side::Server)
    }

    fn new(side: Side) -> Self {
        Self {
            side,
            local_main: None,
            on_disconnect: None,
            max_inflight_calls: None,
            eof: EofPolicy::Disconnect,
        }
    }

    /// Pre-bind id 0 on this side to the given main capability.
    #[must_use]
    pub fn with_local_main(mut self, main: Arc<dyn RpcTarget>) -> Self {
        self.local_main = Some(main);
        self
    }

    /// Register a hook invoked when the session terminates on disconnect.
    #[must_use]
    pub fn with_on_disconnect<F>(mut self, hook: F) -> Self
    where
        F: Fn(&RpcError) + Send + Sync + 'static,
    {
        self.on_disconnect = Some(Arc::new(hook));
        self
    }

    /// Bound the number of inbound calls running concurrently. Further
    /// pushes queue until a handler slot frees up.
    #[must_use]
    pub fn with_max_inflight_calls(mut self, max: usize) -> Self {
        self.max_inflight_calls = Some(max);
        self
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("side", &self.side)
            .field("has_local_main", &self.local_main.is_some())
            .field("has_on_disconnect", &self.on_disconnect.is_some())
            .field("max_inflight_calls", &self.max_inflight_calls)
            .field("eof", &self.eof)
            .finish()
    }
}
