// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod batch;
mod codec;
pub mod config;
pub mod frame;
pub mod session;
pub mod stub;
mod tables;
pub mod target;
pub mod transport;
pub mod value;

/// The reserved id of the pre-agreed main capability on each side.
pub const MAIN_ID: i64 = 0;

pub use batch::{BatchClient, serve_batch};
pub use config::{DisconnectHook, SessionConfig, Side};
pub use cw_error::{ErrorKind, RpcError};
pub use frame::{Frame, JsonlCodec, PushPayload};
pub use session::{RpcSession, SessionStats};
pub use stub::Stub;
pub use target::RpcTarget;
pub use transport::{ChannelSink, ChannelSource, FrameSink, FrameSource, frame_channel};
pub use value::{Number, Value};
