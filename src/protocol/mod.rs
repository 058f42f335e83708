//! LED controller protocol: the binary wire codec and the request/response client.

pub mod client;
pub mod codec;

pub use client::{LedSyncClient, SyncPulse};
pub use codec::{Command, FrameContext, Response, ResponseDecoder};
