//! CDP client layer.
//!
//! Dials a DevTools WebSocket URL and exposes the two primitives everything
//! above it needs: domain-qualified method calls and subscriptions to
//! protocol events, plus an exactly-once close signal distinguishing a
//! requested shutdown from unexpected socket loss.

mod client;
mod connection;
mod error;
pub mod testing;

pub use client::CdpClient;
pub use connection::{CdpConnection, CloseReason, CloseSignal, EventStream, SharedCdp};
pub use error::CdpError;
