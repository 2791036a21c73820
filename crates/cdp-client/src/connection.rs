//! The connection seam every CDP consumer programs against.
//!
//! Production code talks to [`crate::CdpClient`]; tests inject
//! [`crate::testing::FakeCdp`]. Both share the subscription table and close
//! signalling defined here.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::error::CdpError;

/// Why a client reached its terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called.
    Requested,
    /// The underlying socket went away without a requested shutdown.
    ConnectionLost,
}

/// Observer for the exactly-once close signal of a client.
///
/// Every clone resolves with the same reason; a client that is already
/// closed resolves immediately.
#[derive(Clone)]
pub struct CloseSignal {
    rx: watch::Receiver<Option<CloseReason>>,
}

impl CloseSignal {
    pub(crate) fn new(rx: watch::Receiver<Option<CloseReason>>) -> Self {
        Self { rx }
    }

    /// Resolve once the client is closed, with the reason.
    pub async fn wait(mut self) -> CloseReason {
        loop {
            if let Some(reason) = *self.rx.borrow() {
                return reason;
            }
            if self.rx.changed().await.is_err() {
                // Sender dropped without an explicit reason: the client is
                // gone, treat it as a lost connection.
                return CloseReason::ConnectionLost;
            }
        }
    }

    pub fn reason(&self) -> Option<CloseReason> {
        *self.rx.borrow()
    }
}

pub(crate) struct EventSink {
    pub method: String,
    pub tx: mpsc::UnboundedSender<Value>,
}

/// Registry of live event subscriptions for one client.
///
/// Sized for heavy fan-out: a render installs a dozen subscriptions and a
/// busy service runs hundreds of renders, so the table must stay cheap at a
/// thousand-plus concurrent entries.
#[derive(Clone)]
pub(crate) struct SubscriptionTable {
    inner: Arc<TableInner>,
}

pub(crate) struct TableInner {
    subs: DashMap<u64, EventSink>,
    next: AtomicU64,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TableInner {
                subs: DashMap::new(),
                next: AtomicU64::new(1),
            }),
        }
    }

    pub fn subscribe(&self, method: &str) -> EventStream {
        let id = self.inner.next.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subs.insert(
            id,
            EventSink {
                method: method.to_string(),
                tx,
            },
        );
        EventStream {
            id,
            rx,
            table: Arc::clone(&self.inner),
        }
    }

    /// Fan an event out to every subscriber of `method`. Dead receivers are
    /// pruned as they are discovered.
    pub fn dispatch(&self, method: &str, params: &Value) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();
        for entry in self.inner.subs.iter() {
            if entry.value().method == method {
                if entry.value().tx.send(params.clone()).is_ok() {
                    delivered += 1;
                } else {
                    dead.push(*entry.key());
                }
            }
        }
        for id in dead {
            self.inner.subs.remove(&id);
        }
        delivered
    }

    /// Drop every sink so all outstanding streams terminate.
    pub fn clear(&self) {
        self.inner.subs.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.subs.len()
    }
}

/// Stream of raw event payloads for one subscribed method.
///
/// Dropping the stream unsubscribes it.
pub struct EventStream {
    id: u64,
    rx: mpsc::UnboundedReceiver<Value>,
    table: Arc<TableInner>,
}

impl EventStream {
    /// Next event payload; `None` once the client closed or the
    /// subscription was cleared.
    pub async fn next(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.table.subs.remove(&self.id);
    }
}

/// A live CDP endpoint: domain-qualified calls plus event subscriptions.
#[async_trait]
pub trait CdpConnection: Send + Sync {
    /// Invoke `method` with `params`, returning the raw result payload.
    async fn call(&self, method: &str, params: Value) -> Result<Value, CdpError>;

    /// Subscribe to protocol events with the given method name.
    fn subscribe(&self, method: &str) -> EventStream;

    /// Observer resolving exactly once when the client closes.
    fn close_signal(&self) -> CloseSignal;

    fn is_closed(&self) -> bool;

    /// Idempotent requested shutdown.
    async fn close(&self);
}

/// Shorthand used throughout the workspace.
pub type SharedCdp = Arc<dyn CdpConnection>;
