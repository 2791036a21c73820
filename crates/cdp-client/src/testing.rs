//! Scriptable in-process stand-in for a CDP endpoint.
//!
//! Mirrors the real client's observable behavior: calls return queued
//! results (or a canned default), events reach subscribers through the same
//! subscription table, and the close signal fires exactly once.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::watch;

use crate::connection::{CdpConnection, CloseReason, CloseSignal, EventStream, SubscriptionTable};
use crate::error::CdpError;

struct FakeShared {
    subs: SubscriptionTable,
    close_tx: watch::Sender<Option<CloseReason>>,
    calls: StdMutex<Vec<(String, Value)>>,
    queued: StdMutex<HashMap<String, VecDeque<Result<Value, CdpError>>>>,
}

#[derive(Clone)]
pub struct FakeCdp {
    inner: Arc<FakeShared>,
}

impl Default for FakeCdp {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCdp {
    pub fn new() -> Self {
        let (close_tx, _) = watch::channel(None);
        Self {
            inner: Arc::new(FakeShared {
                subs: SubscriptionTable::new(),
                close_tx,
                calls: StdMutex::new(Vec::new()),
                queued: StdMutex::new(HashMap::new()),
            }),
        }
    }

    /// Queue the next result for `method`; consumed FIFO per method.
    pub fn enqueue(&self, method: &str, result: Result<Value, CdpError>) {
        self.inner
            .queued
            .lock()
            .unwrap()
            .entry(method.to_string())
            .or_default()
            .push_back(result);
    }

    /// Deliver a protocol event to all subscribers of `method`.
    pub fn emit(&self, method: &str, params: Value) -> usize {
        if self.is_closed() {
            return 0;
        }
        self.inner.subs.dispatch(method, &params)
    }

    /// Simulate unexpected socket loss.
    pub fn drop_connection(&self) {
        let changed = self.inner.close_tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(CloseReason::ConnectionLost);
                true
            } else {
                false
            }
        });
        if changed {
            self.inner.subs.clear();
        }
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.inner.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, method: &str) -> Vec<Value> {
        self.inner
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.calls_for(method).len()
    }

    fn default_result(method: &str) -> Value {
        match method {
            "Target.createBrowserContext" => json!({ "browserContextId": "fake-context" }),
            "Target.createTarget" => json!({ "targetId": "fake-target" }),
            "Browser.getVersion" => json!({
                "product": "HeadlessChrome/0.0",
                "userAgent": "FakeChrome/0.0",
            }),
            _ => json!({}),
        }
    }
}

#[async_trait]
impl CdpConnection for FakeCdp {
    async fn call(&self, method: &str, params: Value) -> Result<Value, CdpError> {
        self.inner
            .calls
            .lock()
            .unwrap()
            .push((method.to_string(), params));
        if self.is_closed() {
            return Err(CdpError::Closed);
        }
        let queued = self
            .inner
            .queued
            .lock()
            .unwrap()
            .get_mut(method)
            .and_then(|queue| queue.pop_front());
        match queued {
            Some(result) => result,
            None => Ok(Self::default_result(method)),
        }
    }

    fn subscribe(&self, method: &str) -> EventStream {
        self.inner.subs.subscribe(method)
    }

    fn close_signal(&self) -> CloseSignal {
        CloseSignal::new(self.inner.close_tx.subscribe())
    }

    fn is_closed(&self) -> bool {
        self.inner.close_tx.borrow().is_some()
    }

    async fn close(&self) {
        let changed = self.inner.close_tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(CloseReason::Requested);
                true
            } else {
                false
            }
        });
        if changed {
            self.inner.subs.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn queued_results_are_consumed_in_order() {
        let fake = FakeCdp::new();
        fake.enqueue("Runtime.evaluate", Ok(json!({"result": {"value": 1}})));
        fake.enqueue("Runtime.evaluate", Ok(json!({"result": {"value": 2}})));

        let first = fake.call("Runtime.evaluate", json!({})).await.unwrap();
        let second = fake.call("Runtime.evaluate", json!({})).await.unwrap();
        assert_eq!(first["result"]["value"], 1);
        assert_eq!(second["result"]["value"], 2);
        assert_eq!(fake.call_count("Runtime.evaluate"), 2);
    }

    #[tokio::test]
    async fn drop_connection_fires_close_signal_once() {
        let fake = FakeCdp::new();
        let signal = fake.close_signal();
        fake.drop_connection();
        fake.drop_connection();
        assert_eq!(signal.wait().await, CloseReason::ConnectionLost);
        // A later requested close must not rewrite the reason.
        fake.close().await;
        assert_eq!(
            fake.close_signal().wait().await,
            CloseReason::ConnectionLost
        );
    }

    #[tokio::test]
    async fn calls_after_close_fail() {
        let fake = FakeCdp::new();
        fake.close().await;
        let err = fake.call("Page.enable", json!({})).await.unwrap_err();
        assert!(matches!(err, CdpError::Closed));
    }
}
