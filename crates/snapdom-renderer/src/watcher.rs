//! Tracks the HTTP requests a page makes, and above all identifies the
//! *initial* request: the first non-redirect request of the navigation.
//!
//! Redirect hops never open a new record; the protocol reuses the
//! originating request id and so do we. The initial request is frozen the
//! moment it is observed and is never reassigned.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use cdp_client::SharedCdp;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::types::HeaderMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestState {
    Pending,
    Response,
    Loaded,
    Failed,
}

#[derive(Clone, Debug)]
pub struct ResponseDetails {
    pub received_at_micros: i64,
    pub status: u16,
    /// Header names are lowercased on ingestion.
    pub headers: HeaderMap,
    pub from_disk_cache: bool,
}

#[derive(Clone, Debug)]
pub struct FailureDetails {
    pub completed_at_micros: i64,
    pub error_text: String,
}

#[derive(Clone, Debug)]
pub struct RequestRecord {
    pub id: String,
    /// Current URL; redirect hops overwrite it in place.
    pub url: String,
    pub sent_at_micros: i64,
    pub state: RequestState,
    pub response: Option<ResponseDetails>,
    pub failure: Option<FailureDetails>,
}

impl RequestRecord {
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, RequestState::Loaded | RequestState::Failed)
    }
}

/// Protocol timestamps are fractional seconds; render accounting wants
/// integral microseconds with no drift at that granularity.
pub fn to_micros(seconds: f64) -> i64 {
    (seconds * 1_000_000.0).round() as i64
}

struct WatcherState {
    records: HashMap<String, RequestRecord>,
    order: Vec<String>,
    initial_id: Option<String>,
}

struct WatcherInner {
    state: StdMutex<WatcherState>,
    initial_tx: watch::Sender<Option<RequestRecord>>,
}

pub struct RequestWatcher {
    inner: Arc<WatcherInner>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl RequestWatcher {
    /// Subscribe to the four Network events and start tracking. The
    /// Network domain must already be enabled on `client`.
    ///
    /// In only-initial mode the subscriptions are dropped as soon as the
    /// initial request reaches a terminal state; per-class unsubscription
    /// on first sight would race a concurrent event burst.
    pub fn begin(client: &SharedCdp, only_initial: bool) -> Self {
        let (initial_tx, _) = watch::channel(None);
        let inner = Arc::new(WatcherInner {
            state: StdMutex::new(WatcherState {
                records: HashMap::new(),
                order: Vec::new(),
                initial_id: None,
            }),
            initial_tx,
        });

        let mut sent = client.subscribe("Network.requestWillBeSent");
        let mut responded = client.subscribe("Network.responseReceived");
        let mut finished = client.subscribe("Network.loadingFinished");
        let mut failed = client.subscribe("Network.loadingFailed");

        let driver = Arc::clone(&inner);
        let task = tokio::spawn(async move {
            loop {
                let initial_done = tokio::select! {
                    event = sent.next() => match event {
                        Some(params) => on_request_will_be_sent(&driver, &params),
                        None => break,
                    },
                    event = responded.next() => match event {
                        Some(params) => on_response_received(&driver, &params),
                        None => break,
                    },
                    event = finished.next() => match event {
                        Some(params) => on_loading_finished(&driver, &params),
                        None => break,
                    },
                    event = failed.next() => match event {
                        Some(params) => on_loading_failed(&driver, &params),
                        None => break,
                    },
                };
                if initial_done && only_initial {
                    // Dropping the streams unsubscribes all four classes.
                    return;
                }
            }
        });

        Self {
            inner,
            task: StdMutex::new(Some(task)),
        }
    }

    /// Snapshot of all records in first-seen order.
    pub fn requests(&self) -> Vec<RequestRecord> {
        let state = self.inner.state.lock().unwrap();
        state
            .order
            .iter()
            .filter_map(|id| state.records.get(id).cloned())
            .collect()
    }

    /// The initial request, available once it is Loaded or Failed.
    pub fn initial_request(&self) -> Option<RequestRecord> {
        self.inner.initial_tx.borrow().clone()
    }

    /// Resolves when the initial request reaches Loaded or Failed; `None`
    /// if the watcher shuts down before that.
    pub async fn wait_initial(&self) -> Option<RequestRecord> {
        let mut rx = self.inner.initial_tx.subscribe();
        loop {
            if let Some(record) = rx.borrow().clone() {
                return Some(record);
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }

    pub fn close(&self) {
        if let Ok(mut guard) = self.task.lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }
    }
}

impl Drop for RequestWatcher {
    fn drop(&mut self) {
        self.close();
    }
}

/// Returns whether the initial request just reached a terminal state.
fn on_request_will_be_sent(inner: &WatcherInner, params: &Value) -> bool {
    let Some(id) = params["requestId"].as_str() else {
        return false;
    };
    let url = params["request"]["url"].as_str().unwrap_or_default();
    let timestamp = params["timestamp"].as_f64().unwrap_or_default();
    let is_redirect = !params["redirectResponse"].is_null();

    let mut state = inner.state.lock().unwrap();
    if is_redirect {
        // Redirects reuse the originator's record; only the target moves.
        if let Some(record) = state.records.get_mut(id) {
            trace!(target: "request-watcher", id, url, "redirect hop");
            record.url = url.to_string();
            record.state = RequestState::Pending;
            record.response = None;
        }
        return false;
    }

    if state.records.contains_key(id) {
        return false;
    }
    state.order.push(id.to_string());
    state.records.insert(
        id.to_string(),
        RequestRecord {
            id: id.to_string(),
            url: url.to_string(),
            sent_at_micros: to_micros(timestamp),
            state: RequestState::Pending,
            response: None,
            failure: None,
        },
    );
    if state.initial_id.is_none() {
        state.initial_id = Some(id.to_string());
    }
    false
}

fn on_response_received(inner: &WatcherInner, params: &Value) -> bool {
    let Some(id) = params["requestId"].as_str() else {
        return false;
    };
    let timestamp = params["timestamp"].as_f64().unwrap_or_default();
    let response = &params["response"];

    let mut state = inner.state.lock().unwrap();
    if let Some(record) = state.records.get_mut(id) {
        if record.state == RequestState::Pending {
            record.state = RequestState::Response;
            record.response = Some(ResponseDetails {
                received_at_micros: to_micros(timestamp),
                status: response["status"].as_u64().unwrap_or_default() as u16,
                headers: lowercase_headers(&response["headers"]),
                from_disk_cache: response["fromDiskCache"].as_bool().unwrap_or(false),
            });
        }
    }
    false
}

fn on_loading_finished(inner: &WatcherInner, params: &Value) -> bool {
    let Some(id) = params["requestId"].as_str() else {
        return false;
    };
    let mut state = inner.state.lock().unwrap();
    if let Some(record) = state.records.get_mut(id) {
        if record.state == RequestState::Response {
            record.state = RequestState::Loaded;
        }
    }
    maybe_resolve_initial(inner, &mut state, id)
}

fn on_loading_failed(inner: &WatcherInner, params: &Value) -> bool {
    let Some(id) = params["requestId"].as_str() else {
        return false;
    };
    let timestamp = params["timestamp"].as_f64().unwrap_or_default();
    let error_text = params["errorText"].as_str().unwrap_or_default();

    let mut state = inner.state.lock().unwrap();
    if let Some(record) = state.records.get_mut(id) {
        if matches!(record.state, RequestState::Pending | RequestState::Response) {
            record.state = RequestState::Failed;
            record.failure = Some(FailureDetails {
                completed_at_micros: to_micros(timestamp),
                error_text: error_text.to_string(),
            });
        }
    }
    maybe_resolve_initial(inner, &mut state, id)
}

fn maybe_resolve_initial(inner: &WatcherInner, state: &mut WatcherState, id: &str) -> bool {
    if state.initial_id.as_deref() != Some(id) {
        return false;
    }
    let Some(record) = state.records.get(id) else {
        return false;
    };
    if !record.is_terminal() {
        return false;
    }
    inner.initial_tx.send_if_modified(|slot| {
        if slot.is_none() {
            *slot = Some(record.clone());
            true
        } else {
            false
        }
    })
}

fn lowercase_headers(raw: &Value) -> HeaderMap {
    raw.as_object()
        .map(|headers| {
            headers
                .iter()
                .map(|(name, value)| {
                    (
                        name.to_ascii_lowercase(),
                        value.as_str().unwrap_or_default().to_string(),
                    )
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdp_client::testing::FakeCdp;
    use serde_json::json;
    use std::time::Duration;

    fn sent(id: &str, url: &str, ts: f64) -> Value {
        json!({ "requestId": id, "request": { "url": url }, "timestamp": ts })
    }

    fn redirect(id: &str, url: &str, ts: f64) -> Value {
        json!({
            "requestId": id,
            "request": { "url": url },
            "timestamp": ts,
            "redirectResponse": { "status": 301, "headers": {} },
        })
    }

    fn responded(id: &str, status: u16, headers: Value) -> Value {
        json!({
            "requestId": id,
            "timestamp": 2.0,
            "response": { "status": status, "headers": headers, "fromDiskCache": false },
        })
    }

    fn finished(id: &str) -> Value {
        json!({ "requestId": id, "timestamp": 3.0, "encodedDataLength": 100 })
    }

    fn failed(id: &str, error: &str) -> Value {
        json!({ "requestId": id, "timestamp": 3.0, "errorText": error, "canceled": false })
    }

    async fn watcher_on(client: &FakeCdp, only_initial: bool) -> RequestWatcher {
        let shared: SharedCdp = Arc::new(client.clone());
        let watcher = RequestWatcher::begin(&shared, only_initial);
        // Let the driver task install itself.
        tokio::task::yield_now().await;
        watcher
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn redirect_chain_keeps_one_record_with_the_original_id() {
        let client = FakeCdp::new();
        let watcher = watcher_on(&client, false).await;

        client.emit("Network.requestWillBeSent", sent("r1", "http://a.example/", 1.0));
        client.emit("Network.requestWillBeSent", redirect("r1", "http://b.example/", 1.1));
        client.emit("Network.responseReceived", responded("r1", 200, json!({"X-Test": "1"})));
        client.emit("Network.loadingFinished", finished("r1"));

        let initial = tokio::time::timeout(Duration::from_secs(1), watcher.wait_initial())
            .await
            .expect("initial resolves")
            .expect("record present");
        assert_eq!(initial.id, "r1");
        assert_eq!(initial.url, "http://b.example/");
        assert_eq!(initial.state, RequestState::Loaded);
        assert_eq!(watcher.requests().len(), 1);
    }

    #[tokio::test]
    async fn initial_request_is_frozen_on_first_non_redirect() {
        let client = FakeCdp::new();
        let watcher = watcher_on(&client, false).await;

        client.emit("Network.requestWillBeSent", sent("main", "http://page/", 1.0));
        client.emit("Network.requestWillBeSent", sent("img", "http://page/a.png", 1.2));
        client.emit("Network.responseReceived", responded("img", 200, json!({})));
        client.emit("Network.loadingFinished", finished("img"));
        settle().await;

        // A subresource finishing first must not become the initial request.
        assert!(watcher.initial_request().is_none());

        client.emit("Network.responseReceived", responded("main", 200, json!({})));
        client.emit("Network.loadingFinished", finished("main"));
        let initial = watcher.wait_initial().await.expect("initial resolves");
        assert_eq!(initial.id, "main");
    }

    #[tokio::test]
    async fn headers_are_lowercased_and_status_captured() {
        let client = FakeCdp::new();
        let watcher = watcher_on(&client, false).await;

        client.emit("Network.requestWillBeSent", sent("r1", "http://page/", 1.0));
        client.emit(
            "Network.responseReceived",
            responded("r1", 418, json!({"Content-Type": "text/html", "X-FOO": "Bar"})),
        );
        client.emit("Network.loadingFinished", finished("r1"));

        let initial = watcher.wait_initial().await.expect("initial resolves");
        let response = initial.response.expect("response details");
        assert_eq!(response.status, 418);
        assert_eq!(response.headers.get("content-type").unwrap(), "text/html");
        assert_eq!(response.headers.get("x-foo").unwrap(), "Bar");
        assert!(!response.headers.contains_key("X-FOO"));
    }

    #[tokio::test]
    async fn failure_after_response_keeps_response_details() {
        let client = FakeCdp::new();
        let watcher = watcher_on(&client, false).await;

        client.emit("Network.requestWillBeSent", sent("r1", "http://page/", 1.0));
        client.emit("Network.responseReceived", responded("r1", 200, json!({})));
        client.emit("Network.loadingFailed", failed("r1", "net::ERR_INCOMPLETE_CHUNKED_ENCODING"));

        let initial = watcher.wait_initial().await.expect("initial resolves");
        assert_eq!(initial.state, RequestState::Failed);
        assert_eq!(
            initial.failure.as_ref().unwrap().error_text,
            "net::ERR_INCOMPLETE_CHUNKED_ENCODING"
        );
        assert!(initial.response.is_some(), "response stage was reached");
    }

    #[tokio::test]
    async fn failure_before_response_has_no_status() {
        let client = FakeCdp::new();
        let watcher = watcher_on(&client, false).await;

        client.emit("Network.requestWillBeSent", sent("r1", "https://bad.cert/", 1.0));
        client.emit("Network.loadingFailed", failed("r1", "net::ERR_CERT_AUTHORITY_INVALID"));

        let initial = watcher.wait_initial().await.expect("initial resolves");
        assert_eq!(initial.state, RequestState::Failed);
        assert!(initial.response.is_none());
    }

    #[tokio::test]
    async fn only_initial_mode_unsubscribes_after_resolution() {
        let client = FakeCdp::new();
        let watcher = watcher_on(&client, true).await;

        client.emit("Network.requestWillBeSent", sent("r1", "http://page/", 1.0));
        client.emit("Network.responseReceived", responded("r1", 200, json!({})));
        client.emit("Network.loadingFinished", finished("r1"));
        watcher.wait_initial().await.expect("initial resolves");
        settle().await;

        // All four subscriptions are gone; nobody receives these.
        assert_eq!(
            client.emit("Network.requestWillBeSent", sent("r2", "http://page/b", 2.0)),
            0
        );
        assert_eq!(client.emit("Network.loadingFinished", finished("r2")), 0);
        assert_eq!(watcher.requests().len(), 1);
    }

    #[tokio::test]
    async fn full_mode_keeps_collecting_after_the_initial_request() {
        let client = FakeCdp::new();
        let watcher = watcher_on(&client, false).await;

        client.emit("Network.requestWillBeSent", sent("r1", "http://page/", 1.0));
        client.emit("Network.responseReceived", responded("r1", 200, json!({})));
        client.emit("Network.loadingFinished", finished("r1"));
        watcher.wait_initial().await.expect("initial resolves");

        client.emit("Network.requestWillBeSent", sent("r2", "http://page/b", 2.0));
        settle().await;
        assert_eq!(watcher.requests().len(), 2);
    }

    #[test]
    fn micros_conversion_is_exact_at_microsecond_granularity() {
        assert_eq!(to_micros(123.456789), 123_456_789);
        assert_eq!(to_micros(0.000001), 1);
        assert_eq!(to_micros(7.0), 7_000_000);
    }
}
