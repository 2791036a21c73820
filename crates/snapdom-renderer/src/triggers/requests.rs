//! Network-idle trigger: DOMContentLoaded plus a quiet window with no
//! in-flight requests.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use cdp_client::{CdpError, EventStream};
use serde_json::Value;
use tokio::time::Instant;

use crate::triggers::{CompletionTrigger, TriggerEnv};
use crate::types::CompletionType;

pub struct RequestsTrigger {
    wait_after_last_request: Duration,
    sent: Option<EventStream>,
    finished: Option<EventStream>,
    failed: Option<EventStream>,
    dom: Option<EventStream>,
    inflight: HashSet<String>,
    dom_ready: bool,
}

impl RequestsTrigger {
    pub fn new(wait_after_last_request: Duration) -> Self {
        Self {
            wait_after_last_request,
            sent: None,
            finished: None,
            failed: None,
            dom: None,
            inflight: HashSet::new(),
            dom_ready: false,
        }
    }
}

/// Await the next event on an optional stream. A terminated stream parks
/// forever instead of spinning; the timeout path ends the render.
async fn recv(slot: &mut Option<EventStream>) -> Value {
    if let Some(stream) = slot {
        if let Some(value) = stream.next().await {
            return value;
        }
        *slot = None;
    }
    futures::future::pending().await
}

#[async_trait]
impl CompletionTrigger for RequestsTrigger {
    async fn init(&mut self, env: &TriggerEnv) -> Result<(), CdpError> {
        self.sent = Some(env.client.subscribe("Network.requestWillBeSent"));
        self.finished = Some(env.client.subscribe("Network.loadingFinished"));
        self.failed = Some(env.client.subscribe("Network.loadingFailed"));
        self.dom = Some(env.client.subscribe("Page.domContentEventFired"));
        Ok(())
    }

    async fn wait(&mut self) -> CompletionType {
        let mut quiet_since = Instant::now();
        loop {
            let deadline = quiet_since + self.wait_after_last_request;
            let idle = self.dom_ready && self.inflight.is_empty();
            tokio::select! {
                params = recv(&mut self.sent) => {
                    // A redirect hop reuses the id, so the set stays right.
                    if let Some(id) = params["requestId"].as_str() {
                        self.inflight.insert(id.to_string());
                    }
                }
                params = recv(&mut self.finished) => {
                    if let Some(id) = params["requestId"].as_str() {
                        self.inflight.remove(id);
                        if self.inflight.is_empty() {
                            quiet_since = Instant::now();
                        }
                    }
                }
                params = recv(&mut self.failed) => {
                    if let Some(id) = params["requestId"].as_str() {
                        self.inflight.remove(id);
                        if self.inflight.is_empty() {
                            quiet_since = Instant::now();
                        }
                    }
                }
                _ = recv(&mut self.dom) => {
                    self.dom_ready = true;
                }
                _ = tokio::time::sleep_until(deadline), if idle => {
                    return CompletionType::Requests;
                }
            }
        }
    }

    async fn close(&mut self) {
        self.sent = None;
        self.finished = None;
        self.failed = None;
        self.dom = None;
    }
}
