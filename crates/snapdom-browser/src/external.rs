//! Provider for an externally managed browser: one logical connection to a
//! remote debugging endpoint, re-established with backoff when it drops.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use cdp_client::CloseReason;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backoff::Backoff;
use crate::error::{BrowserError, Result};
use crate::handle::BrowserHandle;
use crate::launcher::{BrowserInfo, BrowserLauncher};
use crate::provider::{BrowserProvider, ProviderStatus};
use crate::single_flight::SingleFlight;

/// Where the external browser's debugger lives.
#[derive(Clone, Debug)]
pub enum ExternalEndpoint {
    /// A fixed WebSocket debugger URL.
    WsUrl(String),
    /// Resolve the WebSocket URL from the HTTP version endpoint.
    HostPort {
        host: String,
        port: u16,
        secure: bool,
    },
}

impl ExternalEndpoint {
    fn version_url(&self) -> Option<String> {
        match self {
            ExternalEndpoint::WsUrl(_) => None,
            ExternalEndpoint::HostPort { host, port, secure } => {
                let scheme = if *secure { "https" } else { "http" };
                Some(format!("{scheme}://{host}:{port}/json/version"))
            }
        }
    }
}

struct ExternalInner {
    endpoint: ExternalEndpoint,
    launcher: Arc<dyn BrowserLauncher>,
    backoff: Mutex<Box<dyn Backoff>>,
    status: Mutex<ProviderStatus>,
    client: Mutex<Option<cdp_client::SharedCdp>>,
    info: Mutex<Option<BrowserInfo>>,
    handles: Mutex<HashMap<Uuid, BrowserHandle>>,
    close_flight: SingleFlight<()>,
    watch_tasks: StdMutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct ExternalProvider {
    inner: Arc<ExternalInner>,
}

impl ExternalProvider {
    pub fn new(
        endpoint: ExternalEndpoint,
        launcher: Arc<dyn BrowserLauncher>,
        reconnect_backoff: Box<dyn Backoff>,
    ) -> Self {
        Self {
            inner: Arc::new(ExternalInner {
                endpoint,
                launcher,
                backoff: Mutex::new(reconnect_backoff),
                status: Mutex::new(ProviderStatus::Initial),
                client: Mutex::new(None),
                info: Mutex::new(None),
                handles: Mutex::new(HashMap::new()),
                close_flight: SingleFlight::new(),
                watch_tasks: StdMutex::new(Vec::new()),
            }),
        }
    }

    async fn provider_status(&self) -> ProviderStatus {
        *self.inner.status.lock().await
    }

    fn connect_once(
        &self,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>> {
        Box::pin(self.connect_once_inner())
    }

    async fn connect_once_inner(&self) -> Result<()> {
        let (ws_url, mut info) = match &self.inner.endpoint {
            ExternalEndpoint::WsUrl(url) => (
                url.clone(),
                BrowserInfo {
                    user_agent: String::new(),
                    ws_url: url.clone(),
                    version: String::new(),
                },
            ),
            ExternalEndpoint::HostPort { .. } => {
                let version_url = self
                    .inner
                    .endpoint
                    .version_url()
                    .expect("host/port endpoint always has a version url");
                let info = self.inner.launcher.probe_version(&version_url).await?;
                (info.ws_url.clone(), info)
            }
        };

        let client = self.inner.launcher.connect(&ws_url).await?;

        // A static URL tells us nothing about the browser; ask it.
        if info.version.is_empty() {
            if let Ok(payload) = client.call("Browser.getVersion", json!({})).await {
                info.user_agent = payload["userAgent"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                info.version = payload["product"].as_str().unwrap_or_default().to_string();
            }
        }

        let signal = client.close_signal();
        {
            *self.inner.client.lock().await = Some(client);
            *self.inner.info.lock().await = Some(info);
        }

        let this = self.clone();
        let task = tokio::spawn(async move {
            if signal.wait().await == CloseReason::ConnectionLost {
                this.handle_disconnect().await;
            }
        });
        self.inner.watch_tasks.lock().unwrap().push(task);
        Ok(())
    }

    async fn handle_disconnect(&self) {
        if self.provider_status().await != ProviderStatus::Running {
            return;
        }
        warn!(target: "external-provider", "debugging endpoint lost, reconnecting");
        *self.inner.client.lock().await = None;
        *self.inner.info.lock().await = None;

        // Disconnect propagation closes the handles via their clients; the
        // set is cleared here so stale entries cannot linger.
        let stale: Vec<BrowserHandle> = {
            let mut handles = self.inner.handles.lock().await;
            handles.drain().map(|(_, handle)| handle).collect()
        };
        for handle in &stale {
            handle.close();
        }

        loop {
            let delay = self.inner.backoff.lock().await.next_try();
            tokio::time::sleep(Duration::from_millis(delay)).await;
            if self.provider_status().await != ProviderStatus::Running {
                return;
            }
            match self.connect_once().await {
                Ok(()) => {
                    self.inner.backoff.lock().await.reset();
                    info!(target: "external-provider", "reconnected to debugging endpoint");
                    return;
                }
                Err(err) => {
                    debug!(target: "external-provider", %err, "reconnect attempt failed");
                }
            }
        }
    }
}

#[async_trait]
impl BrowserProvider for ExternalProvider {
    async fn start(&self) -> Result<()> {
        {
            let mut status = self.inner.status.lock().await;
            if *status != ProviderStatus::Initial {
                return Err(BrowserError::logic("external provider already started"));
            }
            *status = ProviderStatus::Starting;
        }
        match self.connect_once().await {
            Ok(()) => {
                *self.inner.status.lock().await = ProviderStatus::Running;
                Ok(())
            }
            Err(err) => {
                *self.inner.status.lock().await = ProviderStatus::Initial;
                Err(err)
            }
        }
    }

    async fn close(&self) {
        self.inner
            .close_flight
            .run(async {
                {
                    let mut status = self.inner.status.lock().await;
                    if matches!(*status, ProviderStatus::Closing | ProviderStatus::Closed) {
                        return;
                    }
                    *status = ProviderStatus::Closing;
                }
                {
                    let mut tasks = self.inner.watch_tasks.lock().unwrap();
                    for task in tasks.drain(..) {
                        task.abort();
                    }
                }
                let handles: Vec<BrowserHandle> = {
                    let mut handles = self.inner.handles.lock().await;
                    handles.drain().map(|(_, handle)| handle).collect()
                };
                for handle in &handles {
                    handle.close();
                }
                if let Some(client) = self.inner.client.lock().await.take() {
                    client.close().await;
                }
                *self.inner.status.lock().await = ProviderStatus::Closed;
            })
            .await;
    }

    async fn create_handle(&self) -> Result<Option<BrowserHandle>> {
        if self.provider_status().await != ProviderStatus::Running {
            return Err(BrowserError::logic("provider is not running"));
        }
        let client = match self.inner.client.lock().await.clone() {
            Some(client) => client,
            None => return Ok(None),
        };
        let info = self
            .inner
            .info
            .lock()
            .await
            .clone()
            .unwrap_or_else(|| BrowserInfo {
                user_agent: String::new(),
                ws_url: String::new(),
                version: String::new(),
            });
        let handle = BrowserHandle::new(client, info);
        self.inner
            .handles
            .lock()
            .await
            .insert(handle.id(), handle.clone());

        let this = self.clone();
        let id = handle.id();
        let closed = handle.closed();
        tokio::spawn(async move {
            closed.await;
            this.inner.handles.lock().await.remove(&id);
        });
        Ok(Some(handle))
    }

    async fn status(&self) -> ProviderStatus {
        self.provider_status().await
    }
}
