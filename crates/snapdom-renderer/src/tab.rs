//! Per-request tab orchestration.
//!
//! One renderer instance performs one render: create an isolated browser
//! context and page target, install instrumentation, navigate, classify
//! the initial request, wait for the completion trigger under the hard
//! page-load timeout, read the HTML, and tear everything down. Teardown
//! runs on every exit path and tolerates individual step failures.

use std::sync::{Arc, Mutex as StdMutex};

use cdp_client::{CdpClient, CdpError, SharedCdp};
use futures::future::BoxFuture;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::dialogs::DialogHandler;
use crate::page_js::PageContext;
use crate::triggers::{build_trigger, CompletionTrigger, TriggerEnv};
use crate::types::{
    CompletionType, RenderError, RenderErrorKind, RenderOptions, RenderOutcome,
};
use crate::watcher::{RequestRecord, RequestState, RequestWatcher};

/// Dials a page-target WebSocket URL. Injected so tests can hand out
/// in-process fakes instead of real sockets.
pub type CdpConnector =
    Arc<dyn Fn(String) -> BoxFuture<'static, Result<SharedCdp, CdpError>> + Send + Sync>;

/// Hook invoked once the initial request has been classified.
pub type InitialRequestHook = Box<dyn FnOnce(&RequestRecord) + Send>;

/// The browser a render runs against: its browser-wide client plus enough
/// endpoint information to open per-target connections.
#[derive(Clone)]
pub struct RenderBrowser {
    client: SharedCdp,
    ws_url: String,
    connector: CdpConnector,
}

impl RenderBrowser {
    pub fn new(client: SharedCdp, ws_url: impl Into<String>) -> Self {
        let connector: CdpConnector = Arc::new(|url: String| {
            Box::pin(async move {
                let client = CdpClient::connect(&url).await?;
                Ok(Arc::new(client) as SharedCdp)
            })
        });
        Self::with_connector(client, ws_url, connector)
    }

    pub fn with_connector(
        client: SharedCdp,
        ws_url: impl Into<String>,
        connector: CdpConnector,
    ) -> Self {
        Self {
            client,
            ws_url: ws_url.into(),
            connector,
        }
    }

    pub fn client(&self) -> SharedCdp {
        Arc::clone(&self.client)
    }

    /// Page targets are addressed on the same endpoint as the browser,
    /// under `/devtools/page/<targetId>`.
    fn page_ws_url(&self, target_id: &str) -> Result<String, CdpError> {
        let mut url = Url::parse(&self.ws_url)
            .map_err(|err| CdpError::Connect(format!("bad browser ws url: {err}")))?;
        url.set_path(&format!("/devtools/page/{target_id}"));
        Ok(url.to_string())
    }
}

/// Single-use renderer: consuming `render` makes a second render of the
/// same instance unrepresentable.
pub struct TabRenderer {
    browser: RenderBrowser,
    opts: RenderOptions,
    on_initial_request: Option<InitialRequestHook>,
}

impl TabRenderer {
    pub fn new(browser: RenderBrowser, opts: RenderOptions) -> Self {
        Self {
            browser,
            opts,
            on_initial_request: None,
        }
    }

    pub fn on_initial_request(mut self, hook: InitialRequestHook) -> Self {
        self.on_initial_request = Some(hook);
        self
    }

    pub async fn render(mut self) -> Result<RenderOutcome, RenderError> {
        let mut tab = Tab::create(&self.browser, &self.opts).await?;
        let hook = self.on_initial_request.take();
        let result = load_and_read(&mut tab, &self.opts, hook).await;
        tab.teardown(&self.browser).await;
        match &result {
            Ok(outcome) => info!(
                target: "tab-renderer",
                url = %self.opts.url,
                status = outcome.http_status,
                completion = ?outcome.completion,
                "render finished"
            ),
            Err(err) => info!(
                target: "tab-renderer",
                url = %self.opts.url,
                code = err.kind.code(),
                "render failed"
            ),
        }
        result
    }
}

struct Tab {
    page_client: Option<SharedCdp>,
    target_id: Option<String>,
    context_id: Option<String>,
    dialogs: Option<Arc<DialogHandler>>,
    watcher: Option<RequestWatcher>,
    trigger: Option<Box<dyn CompletionTrigger>>,
    page: PageContext,
    dom_ready_rx: watch::Receiver<bool>,
    aux_tasks: Vec<JoinHandle<()>>,
    console: Arc<StdMutex<Vec<String>>>,
}

impl Tab {
    async fn create(browser: &RenderBrowser, opts: &RenderOptions) -> Result<Tab, RenderError> {
        let (_, dom_ready_rx) = watch::channel(false);
        let mut tab = Tab {
            page_client: None,
            target_id: None,
            context_id: None,
            dialogs: None,
            watcher: None,
            trigger: None,
            page: PageContext::new(),
            dom_ready_rx,
            aux_tasks: Vec::new(),
            console: Arc::new(StdMutex::new(Vec::new())),
        };
        match Self::fill(&mut tab, browser, opts).await {
            Ok(()) => Ok(tab),
            Err(err) => {
                warn!(target: "tab-renderer", %err, "tab setup failed");
                tab.teardown(browser).await;
                Err(RenderError::new(
                    RenderErrorKind::TabCreationFailed,
                    err.to_string(),
                ))
            }
        }
    }

    async fn fill(
        tab: &mut Tab,
        browser: &RenderBrowser,
        opts: &RenderOptions,
    ) -> Result<(), CdpError> {
        if opts.fresh_browser_context {
            let created = browser
                .client
                .call("Target.createBrowserContext", json!({}))
                .await?;
            tab.context_id = created["browserContextId"]
                .as_str()
                .map(|id| id.to_string());
        }

        let mut create_params = json!({ "url": "about:blank" });
        if let Some(context_id) = &tab.context_id {
            create_params["browserContextId"] = json!(context_id);
        }
        let target = browser
            .client
            .call("Target.createTarget", create_params)
            .await?;
        let target_id = target["targetId"]
            .as_str()
            .ok_or_else(|| CdpError::Decode("createTarget returned no targetId".into()))?
            .to_string();
        tab.target_id = Some(target_id.clone());

        let page_ws = browser.page_ws_url(&target_id)?;
        let page_client = (browser.connector)(page_ws).await?;
        tab.page_client = Some(Arc::clone(&page_client));

        page_client.call("Page.enable", json!({})).await?;
        page_client.call("Network.enable", json!({})).await?;

        if opts.debug {
            page_client.call("Console.enable", json!({})).await?;
            let mut messages = page_client.subscribe("Console.messageAdded");
            let sink = Arc::clone(&tab.console);
            tab.aux_tasks.push(tokio::spawn(async move {
                while let Some(params) = messages.next().await {
                    let text = params["message"]["text"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string();
                    sink.lock().unwrap().push(text);
                }
            }));
        }

        tab.dialogs = Some(DialogHandler::install(Arc::clone(&page_client)));

        let (dom_tx, dom_rx) = watch::channel(false);
        tab.dom_ready_rx = dom_rx;
        let mut dom_events = page_client.subscribe("Page.domContentEventFired");
        tab.aux_tasks.push(tokio::spawn(async move {
            if dom_events.next().await.is_some() {
                let _ = dom_tx.send(true);
            }
        }));

        if let Some(user_agent) = &opts.user_agent {
            page_client
                .call(
                    "Emulation.setUserAgentOverride",
                    json!({ "userAgent": user_agent }),
                )
                .await?;
        }

        page_client
            .call(
                "Page.addScriptToEvaluateOnNewDocument",
                json!({ "source": tab.page.init_script() }),
            )
            .await?;

        let mut trigger = build_trigger(&opts.trigger);
        let env = TriggerEnv {
            client: Arc::clone(&page_client),
            dialogs: Arc::clone(tab.dialogs.as_ref().expect("dialogs installed")),
            page: tab.page.clone(),
        };
        trigger.init(&env).await?;
        tab.trigger = Some(trigger);

        tab.watcher = Some(RequestWatcher::begin(&page_client, !opts.debug));

        // The user's script goes last so it observes the context object
        // and the trigger hooks already in place.
        if let Some(script) = &opts.script_to_evaluate_on_new_document {
            page_client
                .call(
                    "Page.addScriptToEvaluateOnNewDocument",
                    json!({ "source": script }),
                )
                .await?;
        }
        Ok(())
    }

    /// Best-effort teardown; every step is individually fault-tolerant.
    async fn teardown(&mut self, browser: &RenderBrowser) {
        {
            let console = self.console.lock().unwrap();
            for line in console.iter() {
                debug!(target: "tab-renderer", console = %line, "page console output");
            }
        }
        if let Some(dialogs) = self.dialogs.take() {
            dialogs.close();
        }
        if let Some(watcher) = self.watcher.take() {
            watcher.close();
        }
        if let Some(mut trigger) = self.trigger.take() {
            trigger.close().await;
        }
        for task in self.aux_tasks.drain(..) {
            task.abort();
        }
        if let Some(page_client) = self.page_client.take() {
            page_client.close().await;
        }
        if let Some(target_id) = self.target_id.take() {
            if let Err(err) = browser
                .client
                .call("Target.closeTarget", json!({ "targetId": target_id }))
                .await
            {
                debug!(target: "tab-renderer", %err, "closeTarget failed");
            }
        }
        if let Some(context_id) = self.context_id.take() {
            if let Err(err) = browser
                .client
                .call(
                    "Target.disposeBrowserContext",
                    json!({ "browserContextId": context_id }),
                )
                .await
            {
                debug!(target: "tab-renderer", %err, "disposeBrowserContext failed");
            }
        }
    }
}

async fn load_and_read(
    tab: &mut Tab,
    opts: &RenderOptions,
    hook: Option<InitialRequestHook>,
) -> Result<RenderOutcome, RenderError> {
    let page_client = Arc::clone(tab.page_client.as_ref().expect("page client present"));
    let mut trigger = tab.trigger.take().expect("trigger installed");
    let watcher = tab.watcher.as_ref().expect("watcher running");
    let mut hook = hook;

    let load = async {
        page_client
            .call(
                "Emulation.setDeviceMetricsOverride",
                json!({
                    "width": opts.browser_width,
                    "height": opts.browser_height,
                    "screenWidth": opts.browser_width,
                    "screenHeight": opts.browser_height,
                    "deviceScaleFactor": 0,
                    "mobile": false,
                }),
            )
            .await
            .map_err(RenderError::unknown)?;

        page_client
            .call("Page.navigate", json!({ "url": opts.url }))
            .await
            .map_err(RenderError::unknown)?;

        let initial = watcher.wait_initial().await.ok_or_else(|| {
            RenderError::unknown("request tracking ended before the initial request resolved")
        })?;
        let response_status = initial.response.as_ref().map(|r| r.status);
        let response_headers = initial.response.as_ref().map(|r| r.headers.clone());

        if initial.state == RequestState::Failed {
            let message = initial
                .failure
                .as_ref()
                .map(|f| f.error_text.clone())
                .unwrap_or_else(|| "initial request failed".to_string());
            return Err(RenderError::new(RenderErrorKind::InitialRequestFailed, message)
                .with_response(response_status, response_headers));
        }

        let status = response_status.unwrap_or_default();
        if !opts.expected_status_codes.is_empty()
            && !opts.expected_status_codes.contains(&status)
        {
            return Err(RenderError::new(
                RenderErrorKind::InitialRequestStatus,
                format!("initial request returned status {status}"),
            )
            .with_response(response_status, response_headers));
        }

        if let Some(hook) = hook.take() {
            hook(&initial);
        }

        let completion = trigger.wait().await;
        Ok((
            initial.url.clone(),
            status,
            response_headers.unwrap_or_default(),
            completion,
        ))
    };

    let loaded = tokio::time::timeout(opts.page_load_timeout, load).await;
    tab.trigger = Some(trigger);

    let (resolved_url, http_status, headers, completion) = match loaded {
        Ok(Ok(parts)) => parts,
        Ok(Err(err)) => return Err(err),
        Err(_elapsed) => {
            let initial = tab
                .watcher
                .as_ref()
                .and_then(|watcher| watcher.initial_request());
            let status = initial
                .as_ref()
                .and_then(|r| r.response.as_ref())
                .map(|r| r.status);
            let headers = initial
                .as_ref()
                .and_then(|r| r.response.as_ref())
                .map(|r| r.headers.clone());
            let dom_ready = *tab.dom_ready_rx.borrow();
            if !dom_ready || !opts.allow_partial_load {
                return Err(RenderError::new(
                    RenderErrorKind::Timeout,
                    format!(
                        "page did not complete within {} ms",
                        opts.page_load_timeout.as_millis()
                    ),
                )
                .with_response(status, headers));
            }
            let resolved_url = initial
                .as_ref()
                .map(|r| r.url.clone())
                .unwrap_or_else(|| opts.url.clone());
            (
                resolved_url,
                status.unwrap_or_default(),
                headers.unwrap_or_default(),
                CompletionType::PageLoadTimeout,
            )
        }
    };

    let html = read_html(&page_client, &tab.page).await?;
    Ok(RenderOutcome {
        resolved_url,
        http_status,
        headers,
        html,
        completion,
    })
}

/// Prefer the synchronously latched capture; fall back to serializing the
/// live document.
async fn read_html(client: &SharedCdp, page: &PageContext) -> Result<String, RenderError> {
    let payload = client
        .call(
            "Runtime.evaluate",
            json!({ "expression": page.read_html_expr(), "returnByValue": true }),
        )
        .await
        .map_err(RenderError::unknown)?;
    payload["result"]["value"]
        .as_str()
        .map(|html| html.to_string())
        .ok_or_else(|| RenderError::unknown("html serialization returned no string"))
}
