//! Render manager: owns the browser provider, merges per-request options
//! over the service defaults, and runs one tab renderer per request with
//! handle acquisition and release around it.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use snapdom_browser::{BrowserProvider, ProviderStatus};
use snapdom_renderer::{
    CdpConnector, RenderBrowser, RenderError, RenderErrorKind, RenderOptions, RenderOutcome,
    TabRenderer, TriggerSpec,
};
use tracing::debug;

use crate::config::{ServiceConfig, TriggerConfig};

/// `POST /render` body. Every field but `url` falls back to the
/// configured defaults.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RenderRequestBody {
    pub url: String,
    #[serde(default)]
    pub page_load_timeout_millis: Option<u64>,
    #[serde(default)]
    pub browser_width: Option<u32>,
    #[serde(default)]
    pub browser_height: Option<u32>,
    #[serde(default)]
    pub allow_partial_load: Option<bool>,
    #[serde(default)]
    pub fresh_browser_context: Option<bool>,
    #[serde(default)]
    pub script_to_evaluate_on_new_document: Option<String>,
    #[serde(default)]
    pub expected_status_codes: Option<Vec<u16>>,
    #[serde(default)]
    pub completion_trigger: Option<TriggerRequest>,
    #[serde(default)]
    pub user_agent: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum TriggerRequest {
    #[serde(rename_all = "camelCase")]
    Requests {
        #[serde(default)]
        wait_after_last_request_millis: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    Event {
        #[serde(default)]
        target: Option<String>,
        #[serde(default)]
        event_name: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Variable { var_name: String },
}

const MIN_VIEWPORT_EDGE: u32 = 160;

/// Service-level defaults a request merges over.
#[derive(Clone, Debug)]
pub struct RenderDefaults {
    pub browser_width: u32,
    pub browser_height: u32,
    pub user_agent: Option<String>,
    pub page_load_timeout_millis: u64,
    pub allow_partial_load: bool,
    pub fresh_browser_context: bool,
    pub script_to_evaluate_on_new_document: Option<String>,
    pub expected_status_codes: Vec<u16>,
    pub trigger: TriggerConfig,
}

impl RenderDefaults {
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            browser_width: config.browser.width,
            browser_height: config.browser.height,
            user_agent: config.browser.user_agent.clone(),
            page_load_timeout_millis: config.render.page_load_timeout_millis,
            allow_partial_load: config.render.allow_partial_load,
            fresh_browser_context: config.render.fresh_browser_context,
            script_to_evaluate_on_new_document: config
                .render
                .script_to_evaluate_on_new_document
                .clone(),
            expected_status_codes: config.render.expected_status_codes.clone(),
            trigger: config.render.completion_trigger.clone(),
        }
    }

    /// Merge a request over the defaults, validating ranges.
    pub fn resolve(&self, request: RenderRequestBody) -> Result<RenderOptions, RenderError> {
        if request.url.trim().is_empty() {
            return Err(RenderError::unknown("url must not be empty"));
        }
        let width = request.browser_width.unwrap_or(self.browser_width);
        let height = request.browser_height.unwrap_or(self.browser_height);
        if width < MIN_VIEWPORT_EDGE || height < MIN_VIEWPORT_EDGE {
            return Err(RenderError::unknown(format!(
                "viewport must be at least {MIN_VIEWPORT_EDGE}x{MIN_VIEWPORT_EDGE}"
            )));
        }

        let trigger = self.resolve_trigger(request.completion_trigger);

        Ok(RenderOptions {
            url: request.url,
            browser_width: width,
            browser_height: height,
            page_load_timeout: Duration::from_millis(
                request
                    .page_load_timeout_millis
                    .unwrap_or(self.page_load_timeout_millis),
            ),
            allow_partial_load: request
                .allow_partial_load
                .unwrap_or(self.allow_partial_load),
            fresh_browser_context: request
                .fresh_browser_context
                .unwrap_or(self.fresh_browser_context),
            script_to_evaluate_on_new_document: request
                .script_to_evaluate_on_new_document
                .or_else(|| self.script_to_evaluate_on_new_document.clone()),
            expected_status_codes: request
                .expected_status_codes
                .unwrap_or_else(|| self.expected_status_codes.clone()),
            trigger,
            user_agent: request.user_agent.or_else(|| self.user_agent.clone()),
            debug: false,
        })
    }

    /// A request trigger overrides the configured one; missing fields of a
    /// matching type fall back to the configured values, otherwise to the
    /// built-in defaults.
    fn resolve_trigger(&self, request: Option<TriggerRequest>) -> TriggerSpec {
        let Some(request) = request else {
            return TriggerSpec::from(&self.trigger);
        };
        match request {
            TriggerRequest::Requests {
                wait_after_last_request_millis,
            } => {
                let fallback = match &self.trigger {
                    TriggerConfig::Requests {
                        wait_after_last_request_millis,
                    } => *wait_after_last_request_millis,
                    _ => crate::config::defaults::wait_after_last_request_millis(),
                };
                TriggerSpec::Requests {
                    wait_after_last_request_ms: wait_after_last_request_millis
                        .unwrap_or(fallback),
                }
            }
            TriggerRequest::Event { target, event_name } => {
                let (target_fallback, event_fallback) = match &self.trigger {
                    TriggerConfig::Event { target, event_name } => {
                        (target.clone(), event_name.clone())
                    }
                    _ => (
                        crate::config::defaults::event_target(),
                        crate::config::defaults::event_name(),
                    ),
                };
                TriggerSpec::Event {
                    target: target.unwrap_or(target_fallback),
                    event_name: event_name.unwrap_or(event_fallback),
                }
            }
            TriggerRequest::Variable { var_name } => TriggerSpec::Variable { var_name },
        }
    }
}

pub struct RenderManager {
    provider: Arc<dyn BrowserProvider>,
    defaults: RenderDefaults,
    connector: Option<CdpConnector>,
}

impl RenderManager {
    /// The provider is built by an injected factory so the service wiring
    /// (and tests) decide which implementation backs renders.
    pub fn new<F>(provider_factory: F, defaults: RenderDefaults) -> Self
    where
        F: FnOnce() -> Arc<dyn BrowserProvider>,
    {
        Self {
            provider: provider_factory(),
            defaults,
            connector: None,
        }
    }

    /// Override how page-target connections are dialed (tests).
    pub fn with_connector(mut self, connector: CdpConnector) -> Self {
        self.connector = Some(connector);
        self
    }

    pub async fn start(&self) -> snapdom_browser::Result<()> {
        self.provider.start().await
    }

    pub async fn stop(&self) {
        self.provider.close().await;
    }

    pub async fn provider_status(&self) -> ProviderStatus {
        self.provider.status().await
    }

    pub async fn render(&self, request: RenderRequestBody) -> Result<RenderOutcome, RenderError> {
        let options = self.defaults.resolve(request)?;

        let handle = match self.provider.create_handle().await {
            Ok(Some(handle)) => handle,
            Ok(None) => {
                return Err(RenderError::new(
                    RenderErrorKind::BrowserUnavailable,
                    "no browser is available to serve this render",
                ))
            }
            Err(err) => {
                return Err(RenderError::new(
                    RenderErrorKind::BrowserUnavailable,
                    err.to_string(),
                ))
            }
        };

        let info = handle.browser_info().clone();
        let browser = match &self.connector {
            Some(connector) => RenderBrowser::with_connector(
                handle.client(),
                info.ws_url.clone(),
                Arc::clone(connector),
            ),
            None => RenderBrowser::new(handle.client(), info.ws_url.clone()),
        };

        debug!(target: "render-manager", url = %options.url, "render starting");
        let result = TabRenderer::new(browser, options).render().await;

        // The handle is released on every exit path; its client stays
        // open for other renders.
        handle.close();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdp_client::testing::FakeCdp;
    use cdp_client::{CdpConnection, SharedCdp};
    use serde_json::json;
    use snapdom_browser::testing::FakeLauncher;
    use snapdom_browser::{backoff::FlatBackoff, ExternalEndpoint, ExternalProvider};
    use snapdom_renderer::CompletionType;

    fn body(url: &str) -> RenderRequestBody {
        RenderRequestBody {
            url: url.to_string(),
            page_load_timeout_millis: None,
            browser_width: None,
            browser_height: None,
            allow_partial_load: None,
            fresh_browser_context: None,
            script_to_evaluate_on_new_document: None,
            expected_status_codes: None,
            completion_trigger: None,
            user_agent: None,
        }
    }

    fn defaults() -> RenderDefaults {
        RenderDefaults::from_config(&ServiceConfig::default())
    }

    #[test]
    fn resolve_applies_service_defaults() {
        let options = defaults().resolve(body("http://x/")).unwrap();
        assert_eq!(options.browser_width, 1920);
        assert_eq!(options.page_load_timeout, Duration::from_millis(20_000));
        assert!(options.fresh_browser_context);
        assert_eq!(
            options.trigger,
            TriggerSpec::Requests {
                wait_after_last_request_ms: 500
            }
        );
    }

    #[test]
    fn resolve_rejects_tiny_viewports_and_empty_urls() {
        let mut request = body("http://x/");
        request.browser_width = Some(100);
        assert!(defaults().resolve(request).is_err());
        assert!(defaults().resolve(body("  ")).is_err());
    }

    #[test]
    fn event_trigger_fields_fall_back_to_builtin_defaults() {
        let options = defaults()
            .resolve(RenderRequestBody {
                completion_trigger: Some(TriggerRequest::Event {
                    target: None,
                    event_name: None,
                }),
                ..body("http://x/")
            })
            .unwrap();
        assert_eq!(
            options.trigger,
            TriggerSpec::Event {
                target: "window".to_string(),
                event_name: "prerender_done".to_string(),
            }
        );
    }

    fn test_manager(launcher: &FakeLauncher, page: &FakeCdp) -> RenderManager {
        let provider = ExternalProvider::new(
            ExternalEndpoint::HostPort {
                host: "127.0.0.1".to_string(),
                port: 9400,
                secure: false,
            },
            Arc::new(launcher.clone()),
            Box::new(FlatBackoff::new(5)),
        );
        let connector: CdpConnector = {
            let page = page.clone();
            Arc::new(move |_url: String| {
                let page = page.clone();
                Box::pin(async move { Ok(Arc::new(page) as SharedCdp) })
            })
        };
        RenderManager::new(move || Arc::new(provider) as Arc<dyn BrowserProvider>, defaults())
            .with_connector(connector)
    }

    #[tokio::test]
    async fn render_before_start_is_browser_unavailable() {
        let launcher = FakeLauncher::new();
        let page = FakeCdp::new();
        let manager = test_manager(&launcher, &page);

        let err = manager.render(body("http://x/")).await.unwrap_err();
        assert_eq!(err.kind, RenderErrorKind::BrowserUnavailable);
    }

    #[tokio::test]
    async fn render_round_trip_through_the_provider() {
        let launcher = FakeLauncher::new();
        let page = FakeCdp::new();
        page.enqueue(
            "Runtime.evaluate",
            Ok(json!({ "result": { "type": "string", "value": "<html>ok</html>" } })),
        );
        let manager = test_manager(&launcher, &page);
        manager.start().await.unwrap();

        let mut request = body("http://site.example/");
        request.completion_trigger = Some(TriggerRequest::Requests {
            wait_after_last_request_millis: Some(20),
        });

        let render = tokio::spawn(async move {
            let outcome = manager.render(request).await;
            (outcome, manager)
        });

        // Drive the page once navigation lands.
        for _ in 0..200 {
            if page.call_count("Page.navigate") > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        page.emit(
            "Page.domContentEventFired",
            json!({ "timestamp": 1.0 }),
        );
        page.emit(
            "Network.requestWillBeSent",
            json!({
                "requestId": "main",
                "request": { "url": "http://site.example/" },
                "timestamp": 1.0,
            }),
        );
        page.emit(
            "Network.responseReceived",
            json!({
                "requestId": "main",
                "timestamp": 1.1,
                "response": { "status": 200, "headers": {}, "fromDiskCache": false },
            }),
        );
        page.emit(
            "Network.loadingFinished",
            json!({ "requestId": "main", "timestamp": 1.2, "encodedDataLength": 1 }),
        );

        let (outcome, manager) = render.await.unwrap();
        let outcome = outcome.expect("render succeeds");
        assert_eq!(outcome.http_status, 200);
        assert_eq!(outcome.completion, CompletionType::Requests);
        assert_eq!(outcome.html, "<html>ok</html>");

        // The browser-wide client survives handle release.
        assert!(!launcher.latest_client(9400).unwrap().is_closed());
        manager.stop().await;
        assert_eq!(manager.provider_status().await, ProviderStatus::Closed);
    }
}
