//! End-to-end render scenarios against a real local Chromium.
//!
//! Run with `cargo test -- --ignored` on a machine with a Chromium-family
//! binary installed (or SNAPDOM_CHROME pointing at one).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::response::Html;
use axum::routing::get;
use axum::Router;
use snapdom::config::ServiceConfig;
use snapdom::render_manager::{RenderDefaults, RenderManager, RenderRequestBody, TriggerRequest};
use snapdom_browser::{
    detect_browser_binary, BrowserProvider, ChromiumLauncher, SupervisedProvider, SupervisorConfig,
};
use snapdom_renderer::RenderErrorKind;

async fn serve_pages() -> SocketAddr {
    let app = Router::new()
        .route(
            "/event",
            get(|| async {
                Html(
                    r#"<h1>Test</h1><script>window.dispatchEvent(new Event("renderDoneEvent"));</script>"#,
                )
            }),
        )
        .route(
            "/variable",
            get(|| async {
                Html(
                    r#"<p>1</p><script>window.renderDoneVar=true;document.querySelector('p').innerText='2';</script>"#,
                )
            }),
        )
        .route(
            "/endless",
            get(|| async {
                Html(
                    r#"<h1>busy</h1><script>setInterval(function(){fetch('/event?x='+Math.random());}, 100);</script>"#,
                )
            }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service()).await.unwrap();
    });
    addr
}

async fn manager_with_real_browser(port_base: u16) -> RenderManager {
    let binary = detect_browser_binary().expect("a chromium binary is required for e2e tests");
    let mut config = SupervisorConfig::new(binary, port_base, port_base + 1);
    config.auto_recycle = false;
    let provider: Arc<dyn BrowserProvider> = Arc::new(SupervisedProvider::new(
        config,
        Arc::new(ChromiumLauncher::new()),
    ));
    let manager = RenderManager::new(
        move || provider,
        RenderDefaults::from_config(&ServiceConfig::default()),
    );
    manager.start().await.expect("provider start");
    // Give the main browser a moment to come up.
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if manager.render(request("about:blank")).await.is_ok() {
            break;
        }
    }
    manager
}

fn request(url: &str) -> RenderRequestBody {
    RenderRequestBody {
        url: url.to_string(),
        page_load_timeout_millis: Some(15_000),
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

#[tokio::test]
#[ignore = "requires a local Chromium"]
async fn event_trigger_renders_a_minimal_page() {
    let pages = serve_pages().await;
    let manager = manager_with_real_browser(9322).await;

    let mut body = request(&format!("http://{pages}/event"));
    body.completion_trigger = Some(TriggerRequest::Event {
        target: Some("window".to_string()),
        event_name: Some("renderDoneEvent".to_string()),
    });

    let outcome = manager.render(body).await.expect("render succeeds");
    assert_eq!(outcome.http_status, 200);
    assert!(outcome.html.contains("<h1>Test</h1>"));
    assert!(outcome.html.contains("renderDoneEvent"));
    manager.stop().await;
}

#[tokio::test]
#[ignore = "requires a local Chromium"]
async fn variable_trigger_captures_html_before_the_next_mutation() {
    let pages = serve_pages().await;
    let manager = manager_with_real_browser(9332).await;

    let mut body = request(&format!("http://{pages}/variable"));
    body.completion_trigger = Some(TriggerRequest::Variable {
        var_name: "renderDoneVar".to_string(),
    });

    let outcome = manager.render(body).await.expect("render succeeds");
    assert!(
        outcome.html.contains("<p>1</p>"),
        "the capture must precede the synchronous mutation, got: {}",
        outcome.html
    );
    manager.stop().await;
}

#[tokio::test]
#[ignore = "requires a local Chromium"]
async fn requests_trigger_times_out_on_an_endless_page() {
    let pages = serve_pages().await;
    let manager = manager_with_real_browser(9342).await;

    let mut body = request(&format!("http://{pages}/endless"));
    body.page_load_timeout_millis = Some(1_000);
    body.completion_trigger = Some(TriggerRequest::Requests {
        wait_after_last_request_millis: Some(500),
    });

    let err = manager.render(body).await.expect_err("must time out");
    assert_eq!(err.kind, RenderErrorKind::Timeout);
    assert_eq!(err.http_status, Some(200));
    manager.stop().await;
}

#[tokio::test]
#[ignore = "requires a local Chromium"]
async fn expected_status_mismatch_is_reported() {
    let pages = serve_pages().await;
    let manager = manager_with_real_browser(9352).await;

    let mut body = request(&format!("http://{pages}/event"));
    body.expected_status_codes = Some(vec![400]);
    body.completion_trigger = Some(TriggerRequest::Event {
        target: None,
        event_name: Some("renderDoneEvent".to_string()),
    });

    let err = manager.render(body).await.expect_err("status mismatch");
    assert_eq!(err.kind, RenderErrorKind::InitialRequestStatus);
    manager.stop().await;
}
