//! Scenario tests for the main/standby supervised provider.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use event_bus::wait_for;
use serde_json::json;
use snapdom_browser::testing::FakeLauncher;
use snapdom_browser::{
    BrowserError, BrowserProvider, ProcessStatus, ProviderEvent, ProviderStatus, RecycleResult,
    SupervisedProvider, SupervisorConfig, TakeoverReason,
};

const MAIN_PORT: u16 = 9222;
const STANDBY_PORT: u16 = 9223;

fn config() -> SupervisorConfig {
    let mut cfg = SupervisorConfig::new(
        PathBuf::from("/usr/bin/chromium"),
        MAIN_PORT,
        STANDBY_PORT,
    );
    cfg.auto_recycle = false;
    cfg.startup_retry_delay_ms = None;
    cfg.auto_restart_delay_ms = None;
    cfg.graceful_exit_wait_ms = 200;
    cfg
}

fn provider_with(launcher: &FakeLauncher, cfg: SupervisorConfig) -> SupervisedProvider {
    SupervisedProvider::new(cfg, Arc::new(launcher.clone()))
}

async fn start_and_wait(provider: &SupervisedProvider) {
    provider.start().await.expect("supervisor start");
    for _ in 0..200 {
        if let Ok(Some(handle)) = provider.create_handle().await {
            handle.close();
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("provider never became able to serve handles");
}

#[tokio::test]
async fn start_assigns_one_main_and_one_standby() {
    let launcher = FakeLauncher::new();
    let provider = provider_with(&launcher, config());
    start_and_wait(&provider).await;

    let main = provider.main_instance().await;
    let standby = provider.standby_instance().await;
    assert_eq!(main.process().debug_port(), MAIN_PORT);
    assert_eq!(standby.process().debug_port(), STANDBY_PORT);
    assert_eq!(main.role().await, snapdom_browser::Role::Main);
    assert_eq!(standby.role().await, snapdom_browser::Role::Standby);

    // Handles are served by the Main's client.
    let handle = provider.create_handle().await.unwrap().expect("handle");
    handle
        .client()
        .call("Page.enable", json!({}))
        .await
        .unwrap();
    assert_eq!(
        launcher
            .latest_client(MAIN_PORT)
            .unwrap()
            .call_count("Page.enable"),
        1
    );
    assert_eq!(launcher.latest_client(STANDBY_PORT).unwrap().calls().len(), 0);
}

#[tokio::test]
async fn main_fault_promotes_the_standby() {
    let launcher = FakeLauncher::new();
    let provider = provider_with(&launcher, config());
    start_and_wait(&provider).await;
    let mut events = provider.events().subscribe();

    launcher.latest_child(MAIN_PORT).unwrap().terminate();

    let takeover = tokio::time::timeout(
        Duration::from_secs(2),
        wait_for(&mut events, |ev| {
            matches!(ev, ProviderEvent::Takeover { reason: TakeoverReason::Fault })
        }),
    )
    .await
    .expect("expected a fault takeover");
    assert!(takeover.is_some());

    let main = provider.main_instance().await;
    assert_eq!(main.process().debug_port(), STANDBY_PORT);
    assert_eq!(main.role().await, snapdom_browser::Role::Main);

    let handle = provider.create_handle().await.unwrap().expect("handle");
    handle
        .client()
        .call("Browser.getVersion", json!({}))
        .await
        .unwrap();
    assert_eq!(
        launcher
            .latest_client(STANDBY_PORT)
            .unwrap()
            .call_count("Browser.getVersion"),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn initial_startup_gives_the_first_main_a_grace_period() {
    let launcher = FakeLauncher::new();
    launcher.fail_probes_forever(MAIN_PORT, "connection refused");
    let provider = provider_with(&launcher, config());
    let mut events = provider.events().subscribe();

    provider.start().await.unwrap();

    // Standby is up, the initial Main never came up, and it has only one
    // start attempt: no takeover yet.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(
        provider.main_instance().await.process().debug_port(),
        MAIN_PORT
    );
    assert!(provider.create_handle().await.unwrap().is_none());

    // A second failed start attempt ends the grace.
    let main = provider.main_instance().await;
    let _ = main.process().start().await;

    let takeover = tokio::time::timeout(
        Duration::from_secs(30),
        wait_for(&mut events, |ev| {
            matches!(ev, ProviderEvent::Takeover { reason: TakeoverReason::Fault })
        }),
    )
    .await
    .expect("expected takeover after the grace ended");
    assert!(takeover.is_some());
    assert_eq!(
        provider.main_instance().await.process().debug_port(),
        STANDBY_PORT
    );
}

#[tokio::test]
async fn recycle_waits_for_open_handles_then_restarts_the_demoted_main() {
    let launcher = FakeLauncher::new();
    let mut cfg = config();
    cfg.recycle_drain_ms = 10_000;
    let provider = provider_with(&launcher, cfg);
    start_and_wait(&provider).await;
    let mut events = provider.events().subscribe();

    let handle = provider.create_handle().await.unwrap().expect("handle");

    let recycle = {
        let provider = provider.clone();
        tokio::spawn(async move { provider.recycle_main().await })
    };

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        !recycle.is_finished(),
        "recycle must drain the open handle first"
    );

    handle.close();
    let result = tokio::time::timeout(Duration::from_secs(2), recycle)
        .await
        .expect("recycle should finish once drained")
        .unwrap()
        .unwrap();
    assert_eq!(result, RecycleResult::Recycled);

    let takeover = wait_for(&mut events, |ev| {
        matches!(ev, ProviderEvent::Takeover { reason: TakeoverReason::Recycle })
    })
    .await;
    assert!(takeover.is_some());

    // New handles are served by the instance on the former standby port.
    let handle = provider.create_handle().await.unwrap().expect("handle");
    handle
        .client()
        .call("Page.enable", json!({}))
        .await
        .unwrap();
    assert_eq!(
        launcher
            .latest_client(STANDBY_PORT)
            .unwrap()
            .call_count("Page.enable"),
        1
    );

    // The demoted browser was stopped and spawned again.
    for _ in 0..100 {
        if launcher
            .latest_child(MAIN_PORT)
            .map(|child| !child.has_exited())
            .unwrap_or(false)
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        provider
            .standby_instance()
            .await
            .process()
            .debug_port(),
        MAIN_PORT
    );
}

#[tokio::test]
async fn concurrent_recycles_share_one_run_and_one_event() {
    let launcher = FakeLauncher::new();
    let mut cfg = config();
    cfg.recycle_drain_ms = 10_000;
    let provider = provider_with(&launcher, cfg);
    start_and_wait(&provider).await;
    let mut events = provider.events().subscribe();

    // The open handle parks the first recycle in its drain, guaranteeing
    // the second call joins the same flight.
    let handle = provider.create_handle().await.unwrap().expect("handle");

    let first = {
        let provider = provider.clone();
        tokio::spawn(async move { provider.recycle_main().await })
    };
    let second = {
        let provider = provider.clone();
        tokio::spawn(async move { provider.recycle_main().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.close();

    let a = first.await.unwrap().unwrap();
    let b = second.await.unwrap().unwrap();
    assert_eq!(a, b);
    assert_eq!(a, RecycleResult::Recycled);

    let mut recycle_events = 0;
    while let Ok(Some(_)) = tokio::time::timeout(
        Duration::from_millis(200),
        wait_for(&mut events, |ev| matches!(ev, ProviderEvent::Recycle { .. })),
    )
    .await
    {
        recycle_events += 1;
    }
    assert_eq!(recycle_events, 1);
}

#[tokio::test]
async fn recycle_without_running_standby_reports_unavailable() {
    let launcher = FakeLauncher::new();
    let provider = provider_with(&launcher, config());
    start_and_wait(&provider).await;

    provider.standby_instance().await.process().stop().await;

    let result = provider.recycle_main().await.unwrap();
    assert_eq!(result, RecycleResult::StandbyUnavailable);
    assert_eq!(
        provider.main_instance().await.process().debug_port(),
        MAIN_PORT,
        "roles must not swap when the standby is unavailable"
    );
}

#[tokio::test]
async fn recycle_on_a_closed_provider_is_a_logic_error() {
    let launcher = FakeLauncher::new();
    let provider = provider_with(&launcher, config());
    start_and_wait(&provider).await;
    provider.close().await;

    let err = provider.recycle_main().await.unwrap_err();
    assert!(matches!(err, BrowserError::Logic(_)));
}

#[tokio::test]
async fn close_tears_everything_down() {
    let launcher = FakeLauncher::new();
    let provider = provider_with(&launcher, config());
    start_and_wait(&provider).await;

    let handle = provider.create_handle().await.unwrap().expect("handle");

    provider.close().await;
    assert_eq!(provider.status().await, ProviderStatus::Closed);
    assert!(handle.is_closed());
    assert_eq!(
        provider.main_instance().await.process().status().await,
        ProcessStatus::Stopped
    );
    assert_eq!(
        provider.standby_instance().await.process().status().await,
        ProcessStatus::Stopped
    );
    assert_eq!(
        provider.main_instance().await.handle_count().await,
        0,
        "no handle may survive a provider close"
    );

    // Idempotent.
    provider.close().await;
    let err = provider.create_handle().await.unwrap_err();
    assert!(matches!(err, BrowserError::Logic(_)));
}

#[tokio::test(start_paused = true)]
async fn auto_recycle_fires_once_the_uptime_budget_is_spent() {
    let launcher = FakeLauncher::new();
    let mut cfg = config();
    cfg.auto_recycle = true;
    cfg.auto_recycle_after_uptime_ms = 60_000;
    cfg.auto_recycle_retry_after_ms = 1_000;
    let provider = provider_with(&launcher, cfg);
    let mut events = provider.events().subscribe();

    provider.start().await.unwrap();

    let recycled = tokio::time::timeout(
        Duration::from_secs(600),
        wait_for(&mut events, |ev| {
            matches!(
                ev,
                ProviderEvent::Recycle { result: RecycleResult::Recycled }
            )
        }),
    )
    .await
    .expect("auto recycle should fire after the uptime budget");
    assert!(recycled.is_some());
}
