//! State-machine conformance tests for the browser process, driven through
//! a scripted launcher.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use event_bus::EventBus;
use snapdom_browser::testing::FakeLauncher;
use snapdom_browser::{
    BrowserError, BrowserProcess, ProcessConfig, ProcessEvent, ProcessStatus, StopReason,
};
use tokio::sync::broadcast;

const PORT: u16 = 9222;

fn config() -> ProcessConfig {
    ProcessConfig::new(PathBuf::from("/usr/bin/chromium"), PORT)
}

fn process_with(launcher: &FakeLauncher, cfg: ProcessConfig) -> BrowserProcess {
    BrowserProcess::new(cfg, Arc::new(launcher.clone()))
}

/// Collect events until `last` is seen (inclusive) or the timeout hits.
async fn collect_until(
    rx: &mut broadcast::Receiver<ProcessEvent>,
    last: ProcessEvent,
    limit: Duration,
) -> Vec<ProcessEvent> {
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        let event = tokio::select! {
            event = rx.recv() => match event {
                Ok(event) => event,
                Err(_) => break,
            },
            _ = tokio::time::sleep_until(deadline) => break,
        };
        seen.push(event);
        if event == last {
            break;
        }
    }
    seen
}

fn subscribe(process: &BrowserProcess) -> broadcast::Receiver<ProcessEvent> {
    let bus: &Arc<EventBus<ProcessEvent>> = process.events();
    bus.subscribe()
}

#[tokio::test]
async fn clean_start_reaches_running() {
    let launcher = FakeLauncher::new();
    let process = process_with(&launcher, config());
    let mut rx = subscribe(&process);

    process.start().await.unwrap();

    let events = collect_until(&mut rx, ProcessEvent::Started, Duration::from_secs(2)).await;
    assert_eq!(events, vec![ProcessEvent::Starting, ProcessEvent::Started]);
    assert_eq!(process.status().await, ProcessStatus::Running);
    assert_eq!(process.start_count(), 1);
    assert!(process.client().await.is_some());
    let info = process.info().await.expect("browser info cached");
    assert_eq!(info.version, "FakeChrome/1.0");
    assert!(process.pid().await.is_some());
}

#[tokio::test]
async fn start_on_running_process_is_silent() {
    let launcher = FakeLauncher::new();
    let process = process_with(&launcher, config());
    process.start().await.unwrap();

    let mut rx = subscribe(&process);
    process.start().await.unwrap();
    assert_eq!(process.start_count(), 1);
    let events = collect_until(&mut rx, ProcessEvent::Started, Duration::from_millis(100)).await;
    assert!(events.is_empty(), "no events expected, got {events:?}");
}

#[tokio::test]
async fn start_while_starting_is_a_logic_error() {
    let launcher = FakeLauncher::new();
    let process = process_with(&launcher, config());

    launcher.pause_probes();
    let starter = {
        let process = process.clone();
        tokio::spawn(async move { process.start().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(process.status().await, ProcessStatus::Starting);

    let err = process.start().await.unwrap_err();
    assert!(matches!(err, BrowserError::Logic(_)));

    launcher.release_probes();
    starter.await.unwrap().unwrap();
    assert_eq!(process.status().await, ProcessStatus::Running);
}

#[tokio::test]
async fn spawn_failure_faults_and_settles_in_stopped() {
    let launcher = FakeLauncher::new();
    launcher.fail_next_spawn(PORT, "no such binary");
    let process = process_with(&launcher, config());
    let mut rx = subscribe(&process);

    let err = process.start().await.unwrap_err();
    assert!(matches!(err, BrowserError::Spawn(_)));

    let events = collect_until(&mut rx, ProcessEvent::Stopped, Duration::from_secs(2)).await;
    assert_eq!(
        events,
        vec![
            ProcessEvent::Starting,
            ProcessEvent::Faulted,
            ProcessEvent::Stopping,
            ProcessEvent::Stopped,
        ]
    );
    assert_eq!(process.status().await, ProcessStatus::Stopped);
    assert_eq!(process.stop_reason().await, Some(StopReason::Faulted));
    assert!(process.client().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn probe_retries_across_the_delay_ladder() {
    let launcher = FakeLauncher::new();
    launcher.fail_next_probes(PORT, 3, "connection refused");
    let process = process_with(&launcher, config());

    process.start().await.unwrap();
    assert_eq!(process.status().await, ProcessStatus::Running);
}

#[tokio::test(start_paused = true)]
async fn probe_exhaustion_propagates_the_final_error() {
    let launcher = FakeLauncher::new();
    launcher.fail_probes_forever(PORT, "connection refused");
    let process = process_with(&launcher, config());
    let mut rx = subscribe(&process);

    let err = process.start().await.unwrap_err();
    assert!(matches!(err, BrowserError::Endpoint(_)));

    let events = collect_until(&mut rx, ProcessEvent::Stopped, Duration::from_secs(30)).await;
    assert_eq!(events.last(), Some(&ProcessEvent::Stopped));
    assert_eq!(process.status().await, ProcessStatus::Stopped);
}

#[tokio::test(start_paused = true)]
async fn running_fault_auto_restarts_after_delay() {
    let launcher = FakeLauncher::new();
    let mut cfg = config();
    cfg.auto_restart_delay_ms = Some(50);
    let process = process_with(&launcher, cfg);
    process.start().await.unwrap();
    let mut rx = subscribe(&process);

    launcher.latest_child(PORT).unwrap().terminate();

    let events = collect_until(&mut rx, ProcessEvent::Started, Duration::from_secs(30)).await;
    assert_eq!(
        events,
        vec![
            ProcessEvent::Faulted,
            ProcessEvent::Stopping,
            ProcessEvent::Stopped,
            ProcessEvent::Starting,
            ProcessEvent::Started,
        ]
    );
    assert_eq!(process.status().await, ProcessStatus::Running);
    assert_eq!(process.start_count(), 2);
}

#[tokio::test]
async fn disconnect_faults_a_running_process() {
    let launcher = FakeLauncher::new();
    let process = process_with(&launcher, config());
    process.start().await.unwrap();
    let mut rx = subscribe(&process);

    launcher.latest_client(PORT).unwrap().drop_connection();

    let events = collect_until(&mut rx, ProcessEvent::Stopped, Duration::from_secs(2)).await;
    assert_eq!(
        events,
        vec![
            ProcessEvent::Faulted,
            ProcessEvent::Stopping,
            ProcessEvent::Stopped,
        ]
    );
    assert_eq!(process.stop_reason().await, Some(StopReason::Faulted));
}

#[tokio::test]
async fn stop_supersedes_an_inflight_start() {
    let launcher = FakeLauncher::new();
    let process = process_with(&launcher, config());
    let mut rx = subscribe(&process);

    launcher.pause_probes();
    let starter = {
        let process = process.clone();
        tokio::spawn(async move { process.start().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    process.stop().await;
    launcher.release_probes();
    starter.await.unwrap().unwrap();

    // Give the superseded continuation a chance to (incorrectly) finish.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let events = collect_until(&mut rx, ProcessEvent::Stopped, Duration::from_secs(2)).await;
    assert!(
        !events.contains(&ProcessEvent::Started),
        "superseded start must not complete: {events:?}"
    );
    assert_eq!(process.status().await, ProcessStatus::Stopped);
    assert_eq!(process.stop_reason().await, Some(StopReason::Requested));
}

#[tokio::test]
async fn concurrent_stops_share_one_teardown() {
    let launcher = FakeLauncher::new();
    let process = process_with(&launcher, config());
    process.start().await.unwrap();
    let mut rx = subscribe(&process);

    let a = {
        let process = process.clone();
        tokio::spawn(async move { process.stop().await })
    };
    let b = {
        let process = process.clone();
        tokio::spawn(async move { process.stop().await })
    };
    a.await.unwrap();
    b.await.unwrap();

    let events = collect_until(&mut rx, ProcessEvent::Stopped, Duration::from_secs(2)).await;
    let stops = events
        .iter()
        .filter(|event| **event == ProcessEvent::Stopped)
        .count();
    assert_eq!(stops, 1);
    assert_eq!(
        launcher.latest_child(PORT).unwrap().interrupt_count(),
        1,
        "exactly one teardown must touch the child"
    );
}

#[tokio::test(start_paused = true)]
async fn ignored_interrupt_escalates_to_kill() {
    let launcher = FakeLauncher::new();
    launcher.set_die_on_interrupt(false);
    let mut cfg = config();
    cfg.graceful_exit_wait_ms = 100;
    let process = process_with(&launcher, cfg);
    process.start().await.unwrap();

    process.stop().await;

    let child = launcher.latest_child(PORT).unwrap();
    assert_eq!(child.interrupt_count(), 1);
    assert_eq!(child.kill_count(), 1);
    assert!(child.has_exited());
    assert_eq!(process.status().await, ProcessStatus::Stopped);
}
