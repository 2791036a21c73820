//! Lifecycle state machine for one headless browser OS process.
//!
//! ```text
//!  Initial ──start──► Starting ──ok──► Running
//!                      │                │
//!                      │fail            │fault
//!                      ▼                ▼
//!                    Faulted ──stop──► Stopping ──► Stopped ──start──► ...
//! ```
//!
//! Every start records the version it belongs to; each async step re-reads
//! the counter and aborts silently when a stop or a later start has
//! superseded it. That keeps stop-then-start inside an event listener from
//! letting an obsolete start finish.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cdp_client::{CloseReason, SharedCdp};
use event_bus::EventBus;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{BrowserError, Result};
use crate::events::ProcessEvent;
use crate::launcher::{BrowserChild, BrowserInfo, BrowserLauncher, LaunchSpec};
use crate::single_flight::SingleFlight;

/// Delays between successive probes of the DevTools version endpoint.
const START_PROBE_DELAYS_MS: [u64; 6] = [100, 200, 500, 1000, 2000, 5000];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessStatus {
    Initial,
    Starting,
    Running,
    Stopping,
    Stopped,
    Faulted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    Requested,
    Faulted,
}

#[derive(Clone, Copy, Debug)]
enum StartKind {
    Requested,
    AutoRestart,
}

#[derive(Clone, Debug)]
pub struct ProcessConfig {
    pub binary: PathBuf,
    pub debug_port: u16,
    /// Replaces the default browser flags wholesale when present.
    pub args_override: Option<Vec<String>>,
    pub extra_args: Vec<String>,
    /// Delay before retrying a start that failed during startup.
    pub startup_retry_delay_ms: Option<u64>,
    /// Delay before restarting after a running-time fault.
    pub auto_restart_delay_ms: Option<u64>,
    /// How long a polite interrupt may take before the hard kill.
    pub graceful_exit_wait_ms: u64,
}

impl ProcessConfig {
    pub fn new(binary: PathBuf, debug_port: u16) -> Self {
        Self {
            binary,
            debug_port,
            args_override: None,
            extra_args: Vec::new(),
            startup_retry_delay_ms: None,
            auto_restart_delay_ms: None,
            graceful_exit_wait_ms: 5_000,
        }
    }
}

struct ProcessInner {
    cfg: ProcessConfig,
    launcher: Arc<dyn BrowserLauncher>,
    state: Mutex<MutableState>,
    events: Arc<EventBus<ProcessEvent>>,
    version: AtomicU64,
    start_count: AtomicU64,
    stop_flight: SingleFlight<()>,
}

struct MutableState {
    status: ProcessStatus,
    stop_reason: Option<StopReason>,
    child: Option<Arc<dyn BrowserChild>>,
    client: Option<SharedCdp>,
    info: Option<BrowserInfo>,
}

/// Handle to the state machine; cheap to clone, all clones share state.
#[derive(Clone)]
pub struct BrowserProcess {
    inner: Arc<ProcessInner>,
}

impl BrowserProcess {
    pub fn new(cfg: ProcessConfig, launcher: Arc<dyn BrowserLauncher>) -> Self {
        Self {
            inner: Arc::new(ProcessInner {
                cfg,
                launcher,
                state: Mutex::new(MutableState {
                    status: ProcessStatus::Initial,
                    stop_reason: None,
                    child: None,
                    client: None,
                    info: None,
                }),
                events: EventBus::new(64),
                version: AtomicU64::new(0),
                start_count: AtomicU64::new(0),
                stop_flight: SingleFlight::new(),
            }),
        }
    }

    pub fn events(&self) -> &Arc<EventBus<ProcessEvent>> {
        &self.inner.events
    }

    pub fn debug_port(&self) -> u16 {
        self.inner.cfg.debug_port
    }

    pub async fn status(&self) -> ProcessStatus {
        self.inner.state.lock().await.status
    }

    pub async fn stop_reason(&self) -> Option<StopReason> {
        self.inner.state.lock().await.stop_reason
    }

    /// The CDP client; `Some` exactly while Running.
    pub async fn client(&self) -> Option<SharedCdp> {
        self.inner.state.lock().await.client.clone()
    }

    pub async fn info(&self) -> Option<BrowserInfo> {
        self.inner.state.lock().await.info.clone()
    }

    pub async fn pid(&self) -> Option<u32> {
        self.inner
            .state
            .lock()
            .await
            .child
            .as_ref()
            .map(|child| child.pid())
    }

    pub fn start_count(&self) -> u64 {
        self.inner.start_count.load(Ordering::SeqCst)
    }

    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::SeqCst)
    }

    pub async fn start(&self) -> Result<()> {
        self.start_inner(StartKind::Requested).await
    }

    pub async fn stop(&self) {
        self.stop_with_reason(StopReason::Requested).await;
    }

    async fn start_inner(&self, kind: StartKind) -> Result<()> {
        let my_version;
        {
            let mut state = self.inner.state.lock().await;
            match state.status {
                ProcessStatus::Running => return Ok(()),
                ProcessStatus::Initial | ProcessStatus::Stopped => {}
                other => {
                    return Err(BrowserError::logic(format!(
                        "cannot start browser process from {other:?}"
                    )))
                }
            }
            state.status = ProcessStatus::Starting;
            state.stop_reason = None;
            my_version = self.inner.version.fetch_add(1, Ordering::SeqCst) + 1;
            self.inner.start_count.fetch_add(1, Ordering::SeqCst);
        }
        debug!(
            target: "browser-process",
            port = self.inner.cfg.debug_port,
            ?kind,
            start_count = self.start_count(),
            "starting browser process"
        );
        self.inner.events.emit(ProcessEvent::Starting);

        match self.run_start(my_version).await {
            Ok(_completed) => Ok(()),
            Err(err) => {
                warn!(
                    target: "browser-process",
                    port = self.inner.cfg.debug_port,
                    %err,
                    "browser start failed"
                );
                self.fault().await;
                Err(err)
            }
        }
    }

    fn launch_spec(&self) -> LaunchSpec {
        LaunchSpec {
            binary: self.inner.cfg.binary.clone(),
            debug_port: self.inner.cfg.debug_port,
            args_override: self.inner.cfg.args_override.clone(),
            extra_args: self.inner.cfg.extra_args.clone(),
        }
    }

    /// Returns `Ok(false)` when the start was superseded and aborted
    /// silently; errors propagate for the fault path.
    fn run_start(
        &self,
        my_version: u64,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<bool>> + Send + '_>> {
        Box::pin(self.run_start_inner(my_version))
    }

    async fn run_start_inner(&self, my_version: u64) -> Result<bool> {
        let spec = self.launch_spec();
        let child = self.inner.launcher.spawn(&spec).await?;

        {
            let mut state = self.inner.state.lock().await;
            if self.version() != my_version {
                drop(state);
                child.force_kill().await;
                return Ok(false);
            }
            state.child = Some(Arc::clone(&child));
        }

        // One-shot exit watcher: an exit that is not superseded is a fault.
        {
            let this = self.clone();
            let watched = Arc::clone(&child);
            tokio::spawn(async move {
                watched.wait_exit().await;
                if this.version() == my_version {
                    debug!(
                        target: "browser-process",
                        port = this.inner.cfg.debug_port,
                        "browser process exited unexpectedly"
                    );
                    this.fault().await;
                }
            });
        }

        let version_url = spec.version_url();
        let mut attempt = 0;
        let info = loop {
            if self.version() != my_version {
                return Ok(false);
            }
            match self.inner.launcher.probe_version(&version_url).await {
                Ok(found) => break found,
                // The last attempt propagates; everything before it backs
                // off along the delay ladder.
                Err(err) if attempt == START_PROBE_DELAYS_MS.len() => return Err(err),
                Err(err) => {
                    debug!(
                        target: "browser-process",
                        port = self.inner.cfg.debug_port,
                        attempt,
                        %err,
                        "devtools endpoint not ready"
                    );
                    tokio::time::sleep(Duration::from_millis(START_PROBE_DELAYS_MS[attempt]))
                        .await;
                    attempt += 1;
                }
            }
        };

        if self.version() != my_version {
            return Ok(false);
        }
        let client = self.inner.launcher.connect(&info.ws_url).await?;

        // Unexpected socket loss while this start is current is a fault; a
        // requested close comes from our own stop path.
        {
            let this = self.clone();
            let signal = client.close_signal();
            tokio::spawn(async move {
                if signal.wait().await == CloseReason::ConnectionLost
                    && this.version() == my_version
                {
                    this.fault().await;
                }
            });
        }

        {
            let mut state = self.inner.state.lock().await;
            if self.version() != my_version {
                drop(state);
                client.close().await;
                return Ok(false);
            }
            state.client = Some(client);
            state.info = Some(info);
            state.status = ProcessStatus::Running;
        }
        self.inner.events.emit(ProcessEvent::Started);
        Ok(true)
    }

    /// Fault entry point for the exit watcher, the disconnect watcher and
    /// failed starts. No-op unless the process is Starting or Running.
    fn fault(&self) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(self.fault_inner())
    }

    async fn fault_inner(&self) {
        let was_starting;
        {
            let mut state = self.inner.state.lock().await;
            match state.status {
                ProcessStatus::Starting => was_starting = true,
                ProcessStatus::Running => was_starting = false,
                _ => return,
            }
            state.status = ProcessStatus::Faulted;
        }
        self.inner.events.emit(ProcessEvent::Faulted);
        self.stop_with_reason(StopReason::Faulted).await;

        let delay_ms = if was_starting {
            self.inner.cfg.startup_retry_delay_ms
        } else {
            self.inner.cfg.auto_restart_delay_ms
        };
        let Some(delay_ms) = delay_ms else { return };

        // A listener may have driven the machine elsewhere during the stop;
        // the version captured here invalidates the restart if so.
        let restart_version = self.version();
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            if this.version() != restart_version {
                return;
            }
            if this.status().await != ProcessStatus::Stopped {
                return;
            }
            if let Err(err) = this.start_inner(StartKind::AutoRestart).await {
                warn!(
                    target: "browser-process",
                    port = this.inner.cfg.debug_port,
                    %err,
                    "auto-restart failed"
                );
            }
        });
    }

    async fn stop_with_reason(&self, reason: StopReason) {
        self.inner
            .stop_flight
            .run(async { self.stop_body(reason).await })
            .await;
    }

    async fn stop_body(&self, reason: StopReason) {
        let (child, client);
        {
            let mut state = self.inner.state.lock().await;
            if state.status == ProcessStatus::Stopped {
                return;
            }
            state.status = ProcessStatus::Stopping;
            state.stop_reason = Some(reason);
            child = state.child.take();
            client = state.client.take();
            state.info = None;
            self.inner.version.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.events.emit(ProcessEvent::Stopping);

        if let Some(client) = client {
            client.close().await;
        }

        if let Some(child) = child {
            child.interrupt().await;
            let graceful = Duration::from_millis(self.inner.cfg.graceful_exit_wait_ms);
            let exited = tokio::time::timeout(graceful, child.wait_exit())
                .await
                .is_ok();
            if !exited {
                debug!(
                    target: "browser-process",
                    pid = child.pid(),
                    "interrupt ignored, killing"
                );
                child.force_kill().await;
            }
            while child.is_alive().await {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }

        {
            let mut state = self.inner.state.lock().await;
            state.status = ProcessStatus::Stopped;
        }
        self.inner.events.emit(ProcessEvent::Stopped);
    }
}
