//! Supervised provider: a main/standby browser pair.
//!
//! Only the Main serves handles. A fault on the Main promotes the Standby
//! (takeover); a periodic recycle swaps the pair proactively, drains the
//! demoted instance's open handles, then restarts it. Both paths keep
//! in-flight renders alive: their handles point at the demoted browser's
//! client, which stays up until the drain finishes or times out.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use event_bus::EventBus;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{BrowserError, Result};
use crate::events::{InstanceEvent, ProcessEvent, ProviderEvent, RecycleResult, TakeoverReason};
use crate::handle::BrowserHandle;
use crate::instance::{BrowserInstance, Role};
use crate::launcher::BrowserLauncher;
use crate::process::{BrowserProcess, ProcessConfig, ProcessStatus};
use crate::provider::{BrowserProvider, ProviderStatus};
use crate::single_flight::SingleFlight;

#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    pub binary: PathBuf,
    pub main_port: u16,
    pub standby_port: u16,
    pub args_override: Option<Vec<String>>,
    pub extra_args: Vec<String>,
    pub startup_retry_delay_ms: Option<u64>,
    pub auto_restart_delay_ms: Option<u64>,
    pub graceful_exit_wait_ms: u64,
    pub auto_recycle: bool,
    /// Main uptime budget before a precautionary recycle.
    pub auto_recycle_after_uptime_ms: u64,
    /// Retry interval after a recycle found no standby.
    pub auto_recycle_retry_after_ms: u64,
    /// How long a recycle waits for open handles before abandoning them.
    pub recycle_drain_ms: u64,
}

impl SupervisorConfig {
    pub fn new(binary: PathBuf, main_port: u16, standby_port: u16) -> Self {
        Self {
            binary,
            main_port,
            standby_port,
            args_override: None,
            extra_args: Vec::new(),
            startup_retry_delay_ms: Some(1_000),
            auto_restart_delay_ms: Some(1_000),
            graceful_exit_wait_ms: 5_000,
            auto_recycle: true,
            auto_recycle_after_uptime_ms: 3_600_000,
            auto_recycle_retry_after_ms: 60_000,
            recycle_drain_ms: 10_000,
        }
    }

    fn process_config(&self, port: u16) -> ProcessConfig {
        ProcessConfig {
            binary: self.binary.clone(),
            debug_port: port,
            args_override: self.args_override.clone(),
            extra_args: self.extra_args.clone(),
            startup_retry_delay_ms: self.startup_retry_delay_ms,
            auto_restart_delay_ms: self.auto_restart_delay_ms,
            graceful_exit_wait_ms: self.graceful_exit_wait_ms,
        }
    }
}

struct SupervisorInner {
    cfg: SupervisorConfig,
    status: Mutex<ProviderStatus>,
    /// Index 0 is always the Main, index 1 the Standby.
    pair: Mutex<Vec<BrowserInstance>>,
    events: Arc<EventBus<ProviderEvent>>,
    recycle_flight: SingleFlight<RecycleResult>,
    close_flight: SingleFlight<()>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    recycle_timer: StdMutex<Option<JoinHandle<()>>>,
    /// True until the first MainOnline; guards against premature takeover
    /// while the initial Main is still coming up.
    initial_startup: AtomicBool,
}

#[derive(Clone)]
pub struct SupervisedProvider {
    inner: Arc<SupervisorInner>,
}

impl SupervisedProvider {
    pub fn new(cfg: SupervisorConfig, launcher: Arc<dyn BrowserLauncher>) -> Self {
        let main = BrowserInstance::new(
            BrowserProcess::new(cfg.process_config(cfg.main_port), Arc::clone(&launcher)),
            Role::Main,
        );
        let standby = BrowserInstance::new(
            BrowserProcess::new(cfg.process_config(cfg.standby_port), launcher),
            Role::Standby,
        );
        Self {
            inner: Arc::new(SupervisorInner {
                cfg,
                status: Mutex::new(ProviderStatus::Initial),
                pair: Mutex::new(vec![main, standby]),
                events: EventBus::new(64),
                recycle_flight: SingleFlight::new(),
                close_flight: SingleFlight::new(),
                tasks: StdMutex::new(Vec::new()),
                recycle_timer: StdMutex::new(None),
                initial_startup: AtomicBool::new(true),
            }),
        }
    }

    pub fn events(&self) -> &Arc<EventBus<ProviderEvent>> {
        &self.inner.events
    }

    pub async fn main_instance(&self) -> BrowserInstance {
        self.inner.pair.lock().await[0].clone()
    }

    pub async fn standby_instance(&self) -> BrowserInstance {
        self.inner.pair.lock().await[1].clone()
    }

    /// Orderly swap-and-restart of the Main. Single-flight: concurrent
    /// callers share one run and one `Recycle` event.
    pub async fn recycle_main(&self) -> Result<RecycleResult> {
        if self.provider_status().await != ProviderStatus::Running {
            return Err(BrowserError::logic("cannot recycle: provider is not running"));
        }
        let (result, first) = self
            .inner
            .recycle_flight
            .run(self.recycle_body())
            .await;
        if first {
            info!(target: "supervisor", ?result, "recycle finished");
            self.inner.events.emit(ProviderEvent::Recycle { result });
        }
        Ok(result)
    }

    async fn provider_status(&self) -> ProviderStatus {
        *self.inner.status.lock().await
    }

    /// Swap standby into the main slot. Validates the swap is still
    /// meaningful under the pair lock, so racing fault/recycle paths
    /// cannot double-swap. Returns `(demoted, promoted)` on success.
    async fn promote(
        &self,
        reason: TakeoverReason,
    ) -> Option<(BrowserInstance, BrowserInstance)> {
        let (demoted, promoted) = {
            let mut pair = self.inner.pair.lock().await;
            let standby_running =
                pair[1].process().status().await == ProcessStatus::Running;
            if !standby_running {
                return None;
            }
            if reason == TakeoverReason::Fault
                && pair[0].process().status().await == ProcessStatus::Running
            {
                // Somebody else already restored a running Main.
                return None;
            }
            pair.swap(0, 1);
            (pair[1].clone(), pair[0].clone())
        };
        promoted.set_role(Role::Main).await;
        demoted.set_role(Role::Standby).await;
        info!(target: "supervisor", ?reason, "standby took over as main");
        self.inner.events.emit(ProviderEvent::Takeover { reason });
        Some((demoted, promoted))
    }

    /// Fault-path promotion check, run on every process start/fault edge.
    async fn consider_standby_promotion(&self) {
        if self.provider_status().await != ProviderStatus::Running {
            return;
        }
        let (main, standby) = {
            let pair = self.inner.pair.lock().await;
            (pair[0].clone(), pair[1].clone())
        };
        if main.process().status().await == ProcessStatus::Running {
            return;
        }
        if standby.process().status().await != ProcessStatus::Running {
            return;
        }
        if self.inner.initial_startup.load(Ordering::SeqCst)
            && main.process().start_count() <= 1
        {
            // The initial Main gets a chance to come up before we steal
            // its role.
            return;
        }
        self.promote(TakeoverReason::Fault).await;
    }

    async fn recycle_body(&self) -> RecycleResult {
        let standby = self.standby_instance().await;
        if standby.process().status().await != ProcessStatus::Running {
            return RecycleResult::StandbyUnavailable;
        }

        let Some((demoted, _promoted)) = self.promote(TakeoverReason::Recycle).await else {
            return RecycleResult::StandbyUnavailable;
        };

        // Drain: wait for open handles to finish, bounded by the drain
        // budget. Subscribe before reading the count so the idle edge
        // cannot slip through the gap.
        let mut idle_rx = demoted.events().subscribe();
        if demoted.handle_count().await > 0 {
            let drain = Duration::from_millis(self.inner.cfg.recycle_drain_ms);
            tokio::select! {
                _ = event_bus::wait_for(&mut idle_rx, |ev| *ev == InstanceEvent::Idle) => {}
                _ = tokio::time::sleep(drain) => {
                    debug!(target: "supervisor", "drain budget exhausted, abandoning handles");
                }
            }
        }

        // The world may have moved during the drain.
        if self.provider_status().await != ProviderStatus::Running {
            return RecycleResult::Canceled;
        }
        if demoted.role().await != Role::Standby {
            // A fault on the new Main promoted the demoted instance back.
            return RecycleResult::StandbyUnavailable;
        }
        if demoted.process().status().await != ProcessStatus::Running {
            return RecycleResult::Canceled;
        }

        demoted.shutdown().await;
        if self.provider_status().await != ProviderStatus::Running {
            return RecycleResult::Canceled;
        }
        if let Err(err) = demoted.process().start().await {
            warn!(target: "supervisor", %err, "restart of recycled standby failed");
        }
        RecycleResult::Recycled
    }

    /// (Re)arm the uptime-driven recycle loop.
    fn schedule_recycle(&self) {
        if !self.inner.cfg.auto_recycle {
            return;
        }
        let this = self.clone();
        let task = tokio::spawn(async move {
            loop {
                if this.provider_status().await != ProviderStatus::Running {
                    return;
                }
                let main = this.main_instance().await;
                let uptime = main.main_uptime_millis().await;
                let delay = this
                    .inner
                    .cfg
                    .auto_recycle_after_uptime_ms
                    .saturating_sub(uptime);
                tokio::time::sleep(Duration::from_millis(delay)).await;
                if this.provider_status().await != ProviderStatus::Running {
                    return;
                }
                match this.recycle_main().await {
                    Ok(RecycleResult::StandbyUnavailable) => {
                        tokio::time::sleep(Duration::from_millis(
                            this.inner.cfg.auto_recycle_retry_after_ms,
                        ))
                        .await;
                    }
                    Ok(_) => {}
                    Err(_) => return,
                }
            }
        });
        let mut timer = self.inner.recycle_timer.lock().unwrap();
        if let Some(old) = timer.replace(task) {
            old.abort();
        }
    }

    fn watch_instance(&self, instance: &BrowserInstance) {
        let mut tasks = self.inner.tasks.lock().unwrap();

        // Main availability drives the recycle schedule and ends the
        // initial-startup grace period.
        {
            let this = self.clone();
            let mut rx = instance.events().subscribe();
            tasks.push(tokio::spawn(async move {
                while event_bus::wait_for(&mut rx, |ev| *ev == InstanceEvent::MainOnline)
                    .await
                    .is_some()
                {
                    this.inner.initial_startup.store(false, Ordering::SeqCst);
                    this.schedule_recycle();
                }
            }));
        }

        // Start/fault edges of either process can change who should serve.
        {
            let this = self.clone();
            let mut rx = instance.process().events().subscribe();
            tasks.push(tokio::spawn(async move {
                while event_bus::wait_for(&mut rx, |ev| {
                    matches!(ev, ProcessEvent::Started | ProcessEvent::Faulted)
                })
                .await
                .is_some()
                {
                    this.consider_standby_promotion().await;
                }
            }));
        }
    }
}

#[async_trait]
impl BrowserProvider for SupervisedProvider {
    async fn start(&self) -> Result<()> {
        {
            let mut status = self.inner.status.lock().await;
            if *status != ProviderStatus::Initial {
                return Err(BrowserError::logic("supervisor already started"));
            }
            *status = ProviderStatus::Starting;
        }

        let (main, standby) = {
            let pair = self.inner.pair.lock().await;
            (pair[0].clone(), pair[1].clone())
        };

        // Subscribe before the first start so no availability edge of the
        // startup itself can be missed.
        self.watch_instance(&main);
        self.watch_instance(&standby);

        let (main_started, standby_started) =
            tokio::join!(main.process().start(), standby.process().start());
        if let Err(err) = main_started {
            warn!(target: "supervisor", %err, "main browser failed to start");
        }
        if let Err(err) = standby_started {
            warn!(target: "supervisor", %err, "standby browser failed to start");
        }

        *self.inner.status.lock().await = ProviderStatus::Running;
        self.schedule_recycle();
        Ok(())
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
                    let mut tasks = self.inner.tasks.lock().unwrap();
                    for task in tasks.drain(..) {
                        task.abort();
                    }
                }
                {
                    let mut timer = self.inner.recycle_timer.lock().unwrap();
                    if let Some(task) = timer.take() {
                        task.abort();
                    }
                }
                let (main, standby) = {
                    let pair = self.inner.pair.lock().await;
                    (pair[0].clone(), pair[1].clone())
                };
                tokio::join!(main.shutdown(), standby.shutdown());
                main.detach();
                standby.detach();
                *self.inner.status.lock().await = ProviderStatus::Closed;
            })
            .await;
    }

    async fn create_handle(&self) -> Result<Option<BrowserHandle>> {
        if self.provider_status().await != ProviderStatus::Running {
            return Err(BrowserError::logic("provider is not running"));
        }
        let main = self.main_instance().await;
        let Some(client) = main.process().client().await else {
            return Ok(None);
        };
        let Some(info) = main.process().info().await else {
            return Ok(None);
        };
        let handle = BrowserHandle::new(client, info);
        main.add_handle(handle.clone()).await;
        Ok(Some(handle))
    }

    async fn status(&self) -> ProviderStatus {
        self.provider_status().await
    }
}
