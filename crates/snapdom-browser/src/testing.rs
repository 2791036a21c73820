//! Scriptable launcher and child used to exercise the lifecycle machinery
//! without a browser binary.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use cdp_client::testing::FakeCdp;
use cdp_client::SharedCdp;
use tokio::sync::watch;

use crate::error::{BrowserError, Result};
use crate::launcher::{BrowserChild, BrowserInfo, BrowserLauncher, LaunchSpec};

/// Child whose death is fully under test control.
pub struct FakeChild {
    pid: u32,
    exited_tx: watch::Sender<bool>,
    interrupts: AtomicUsize,
    kills: AtomicUsize,
    die_on_interrupt: AtomicBool,
}

impl FakeChild {
    fn new(pid: u32, die_on_interrupt: bool) -> Self {
        let (exited_tx, _) = watch::channel(false);
        Self {
            pid,
            exited_tx,
            interrupts: AtomicUsize::new(0),
            kills: AtomicUsize::new(0),
            die_on_interrupt: AtomicBool::new(die_on_interrupt),
        }
    }

    /// Simulate a crash.
    pub fn terminate(&self) {
        let _ = self.exited_tx.send(true);
    }

    pub fn interrupt_count(&self) -> usize {
        self.interrupts.load(Ordering::SeqCst)
    }

    pub fn kill_count(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub fn set_die_on_interrupt(&self, die: bool) {
        self.die_on_interrupt.store(die, Ordering::SeqCst);
    }

    pub fn has_exited(&self) -> bool {
        *self.exited_tx.subscribe().borrow()
    }
}

#[async_trait]
impl BrowserChild for FakeChild {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn wait_exit(&self) {
        let mut rx = self.exited_tx.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    async fn interrupt(&self) {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
        if self.die_on_interrupt.load(Ordering::SeqCst) {
            let _ = self.exited_tx.send(true);
        }
    }

    async fn force_kill(&self) {
        self.kills.fetch_add(1, Ordering::SeqCst);
        let _ = self.exited_tx.send(true);
    }

    async fn is_alive(&self) -> bool {
        !*self.exited_tx.subscribe().borrow()
    }
}

#[derive(Default)]
struct PortPlan {
    spawn_failures: VecDeque<String>,
    probe_failures: VecDeque<String>,
    probe_fail_forever: Option<String>,
}

struct FakeLauncherInner {
    plans: StdMutex<HashMap<u16, PortPlan>>,
    children: StdMutex<Vec<(u16, Arc<FakeChild>)>>,
    clients: StdMutex<Vec<(u16, FakeCdp)>>,
    next_pid: AtomicU32,
    die_on_interrupt: AtomicBool,
    probe_paused: watch::Sender<bool>,
}

/// Launcher whose spawn/probe/connect behavior is scripted per debug port.
#[derive(Clone)]
pub struct FakeLauncher {
    inner: Arc<FakeLauncherInner>,
}

impl Default for FakeLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeLauncher {
    pub fn new() -> Self {
        let (probe_paused, _) = watch::channel(false);
        Self {
            inner: Arc::new(FakeLauncherInner {
                plans: StdMutex::new(HashMap::new()),
                children: StdMutex::new(Vec::new()),
                clients: StdMutex::new(Vec::new()),
                next_pid: AtomicU32::new(4000),
                die_on_interrupt: AtomicBool::new(true),
                probe_paused,
            }),
        }
    }

    pub fn fail_next_spawn(&self, port: u16, message: &str) {
        self.inner
            .plans
            .lock()
            .unwrap()
            .entry(port)
            .or_default()
            .spawn_failures
            .push_back(message.to_string());
    }

    pub fn fail_next_probes(&self, port: u16, count: usize, message: &str) {
        let mut plans = self.inner.plans.lock().unwrap();
        let plan = plans.entry(port).or_default();
        for _ in 0..count {
            plan.probe_failures.push_back(message.to_string());
        }
    }

    pub fn fail_probes_forever(&self, port: u16, message: &str) {
        self.inner
            .plans
            .lock()
            .unwrap()
            .entry(port)
            .or_default()
            .probe_fail_forever = Some(message.to_string());
    }

    /// Block probes until [`FakeLauncher::release_probes`]; lets tests hold
    /// a process in Starting.
    pub fn pause_probes(&self) {
        let _ = self.inner.probe_paused.send(true);
    }

    pub fn release_probes(&self) {
        let _ = self.inner.probe_paused.send(false);
    }

    pub fn set_die_on_interrupt(&self, die: bool) {
        self.inner.die_on_interrupt.store(die, Ordering::SeqCst);
    }

    pub fn spawn_count(&self) -> usize {
        self.inner.children.lock().unwrap().len()
    }

    pub fn latest_child(&self, port: u16) -> Option<Arc<FakeChild>> {
        self.inner
            .children
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(p, _)| *p == port)
            .map(|(_, child)| Arc::clone(child))
    }

    pub fn latest_client(&self, port: u16) -> Option<FakeCdp> {
        self.inner
            .clients
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(p, _)| *p == port)
            .map(|(_, client)| client.clone())
    }

    fn port_of(version_url: &str) -> u16 {
        version_url
            .rsplit_once(':')
            .and_then(|(_, rest)| rest.split('/').next())
            .and_then(|port| port.parse().ok())
            .unwrap_or(0)
    }
}

#[async_trait]
impl BrowserLauncher for FakeLauncher {
    async fn spawn(&self, spec: &LaunchSpec) -> Result<Arc<dyn BrowserChild>> {
        if let Some(message) = self
            .inner
            .plans
            .lock()
            .unwrap()
            .entry(spec.debug_port)
            .or_default()
            .spawn_failures
            .pop_front()
        {
            return Err(BrowserError::Spawn(message));
        }
        let pid = self.inner.next_pid.fetch_add(1, Ordering::SeqCst);
        let child = Arc::new(FakeChild::new(
            pid,
            self.inner.die_on_interrupt.load(Ordering::SeqCst),
        ));
        self.inner
            .children
            .lock()
            .unwrap()
            .push((spec.debug_port, Arc::clone(&child)));
        Ok(child)
    }

    async fn probe_version(&self, version_url: &str) -> Result<BrowserInfo> {
        {
            let mut paused = self.inner.probe_paused.subscribe();
            while *paused.borrow() {
                if paused.changed().await.is_err() {
                    break;
                }
            }
        }
        let port = Self::port_of(version_url);
        {
            let mut plans = self.inner.plans.lock().unwrap();
            let plan = plans.entry(port).or_default();
            if let Some(message) = plan.probe_failures.pop_front() {
                return Err(BrowserError::Endpoint(message));
            }
            if let Some(message) = &plan.probe_fail_forever {
                return Err(BrowserError::Endpoint(message.clone()));
            }
        }
        Ok(BrowserInfo {
            user_agent: "FakeChrome-UA".to_string(),
            ws_url: format!("ws://127.0.0.1:{port}/devtools/browser/fake"),
            version: "FakeChrome/1.0".to_string(),
        })
    }

    async fn connect(&self, ws_url: &str) -> Result<SharedCdp> {
        let port = Self::port_of(ws_url);
        let client = FakeCdp::new();
        self.inner
            .clients
            .lock()
            .unwrap()
            .push((port, client.clone()));
        Ok(Arc::new(client))
    }
}
