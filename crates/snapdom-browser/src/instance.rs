//! A supervised browser instance: a process plus its role in the pair.
//!
//! The instance re-evaluates the main-uptime stopwatch whenever its role or
//! its process status changes, fires `MainOnline`/`MainOffline` edges, and
//! accounts open handles so the supervisor can drain before recycling.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use event_bus::EventBus;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::events::{InstanceEvent, ProcessEvent};
use crate::handle::BrowserHandle;
use crate::process::{BrowserProcess, ProcessStatus};
use crate::stopwatch::Stopwatch;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Main,
    Standby,
}

struct InstanceState {
    role: Role,
    handles: HashMap<Uuid, BrowserHandle>,
    stopwatch: Stopwatch,
    main_online: bool,
}

struct InstanceInner {
    process: BrowserProcess,
    state: Mutex<InstanceState>,
    events: Arc<EventBus<InstanceEvent>>,
    monitor: StdMutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct BrowserInstance {
    inner: Arc<InstanceInner>,
}

impl BrowserInstance {
    pub fn new(process: BrowserProcess, role: Role) -> Self {
        let instance = Self {
            inner: Arc::new(InstanceInner {
                process,
                state: Mutex::new(InstanceState {
                    role,
                    handles: HashMap::new(),
                    stopwatch: Stopwatch::new(),
                    main_online: false,
                }),
                events: EventBus::new(64),
                monitor: StdMutex::new(None),
            }),
        };

        let this = instance.clone();
        let mut rx = instance.inner.process.events().subscribe();
        let monitor = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        match event {
                            ProcessEvent::Started => {
                                this.inner.events.emit(InstanceEvent::Started);
                            }
                            ProcessEvent::Stopped => {
                                this.inner.events.emit(InstanceEvent::Stopped);
                            }
                            _ => {}
                        }
                        this.refresh().await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                        this.refresh().await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *instance.inner.monitor.lock().unwrap() = Some(monitor);

        instance
    }

    pub fn process(&self) -> &BrowserProcess {
        &self.inner.process
    }

    pub fn events(&self) -> &Arc<EventBus<InstanceEvent>> {
        &self.inner.events
    }

    pub async fn role(&self) -> Role {
        self.inner.state.lock().await.role
    }

    pub async fn set_role(&self, role: Role) {
        {
            let mut state = self.inner.state.lock().await;
            if state.role == role {
                return;
            }
            state.role = role;
        }
        self.inner.events.emit(match role {
            Role::Main => InstanceEvent::Main,
            Role::Standby => InstanceEvent::Standby,
        });
        self.refresh().await;
    }

    /// Milliseconds this instance has spent as a running Main since its
    /// process last came up.
    pub async fn main_uptime_millis(&self) -> u64 {
        self.inner.state.lock().await.stopwatch.elapsed_millis()
    }

    pub async fn handle_count(&self) -> usize {
        self.inner.state.lock().await.handles.len()
    }

    pub async fn add_handle(&self, handle: BrowserHandle) {
        {
            let mut state = self.inner.state.lock().await;
            state.handles.insert(handle.id(), handle.clone());
        }
        let this = self.clone();
        let id = handle.id();
        let closed = handle.closed();
        tokio::spawn(async move {
            closed.await;
            this.remove_handle(id).await;
        });
    }

    async fn remove_handle(&self, id: Uuid) {
        let drained = {
            let mut state = self.inner.state.lock().await;
            state.handles.remove(&id).is_some() && state.handles.is_empty()
        };
        if drained {
            self.inner.events.emit(InstanceEvent::Idle);
        }
    }

    /// Close every open handle and stop the process. Used on provider
    /// close and on the abandon path after a drain timeout.
    pub async fn shutdown(&self) {
        let handles: Vec<BrowserHandle> = {
            let mut state = self.inner.state.lock().await;
            state.handles.drain().map(|(_, handle)| handle).collect()
        };
        let had_handles = !handles.is_empty();
        for handle in &handles {
            handle.close();
        }
        if had_handles {
            self.inner.events.emit(InstanceEvent::Idle);
        }
        self.inner.process.stop().await;
    }

    pub fn detach(&self) {
        if let Ok(mut guard) = self.inner.monitor.lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }
    }

    /// Recompute stopwatch state and main availability edges.
    async fn refresh(&self) {
        let status = self.inner.process.status().await;
        let running = status == ProcessStatus::Running;
        let edge = {
            let mut state = self.inner.state.lock().await;
            match (state.role, running) {
                (Role::Main, true) => state.stopwatch.start(),
                (Role::Standby, true) => state.stopwatch.pause(),
                _ => state.stopwatch.stop(),
            }
            let online = state.role == Role::Main && running;
            if online != state.main_online {
                state.main_online = online;
                Some(online)
            } else {
                None
            }
        };
        match edge {
            Some(true) => {
                self.inner.events.emit(InstanceEvent::MainOnline);
            }
            Some(false) => {
                self.inner.events.emit(InstanceEvent::MainOffline);
            }
            None => {}
        }
    }
}
