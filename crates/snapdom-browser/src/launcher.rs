//! Spawning and probing of headless Chromium processes.
//!
//! The process state machine drives these seams rather than the OS
//! directly, so the lifecycle logic stays testable without a browser
//! binary on the machine.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cdp_client::{CdpClient, SharedCdp};
use serde::Deserialize;
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};
use which::which;

use crate::error::{BrowserError, Result};

/// Identity of a running browser, read from the DevTools version endpoint.
#[derive(Clone, Debug)]
pub struct BrowserInfo {
    pub user_agent: String,
    pub ws_url: String,
    pub version: String,
}

/// Composition of the browser command line.
#[derive(Clone, Debug)]
pub struct LaunchSpec {
    pub binary: PathBuf,
    pub debug_port: u16,
    /// Replaces the default flag set wholesale when present.
    pub args_override: Option<Vec<String>>,
    /// Appended after the (default or overridden) flag set.
    pub extra_args: Vec<String>,
}

/// Flags every supervised browser gets unless overridden.
const DEFAULT_FLAGS: &[&str] = &[
    "--headless",
    "--mute-audio",
    "--disable-gpu",
    "--hide-scrollbars",
    "--no-default-browser-check",
    "--no-first-run",
    "--metrics-recording-only",
    "--password-store=basic",
    "--use-mock-keychain",
    "--disable-features=Translate,OptimizationHints,MediaRouter,InterestFeedContentSuggestions",
    "--disable-extensions",
    "--disable-component-extensions-with-background-pages",
    "--disable-background-networking",
    "--disable-component-update",
    "--disable-client-side-phishing-detection",
    "--disable-sync",
    "--disable-default-apps",
    "--disable-domain-reliability",
    "--disable-backgrounding-occluded-windows",
    "--disable-renderer-backgrounding",
    "--disable-background-timer-throttling",
    "--disable-ipc-flooding-protection",
];

impl LaunchSpec {
    /// Full argument vector: flag set, extras, debugging port, and the
    /// `about:blank` start page last.
    pub fn command_args(&self) -> Vec<String> {
        let mut args: Vec<String> = match &self.args_override {
            Some(flags) => flags.clone(),
            None => DEFAULT_FLAGS.iter().map(|flag| flag.to_string()).collect(),
        };
        args.extend(self.extra_args.iter().cloned());
        args.push(format!("--remote-debugging-port={}", self.debug_port));
        args.push("about:blank".to_string());
        args
    }

    pub fn version_url(&self) -> String {
        format!("http://127.0.0.1:{}/json/version", self.debug_port)
    }
}

/// A spawned browser OS process.
#[async_trait]
pub trait BrowserChild: Send + Sync {
    fn pid(&self) -> u32;

    /// Resolve once the process has exited, however that happened.
    async fn wait_exit(&self);

    /// Polite shutdown request (SIGINT on the POSIX family).
    async fn interrupt(&self);

    /// Forceful kill; resolves only when the process is truly gone.
    async fn force_kill(&self);

    async fn is_alive(&self) -> bool;
}

/// Spawns children, probes the DevTools version endpoint, dials CDP.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn spawn(&self, spec: &LaunchSpec) -> Result<Arc<dyn BrowserChild>>;

    /// One probe of a `/json/version` URL. Retry policy belongs to callers.
    async fn probe_version(&self, version_url: &str) -> Result<BrowserInfo>;

    async fn connect(&self, ws_url: &str) -> Result<SharedCdp>;
}

#[derive(Deserialize)]
struct VersionPayload {
    #[serde(rename = "Browser", default)]
    browser: String,
    #[serde(rename = "User-Agent", default)]
    user_agent: String,
    #[serde(rename = "webSocketDebuggerUrl")]
    ws_url: String,
}

/// Production launcher for local Chromium binaries.
pub struct ChromiumLauncher {
    http: reqwest::Client,
}

impl Default for ChromiumLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl ChromiumLauncher {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(2))
                .build()
                .expect("reqwest client construction cannot fail with static options"),
        }
    }
}

#[async_trait]
impl BrowserLauncher for ChromiumLauncher {
    async fn spawn(&self, spec: &LaunchSpec) -> Result<Arc<dyn BrowserChild>> {
        let args = spec.command_args();
        debug!(target: "browser-launcher", binary = %spec.binary.display(), port = spec.debug_port, "spawning browser");
        let child = Command::new(&spec.binary)
            .args(&args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(|err| BrowserError::Spawn(format!("{}: {err}", spec.binary.display())))?;
        let pid = child
            .id()
            .ok_or_else(|| BrowserError::Spawn("spawned browser exited immediately".into()))?;
        Ok(Arc::new(ChromiumChild::new(pid, child)))
    }

    async fn probe_version(&self, version_url: &str) -> Result<BrowserInfo> {
        let response = self
            .http
            .get(version_url)
            .send()
            .await
            .map_err(|err| BrowserError::Endpoint(err.to_string()))?;
        if !response.status().is_success() {
            return Err(BrowserError::Endpoint(format!(
                "version endpoint returned HTTP {}",
                response.status()
            )));
        }
        let payload: VersionPayload = response
            .json()
            .await
            .map_err(|err| BrowserError::Endpoint(format!("bad version payload: {err}")))?;
        Ok(BrowserInfo {
            user_agent: payload.user_agent,
            ws_url: payload.ws_url,
            version: payload.browser,
        })
    }

    async fn connect(&self, ws_url: &str) -> Result<SharedCdp> {
        let client = CdpClient::connect(ws_url).await?;
        Ok(Arc::new(client))
    }
}

struct ChromiumChild {
    pid: u32,
    child: Arc<Mutex<Option<Child>>>,
    exited_rx: watch::Receiver<bool>,
}

impl ChromiumChild {
    fn new(pid: u32, child: Child) -> Self {
        let child = Arc::new(Mutex::new(Some(child)));
        let (exited_tx, exited_rx) = watch::channel(false);

        // The child handle lives behind the Mutex so the kill path can reach
        // it; exit detection therefore polls `try_wait` instead of holding
        // `wait()` across an await.
        let reaper_child = Arc::clone(&child);
        tokio::spawn(async move {
            loop {
                {
                    let mut guard = reaper_child.lock().await;
                    match guard.as_mut() {
                        Some(inner) => {
                            if let Ok(Some(_)) = inner.try_wait() {
                                guard.take();
                                let _ = exited_tx.send(true);
                                return;
                            }
                        }
                        None => {
                            let _ = exited_tx.send(true);
                            return;
                        }
                    }
                }
                tokio::time::sleep(Duration::from_millis(150)).await;
            }
        });

        Self {
            pid,
            child,
            exited_rx,
        }
    }
}

#[async_trait]
impl BrowserChild for ChromiumChild {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn wait_exit(&self) {
        let mut rx = self.exited_rx.clone();
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
        #[cfg(unix)]
        {
            unsafe {
                libc::kill(self.pid as libc::pid_t, libc::SIGINT);
            }
        }
        #[cfg(not(unix))]
        {
            let mut guard = self.child.lock().await;
            if let Some(child) = guard.as_mut() {
                let _ = child.start_kill();
            }
        }
    }

    async fn force_kill(&self) {
        {
            let mut guard = self.child.lock().await;
            if let Some(child) = guard.as_mut() {
                if let Err(err) = child.kill().await {
                    warn!(target: "browser-launcher", pid = self.pid, %err, "kill failed");
                }
            }
        }
        while self.is_alive().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn is_alive(&self) -> bool {
        {
            // Reap if the exit status is already collectable; otherwise a
            // zombie would read as alive forever.
            let mut guard = self.child.lock().await;
            if let Some(child) = guard.as_mut() {
                match child.try_wait() {
                    Ok(Some(_)) => {
                        guard.take();
                        return false;
                    }
                    Ok(None) => return true,
                    Err(_) => {}
                }
            }
        }
        probe_alive(self.pid)
    }
}

/// Liveness probe for a PID this process may or may not have reaped.
#[cfg(unix)]
fn probe_alive(pid: u32) -> bool {
    // Prefer procfs: a zombie (`Z`) or dead (`X`) entry is not alive even
    // though signal 0 would still succeed against it.
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => {
            // The state field follows the parenthesised command name, which
            // itself may contain spaces and parentheses.
            match stat.rsplit_once(')') {
                Some((_, rest)) => {
                    let state = rest.trim_start().chars().next().unwrap_or('X');
                    !matches!(state, 'Z' | 'X' | 'x')
                }
                None => false,
            }
        }
        Err(_) => unsafe { libc::kill(pid as libc::pid_t, 0) == 0 },
    }
}

#[cfg(not(unix))]
fn probe_alive(_pid: u32) -> bool {
    // Non-POSIX platforms rely on `try_wait` in `is_alive`; by the time the
    // handle is gone the process is too.
    false
}

/// Locate a Chromium-family binary: explicit env override, PATH lookup,
/// then well-known install locations.
pub fn detect_browser_binary() -> Option<PathBuf> {
    if let Ok(raw) = env::var("SNAPDOM_CHROME") {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            let candidate = PathBuf::from(trimmed);
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    for name in [
        "google-chrome-stable",
        "google-chrome",
        "chromium",
        "chromium-browser",
        "chrome",
    ] {
        if let Ok(path) = which(name) {
            return Some(path);
        }
    }

    for candidate in [
        "/usr/bin/google-chrome-stable",
        "/usr/bin/google-chrome",
        "/usr/bin/chromium-browser",
        "/usr/bin/chromium",
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        "/Applications/Chromium.app/Contents/MacOS/Chromium",
    ] {
        let path = PathBuf::from(candidate);
        if path.exists() {
            return Some(path);
        }
    }

    None
}
