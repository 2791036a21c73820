//! Pausable stopwatch used for main-role uptime accounting.

use tokio::time::{Duration, Instant};

/// Accumulates elapsed time across start/pause cycles; `stop` resets.
#[derive(Debug, Default)]
pub struct Stopwatch {
    accumulated: Duration,
    since: Option<Instant>,
}

impl Stopwatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self) {
        if self.since.is_none() {
            self.since = Some(Instant::now());
        }
    }

    pub fn pause(&mut self) {
        if let Some(since) = self.since.take() {
            self.accumulated += since.elapsed();
        }
    }

    /// Halt and discard accumulated time.
    pub fn stop(&mut self) {
        self.accumulated = Duration::ZERO;
        self.since = None;
    }

    pub fn is_running(&self) -> bool {
        self.since.is_some()
    }

    pub fn elapsed(&self) -> Duration {
        match self.since {
            Some(since) => self.accumulated + since.elapsed(),
            None => self.accumulated,
        }
    }

    pub fn elapsed_millis(&self) -> u64 {
        self.elapsed().as_millis() as u64
    }
}
