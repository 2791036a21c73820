//! Render inputs and outputs.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the renderer decides the page is "loaded".
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TriggerSpec {
    /// DOMContentLoaded plus a network-quiet window.
    Requests { wait_after_last_request_ms: u64 },
    /// A window variable being assigned `true`.
    Variable { var_name: String },
    /// A DOM event on a global object.
    Event { target: String, event_name: String },
    /// Loaded as soon as navigation is classified.
    Always,
    /// Never fires; only the timeout path ends the render.
    Never,
}

impl TriggerSpec {
    pub const DEFAULT_EVENT_TARGET: &'static str = "window";
    pub const DEFAULT_EVENT_NAME: &'static str = "prerender_done";
}

/// What ended the wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionType {
    Requests,
    Variable,
    Event,
    PageLoadTimeout,
    Never,
    Always,
}

/// Fully resolved options for one render (per-request values already merged
/// over service defaults).
#[derive(Clone, Debug)]
pub struct RenderOptions {
    pub url: String,
    pub browser_width: u32,
    pub browser_height: u32,
    pub page_load_timeout: Duration,
    pub allow_partial_load: bool,
    pub fresh_browser_context: bool,
    pub script_to_evaluate_on_new_document: Option<String>,
    /// Empty means any status is acceptable.
    pub expected_status_codes: Vec<u16>,
    pub trigger: TriggerSpec,
    pub user_agent: Option<String>,
    /// Collect console output and full request lists.
    pub debug: bool,
}

pub type HeaderMap = HashMap<String, String>;

/// A finished render.
#[derive(Clone, Debug)]
pub struct RenderOutcome {
    pub resolved_url: String,
    pub http_status: u16,
    pub headers: HeaderMap,
    pub html: String,
    pub completion: CompletionType,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderErrorKind {
    TabCreationFailed,
    InitialRequestFailed,
    InitialRequestStatus,
    Timeout,
    BrowserUnavailable,
    Unknown,
}

impl RenderErrorKind {
    /// Wire-level error code reported to HTTP clients.
    pub fn code(&self) -> &'static str {
        match self {
            RenderErrorKind::TabCreationFailed => "tab_creation_failed",
            RenderErrorKind::InitialRequestFailed => "initial_request_failed",
            RenderErrorKind::InitialRequestStatus => "initial_request_status",
            RenderErrorKind::Timeout => "timeout",
            RenderErrorKind::BrowserUnavailable => "browser_unavailable",
            RenderErrorKind::Unknown => "unknown",
        }
    }
}

/// Render failure. Status and headers are present exactly when the initial
/// request got at least as far as a response.
#[derive(Clone, Debug)]
pub struct RenderError {
    pub kind: RenderErrorKind,
    pub message: String,
    pub http_status: Option<u16>,
    pub headers: Option<HeaderMap>,
}

impl RenderError {
    pub fn new(kind: RenderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            http_status: None,
            headers: None,
        }
    }

    pub fn with_response(mut self, status: Option<u16>, headers: Option<HeaderMap>) -> Self {
        self.http_status = status;
        self.headers = headers;
        self
    }

    pub fn unknown(message: impl fmt::Display) -> Self {
        Self::new(RenderErrorKind::Unknown, message.to_string())
    }
}

impl fmt::Display for RenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.code(), self.message)
    }
}

impl std::error::Error for RenderError {}
