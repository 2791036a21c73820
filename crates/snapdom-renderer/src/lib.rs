//! Render coordination layer.
//!
//! Everything that happens between "here is a browser handle" and "here is
//! the page's post-JavaScript HTML": tab lifecycle, request watching,
//! dialog handling, in-page instrumentation, and the pluggable completion
//! triggers that decide when a page counts as loaded.

mod dialogs;
pub mod page_js;
mod tab;
mod triggers;
mod types;
mod watcher;

pub use dialogs::DialogHandler;
pub use tab::{CdpConnector, InitialRequestHook, RenderBrowser, TabRenderer};
pub use triggers::{build_trigger, CompletionTrigger, TriggerEnv};
pub use types::{
    CompletionType, HeaderMap, RenderError, RenderErrorKind, RenderOptions, RenderOutcome,
    TriggerSpec,
};
pub use watcher::{
    to_micros, FailureDetails, RequestRecord, RequestState, RequestWatcher, ResponseDetails,
};
