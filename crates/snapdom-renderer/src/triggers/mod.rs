//! Pluggable "page loaded" detectors.
//!
//! A trigger installs its hooks before navigation (`init`), resolves once
//! the page qualifies (`wait`), and detaches on `close`. All triggers
//! operate on the top-level frame only.

mod event;
mod requests;
mod simple;
mod variable;

use std::sync::Arc;

use async_trait::async_trait;
use cdp_client::{CdpError, SharedCdp};

use crate::dialogs::DialogHandler;
use crate::page_js::PageContext;
use crate::types::{CompletionType, TriggerSpec};

pub use event::EventTrigger;
pub use requests::RequestsTrigger;
pub use simple::{AlwaysTrigger, NeverTrigger};
pub use variable::VariableTrigger;

/// Everything a trigger may hook into on the tab being rendered.
pub struct TriggerEnv {
    pub client: SharedCdp,
    pub dialogs: Arc<DialogHandler>,
    pub page: PageContext,
}

#[async_trait]
pub trait CompletionTrigger: Send {
    /// Install hooks. Runs after the page context script is registered and
    /// before navigation.
    async fn init(&mut self, env: &TriggerEnv) -> Result<(), CdpError>;

    /// Resolve once the page counts as loaded. May never resolve (the
    /// caller bounds it with the page-load timeout).
    async fn wait(&mut self) -> CompletionType;

    async fn close(&mut self);
}

pub fn build_trigger(spec: &TriggerSpec) -> Box<dyn CompletionTrigger> {
    match spec {
        TriggerSpec::Requests {
            wait_after_last_request_ms,
        } => Box::new(RequestsTrigger::new(std::time::Duration::from_millis(
            *wait_after_last_request_ms,
        ))),
        TriggerSpec::Variable { var_name } => Box::new(VariableTrigger::new(var_name.clone())),
        TriggerSpec::Event { target, event_name } => {
            Box::new(EventTrigger::new(target.clone(), event_name.clone()))
        }
        TriggerSpec::Always => Box::new(AlwaysTrigger),
        TriggerSpec::Never => Box::new(NeverTrigger),
    }
}
