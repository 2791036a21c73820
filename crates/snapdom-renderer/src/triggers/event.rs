//! Event trigger: fires on a DOM event dispatched to a named global.
//! Shares the latch-then-signal pattern with the variable trigger.

use async_trait::async_trait;
use cdp_client::CdpError;
use serde_json::json;
use tokio::sync::oneshot;

use crate::triggers::{CompletionTrigger, TriggerEnv};
use crate::types::CompletionType;

pub struct EventTrigger {
    target: String,
    event_name: String,
    rendezvous: Option<oneshot::Receiver<()>>,
}

impl EventTrigger {
    pub fn new(target: String, event_name: String) -> Self {
        Self {
            target,
            event_name,
            rendezvous: None,
        }
    }
}

#[async_trait]
impl CompletionTrigger for EventTrigger {
    async fn init(&mut self, env: &TriggerEnv) -> Result<(), CdpError> {
        let (token, rx) = env.dialogs.register_magic();
        let script = env
            .page
            .event_hook_script(&self.target, &self.event_name, &token);
        env.client
            .call(
                "Page.addScriptToEvaluateOnNewDocument",
                json!({ "source": script }),
            )
            .await?;
        self.rendezvous = Some(rx);
        Ok(())
    }

    async fn wait(&mut self) -> CompletionType {
        if let Some(rx) = self.rendezvous.take() {
            if rx.await.is_ok() {
                return CompletionType::Event;
            }
        }
        futures::future::pending::<()>().await;
        unreachable!()
    }

    async fn close(&mut self) {
        self.rendezvous = None;
    }
}
