//! Variable trigger: fires when the page assigns `true` to a chosen
//! window variable. The injected accessor latches the HTML synchronously
//! inside the setter before signalling, so later mutations by the page
//! cannot change what the render returns.

use async_trait::async_trait;
use cdp_client::CdpError;
use serde_json::json;
use tokio::sync::oneshot;

use crate::triggers::{CompletionTrigger, TriggerEnv};
use crate::types::CompletionType;

pub struct VariableTrigger {
    var_name: String,
    rendezvous: Option<oneshot::Receiver<()>>,
}

impl VariableTrigger {
    pub fn new(var_name: String) -> Self {
        Self {
            var_name,
            rendezvous: None,
        }
    }
}

#[async_trait]
impl CompletionTrigger for VariableTrigger {
    async fn init(&mut self, env: &TriggerEnv) -> Result<(), CdpError> {
        let (token, rx) = env.dialogs.register_magic();
        let script = env.page.variable_hook_script(&self.var_name, &token);
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
                return CompletionType::Variable;
            }
        }
        // Rendezvous lost (dialog handler closed): only the timeout ends
        // this render.
        futures::future::pending::<()>().await;
        unreachable!()
    }

    async fn close(&mut self) {
        self.rendezvous = None;
    }
}
