//! JavaScript dialog handling for rendered pages.
//!
//! Every dialog is accepted with its own default prompt text, so pages
//! that alert/confirm/prompt never wedge a render. Magic dialogs ride the
//! same channel: page code calls `window.prompt('', token)` and the token
//! match resolves the registered rendezvous. This is the only path a page
//! has to signal the service, and the HTML latch happens in-page before
//! the prompt fires, so the capture is deterministic.

use std::sync::{Arc, Mutex as StdMutex};

use cdp_client::SharedCdp;
use dashmap::DashMap;
use serde_json::json;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::page_js::random_token;

pub struct DialogHandler {
    magics: Arc<DashMap<String, oneshot::Sender<()>>>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl DialogHandler {
    /// Subscribe to dialog events on an already Page-enabled client.
    pub fn install(client: SharedCdp) -> Arc<Self> {
        let handler = Arc::new(Self {
            magics: Arc::new(DashMap::new()),
            task: StdMutex::new(None),
        });

        let magics = Arc::clone(&handler.magics);
        let mut dialogs = client.subscribe("Page.javascriptDialogOpening");
        let task = tokio::spawn(async move {
            while let Some(params) = dialogs.next().await {
                let default_prompt = params["defaultPrompt"].as_str().unwrap_or_default();
                let reply = json!({ "accept": true, "promptText": default_prompt });
                if let Err(err) = client.call("Page.handleJavaScriptDialog", reply).await {
                    warn!(target: "dialog-handler", %err, "failed to accept dialog");
                }
                if let Some((_, tx)) = magics.remove(default_prompt) {
                    debug!(target: "dialog-handler", "magic dialog rendezvous");
                    let _ = tx.send(());
                }
            }
        });
        *handler.task.lock().unwrap() = Some(task);
        handler
    }

    /// Register a rendezvous token. The receiver resolves when a dialog
    /// arrives whose accepted input equals the token.
    pub fn register_magic(&self) -> (String, oneshot::Receiver<()>) {
        let token = random_token();
        let (tx, rx) = oneshot::channel();
        self.magics.insert(token.clone(), tx);
        (token, rx)
    }

    pub fn close(&self) {
        if let Ok(mut guard) = self.task.lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }
        self.magics.clear();
    }
}

impl Drop for DialogHandler {
    fn drop(&mut self) {
        self.close();
    }
}
