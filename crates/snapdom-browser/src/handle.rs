//! Handles issued by providers to render coordinators.
//!
//! A handle is an opaque token over the CDP client of whichever browser is
//! currently serving. Closing a handle releases the token only; the client
//! is shared with every other open handle and with the provider itself.

use std::sync::{Arc, Mutex as StdMutex};

use cdp_client::SharedCdp;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::launcher::BrowserInfo;

struct HandleInner {
    id: Uuid,
    client: SharedCdp,
    info: BrowserInfo,
    closed_tx: watch::Sender<bool>,
    auto_task: StdMutex<Option<JoinHandle<()>>>,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.auto_task.lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }
    }
}

#[derive(Clone)]
pub struct BrowserHandle {
    inner: Arc<HandleInner>,
}

impl BrowserHandle {
    pub fn new(client: SharedCdp, info: BrowserInfo) -> Self {
        let (closed_tx, _) = watch::channel(false);
        let handle = Self {
            inner: Arc::new(HandleInner {
                id: Uuid::new_v4(),
                client: Arc::clone(&client),
                info,
                closed_tx,
                auto_task: StdMutex::new(None),
            }),
        };

        // A handle cannot outlive its client: close/disconnect of the
        // underlying connection closes the handle automatically.
        let this = handle.clone();
        let signal = client.close_signal();
        let task = tokio::spawn(async move {
            signal.wait().await;
            this.close();
        });
        *handle.inner.auto_task.lock().unwrap() = Some(task);

        handle
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn client(&self) -> SharedCdp {
        Arc::clone(&self.inner.client)
    }

    pub fn browser_info(&self) -> &BrowserInfo {
        &self.inner.info
    }

    /// Idempotent. Never touches the underlying client.
    pub fn close(&self) {
        let changed = self.inner.closed_tx.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        });
        if changed {
            if let Ok(mut guard) = self.inner.auto_task.lock() {
                if let Some(task) = guard.take() {
                    task.abort();
                }
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed_tx.subscribe().borrow()
    }

    /// Resolves once the handle is closed (directly or via client loss).
    pub fn closed(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut rx = self.inner.closed_tx.subscribe();
        async move {
            loop {
                if *rx.borrow() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        }
    }
}
