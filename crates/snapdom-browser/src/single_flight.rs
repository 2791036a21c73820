//! Re-entrancy guard: while one caller executes the body, every concurrent
//! caller awaits the same outcome. The first caller is told it was first so
//! exactly one component fires the terminal event.

use std::future::Future;

use tokio::sync::{watch, Mutex};

pub struct SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    slot: Mutex<Option<watch::Receiver<Option<T>>>>,
}

impl<T> Default for SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Execute `body` single-flight. Returns the outcome and whether this
    /// caller ran the body (`true`) or joined an in-flight run (`false`).
    pub async fn run<F>(&self, body: F) -> (T, bool)
    where
        F: Future<Output = T>,
    {
        let mut body = Some(body);
        loop {
            let follower_rx = {
                let mut slot = self.slot.lock().await;
                match slot.as_ref() {
                    Some(rx) => Some(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        *slot = Some(rx);
                        drop(slot);
                        let outcome = body
                            .take()
                            .expect("single-flight body consumed twice")
                            .await;
                        let _ = tx.send(Some(outcome.clone()));
                        *self.slot.lock().await = None;
                        return (outcome, true);
                    }
                }
            };

            if let Some(mut rx) = follower_rx {
                loop {
                    if let Some(outcome) = rx.borrow().clone() {
                        return (outcome, false);
                    }
                    if rx.changed().await.is_err() {
                        // The flight leader was dropped before finishing.
                        // Clear the dead slot and contend for leadership.
                        let mut slot = self.slot.lock().await;
                        if slot
                            .as_ref()
                            .map(|existing| existing.has_changed().is_err())
                            .unwrap_or(false)
                        {
                            *slot = None;
                        }
                        break;
                    }
                }
            }
        }
    }
}
