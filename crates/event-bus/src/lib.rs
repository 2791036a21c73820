//! In-memory event bus for component lifecycle signals.
//!
//! Browser processes, instances and providers announce their state changes on
//! a bus of this shape. Emission order is preserved per bus, so listeners can
//! assert on transition sequences.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

/// Trait implemented by payload types that can be carried on the bus.
pub trait Event: Clone + Send + Sync + fmt::Debug + 'static {}

impl<T> Event for T where T: Clone + Send + Sync + fmt::Debug + 'static {}

/// Broadcast bus with a bounded replay buffer. Slow subscribers that fall
/// behind the buffer observe a `Lagged` gap, never a stall of the emitter.
pub struct EventBus<E>
where
    E: Event,
{
    sender: broadcast::Sender<E>,
}

impl<E> EventBus<E>
where
    E: Event,
{
    pub fn new(capacity: usize) -> Arc<Self> {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Arc::new(Self { sender })
    }

    /// Emit an event to all current subscribers. Returns the number of
    /// subscribers that will observe it; zero subscribers is not an error.
    pub fn emit(&self, event: E) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }
}

/// Materialise an mpsc receiver from a bus subscription so callers can await
/// events without handling broadcast lag semantics directly.
pub fn into_mpsc<E>(bus: &EventBus<E>, capacity: usize) -> mpsc::Receiver<E>
where
    E: Event,
{
    let mut rx = bus.subscribe();
    let (tx, out_rx) = mpsc::channel(capacity.max(1));
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(ev) => {
                    if tx.send(ev).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
    out_rx
}

/// Await the first event matching `pred`, skipping everything else.
pub async fn wait_for<E, F>(rx: &mut broadcast::Receiver<E>, mut pred: F) -> Option<E>
where
    E: Event,
    F: FnMut(&E) -> bool,
{
    loop {
        match rx.recv().await {
            Ok(ev) if pred(&ev) => return Some(ev),
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}
