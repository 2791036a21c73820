//! Production CDP client over a DevTools WebSocket endpoint.
//!
//! One client owns one socket. A background task multiplexes method calls
//! (correlated by `CallId`) and fans protocol events out to subscribers.

use std::collections::HashMap;
use std::convert::TryInto;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::cdp::events::CdpEventMessage;
use chromiumoxide::conn::Connection;
use chromiumoxide_types::{CallId, CdpJsonEventMessage, Message, MethodId, Response};
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::connection::{CdpConnection, CloseReason, CloseSignal, EventStream, SubscriptionTable};
use crate::error::CdpError;

const DEFAULT_CALL_DEADLINE: Duration = Duration::from_secs(30);
const COMMAND_QUEUE_DEPTH: usize = 128;

struct CommandRequest {
    method: String,
    params: Value,
    responder: oneshot::Sender<Result<Value, CdpError>>,
}

struct ClientShared {
    ws_url: String,
    command_tx: mpsc::Sender<CommandRequest>,
    subs: SubscriptionTable,
    close_tx: watch::Sender<Option<CloseReason>>,
    loop_task: StdMutex<Option<JoinHandle<()>>>,
    call_deadline: Duration,
}

impl Drop for ClientShared {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.loop_task.lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }
    }
}

/// Handle to a live CDP WebSocket connection. Cheap to clone; all clones
/// share the socket, the subscription table and the close signal.
#[derive(Clone)]
pub struct CdpClient {
    inner: Arc<ClientShared>,
}

impl CdpClient {
    /// Dial `ws_url` and start the connection loop.
    pub async fn connect(ws_url: &str) -> Result<Self, CdpError> {
        Self::connect_with_deadline(ws_url, DEFAULT_CALL_DEADLINE).await
    }

    pub async fn connect_with_deadline(
        ws_url: &str,
        call_deadline: Duration,
    ) -> Result<Self, CdpError> {
        let conn = Connection::<CdpEventMessage>::connect(ws_url)
            .await
            .map_err(|err| CdpError::Connect(err.to_string()))?;

        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (close_tx, _close_rx) = watch::channel(None);
        let subs = SubscriptionTable::new();

        let loop_close_tx = close_tx.clone();
        let loop_subs = subs.clone();
        let loop_url = ws_url.to_string();
        let loop_task = tokio::spawn(async move {
            let reason = run_loop(conn, command_rx, &loop_subs).await;
            if set_reason(&loop_close_tx, reason) {
                debug!(target: "cdp-client", url = %loop_url, ?reason, "connection loop ended");
            }
            loop_subs.clear();
        });

        Ok(Self {
            inner: Arc::new(ClientShared {
                ws_url: ws_url.to_string(),
                command_tx,
                subs,
                close_tx,
                loop_task: StdMutex::new(Some(loop_task)),
                call_deadline,
            }),
        })
    }

    pub fn ws_url(&self) -> &str {
        &self.inner.ws_url
    }
}

#[async_trait]
impl CdpConnection for CdpClient {
    async fn call(&self, method: &str, params: Value) -> Result<Value, CdpError> {
        if self.is_closed() {
            return Err(CdpError::Closed);
        }

        let (resp_tx, resp_rx) = oneshot::channel();
        let request = CommandRequest {
            method: method.to_string(),
            params,
            responder: resp_tx,
        };
        self.inner
            .command_tx
            .send(request)
            .await
            .map_err(|_| CdpError::Closed)?;

        match tokio::time::timeout(self.inner.call_deadline, resp_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CdpError::Closed),
            Err(_) => Err(CdpError::Timeout(method.to_string())),
        }
    }

    fn subscribe(&self, method: &str) -> EventStream {
        self.inner.subs.subscribe(method)
    }

    fn close_signal(&self) -> CloseSignal {
        CloseSignal::new(self.inner.close_tx.subscribe())
    }

    fn is_closed(&self) -> bool {
        self.inner.close_tx.borrow().is_some()
    }

    async fn close(&self) {
        if !set_reason(&self.inner.close_tx, CloseReason::Requested) {
            return;
        }
        if let Ok(mut guard) = self.inner.loop_task.lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }
        self.inner.subs.clear();
    }
}

/// First-wins close reason; returns whether this call set it.
fn set_reason(close_tx: &watch::Sender<Option<CloseReason>>, reason: CloseReason) -> bool {
    close_tx.send_if_modified(|slot| {
        if slot.is_none() {
            *slot = Some(reason);
            true
        } else {
            false
        }
    })
}

async fn run_loop(
    mut conn: Connection<CdpEventMessage>,
    mut command_rx: mpsc::Receiver<CommandRequest>,
    subs: &SubscriptionTable,
) -> CloseReason {
    let mut inflight: HashMap<CallId, oneshot::Sender<Result<Value, CdpError>>> = HashMap::new();

    loop {
        tokio::select! {
            cmd = command_rx.recv() => {
                let Some(cmd) = cmd else {
                    // Every client handle is gone; nothing can observe the
                    // socket any more.
                    fail_inflight(&mut inflight, &CdpError::Closed);
                    return CloseReason::Requested;
                };
                let method_id: MethodId = cmd.method.clone().into();
                match conn.submit_command(method_id, None, cmd.params) {
                    Ok(call_id) => {
                        inflight.insert(call_id, cmd.responder);
                    }
                    Err(err) => {
                        warn!(target: "cdp-client", method = %cmd.method, %err, "command submit failed");
                        let io = CdpError::Io(err.to_string());
                        let _ = cmd.responder.send(Err(io.clone()));
                        fail_inflight(&mut inflight, &io);
                        return CloseReason::ConnectionLost;
                    }
                }
            }
            message = conn.next() => {
                match message {
                    Some(Ok(Message::Response(resp))) => handle_response(resp, &mut inflight),
                    Some(Ok(Message::Event(event))) => {
                        let raw: Result<CdpJsonEventMessage, _> = event.try_into();
                        match raw {
                            Ok(raw) => {
                                subs.dispatch(raw.method.as_ref(), &raw.params);
                            }
                            Err(err) => {
                                debug!(target: "cdp-client", ?err, "undecodable event dropped");
                            }
                        }
                    }
                    Some(Err(err)) => {
                        fail_inflight(&mut inflight, &CdpError::Io(err.to_string()));
                        return CloseReason::ConnectionLost;
                    }
                    None => {
                        fail_inflight(&mut inflight, &CdpError::Closed);
                        return CloseReason::ConnectionLost;
                    }
                }
            }
        }
    }
}

fn handle_response(
    resp: Response,
    inflight: &mut HashMap<CallId, oneshot::Sender<Result<Value, CdpError>>>,
) {
    let Some(sender) = inflight.remove(&resp.id) else {
        debug!(target: "cdp-client", id = ?resp.id, "response without a pending call");
        return;
    };
    let result = if let Some(result) = resp.result {
        Ok(result)
    } else if let Some(error) = resp.error {
        Err(CdpError::Protocol {
            code: error.code,
            message: error.message,
        })
    } else {
        Err(CdpError::Decode("empty cdp response".into()))
    };
    let _ = sender.send(result);
}

fn fail_inflight(
    inflight: &mut HashMap<CallId, oneshot::Sender<Result<Value, CdpError>>>,
    err: &CdpError,
) {
    for (_, sender) in inflight.drain() {
        let _ = sender.send(Err(err.clone()));
    }
}
