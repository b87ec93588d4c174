//! Multiplexing CDP WebSocket connection.
//!
//! One reader task owns the socket's receive half and dispatches responses
//! to per-command oneshot channels and events to subscribed listeners. Ids
//! are allocated per session so flat-session targets never collide.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::protocol::{Message, WebSocketConfig};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    common::{PipeError, PipeResult},
    cdp::proto::{Command, CommandError, Incoming},
};

/// CDP responses (Network bodies in particular) can be large.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Per-listener event buffer; events beyond it are dropped for that
/// listener only.
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Key of a pending command: session id (None for the browser session) and
/// command id.
type PendingKey = (Option<String>, u64);
type PendingResult = Result<Value, CommandError>;

struct Listener {
    session_id: Option<String>,
    method: String,
    tx: mpsc::Sender<Value>,
}

pub struct CdpConnection {
    out_tx: mpsc::UnboundedSender<Message>,
    pending: Arc<Mutex<HashMap<PendingKey, oneshot::Sender<PendingResult>>>>,
    listeners: Arc<Mutex<Vec<Listener>>>,
    next_ids: Mutex<HashMap<Option<String>, u64>>,
    cancel: CancellationToken,
    cmd_timeout: Duration,
}

impl CdpConnection {
    /// Connect to a DevTools WebSocket endpoint.
    pub async fn create(ws_url: &str, cmd_timeout: Duration) -> PipeResult<Arc<Self>> {
        let config = WebSocketConfig::default()
            .max_message_size(Some(MAX_MESSAGE_SIZE))
            .max_frame_size(Some(MAX_MESSAGE_SIZE));
        let (socket, _) =
            tokio_tungstenite::connect_async_with_config(ws_url, Some(config), false)
                .await
                .map_err(|e| PipeError::Cdp(format!("Failed to connect to {ws_url}: {e}")))?;
        debug!("Connected to CDP endpoint {ws_url}");
        let (mut write, mut read) = socket.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let pending: Arc<Mutex<HashMap<PendingKey, oneshot::Sender<PendingResult>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let listeners: Arc<Mutex<Vec<Listener>>> = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();

        let write_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = write_cancel.cancelled() => break,
                    msg = out_rx.recv() => match msg {
                        Some(msg) => {
                            if let Err(e) = write.send(msg).await {
                                warn!("CDP write error: {e}");
                                write_cancel.cancel();
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            let _ = write.close().await;
        });

        let read_pending = pending.clone();
        let read_listeners = listeners.clone();
        let read_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = read_cancel.cancelled() => break,
                    msg = read.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            dispatch(&text, &read_pending, &read_listeners);
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!("CDP connection closed by remote");
                            read_cancel.cancel();
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("CDP read error: {e}");
                            read_cancel.cancel();
                            break;
                        }
                    },
                }
            }
            // Wake every caller still waiting for a response.
            read_pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clear();
        });

        Ok(Arc::new(Self {
            out_tx,
            pending,
            listeners,
            next_ids: Mutex::new(HashMap::new()),
            cancel,
            cmd_timeout,
        }))
    }

    fn next_id(&self, session_id: Option<&str>) -> u64 {
        let mut ids = self.next_ids.lock().unwrap_or_else(|e| e.into_inner());
        let counter = ids.entry(session_id.map(str::to_string)).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Send a command and await its response.
    pub async fn send(
        &self,
        method: &str,
        params: Option<Value>,
        session_id: Option<&str>,
    ) -> PipeResult<Value> {
        if self.cancel.is_cancelled() {
            return Err(PipeError::Cdp("Connection is closed".into()));
        }
        let id = self.next_id(session_id);
        let key = (session_id.map(str::to_string), id);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.clone(), tx);

        let command = Command {
            id,
            method,
            params,
            session_id,
        };
        let text = serde_json::to_string(&command)
            .map_err(|e| PipeError::Cdp(format!("Failed to serialize command: {e}")))?;
        trace!("CDP send: {text}");
        if self.out_tx.send(Message::Text(text.into())).is_err() {
            self.remove_pending(&key);
            return Err(PipeError::Cdp("Connection is closed".into()));
        }

        match tokio::time::timeout(self.cmd_timeout, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(err))) => Err(PipeError::Cdp(err.to_string())),
            Ok(Err(_)) => Err(PipeError::Cdp("Connection closed mid-command".into())),
            Err(_) => {
                self.remove_pending(&key);
                Err(PipeError::Cdp(format!("{method} timed out")))
            }
        }
    }

    fn remove_pending(&self, key: &PendingKey) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    /// Subscribe to an event method on a session. Events arriving while the
    /// receiver's buffer is full are dropped for this listener.
    pub fn subscribe(&self, session_id: Option<&str>, method: &str) -> mpsc::Receiver<Value> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Listener {
                session_id: session_id.map(str::to_string),
                method: method.to_string(),
                tx,
            });
        rx
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for CdpConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn dispatch(
    text: &str,
    pending: &Mutex<HashMap<PendingKey, oneshot::Sender<PendingResult>>>,
    listeners: &Mutex<Vec<Listener>>,
) {
    let incoming: Incoming = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("Unparseable CDP message: {e}");
            return;
        }
    };

    if let Some(id) = incoming.id {
        let key = (incoming.session_id, id);
        let Some(tx) = pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&key) else {
            trace!("Response for unknown command id {id}");
            return;
        };
        let result = match incoming.error {
            Some(err) => Err(err),
            None => Ok(incoming.result.unwrap_or(Value::Null)),
        };
        let _ = tx.send(result);
        return;
    }

    let Some(method) = incoming.method else {
        warn!("CDP message with neither id nor method");
        return;
    };
    let params = incoming.params.unwrap_or(Value::Null);
    let mut listeners = listeners.lock().unwrap_or_else(|e| e.into_inner());
    listeners.retain(|listener| !listener.tx.is_closed());
    for listener in listeners.iter() {
        if listener.method != method || listener.session_id != incoming.session_id {
            continue;
        }
        if let Err(mpsc::error::TrySendError::Full(_)) = listener.tx.try_send(params.clone()) {
            warn!("Dropping {method} event for a slow listener");
        }
    }
}
