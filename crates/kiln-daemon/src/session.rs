//! Per-connection state: the outbound message queue and open streams.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use kiln_core::debug::RelayInput;
use kiln_rpc::protocol::{Message, Notification, RequestId, Response, RpcError};
use kiln_rpc::{stream_end, stream_item};
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{DaemonError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a stream does with client-sent frames
#[derive(Debug)]
pub enum StreamInput {
    /// Server-streaming; client frames other than cancel are ignored
    None,
    /// `board_list_watch`; an interrupt or close ends the stream
    Watch,
    /// `debug`; frames are relayed to the session
    Debug(mpsc::Sender<RelayInput>),
}

#[derive(Debug)]
pub struct StreamEntry {
    pub cancel: CancellationToken,
    pub input: StreamInput,
    /// Set when the client broke the stream's protocol; reported as its end
    pub rejection: Arc<OnceLock<RpcError>>,
}

impl StreamEntry {
    #[must_use]
    pub fn new(cancel: CancellationToken, input: StreamInput) -> Self {
        Self {
            cancel,
            input,
            rejection: Arc::new(OnceLock::new()),
        }
    }

    /// Record a protocol error and stop the stream.
    pub fn reject(&self, error: RpcError) {
        let _ = self.rejection.set(error);
        self.cancel.cancel();
    }
}

/// Handle to one client connection, shared by the tasks serving its streams
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnectionId,
    tx: mpsc::UnboundedSender<Message>,
    streams: Arc<Mutex<HashMap<RequestId, StreamEntry>>>,
}

impl Connection {
    #[must_use]
    pub fn new(id: ConnectionId, tx: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id,
            tx,
            streams: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Queue a message for the connection's writer.
    ///
    /// Returns false once the connection is gone.
    pub fn send(&self, msg: Message) -> bool {
        if self.tx.send(msg).is_err() {
            trace!("[{}] Dropping message, connection closed", self.id);
            return false;
        }
        true
    }

    pub fn respond(&self, response: Response) -> bool {
        self.send(Message::Response(response))
    }

    fn notify(&self, notification: Notification) -> bool {
        self.send(Message::Notification(notification))
    }

    /// Send one `stream.item`.
    pub fn send_item<T: Serialize>(&self, stream: &RequestId, item: &T) -> bool {
        match stream_item(stream, item) {
            Ok(notification) => self.notify(notification),
            Err(e) => {
                warn!("[{}] Failed to serialize item for {}: {}", self.id, stream, e);
                true
            }
        }
    }

    /// Register a stream under the id of the request that opened it.
    ///
    /// # Errors
    ///
    /// Returns `DaemonError::StreamInUse` if that id is still open.
    pub async fn open_stream(&self, id: RequestId, entry: StreamEntry) -> Result<()> {
        let mut streams = self.streams.lock().await;
        if streams.contains_key(&id) {
            return Err(DaemonError::StreamInUse(id));
        }
        debug!("[{}] Stream {} opened", self.id, id);
        streams.insert(id, entry);
        Ok(())
    }

    /// Remove a stream and send its `stream.end`.
    ///
    /// A protocol error recorded on the stream replaces `error`.
    pub async fn end_stream(&self, id: &RequestId, error: Option<RpcError>) {
        let entry = self.streams.lock().await.remove(id);
        let error = entry
            .and_then(|e| e.rejection.get().cloned())
            .or(error);
        debug!("[{}] Stream {} ended (error: {:?})", self.id, id, error);
        self.notify(stream_end(id, error));
    }

    /// Remove a stream without sending anything.
    pub async fn forget_stream(&self, id: &RequestId) -> Option<StreamEntry> {
        self.streams.lock().await.remove(id)
    }

    /// Protocol error recorded on an open stream, if any.
    pub async fn rejection(&self, id: &RequestId) -> Option<RpcError> {
        self.streams
            .lock()
            .await
            .get(id)
            .and_then(|e| e.rejection.get().cloned())
    }

    /// Route a `stream.send` item.
    ///
    /// # Errors
    ///
    /// Returns `DaemonError::StreamNotFound` if no such stream is open.
    pub async fn stream_send(&self, id: &RequestId, item: serde_json::Value) -> Result<()> {
        let streams = self.streams.lock().await;
        let entry = streams
            .get(id)
            .ok_or_else(|| DaemonError::StreamNotFound(id.clone()))?;
        match &entry.input {
            StreamInput::None => {
                debug!("[{}] Ignoring input on server stream {}", self.id, id);
            }
            StreamInput::Watch => match serde_json::from_value::<kiln_rpc::WatchControl>(item) {
                Ok(control) if control.interrupt => {
                    debug!("[{}] Watch {} interrupted", self.id, id);
                    entry.cancel.cancel();
                }
                Ok(_) => {}
                Err(e) => warn!("[{}] Malformed watch control: {}", self.id, e),
            },
            StreamInput::Debug(tx) => {
                let request = match serde_json::from_value(item) {
                    Ok(request) => request,
                    Err(e) => {
                        warn!("[{}] Malformed debug request on {}: {}", self.id, id, e);
                        entry.reject(RpcError::new(
                            kiln_rpc::PROTOCOL_VIOLATION,
                            format!("Malformed debug request: {e}"),
                        ));
                        return Ok(());
                    }
                };
                // The read loop serves every stream on the connection, so it never waits here
                match tx.try_send(RelayInput::Message(request)) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!("[{}] Debug stream {} input overflowed", self.id, id);
                        entry.reject(RpcError::new(
                            kiln_rpc::BACKEND_UNAVAILABLE,
                            "Debugger is not consuming its input",
                        ));
                    }
                    Err(TrySendError::Closed(_)) => {
                        trace!("[{}] Debug stream {} no longer reading", self.id, id);
                    }
                }
            }
        }
        Ok(())
    }

    /// Route a `stream.close` half-close.
    ///
    /// # Errors
    ///
    /// Returns `DaemonError::StreamNotFound` if no such stream is open.
    pub async fn stream_close(&self, id: &RequestId) -> Result<()> {
        let streams = self.streams.lock().await;
        let entry = streams
            .get(id)
            .ok_or_else(|| DaemonError::StreamNotFound(id.clone()))?;
        match &entry.input {
            StreamInput::None => {}
            StreamInput::Watch => entry.cancel.cancel(),
            StreamInput::Debug(tx) => {
                if let Err(TrySendError::Full(close)) = tx.try_send(RelayInput::Close) {
                    // Queued behind pending input; delivered once the relay catches up
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let _ = tx.send(close).await;
                    });
                }
            }
        }
        Ok(())
    }

    /// Route a `stream.cancel`.
    ///
    /// # Errors
    ///
    /// Returns `DaemonError::StreamNotFound` if no such stream is open.
    pub async fn stream_cancel(&self, id: &RequestId) -> Result<()> {
        let streams = self.streams.lock().await;
        let entry = streams
            .get(id)
            .ok_or_else(|| DaemonError::StreamNotFound(id.clone()))?;
        debug!("[{}] Stream {} cancelled by client", self.id, id);
        entry.cancel.cancel();
        Ok(())
    }

    /// Cancel every open stream; used when the connection closes.
    pub async fn cancel_all(&self) {
        let streams = self.streams.lock().await;
        if !streams.is_empty() {
            debug!("[{}] Cancelling {} open streams", self.id, streams.len());
        }
        for entry in streams.values() {
            entry.cancel.cancel();
        }
    }

    pub async fn open_streams(&self) -> usize {
        self.streams.lock().await.len()
    }
}
