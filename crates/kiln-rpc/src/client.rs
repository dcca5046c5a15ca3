//! RPC client for connecting to the kiln daemon.
//!
//! Responses are matched to pending requests by id; stream frames are routed
//! to per-stream channels registered before the opening request is sent.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use kiln_types::{
    BoardDelta, DebugConfigRequest, DebugRequest, DebugResponse, DebugSessionConfig,
    DetectedPort, InstanceId, ProgressEvent,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::net::UnixStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio_util::codec::Framed;
use tracing::{debug, trace, warn};

use crate::helpers::{StreamFrame, parse_stream_frame, stream_ref, stream_send};
use crate::protocol::{
    BoardListParams, BoardListResult, CompileParams, CreateInstanceResult, InitParams,
    InstanceParams,
    Message, Notification, PlatformInstallParams, Request, RequestId, Response, RpcError,
    StatusResult, TRANSPORT_CLOSED, WatchControl, methods,
};
use crate::transport::{CodecError, JsonRpcCodec, MAX_DEBUG_CHUNK};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const STREAM_BUFFER: usize = 64;
const NOTIFICATION_BUFFER: usize = 64;

fn runtime_dir() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR").map_or_else(|_| std::env::temp_dir(), PathBuf::from)
}

fn is_dev_build() -> bool {
    let Ok(exe) = std::env::current_exe() else {
        return false;
    };
    let in_target_debug = exe.parent().is_some_and(|p| p.ends_with("target/debug"));
    let is_kiln_binary = exe
        .file_name()
        .and_then(|f| f.to_str())
        .is_some_and(|name| matches!(name, "kiln" | "kiln-daemon"));
    in_target_debug && is_kiln_binary
}

/// Get the socket path for the kiln daemon.
///
/// Prefers `$XDG_RUNTIME_DIR`, falling back to the system temp directory.
/// Debug builds of the kiln binaries use a separate socket.
#[must_use]
pub fn socket_path() -> PathBuf {
    let name = if is_dev_build() {
        "kiln-dev.sock"
    } else {
        "kiln.sock"
    };
    runtime_dir().join(name)
}

/// Errors that can occur with the RPC client
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("RPC error: {code} - {message}")]
    Rpc { code: i32, message: String },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Request timeout")]
    Timeout,

    #[error("Unexpected response type")]
    UnexpectedResponse,
}

impl From<RpcError> for ClientError {
    fn from(e: RpcError) -> Self {
        ClientError::Rpc {
            code: e.code,
            message: e.message,
        }
    }
}

impl ClientError {
    /// RPC error code, if the daemon answered with one.
    #[must_use]
    pub fn code(&self) -> Option<i32> {
        match self {
            ClientError::Rpc { code, .. } => Some(*code),
            _ => None,
        }
    }
}

type SharedSink = Arc<Mutex<SplitSink<Framed<UnixStream, JsonRpcCodec>, Message>>>;
type PendingRequest = oneshot::Sender<Result<Response, ClientError>>;
type PendingMap = Arc<Mutex<HashMap<RequestId, PendingRequest>>>;
type StreamRoutes = Arc<Mutex<HashMap<RequestId, mpsc::Sender<StreamFrame>>>>;

/// RPC client for communicating with the kiln daemon
pub struct RpcClient {
    sink: SharedSink,
    pending: PendingMap,
    streams: StreamRoutes,
    notifications: mpsc::Receiver<Notification>,
    next_id: AtomicU64,
    reader: AbortHandle,
}

impl RpcClient {
    /// Connect to the kiln daemon at the default socket path.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Io` if the socket connection fails.
    pub async fn connect() -> Result<Self, ClientError> {
        Self::connect_to(socket_path()).await
    }

    /// Connect to the kiln daemon at a custom socket path.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Io` if the socket connection fails.
    pub async fn connect_to(path: PathBuf) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(&path).await?;
        let (sink, mut stream) = Framed::new(stream, JsonRpcCodec::new()).split();

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let streams: StreamRoutes = Arc::new(Mutex::new(HashMap::new()));
        let (notification_tx, notifications) = mpsc::channel(NOTIFICATION_BUFFER);

        let reader_pending = pending.clone();
        let reader_streams = streams.clone();
        let reader = tokio::spawn(async move {
            while let Some(result) = stream.next().await {
                match result {
                    Ok(Message::Response(resp)) => {
                        if let Some(tx) = reader_pending.lock().await.remove(&resp.id) {
                            let _ = tx.send(Ok(resp));
                        }
                    }
                    Ok(msg) => {
                        let Some(notification) = msg.into_notification() else {
                            debug!("Ignoring request sent by daemon");
                            continue;
                        };
                        if let Some((id, frame)) = parse_stream_frame(&notification) {
                            route_frame(&reader_streams, id, frame).await;
                        } else if notification_tx.try_send(notification).is_err() {
                            trace!("Dropping notification, nobody is listening");
                        }
                    }
                    Err(e) => {
                        warn!("Connection read error: {}", e);
                        break;
                    }
                }
            }

            for (_, tx) in reader_pending.lock().await.drain() {
                let _ = tx.send(Err(ClientError::ConnectionClosed));
            }
            // Dropping the senders tells every open stream the transport is gone
            reader_streams.lock().await.clear();
            debug!("Client reader stopped");
        });

        Ok(Self {
            sink: Arc::new(Mutex::new(sink)),
            pending,
            streams,
            notifications,
            next_id: AtomicU64::new(1),
            reader: reader.abort_handle(),
        })
    }

    fn next_request_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn call(
        &self,
        id: RequestId,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        let request = Request::new(method, params, id.clone());
        if let Err(e) = self.sink.lock().await.send(Message::Request(request)).await {
            self.pending.lock().await.remove(&id);
            return Err(e.into());
        }

        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(received) => received.map_err(|_| ClientError::ConnectionClosed)??,
            Err(_) => {
                self.pending.lock().await.remove(&id);
                return Err(ClientError::Timeout);
            }
        };

        if let Some(error) = response.error {
            return Err(error.into());
        }
        response.result.ok_or(ClientError::UnexpectedResponse)
    }

    /// Send an RPC request and wait for a response.
    ///
    /// # Errors
    ///
    /// Returns an error if sending fails, the connection closes, or deserialization fails.
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<T, ClientError> {
        self.request_with_timeout(method, params, REQUEST_TIMEOUT)
            .await
    }

    /// Like [`request`](Self::request) with an explicit response deadline.
    ///
    /// # Errors
    ///
    /// Returns an error if sending fails, the connection closes, or deserialization fails.
    pub async fn request_with_timeout<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<T, ClientError> {
        let id = self.next_request_id();
        let result = self.call(id, method, params, timeout).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Send a notification (no response expected).
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Codec` if sending fails.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ClientError> {
        let notification = Notification::new(method, params);
        self.sink
            .lock()
            .await
            .send(Message::Notification(notification))
            .await?;
        Ok(())
    }

    /// Next daemon notification that is not a stream frame.
    pub async fn recv(&mut self) -> Option<Notification> {
        self.notifications.recv().await
    }

    /// Open a stream. The stream id is the id of the opening request.
    ///
    /// # Errors
    ///
    /// Returns the daemon's error if it refused to open the stream.
    pub async fn open_stream(
        &self,
        method: &str,
        params: Value,
    ) -> Result<ClientStream, ClientError> {
        let id = self.next_request_id();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        self.streams.lock().await.insert(id.clone(), tx);

        match self.call(id.clone(), method, Some(params), REQUEST_TIMEOUT).await {
            Ok(opened) => Ok(ClientStream {
                id,
                opened,
                rx,
                sink: self.sink.clone(),
                finished: false,
            }),
            Err(e) => {
                self.streams.lock().await.remove(&id);
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Typed helpers
    // ------------------------------------------------------------------------

    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn create_instance(&self) -> Result<InstanceId, ClientError> {
        let result: CreateInstanceResult =
            self.request(methods::CREATE_INSTANCE, Some(json!({}))).await?;
        Ok(result.instance)
    }

    /// # Errors
    ///
    /// Returns an error if the request fails or the instance is unknown.
    pub async fn destroy_instance(&self, instance: InstanceId) -> Result<(), ClientError> {
        let _: Value = self
            .request(
                methods::DESTROY_INSTANCE,
                Some(serde_json::to_value(InstanceParams { instance })?),
            )
            .await?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the daemon refuses to start the operation.
    pub async fn init(&self, instance: InstanceId) -> Result<OperationStream, ClientError> {
        self.init_with(InitParams::new(instance)).await
    }

    /// `init` that also takes target defaults from a sketch, optionally
    /// through one of its profiles.
    ///
    /// # Errors
    ///
    /// Returns an error if the daemon refuses to start the operation.
    pub async fn init_with(&self, params: InitParams) -> Result<OperationStream, ClientError> {
        let params = serde_json::to_value(params)?;
        Ok(OperationStream::new(
            self.open_stream(methods::INIT, params).await?,
        ))
    }

    /// One-shot discovery snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if discovery fails or does not answer within `timeout_ms`.
    pub async fn board_list(
        &self,
        instance: InstanceId,
        timeout_ms: u64,
    ) -> Result<Vec<DetectedPort>, ClientError> {
        let params = serde_json::to_value(BoardListParams {
            instance,
            timeout_ms,
        })?;
        let deadline = REQUEST_TIMEOUT.max(Duration::from_millis(timeout_ms) * 2);
        let result: BoardListResult = self
            .request_with_timeout(methods::BOARD_LIST, Some(params), deadline)
            .await?;
        Ok(result.ports)
    }

    /// # Errors
    ///
    /// Returns an error if the daemon refuses the subscription.
    pub async fn board_list_watch(&self, instance: InstanceId) -> Result<WatchStream, ClientError> {
        let params = serde_json::to_value(InstanceParams { instance })?;
        Ok(WatchStream {
            inner: self.open_stream(methods::BOARD_LIST_WATCH, params).await?,
        })
    }

    /// # Errors
    ///
    /// Returns an error if the daemon refuses to start the operation.
    pub async fn platform_install(
        &self,
        params: PlatformInstallParams,
    ) -> Result<OperationStream, ClientError> {
        let params = serde_json::to_value(params)?;
        Ok(OperationStream::new(
            self.open_stream(methods::PLATFORM_INSTALL, params).await?,
        ))
    }

    /// # Errors
    ///
    /// Returns an error if the daemon refuses to start the operation.
    pub async fn compile(&self, params: CompileParams) -> Result<OperationStream, ClientError> {
        let params = serde_json::to_value(params)?;
        Ok(OperationStream::new(
            self.open_stream(methods::COMPILE, params).await?,
        ))
    }

    /// Resolve a debug configuration without starting a backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the target cannot be resolved.
    pub async fn get_debug_config(
        &self,
        request: DebugConfigRequest,
    ) -> Result<DebugSessionConfig, ClientError> {
        self.request(
            methods::GET_DEBUG_CONFIG,
            Some(serde_json::to_value(request)?),
        )
        .await
    }

    /// Start a debug session. Returns once the backend is running.
    ///
    /// # Errors
    ///
    /// Returns an error if negotiation fails or the backend cannot start.
    pub async fn debug(&self, request: DebugConfigRequest) -> Result<DebugStream, ClientError> {
        let params = serde_json::to_value(DebugRequest::open(request))?;
        let inner = self.open_stream(methods::DEBUG, params).await?;
        let config = serde_json::from_value(inner.opened().clone())?;
        Ok(DebugStream { inner, config })
    }

    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn status(&self) -> Result<StatusResult, ClientError> {
        self.request(methods::STATUS, None).await
    }

    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        let _: Value = self.request(methods::SHUTDOWN, None).await?;
        Ok(())
    }
}

/// Hand a frame to its stream without waiting on the consumer.
///
/// A consumer more than `STREAM_BUFFER` frames behind loses its route: it
/// reads what was buffered and then sees the stream end early.
async fn route_frame(streams: &StreamRoutes, id: RequestId, frame: StreamFrame) {
    let mut routes = streams.lock().await;
    let Some(tx) = routes.get(&id) else {
        trace!("Frame for unknown stream {}", id);
        return;
    };
    let is_end = matches!(frame, StreamFrame::End(_));
    match tx.try_send(frame) {
        Ok(()) if is_end => {
            routes.remove(&id);
        }
        Ok(()) => {}
        Err(TrySendError::Full(end)) if is_end => {
            // Nothing follows an end, so it may wait for the consumer
            if let Some(tx) = routes.remove(&id) {
                tokio::spawn(async move {
                    let _ = tx.send(end).await;
                });
            }
        }
        Err(TrySendError::Full(_)) => {
            warn!("Stream {} is not being read, dropping it", id);
            routes.remove(&id);
        }
        Err(TrySendError::Closed(_)) => {
            routes.remove(&id);
        }
    }
}

/// The socket closes once the client and its open streams are dropped
impl Drop for RpcClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Client end of one stream
pub struct ClientStream {
    id: RequestId,
    opened: Value,
    rx: mpsc::Receiver<StreamFrame>,
    sink: SharedSink,
    finished: bool,
}

impl ClientStream {
    #[must_use]
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Result of the opening request.
    #[must_use]
    pub fn opened(&self) -> &Value {
        &self.opened
    }

    /// Next item of the stream.
    ///
    /// Returns `None` after a clean end. An end carrying an error, the
    /// connection dropping, or the stream falling too far behind yields one
    /// final `Err`.
    pub async fn next_item<T: DeserializeOwned>(&mut self) -> Option<Result<T, ClientError>> {
        if self.finished {
            return None;
        }
        match self.rx.recv().await {
            Some(StreamFrame::Item(item)) => Some(serde_json::from_value(item).map_err(Into::into)),
            Some(StreamFrame::End(None)) => {
                self.finished = true;
                None
            }
            Some(StreamFrame::End(Some(error))) => {
                self.finished = true;
                Some(Err(error.into()))
            }
            None => {
                self.finished = true;
                // The route is gone; make sure the daemon stops producing too
                let notification = stream_ref(methods::STREAM_CANCEL, &self.id);
                let _ = self
                    .sink
                    .lock()
                    .await
                    .send(Message::Notification(notification))
                    .await;
                Some(Err(ClientError::ConnectionClosed))
            }
        }
    }

    /// Send one inbound item on a bidirectional stream.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or sending fails.
    pub async fn send<T: Serialize>(&self, item: &T) -> Result<(), ClientError> {
        let notification = stream_send(&self.id, item)?;
        self.sink
            .lock()
            .await
            .send(Message::Notification(notification))
            .await?;
        Ok(())
    }

    /// Half-close: no more inbound items will be sent.
    ///
    /// # Errors
    ///
    /// Returns an error if sending fails.
    pub async fn close(&self) -> Result<(), ClientError> {
        let notification = stream_ref(methods::STREAM_CLOSE, &self.id);
        self.sink
            .lock()
            .await
            .send(Message::Notification(notification))
            .await?;
        Ok(())
    }

    /// Abandon the stream.
    ///
    /// # Errors
    ///
    /// Returns an error if sending fails.
    pub async fn cancel(mut self) -> Result<(), ClientError> {
        self.finished = true;
        let notification = stream_ref(methods::STREAM_CANCEL, &self.id);
        self.sink
            .lock()
            .await
            .send(Message::Notification(notification))
            .await?;
        Ok(())
    }
}

impl Drop for ClientStream {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let sink = self.sink.clone();
        let notification = stream_ref(methods::STREAM_CANCEL, &self.id);
        handle.spawn(async move {
            let _ = sink
                .lock()
                .await
                .send(Message::Notification(notification))
                .await;
        });
    }
}

/// How a long-running operation ended
#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutcome {
    Completed(Value),
    Failed(String),
    /// The stream closed without a terminal event; the outcome is unknown
    TransportClosed(String),
}

impl OperationOutcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, OperationOutcome::Completed(_))
    }
}

/// Progress stream of `init`, `platform_install` or `compile`
pub struct OperationStream {
    inner: ClientStream,
}

impl OperationStream {
    fn new(inner: ClientStream) -> Self {
        Self { inner }
    }

    pub async fn next_event(&mut self) -> Option<Result<ProgressEvent, ClientError>> {
        self.inner.next_item().await
    }

    /// Consume the stream, passing every event to `on_event`, and report the outcome.
    ///
    /// Success is only reported when a terminal `Completed` event was seen.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed events or unexpected daemon errors.
    pub async fn outcome(
        mut self,
        mut on_event: impl FnMut(&ProgressEvent),
    ) -> Result<OperationOutcome, ClientError> {
        let mut terminal = None;
        while let Some(next) = self.next_event().await {
            match next {
                Ok(event) => {
                    on_event(&event);
                    if event.is_terminal() && terminal.is_none() {
                        terminal = Some(event);
                    }
                }
                Err(ClientError::Rpc { code, message }) if code == TRANSPORT_CLOSED => {
                    return Ok(OperationOutcome::TransportClosed(message));
                }
                Err(ClientError::ConnectionClosed) => {
                    return Ok(OperationOutcome::TransportClosed(
                        "connection closed".to_string(),
                    ));
                }
                Err(e) => return Err(e),
            }
        }

        Ok(match terminal {
            Some(ProgressEvent::Completed { result }) => OperationOutcome::Completed(result),
            Some(ProgressEvent::Failed { message }) => OperationOutcome::Failed(message),
            _ => OperationOutcome::TransportClosed(
                "stream ended without a terminal event".to_string(),
            ),
        })
    }

    /// # Errors
    ///
    /// Returns an error if sending fails.
    pub async fn cancel(self) -> Result<(), ClientError> {
        self.inner.cancel().await
    }
}

/// Delta stream of `board_list_watch`
pub struct WatchStream {
    inner: ClientStream,
}

impl WatchStream {
    pub async fn next_delta(&mut self) -> Option<Result<BoardDelta, ClientError>> {
        self.inner.next_item().await
    }

    /// Ask the daemon to end the subscription.
    ///
    /// # Errors
    ///
    /// Returns an error if sending fails.
    pub async fn stop(&self) -> Result<(), ClientError> {
        self.inner.send(&WatchControl { interrupt: true }).await
    }
}

/// Bidirectional byte relay of a `debug` session
pub struct DebugStream {
    inner: ClientStream,
    config: DebugSessionConfig,
}

impl DebugStream {
    #[must_use]
    pub fn config(&self) -> &DebugSessionConfig {
        &self.config
    }

    /// Forward raw bytes to the debugger, split so every frame fits the
    /// transport limit.
    ///
    /// # Errors
    ///
    /// Returns an error if sending fails.
    pub async fn send(&self, data: &[u8]) -> Result<(), ClientError> {
        for chunk in data.chunks(MAX_DEBUG_CHUNK) {
            self.inner.send(&DebugRequest::data(chunk.to_vec())).await?;
        }
        Ok(())
    }

    /// Interrupt the debugger.
    ///
    /// # Errors
    ///
    /// Returns an error if sending fails.
    pub async fn interrupt(&self) -> Result<(), ClientError> {
        self.inner.send(&DebugRequest::interrupt()).await
    }

    /// Close the client side; the daemon drains output and ends the stream.
    ///
    /// # Errors
    ///
    /// Returns an error if sending fails.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.inner.close().await
    }

    /// Send an arbitrary message, including ones the daemon will reject.
    ///
    /// # Errors
    ///
    /// Returns an error if sending fails.
    pub async fn send_raw(&self, request: &DebugRequest) -> Result<(), ClientError> {
        self.inner.send(request).await
    }

    pub async fn next_response(&mut self) -> Option<Result<DebugResponse, ClientError>> {
        self.inner.next_item().await
    }
}
