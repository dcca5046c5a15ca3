//! Socket server implementation for the kiln daemon.
//!
//! Accepts client connections on a Unix socket and serves each on its own
//! task. Every connection has one writer task fed by a channel, so replies
//! and stream frames from concurrent handlers never interleave mid-message.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use kiln_core::KilnCore;
use kiln_core::config::Directories;
use kiln_rpc::client::socket_path;
use kiln_rpc::protocol::Message;
use kiln_rpc::transport::JsonRpcCodec;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config_watcher::{reload_on_change, watch_config};
use crate::error::{DaemonError, Result};
use crate::handlers::{HandlerContext, handle_notification, handle_request};
use crate::session::{Connection, ConnectionId};

/// How long a closing connection may take to flush queued frames
const CONNECTION_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
/// How long shutdown waits for connections to finish
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Where the daemon listens and where it finds its files
#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    /// Socket path (defaults to `$XDG_RUNTIME_DIR/kiln.sock`)
    pub socket_path: Option<PathBuf>,
    /// Config file (defaults to `~/.config/kiln/config.json`)
    pub config_file: Option<PathBuf>,
    /// Data directory, overriding the config file's `dataDir`
    pub data_dir: Option<PathBuf>,
}

pub struct DaemonState {
    pub core: KilnCore,
    connections: AtomicUsize,
    shutdown: CancellationToken,
}

impl DaemonState {
    #[must_use]
    pub fn new(core: KilnCore) -> Self {
        Self {
            core,
            connections: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }
}

fn directories(options: &ServerOptions) -> Result<Directories> {
    let mut dirs = Directories::new()?;
    if let Some(file) = &options.config_file {
        if let Some(parent) = file.parent().filter(|p| !p.as_os_str().is_empty()) {
            dirs.config = parent.to_path_buf();
        }
        dirs.config_file.clone_from(file);
    }
    Ok(dirs)
}

/// Run the daemon server until shutdown is requested.
///
/// # Errors
///
/// Returns an error if another daemon owns the socket, the config is invalid,
/// or the socket cannot be bound.
pub async fn run(options: ServerOptions) -> Result<()> {
    let path = options.socket_path.clone().unwrap_or_else(socket_path);

    cleanup_stale_socket(&path).await?;

    let core = KilnCore::load_with_data_dir(directories(&options)?, options.data_dir.clone())?;
    let state = Arc::new(DaemonState::new(core));

    let listener = UnixListener::bind(&path)?;
    info!("Daemon listening on {:?}", path);

    let (reload_tx, reload_rx) = mpsc::unbounded_channel();
    let _config_watcher = match watch_config(&state.core.dirs().config_file, reload_tx) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            warn!("Config hot-reload disabled: {}", e);
            None
        }
    };
    tokio::spawn(reload_on_change(state.clone(), reload_rx));

    let signal_state = state.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received");
            signal_state.request_shutdown();
        }
    });

    let result = serve(listener, state).await;

    if path.exists()
        && let Err(e) = std::fs::remove_file(&path)
    {
        warn!("Failed to remove socket file {:?}: {}", path, e);
    }

    result
}

/// Accept and serve connections on `listener` until shutdown is requested.
///
/// On shutdown every instance is destroyed, which stops its operations,
/// watches and debuggers.
///
/// # Errors
///
/// Currently infallible; accept errors are logged and retried.
pub async fn serve(listener: UnixListener, state: Arc<DaemonState>) -> Result<()> {
    let mut connections = JoinSet::new();

    info!("Ready to accept connections");
    loop {
        tokio::select! {
            () = state.shutdown.cancelled() => {
                info!("Shutdown requested, stopping server");
                break;
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    debug!("Accepted connection");
                    let state = state.clone();
                    connections.spawn(handle_connection(stream, state));
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }

    for id in state.core.instances().await {
        if let Err(e) = state.core.destroy_instance(id).await {
            debug!("Instance {} already gone: {}", id, e);
        }
    }

    let drained = tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!("Connections still open after shutdown timeout, dropping them");
        connections.abort_all();
    }

    Ok(())
}

async fn cleanup_stale_socket(path: &Path) -> Result<()> {
    if path.exists() {
        if UnixStream::connect(path).await.is_ok() {
            return Err(DaemonError::Io(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                "Another daemon is already running",
            )));
        }
        info!("Removing stale socket at {}", path.display());
        std::fs::remove_file(path)?;
    }
    Ok(())
}

async fn handle_connection(stream: UnixStream, state: Arc<DaemonState>) {
    let framed = Framed::new(stream, JsonRpcCodec::new());
    let (mut sink, mut stream) = framed.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let conn = Connection::new(ConnectionId::new(), tx);
    state.connections.fetch_add(1, Ordering::SeqCst);
    debug!("New connection: {}", conn.id);

    let conn_id = conn.id.clone();
    let send_task = tokio::spawn(async move {
        trace!("[{}] send_task started", conn_id);
        while let Some(msg) = rx.recv().await {
            if let Err(e) = sink.send(msg).await {
                warn!("Failed to send to {}: {}", conn_id, e);
                break;
            }
        }
        trace!("[{}] send_task ended", conn_id);
    });

    let ctx = HandlerContext {
        state: state.clone(),
        conn: conn.clone(),
    };

    loop {
        tokio::select! {
            () = state.shutdown.cancelled() => break,
            next = stream.next() => match next {
                Some(Ok(msg)) => process_message(&ctx, msg).await,
                Some(Err(e)) => {
                    warn!("Read error from {}: {}", conn.id, e);
                    break;
                }
                None => break,
            }
        }
    }

    debug!("Connection closed: {}", conn.id);
    conn.cancel_all().await;
    state.connections.fetch_sub(1, Ordering::SeqCst);

    // Stream tasks hold their own handles; the writer ends once they finish
    drop(ctx);
    drop(conn);
    let abort = send_task.abort_handle();
    if tokio::time::timeout(CONNECTION_DRAIN_TIMEOUT, send_task)
        .await
        .is_err()
    {
        abort.abort();
    }
}

async fn process_message(ctx: &HandlerContext, msg: Message) {
    match msg {
        Message::Request(request) if request.id.is_some() => {
            if let Some(response) = handle_request(ctx, request).await {
                ctx.conn.respond(response);
            }
        }
        Message::Response(response) => {
            debug!(
                "[{}] Ignoring response from client: id={:?}",
                ctx.conn.id, response.id
            );
        }
        other => {
            let Some(notification) = other.into_notification() else {
                return;
            };
            if let Err(e) = handle_notification(ctx, &notification).await {
                warn!(
                    "[{}] {} rejected: {}",
                    ctx.conn.id, notification.method, e
                );
            }
        }
    }
}
