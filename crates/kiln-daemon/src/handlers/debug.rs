//! `get_debug_config` and the bidirectional `debug` stream.
//!
//! The opening response of a `debug` call is held back until the debugger
//! is running: it carries the resolved session config on success or the
//! negotiation error otherwise. Client frames are routed into the session
//! from the moment the stream is registered, so anything sent while the
//! backend starts is seen by negotiation.

use std::sync::Arc;

use kiln_core::Error as CoreError;
use kiln_core::debug::RelayInput;
use kiln_rpc::parse_params;
use kiln_rpc::protocol::{RequestId, Response};
use kiln_types::{DebugConfigRequest, DebugRequest, DebugResponse};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{HandlerContext, Reply};
use crate::error::{DaemonError, Result, core_error_to_rpc};
use crate::server::DaemonState;
use crate::session::{Connection, StreamEntry, StreamInput};

pub async fn handle_get_debug_config(
    ctx: &HandlerContext,
    params: Option<&Value>,
) -> Result<Reply> {
    let req: DebugConfigRequest = parse_params(params)?;
    let config = ctx.state.core.debug_config(&req).await?;
    Ok(Reply::Value(serde_json::to_value(config)?))
}

pub async fn handle_debug(
    ctx: &HandlerContext,
    id: &RequestId,
    params: Option<&Value>,
) -> Result<Reply> {
    let first: DebugRequest = parse_params(params)?;
    let buffer = ctx.state.core.event_buffer().await;
    let (input_tx, input_rx) = mpsc::channel(buffer.max(1));
    let cancel = CancellationToken::new();
    ctx.conn
        .open_stream(
            id.clone(),
            StreamEntry::new(cancel.clone(), StreamInput::Debug(input_tx)),
        )
        .await?;

    tokio::spawn(run_session(
        ctx.state.clone(),
        ctx.conn.clone(),
        id.clone(),
        first,
        input_rx,
        cancel,
    ));
    Ok(Reply::Sent)
}

async fn run_session(
    state: Arc<DaemonState>,
    conn: Connection,
    stream: RequestId,
    first: DebugRequest,
    mut inbound: mpsc::Receiver<RelayInput>,
    cancel: CancellationToken,
) {
    let negotiated = tokio::select! {
        session = state.core.start_debug(first, &mut inbound) => session,
        () = cancel.cancelled() => Err(CoreError::Cancelled),
    };

    let session = match negotiated {
        Ok(session) => session,
        Err(e) => {
            debug!("[{}] Debug negotiation on {} failed: {}", conn.id, stream, e);
            let error = conn
                .rejection(&stream)
                .await
                .unwrap_or_else(|| core_error_to_rpc(&e));
            conn.forget_stream(&stream).await;
            conn.respond(Response::error(stream, error));
            return;
        }
    };

    match serde_json::to_value(session.config()) {
        Ok(config) => {
            conn.respond(Response::success(stream.clone(), config));
        }
        Err(e) => {
            conn.forget_stream(&stream).await;
            conn.respond(Response::error(stream, DaemonError::from(e).into()));
            return;
        }
    }
    info!("[{}] Debug session {} active", conn.id, stream);

    let buffer = state.core.event_buffer().await;
    let (out_tx, out_rx) = mpsc::channel(buffer.max(1));
    let forward = tokio::spawn(forward_output(conn.clone(), stream.clone(), out_rx));

    let result = session.relay(inbound, out_tx, cancel).await;
    // Every byte the backend wrote goes out before the end marker
    let _ = forward.await;

    let error = match result {
        Ok(()) => None,
        Err(e) => {
            debug!("[{}] Debug session {} ended: {}", conn.id, stream, e);
            Some(core_error_to_rpc(&e))
        }
    };
    info!("[{}] Debug session {} closed", conn.id, stream);
    conn.end_stream(&stream, error).await;
}

async fn forward_output(
    conn: Connection,
    stream: RequestId,
    mut responses: mpsc::Receiver<DebugResponse>,
) {
    while let Some(response) = responses.recv().await {
        if !conn.send_item(&stream, &response) {
            break;
        }
    }
}
