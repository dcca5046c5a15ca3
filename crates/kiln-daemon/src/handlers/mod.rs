//! Request handlers for the daemon.
//!
//! Handlers are grouped by the part of the core they drive:
//! - Instance lifecycle and daemon control (`create_instance`, `status`, ...)
//! - Long-running operations (`init`, `platform_install`, `compile`)
//! - Board discovery (`board_list`, `board_list_watch`)
//! - Debugging (`get_debug_config`, `debug`)
//!
//! Streaming handlers send their own opening response before any item of
//! the stream, so they report [`Reply::Sent`] instead of a value.

mod debug;
mod discovery;
mod instance;
mod operation;

use std::sync::Arc;

use kiln_rpc::protocol::{
    Notification, Request, RequestId, Response, StreamItemParams, StreamOpened, StreamRefParams,
    methods,
};
use kiln_rpc::parse_params;
use serde_json::{Value, json};
use tracing::{debug, trace};

use crate::error::{DaemonError, Result};
use crate::server::DaemonState;
use crate::session::Connection;

pub struct HandlerContext {
    pub state: Arc<DaemonState>,
    pub conn: Connection,
}

impl HandlerContext {
    /// Send the `{"stream": id}` response that opens a server stream.
    pub(crate) fn confirm_stream(&self, stream: &RequestId) -> Result<()> {
        let opened = serde_json::to_value(StreamOpened {
            stream: stream.clone(),
        })?;
        self.conn.respond(Response::success(stream.clone(), opened));
        Ok(())
    }
}

/// What a handler produced for its request
#[derive(Debug)]
pub enum Reply {
    /// Answer the request with this result
    Value(Value),
    /// The handler answered, or will answer, on its own
    Sent,
}

/// Handle a request, returning the response to send if there is one yet.
pub async fn handle_request(ctx: &HandlerContext, request: Request) -> Option<Response> {
    let Some(id) = request.id.clone() else {
        debug!("Request without id reached the request handler");
        return None;
    };
    trace!("[{}] Request {} id={}", ctx.conn.id, request.method, id);
    let params = request.params.as_ref();

    let result = match request.method.as_str() {
        methods::CREATE_INSTANCE => instance::handle_create(ctx).await,
        methods::DESTROY_INSTANCE => instance::handle_destroy(ctx, params).await,
        methods::STATUS => instance::handle_status(ctx).await,
        methods::SHUTDOWN => Ok(instance::handle_shutdown(ctx)),

        methods::INIT => operation::handle_init(ctx, &id, params).await,
        methods::PLATFORM_INSTALL => operation::handle_platform_install(ctx, &id, params).await,
        methods::COMPILE => operation::handle_compile(ctx, &id, params).await,

        methods::BOARD_LIST => discovery::handle_board_list(ctx, &id, params),
        methods::BOARD_LIST_WATCH => discovery::handle_board_list_watch(ctx, &id, params).await,

        methods::GET_DEBUG_CONFIG => debug::handle_get_debug_config(ctx, params).await,
        methods::DEBUG => debug::handle_debug(ctx, &id, params).await,

        // Stream frames sent as requests get an acknowledgement or STREAM_NOT_FOUND
        methods::STREAM_SEND | methods::STREAM_CLOSE | methods::STREAM_CANCEL => {
            route_stream_frame(ctx, &request.method, params)
                .await
                .map(|()| Reply::Value(json!({})))
        }

        other => Err(DaemonError::MethodNotFound(other.to_string())),
    };

    match result {
        Ok(Reply::Value(value)) => Some(Response::success(id, value)),
        Ok(Reply::Sent) => None,
        Err(e) => {
            debug!("[{}] {} failed: {}", ctx.conn.id, request.method, e);
            Some(Response::error(id, e.into()))
        }
    }
}

/// Handle a notification. Only stream frames are meaningful.
///
/// # Errors
///
/// Returns an error for malformed params or frames naming unknown streams.
pub async fn handle_notification(ctx: &HandlerContext, notification: &Notification) -> Result<()> {
    match notification.method.as_str() {
        methods::STREAM_SEND | methods::STREAM_CLOSE | methods::STREAM_CANCEL => {
            route_stream_frame(ctx, &notification.method, notification.params.as_ref()).await
        }
        other => {
            debug!("[{}] Ignoring notification: {}", ctx.conn.id, other);
            Ok(())
        }
    }
}

async fn route_stream_frame(ctx: &HandlerContext, method: &str, params: Option<&Value>) -> Result<()> {
    match method {
        methods::STREAM_SEND => {
            let params: StreamItemParams = parse_params(params)?;
            ctx.conn.stream_send(&params.stream, params.item).await
        }
        methods::STREAM_CLOSE => {
            let params: StreamRefParams = parse_params(params)?;
            ctx.conn.stream_close(&params.stream).await
        }
        _ => {
            let params: StreamRefParams = parse_params(params)?;
            ctx.conn.stream_cancel(&params.stream).await
        }
    }
}
