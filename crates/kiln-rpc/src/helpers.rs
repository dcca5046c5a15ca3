//! Helpers for the stream conventions layered on JSON-RPC.
//!
//! A streaming call is a request whose id doubles as the stream id. Items and
//! the end marker travel as notifications that name that id.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::protocol::{
    Notification, RequestId, RpcError, StreamEndParams, StreamItemParams, StreamRefParams, methods,
};

/// A stream notification after routing
#[derive(Debug, Clone)]
pub enum StreamFrame {
    Item(Value),
    End(Option<RpcError>),
}

/// Build a `stream.item` notification.
///
/// # Errors
///
/// Returns an error if `item` fails to serialize.
pub fn stream_item<T: Serialize>(
    stream: &RequestId,
    item: &T,
) -> Result<Notification, serde_json::Error> {
    item_notification(methods::STREAM_ITEM, stream, item)
}

/// Build a `stream.send` notification.
///
/// # Errors
///
/// Returns an error if `item` fails to serialize.
pub fn stream_send<T: Serialize>(
    stream: &RequestId,
    item: &T,
) -> Result<Notification, serde_json::Error> {
    item_notification(methods::STREAM_SEND, stream, item)
}

fn item_notification<T: Serialize>(
    method: &str,
    stream: &RequestId,
    item: &T,
) -> Result<Notification, serde_json::Error> {
    let params = StreamItemParams {
        stream: stream.clone(),
        item: serde_json::to_value(item)?,
    };
    Ok(Notification::new(method, Some(serde_json::to_value(params)?)))
}

#[must_use]
pub fn stream_end(stream: &RequestId, error: Option<RpcError>) -> Notification {
    let params = StreamEndParams {
        stream: stream.clone(),
        error,
    };
    Notification::new(methods::STREAM_END, serde_json::to_value(params).ok())
}

/// Build a `stream.close` or `stream.cancel` notification.
#[must_use]
pub fn stream_ref(method: &str, stream: &RequestId) -> Notification {
    let params = StreamRefParams {
        stream: stream.clone(),
    };
    Notification::new(method, serde_json::to_value(params).ok())
}

/// Route a daemon notification to the stream it belongs to.
///
/// Returns `None` for notifications that are not stream frames.
#[must_use]
pub fn parse_stream_frame(notification: &Notification) -> Option<(RequestId, StreamFrame)> {
    let params = notification.params.clone()?;
    match notification.method.as_str() {
        methods::STREAM_ITEM => {
            let params: StreamItemParams = serde_json::from_value(params)
                .inspect_err(|e| tracing::warn!("Malformed stream.item: {}", e))
                .ok()?;
            Some((params.stream, StreamFrame::Item(params.item)))
        }
        methods::STREAM_END => {
            let params: StreamEndParams = serde_json::from_value(params)
                .inspect_err(|e| tracing::warn!("Malformed stream.end: {}", e))
                .ok()?;
            Some((params.stream, StreamFrame::End(params.error)))
        }
        _ => None,
    }
}

/// Deserialize method params, mapping failures to `INVALID_PARAMS`.
///
/// # Errors
///
/// Returns `RpcError::invalid_params` if params are missing or malformed.
pub fn parse_params<T: DeserializeOwned>(params: Option<&Value>) -> Result<T, RpcError> {
    let value = params.cloned().unwrap_or(Value::Null);
    serde_json::from_value(value).map_err(|e| RpcError::invalid_params(e.to_string()))
}
