//! JSON-RPC 2.0 protocol types.
//!
//! Message envelopes, error codes, and the parameter/result shapes of every
//! daemon method.

use std::path::PathBuf;

use kiln_types::{DetectedPort, InstanceId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";
pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;
pub const INVALID_INSTANCE: i32 = -32000;
pub const MISSING_TARGET: i32 = -32001;
pub const UNSUPPORTED_TARGET: i32 = -32002;
pub const BACKEND_UNAVAILABLE: i32 = -32003;
pub const PROTOCOL_VIOLATION: i32 = -32004;
pub const OPERATION_FAILED: i32 = -32005;
pub const TRANSPORT_CLOSED: i32 = -32006;
pub const TIMEOUT: i32 = -32007;
pub const STREAM_NOT_FOUND: i32 = -32008;

/// Method names understood by the daemon.
pub mod methods {
    pub const CREATE_INSTANCE: &str = "create_instance";
    pub const DESTROY_INSTANCE: &str = "destroy_instance";
    pub const INIT: &str = "init";
    pub const BOARD_LIST: &str = "board_list";
    pub const BOARD_LIST_WATCH: &str = "board_list_watch";
    pub const PLATFORM_INSTALL: &str = "platform_install";
    pub const COMPILE: &str = "compile";
    pub const GET_DEBUG_CONFIG: &str = "get_debug_config";
    pub const DEBUG: &str = "debug";
    pub const STATUS: &str = "status";
    pub const SHUTDOWN: &str = "shutdown";

    /// Daemon to client: one stream item
    pub const STREAM_ITEM: &str = "stream.item";
    /// Daemon to client: end of stream, with an error when no terminal answer was produced
    pub const STREAM_END: &str = "stream.end";
    /// Client to daemon: one inbound item of a bidirectional stream
    pub const STREAM_SEND: &str = "stream.send";
    /// Client to daemon: half-close of a bidirectional stream
    pub const STREAM_CLOSE: &str = "stream.close";
    /// Client to daemon: abandon a stream
    pub const STREAM_CANCEL: &str = "stream.cancel";
}

/// JSON-RPC 2.0 Request ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<u64> for RequestId {
    fn from(n: u64) -> Self {
        RequestId::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_string())
    }
}

/// JSON-RPC 2.0 Request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
}

impl Request {
    #[must_use]
    pub fn new(method: impl Into<String>, params: Option<Value>, id: RequestId) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id: Some(id),
        }
    }
}

/// JSON-RPC 2.0 Response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: RequestId,
}

impl Response {
    #[must_use]
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    #[must_use]
    pub fn error(id: RequestId, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }
}

/// JSON-RPC 2.0 Notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    #[must_use]
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 Error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    #[must_use]
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    #[must_use]
    pub fn parse_error() -> Self {
        Self::new(PARSE_ERROR, "Parse error")
    }

    #[must_use]
    pub fn invalid_request() -> Self {
        Self::new(INVALID_REQUEST, "Invalid Request")
    }

    #[must_use]
    pub fn method_not_found() -> Self {
        Self::new(METHOD_NOT_FOUND, "Method not found")
    }

    #[must_use]
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }

    #[must_use]
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }

    #[must_use]
    pub fn invalid_instance(instance: InstanceId) -> Self {
        Self::new(INVALID_INSTANCE, format!("Invalid instance: {instance}"))
    }

    #[must_use]
    pub fn transport_closed(message: impl Into<String>) -> Self {
        Self::new(TRANSPORT_CLOSED, message)
    }

    #[must_use]
    pub fn stream_not_found(stream: &RequestId) -> Self {
        Self::new(STREAM_NOT_FOUND, format!("Stream not found: {stream}"))
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RPC error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

/// Incoming message that could be a request, response, or notification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

impl Message {
    /// Views a request without id as the notification it is.
    #[must_use]
    pub fn into_notification(self) -> Option<Notification> {
        match self {
            Message::Request(r) if r.id.is_none() => Some(Notification::new(r.method, r.params)),
            Message::Notification(n) => Some(n),
            _ => None,
        }
    }
}

// ============================================================================
// Method parameters and results
// ============================================================================

/// Parameters naming one instance (`destroy_instance`, `board_list_watch`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceParams {
    pub instance: InstanceId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitParams {
    pub instance: InstanceId,
    /// Sketch whose `sketch.json` supplies the instance's target defaults
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sketch_path: Option<PathBuf>,
    /// Profile of that sketch to apply
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
}

impl InitParams {
    #[must_use]
    pub fn new(instance: InstanceId) -> Self {
        Self {
            instance,
            sketch_path: None,
            profile: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateInstanceResult {
    pub instance: InstanceId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardListParams {
    pub instance: InstanceId,
    /// Upper bound on the wait, 0 selects the configured default
    #[serde(default)]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardListResult {
    pub ports: Vec<DetectedPort>,
}

/// Inbound message of a `board_list_watch` stream
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatchControl {
    #[serde(default)]
    pub interrupt: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformInstallParams {
    pub instance: InstanceId,
    pub platform_package: String,
    pub architecture: String,
    /// Empty or absent selects the latest indexed version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub skip_post_install: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileParams {
    pub instance: InstanceId,
    pub fqbn: String,
    pub sketch_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_path: Option<PathBuf>,
    #[serde(default)]
    pub verbose: bool,
}

/// Result of a request that opened a stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamOpened {
    pub stream: RequestId,
}

/// Params of `stream.item` and `stream.send`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamItemParams {
    pub stream: RequestId,
    pub item: Value,
}

/// Params of `stream.end`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEndParams {
    pub stream: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

/// Params of `stream.close` and `stream.cancel`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRefParams {
    pub stream: RequestId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResult {
    pub version: String,
    pub instances: Vec<InstanceId>,
    pub connections: usize,
}
