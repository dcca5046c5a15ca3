//! Error types for the kiln daemon.

use kiln_rpc::protocol::{self, RequestId, RpcError};

/// Errors that can occur in the daemon
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Core error
    #[error("{0}")]
    Core(#[from] kiln_core::Error),

    /// Codec error
    #[error("Codec error: {0}")]
    Codec(#[from] kiln_rpc::transport::CodecError),

    /// Invalid parameters
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    /// Method not found
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    /// No open stream with this id on the connection
    #[error("Stream not found: {0}")]
    StreamNotFound(RequestId),

    /// A request reused the id of a stream that is still open
    #[error("Stream {0} is already open")]
    StreamInUse(RequestId),

    /// File watcher error
    #[error("Watcher error: {0}")]
    Watcher(#[from] notify::Error),

    /// An error received as an RPC error object, kept with its code
    #[error("{0}")]
    Rpc(RpcError),
}

/// Map a core error to the RPC error a client sees.
#[must_use]
pub fn core_error_to_rpc(err: &kiln_core::Error) -> RpcError {
    use kiln_core::Error;

    match err {
        Error::InvalidInstance(id) => RpcError::invalid_instance(*id),
        Error::MissingTarget(_) => RpcError::new(protocol::MISSING_TARGET, err.to_string()),
        Error::UnsupportedTarget(_) => {
            RpcError::new(protocol::UNSUPPORTED_TARGET, err.to_string())
        }
        Error::BackendUnavailable(_) => {
            RpcError::new(protocol::BACKEND_UNAVAILABLE, err.to_string())
        }
        Error::ProtocolViolation(_) => {
            RpcError::new(protocol::PROTOCOL_VIOLATION, err.to_string())
        }
        Error::OperationFailed(_) => RpcError::new(protocol::OPERATION_FAILED, err.to_string()),
        Error::TransportClosed(_) | Error::Cancelled => RpcError::transport_closed(err.to_string()),
        Error::InvalidArgument(_) => RpcError::invalid_params(err.to_string()),
        Error::Timeout(_) => RpcError::new(protocol::TIMEOUT, err.to_string()),
        Error::Io(_) | Error::Json(_) | Error::Config(_) => {
            RpcError::internal_error(err.to_string())
        }
    }
}

impl From<DaemonError> for RpcError {
    fn from(err: DaemonError) -> Self {
        match err {
            DaemonError::Io(e) => RpcError::internal_error(e.to_string()),
            DaemonError::Json(e) => RpcError::internal_error(e.to_string()),
            DaemonError::Core(ref e) => core_error_to_rpc(e),
            DaemonError::Codec(e) => RpcError::internal_error(e.to_string()),
            DaemonError::InvalidParams(msg) => RpcError::invalid_params(msg),
            DaemonError::MethodNotFound(name) => RpcError::new(
                protocol::METHOD_NOT_FOUND,
                format!("Method not found: {name}"),
            ),
            DaemonError::StreamNotFound(ref id) => RpcError::stream_not_found(id),
            DaemonError::StreamInUse(_) => {
                RpcError::new(protocol::PROTOCOL_VIOLATION, err.to_string())
            }
            DaemonError::Watcher(ref e) => RpcError::internal_error(e.to_string()),
            DaemonError::Rpc(e) => e,
        }
    }
}

pub type Result<T> = std::result::Result<T, DaemonError>;

impl From<RpcError> for DaemonError {
    fn from(err: RpcError) -> Self {
        match err.code {
            protocol::INVALID_PARAMS => DaemonError::InvalidParams(err.message),
            protocol::METHOD_NOT_FOUND => DaemonError::MethodNotFound(err.message),
            _ => DaemonError::Rpc(err),
        }
    }
}
