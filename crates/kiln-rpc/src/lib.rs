//! JSON-RPC 2.0 protocol definitions for kiln.
//!
//! This crate provides the protocol types, the stream conventions layered on
//! top of them, the transport codec, and the client used by the CLI and tests.
//!
//! # Architecture
//!
//! - [`protocol`]: JSON-RPC 2.0 message types, error codes, method params
//! - [`helpers`]: `stream.*` notification builders and routing
//! - [`transport`]: Length-prefixed codec for message framing
//! - [`client`]: RPC client with typed helpers for every daemon method
//!
//! # Example
//!
//! ```no_run
//! use kiln_rpc::RpcClient;
//!
//! # async fn example() -> Result<(), kiln_rpc::ClientError> {
//! let client = RpcClient::connect().await?;
//! let instance = client.create_instance().await?;
//!
//! let outcome = client.init(instance).await?.outcome(|event| {
//!     println!("{event:?}");
//! }).await?;
//! assert!(outcome.is_success());
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod helpers;
pub mod protocol;
pub mod transport;

pub use client::{
    ClientError, ClientStream, DebugStream, OperationOutcome, OperationStream, RpcClient,
    WatchStream, socket_path,
};

pub use helpers::{StreamFrame, parse_params, parse_stream_frame, stream_end, stream_item};

pub use protocol::{
    BACKEND_UNAVAILABLE, BoardListParams, BoardListResult, CompileParams, CreateInstanceResult,
    INTERNAL_ERROR, INVALID_INSTANCE, INVALID_PARAMS, INVALID_REQUEST, InitParams, InstanceParams,
    JSONRPC_VERSION, METHOD_NOT_FOUND, MISSING_TARGET, Message, Notification, OPERATION_FAILED,
    PARSE_ERROR, PROTOCOL_VIOLATION, PlatformInstallParams, Request, RequestId, Response,
    RpcError, STREAM_NOT_FOUND, StatusResult, StreamEndParams, StreamItemParams, StreamOpened,
    StreamRefParams, TIMEOUT, TRANSPORT_CLOSED, UNSUPPORTED_TARGET, WatchControl, methods,
};

pub use transport::{CodecError, JsonRpcCodec, MAX_DEBUG_CHUNK, MAX_MESSAGE_SIZE};

pub use kiln_types::{
    BoardDelta, BoardListItem, DebugConfigRequest, DebugRequest, DebugResponse,
    DebugSessionConfig, DeltaKind, DetectedPort, InstanceId, OutputStream, Port, PortSet,
    ProgressEvent, ServerConfig, ToolchainConfig,
};
