//! Kiln daemon library providing the socket server.
//!
//! This crate serves the kiln core to clients over a Unix socket: instance
//! lifecycle, long-running operations, board discovery and debug sessions,
//! all as JSON-RPC calls and streams on one connection.

pub(crate) mod config_watcher;
pub mod error;
pub(crate) mod handlers;
pub mod logging;
pub mod server;
pub(crate) mod session;

pub use error::{DaemonError, Result, core_error_to_rpc};
pub use server::{DaemonState, ServerOptions, run, serve};
