//! Debug sessions: target resolution, backend launch and the byte relay.

pub mod backend;
mod relay;
mod resolver;

pub use relay::{DebugSession, RelayInput, negotiate, opening_request};
pub use resolver::resolve;
