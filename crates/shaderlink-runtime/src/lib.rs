//! # shaderlink-runtime
//!
//! The part of shaderlink that does work on a connection:
//!
//! - [`SessionController`] opens sessions with the peer, records history and
//!   dispatches inbound user requests.
//! - [`GenerationOrchestrator`] runs each request through
//!   generate → validate → repair, escalating to the user when retries run
//!   out.
//! - [`RemoteTools`] issues correlated `ToolCall`s to the peer.

mod config;
mod orchestrator;
mod session;
mod tools;

#[cfg(test)]
mod testing;

pub use config::RuntimeConfig;
pub use orchestrator::{GenerationOrchestrator, TaskRequest, TaskSnapshot};
pub use session::{SessionController, SessionInfo, SessionState};
pub use tools::{InFlightCall, RemoteTools};
