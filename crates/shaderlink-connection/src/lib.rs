//! Connection lifecycle for one logical link to the peer.
//!
//! ```text
//! Disconnected -> Connecting -> Connected <-> Degraded <-> Unhealthy
//!       ^                                                      |
//!       +------------------------------------------------------+
//! ```
//!
//! While connected, a receive loop decodes frames (routing replies through
//! the correlation registry before fanning them out) and a health loop
//! pings the peer when it goes quiet. Transport faults never
//! reach callers as errors; they surface only as phase changes and failed
//! sends.

mod manager;
mod state;

pub use manager::ConnectionManager;
pub use state::{ConnectionEvent, ConnectionPhase, ConnectionState};
