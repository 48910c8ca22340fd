use std::collections::{HashSet, VecDeque};
use std::fmt;

use serde::Serialize;
use shaderlink_protocol::MessageId;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
    Unhealthy,
}

impl ConnectionPhase {
    /// A transport is open, whatever its health.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Connected | Self::Degraded | Self::Unhealthy)
    }
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        })
    }
}

/// Read-only view of the connection. Only the manager's own loops write it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub phase: ConnectionPhase,
    pub last_activity: Option<Instant>,
    pub consecutive_failures: u32,
    pub unhealthy_checks: u32,
    pub awaiting_pong: bool,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            phase: ConnectionPhase::Disconnected,
            last_activity: None,
            consecutive_failures: 0,
            unhealthy_checks: 0,
            awaiting_pong: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    PhaseChanged {
        from: ConnectionPhase,
        to: ConnectionPhase,
    },
    /// Consecutive failures crossed the notice threshold. Sent once until
    /// the connection comes back.
    ConnectionLost { consecutive_failures: u32 },
    Restored,
}

/// Bounded memory of recently received envelope ids.
#[derive(Debug)]
pub(crate) struct SeenIds {
    capacity: usize,
    order: VecDeque<MessageId>,
    ids: HashSet<MessageId>,
}

impl SeenIds {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
        }
    }

    /// `false` if `id` was already seen.
    pub(crate) fn insert(&mut self, id: &MessageId) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity
            && let Some(oldest) = self.order.pop_front()
        {
            self.ids.remove(&oldest);
        }
        self.order.push_back(id.clone());
        self.ids.insert(id.clone());
        true
    }
}
