//! Correlation registry: maps an outstanding request id to the task waiting
//! for its reply.
//!
//! Every entry is completed exactly once. Resolution, cancellation, the
//! deadline sweep and reconnect expiry all race through the same map; the
//! one that removes the entry is the one that delivers.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use shaderlink_protocol::{LinkError, LinkResult, RequestId};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    UserCancelled,
    SessionClosed,
    Shutdown,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::UserCancelled => "user cancelled",
            Self::SessionClosed => "session closed",
            Self::Shutdown => "shutdown",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome<T> {
    Resolved(T),
    Cancelled(CancelReason),
    TimedOut,
}

impl<T> CallOutcome<T> {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved(_))
    }
}

struct PendingCall<T> {
    serial: u64,
    label: String,
    issued_at: Instant,
    deadline: Option<Instant>,
    sink: oneshot::Sender<CallOutcome<T>>,
}

impl<T> PendingCall<T> {
    fn deliver(self, request_id: &RequestId, outcome: CallOutcome<T>) {
        let waited_ms = self.issued_at.elapsed().as_millis();
        if self.sink.send(outcome).is_err() {
            debug!(request_id = %request_id, label = %self.label, waited_ms, "caller stopped waiting before completion");
        }
    }
}

struct Table<T> {
    next_serial: u64,
    calls: HashMap<RequestId, PendingCall<T>>,
}

/// Snapshot of one outstanding entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingInfo {
    pub request_id: RequestId,
    pub label: String,
    pub issued_at: Instant,
    pub deadline: Option<Instant>,
}

pub struct CorrelationRegistry<T> {
    table: Arc<Mutex<Table<T>>>,
}

impl<T> Clone for CorrelationRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            table: Arc::clone(&self.table),
        }
    }
}

impl<T> Default for CorrelationRegistry<T> {
    fn default() -> Self {
        Self {
            table: Arc::new(Mutex::new(Table {
                next_serial: 0,
                calls: HashMap::new(),
            })),
        }
    }
}

impl<T: Send + 'static> CorrelationRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in `request_id`. `timeout` of `None` waits until a
    /// reply or cancellation; that is reserved for human confirmations.
    ///
    /// A second registration for a live id is a caller bug and fails with
    /// [`LinkError::DuplicateRequest`].
    pub fn register(
        &self,
        request_id: RequestId,
        label: impl Into<String>,
        timeout: Option<Duration>,
    ) -> LinkResult<PendingReply<T>> {
        let label = label.into();
        let issued_at = Instant::now();
        let deadline = timeout.map(|timeout| issued_at + timeout);
        let (sink, rx) = oneshot::channel();

        let serial = {
            let mut table = self.table.lock();
            if table.calls.contains_key(&request_id) {
                error!(request_id = %request_id, label = %label, "duplicate request id registered");
                return Err(LinkError::DuplicateRequest(request_id));
            }
            table.next_serial += 1;
            let serial = table.next_serial;
            table.calls.insert(
                request_id.clone(),
                PendingCall {
                    serial,
                    label: label.clone(),
                    issued_at,
                    deadline,
                    sink,
                },
            );
            serial
        };
        debug!(request_id = %request_id, label = %label, ?timeout, "call registered");

        Ok(PendingReply {
            request_id,
            serial,
            deadline,
            rx,
            table: Arc::downgrade(&self.table),
        })
    }

    /// Deliver a reply. Unknown ids are logged and ignored: the peer may be
    /// answering a call that already timed out here.
    pub fn resolve(&self, request_id: &RequestId, value: T) -> bool {
        self.complete(request_id, CallOutcome::Resolved(value), "resolve")
    }

    pub fn cancel(&self, request_id: &RequestId, reason: CancelReason) -> bool {
        self.complete(request_id, CallOutcome::Cancelled(reason), "cancel")
    }

    fn complete(&self, request_id: &RequestId, outcome: CallOutcome<T>, op: &'static str) -> bool {
        let call = self.table.lock().calls.remove(request_id);
        match call {
            Some(call) => {
                debug!(request_id = %request_id, label = %call.label, op, "call completed");
                call.deliver(request_id, outcome);
                true
            }
            None => {
                warn!(request_id = %request_id, op, "no pending call for request id");
                false
            }
        }
    }

    /// Time out every entry whose deadline is at or before `now`.
    pub fn sweep(&self, now: Instant) -> usize {
        let expired: Vec<(RequestId, PendingCall<T>)> = {
            let mut table = self.table.lock();
            let ids: Vec<RequestId> = table
                .calls
                .iter()
                .filter(|(_, call)| call.deadline.is_some_and(|deadline| deadline <= now))
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| table.calls.remove(&id).map(|call| (id, call)))
                .collect()
        };
        let count = expired.len();
        for (request_id, call) in expired {
            warn!(request_id = %request_id, label = %call.label, "call timed out");
            call.deliver(&request_id, CallOutcome::TimedOut);
        }
        count
    }

    /// Time out every entry regardless of deadline. Used when the connection
    /// drops: nothing in flight survives a reconnect.
    pub fn expire_all(&self) -> usize {
        let drained = self.drain();
        let count = drained.len();
        for (request_id, call) in drained {
            call.deliver(&request_id, CallOutcome::TimedOut);
        }
        if count > 0 {
            info!(count, "expired all pending calls");
        }
        count
    }

    pub fn cancel_all(&self, reason: CancelReason) -> usize {
        let drained = self.drain();
        let count = drained.len();
        for (request_id, call) in drained {
            call.deliver(&request_id, CallOutcome::Cancelled(reason));
        }
        count
    }

    fn drain(&self) -> Vec<(RequestId, PendingCall<T>)> {
        self.table.lock().calls.drain().collect()
    }

    /// Run [`sweep`](Self::sweep) every `interval` until the registry is
    /// dropped.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let table = Arc::downgrade(&self.table);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(table) = table.upgrade() else {
                    debug!("registry dropped, sweeper exiting");
                    break;
                };
                CorrelationRegistry { table }.sweep(Instant::now());
            }
        })
    }

    pub fn pending_count(&self) -> usize {
        self.table.lock().calls.len()
    }

    pub fn is_pending(&self, request_id: &RequestId) -> bool {
        self.table.lock().calls.contains_key(request_id)
    }

    pub fn pending(&self) -> Vec<PendingInfo> {
        self.table
            .lock()
            .calls
            .iter()
            .map(|(request_id, call)| PendingInfo {
                request_id: request_id.clone(),
                label: call.label.clone(),
                issued_at: call.issued_at,
                deadline: call.deadline,
            })
            .collect()
    }
}

/// Handle held by the waiting task.
///
/// Waiting enforces the entry's own deadline, so a reply is never awaited
/// past it even when no sweeper runs. Dropping the handle withdraws the
/// entry.
pub struct PendingReply<T> {
    request_id: RequestId,
    serial: u64,
    deadline: Option<Instant>,
    rx: oneshot::Receiver<CallOutcome<T>>,
    table: Weak<Mutex<Table<T>>>,
}

impl<T> PendingReply<T> {
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub async fn wait(mut self) -> CallOutcome<T> {
        if let Some(deadline) = self.deadline {
            match tokio::time::timeout_at(deadline, &mut self.rx).await {
                Ok(delivered) => return delivered.unwrap_or(CallOutcome::Cancelled(CancelReason::Shutdown)),
                Err(_) => {
                    if let Some(call) = self.take_own_entry() {
                        warn!(request_id = %self.request_id, label = %call.label, "call timed out");
                        call.deliver(&self.request_id, CallOutcome::TimedOut);
                    }
                }
            }
        }
        // Either there is no deadline, or someone else completed the entry
        // while the timer fired; their outcome is already in the channel.
        (&mut self.rx)
            .await
            .unwrap_or(CallOutcome::Cancelled(CancelReason::Shutdown))
    }

    fn take_own_entry(&self) -> Option<PendingCall<T>> {
        let table = self.table.upgrade()?;
        let mut table = table.lock();
        let owned = table
            .calls
            .get(&self.request_id)
            .is_some_and(|call| call.serial == self.serial);
        if owned {
            table.calls.remove(&self.request_id)
        } else {
            None
        }
    }
}

impl<T> Drop for PendingReply<T> {
    fn drop(&mut self) {
        if self.take_own_entry().is_some() {
            debug!(request_id = %self.request_id, "pending call withdrawn by its owner");
        }
    }
}
