use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use shaderlink_connection::ConnectionManager;
use shaderlink_correlation::CallOutcome;
use shaderlink_events::HistoryStore;
use shaderlink_protocol::{
    ConfirmChoice, ConfirmResult, Envelope, ErrorNotice, FailureReason, HistoryEntry, HistoryRole,
    LinkError, LinkResult, MessageKind, RequestId, SessionConfig, SessionEnd, SessionId,
    SessionInit, SessionReady, TaskId, TaskStatus,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::RuntimeConfig;
use crate::orchestrator::{GenerationOrchestrator, TaskRequest, TaskSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Completed,
    Archived,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub state: SessionState,
    pub project_path: String,
    pub config: SessionConfig,
    pub opened_at: DateTime<Utc>,
    pub history_len: usize,
}

/// Completed sessions kept in memory before the oldest is archived.
const RETAINED_COMPLETED_SESSIONS: usize = 64;
/// Archived sessions remembered by summary only.
const RETAINED_ARCHIVED_SESSIONS: usize = 256;

struct SessionRecord {
    info: SessionInfo,
    history: Vec<HistoryEntry>,
}

#[derive(Default)]
struct SessionTable {
    /// Active and completed sessions.
    live: HashMap<SessionId, SessionRecord>,
    /// Completed session ids, oldest first.
    completed: VecDeque<SessionId>,
    archived: VecDeque<SessionInfo>,
}

impl SessionTable {
    fn insert(&mut self, record: SessionRecord) {
        let session_id = record.info.session_id.clone();
        self.completed.retain(|id| id != &session_id);
        self.archived.retain(|info| info.session_id != session_id);
        self.live.insert(session_id, record);
    }

    fn active_mut(&mut self, session_id: &SessionId) -> Option<&mut SessionRecord> {
        self.live
            .get_mut(session_id)
            .filter(|record| record.info.state == SessionState::Active)
    }

    fn complete(&mut self, session_id: &SessionId) -> bool {
        let Some(record) = self.active_mut(session_id) else {
            return false;
        };
        record.info.state = SessionState::Completed;
        self.completed.push_back(session_id.clone());
        while self.completed.len() > RETAINED_COMPLETED_SESSIONS {
            if let Some(oldest) = self.completed.pop_front() {
                self.archive(&oldest);
            }
        }
        true
    }

    /// Drop the record and keep its summary.
    fn archive(&mut self, session_id: &SessionId) -> bool {
        let Some(record) = self.live.remove(session_id) else {
            return false;
        };
        self.completed.retain(|id| id != session_id);
        let mut info = record.info;
        info.state = SessionState::Archived;
        info.history_len = 0;
        self.archived.push_back(info);
        if self.archived.len() > RETAINED_ARCHIVED_SESSIONS {
            self.archived.pop_front();
        }
        true
    }

    fn info(&self, session_id: &SessionId) -> Option<SessionInfo> {
        self.live
            .get(session_id)
            .map(|record| record.info.clone())
            .or_else(|| {
                self.archived
                    .iter()
                    .rev()
                    .find(|info| &info.session_id == session_id)
                    .cloned()
            })
    }
}

struct ControllerInner {
    connection: ConnectionManager,
    orchestrator: GenerationOrchestrator,
    config: RuntimeConfig,
    history_store: Option<Arc<dyn HistoryStore>>,
    sessions: Mutex<SessionTable>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ControllerInner {
    fn drop(&mut self) {
        if let Some(task) = self.dispatch.get_mut().take() {
            task.abort();
        }
    }
}

/// Opens sessions with the peer and routes user work into the
/// orchestrator.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<ControllerInner>,
}

impl SessionController {
    pub fn new(
        connection: ConnectionManager,
        orchestrator: GenerationOrchestrator,
        config: RuntimeConfig,
        history_store: Option<Arc<dyn HistoryStore>>,
    ) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                connection,
                orchestrator,
                config,
                history_store,
                sessions: Mutex::new(SessionTable::default()),
                dispatch: Mutex::new(None),
            }),
        }
    }

    pub fn orchestrator(&self) -> &GenerationOrchestrator {
        &self.inner.orchestrator
    }

    /// Open a fresh session. The config is checked locally first; an
    /// invalid one never reaches the wire.
    pub async fn open(
        &self,
        project_path: impl Into<String>,
        config: SessionConfig,
    ) -> LinkResult<SessionId> {
        self.establish(None, project_path.into(), config).await
    }

    /// Re-open a known session id, e.g. after a restart.
    pub async fn resume(
        &self,
        session_id: SessionId,
        project_path: impl Into<String>,
        config: SessionConfig,
    ) -> LinkResult<SessionId> {
        self.establish(Some(session_id), project_path.into(), config)
            .await
    }

    #[instrument(skip(self, config), fields(resume = session_id.is_some()))]
    async fn establish(
        &self,
        session_id: Option<SessionId>,
        project_path: String,
        config: SessionConfig,
    ) -> LinkResult<SessionId> {
        config.validate()?;
        let inner = &self.inner;
        let timeout = inner.config.session_establish_timeout;
        let deadline = Instant::now() + timeout;

        if !inner.connection.wait_connected(timeout).await {
            return Err(LinkError::SessionUnavailable(format!(
                "no connection within {timeout:?}"
            )));
        }

        // The peer echoes the id we propose, which is what SessionReady is
        // correlated by.
        let session_id = session_id.unwrap_or_else(SessionId::new_uuid);
        let reply = inner.connection.registry().register(
            RequestId::for_session(&session_id),
            "session_init",
            Some(deadline.saturating_duration_since(Instant::now())),
        )?;
        inner
            .connection
            .send_kind(MessageKind::SessionInit(SessionInit {
                session_id: Some(session_id.clone()),
                project_path: project_path.clone(),
                config: config.clone(),
            }))
            .await
            .map_err(|error| LinkError::SessionUnavailable(error.to_string()))?;

        let ready = match reply.wait().await {
            CallOutcome::Resolved(Envelope {
                kind: MessageKind::SessionReady(ready),
                ..
            }) => ready,
            CallOutcome::Resolved(other) => {
                return Err(LinkError::InvalidState(format!(
                    "{} answered SessionInit",
                    other.kind.type_name()
                )));
            }
            CallOutcome::TimedOut => {
                warn!(session_id = %session_id, "peer did not acknowledge the session");
                return Err(LinkError::SessionUnavailable(format!(
                    "no SessionReady within {timeout:?}"
                )));
            }
            CallOutcome::Cancelled(reason) => {
                return Err(LinkError::SessionUnavailable(reason.to_string()));
            }
        };

        let history = self.seed_history(&ready).await;
        let history_len = history.len();
        inner.sessions.lock().insert(SessionRecord {
            info: SessionInfo {
                session_id: session_id.clone(),
                state: SessionState::Active,
                project_path,
                config,
                opened_at: Utc::now(),
                history_len,
            },
            history,
        });
        info!(session_id = %session_id, history_len, "session active");
        Ok(session_id)
    }

    /// Stored history wins over what the peer sent; the peer's copy is
    /// renumbered and persisted when nothing is stored yet.
    async fn seed_history(&self, ready: &SessionReady) -> Vec<HistoryEntry> {
        let Some(store) = &self.inner.history_store else {
            return renumber(ready.history.clone());
        };
        match store.read_from(&ready.session_id, 1, usize::MAX).await {
            Ok(stored) if !stored.is_empty() => return stored,
            Ok(_) => {}
            Err(error) => {
                warn!(session_id = %ready.session_id, %error, "failed loading stored history");
                return renumber(ready.history.clone());
            }
        }
        let seeded = renumber(ready.history.clone());
        for entry in &seeded {
            if let Err(error) = store.append(&ready.session_id, entry).await {
                warn!(session_id = %ready.session_id, %error, "failed persisting seeded history");
                break;
            }
        }
        seeded
    }

    /// Hand a user request to the orchestrator.
    #[instrument(skip(self, content, images), fields(session_id = %session_id))]
    pub async fn submit(
        &self,
        session_id: &SessionId,
        content: impl Into<String>,
        images: Vec<String>,
    ) -> LinkResult<TaskId> {
        let content = content.into();
        if content.trim().is_empty() {
            return Err(LinkError::InvalidInput("request content is empty".to_owned()));
        }
        let config = self.active_config(session_id)?;
        config.validate()?;

        self.record(session_id, HistoryRole::User, content.clone())
            .await;
        let task_id = self.inner.orchestrator.start(TaskRequest {
            session_id: session_id.clone(),
            requirement: content,
            images,
            config,
        })?;

        let controller = Arc::downgrade(&self.inner);
        let orchestrator = self.inner.orchestrator.clone();
        let watched = task_id.clone();
        tokio::spawn(async move {
            let Some(snapshot) = orchestrator.wait(&watched).await else {
                return;
            };
            if let Some(inner) = controller.upgrade() {
                SessionController { inner }.record_outcome(&snapshot).await;
            }
        });
        Ok(task_id)
    }

    /// Answer an outstanding confirmation locally. `false` if nothing is
    /// waiting on `confirm_id`.
    pub fn confirm(
        &self,
        confirm_id: &RequestId,
        choice: ConfirmChoice,
        note: Option<String>,
    ) -> bool {
        let envelope = Envelope::new(MessageKind::ConfirmResult(ConfirmResult {
            confirm_id: confirm_id.clone(),
            confirmed: choice != ConfirmChoice::Abandon,
            note,
            choice: Some(choice),
        }));
        self.inner
            .connection
            .registry()
            .resolve(confirm_id, envelope)
    }

    pub fn cancel(&self, task_id: &TaskId) -> bool {
        self.inner
            .orchestrator
            .cancel(task_id, FailureReason::UserCancelled)
    }

    /// Active → Completed. Outstanding tasks end with `SessionClosed`.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn close(&self, session_id: &SessionId) -> LinkResult<()> {
        if !self.inner.sessions.lock().complete(session_id) {
            return Err(LinkError::SessionNotActive(session_id.clone()));
        }
        self.cancel_tasks(session_id);
        let sent = self
            .inner
            .connection
            .send_kind(MessageKind::SessionEnd(SessionEnd {
                session_id: session_id.clone(),
            }))
            .await;
        if let Err(error) = sent {
            debug!(%error, "SessionEnd not delivered");
        }
        info!("session closed");
        Ok(())
    }

    /// Active or Completed → Archived: the session is evicted from memory
    /// and only its summary remains. Its stored history, if any, is kept.
    pub fn archive(&self, session_id: &SessionId) -> LinkResult<()> {
        let was_active = self
            .inner
            .sessions
            .lock()
            .live
            .get(session_id)
            .is_some_and(|record| record.info.state == SessionState::Active);
        if was_active {
            self.cancel_tasks(session_id);
        }
        if !self.inner.sessions.lock().archive(session_id) {
            return Err(LinkError::SessionNotActive(session_id.clone()));
        }
        info!(session_id = %session_id, "session archived");
        Ok(())
    }

    /// Close every active session.
    pub async fn close_all(&self) {
        for session_id in self.active_sessions() {
            if let Err(error) = self.close(&session_id).await {
                debug!(session_id = %session_id, %error, "session already gone");
            }
        }
    }

    fn cancel_tasks(&self, session_id: &SessionId) {
        let cancelled = self
            .inner
            .orchestrator
            .cancel_session(session_id, FailureReason::SessionClosed);
        if cancelled > 0 {
            info!(session_id = %session_id, cancelled, "cancelled outstanding tasks");
        }
    }

    pub fn session(&self, session_id: &SessionId) -> Option<SessionInfo> {
        self.inner.sessions.lock().info(session_id)
    }

    pub fn active_sessions(&self) -> Vec<SessionId> {
        self.inner
            .sessions
            .lock()
            .live
            .values()
            .filter(|record| record.info.state == SessionState::Active)
            .map(|record| record.info.session_id.clone())
            .collect()
    }

    pub fn history(&self, session_id: &SessionId) -> Vec<HistoryEntry> {
        self.inner
            .sessions
            .lock()
            .live
            .get(session_id)
            .map(|record| record.history.clone())
            .unwrap_or_default()
    }

    pub fn tasks(&self, session_id: &SessionId) -> Vec<TaskSnapshot> {
        self.inner.orchestrator.tasks_for(session_id)
    }

    fn active_config(&self, session_id: &SessionId) -> LinkResult<SessionConfig> {
        self.inner
            .sessions
            .lock()
            .active_mut(session_id)
            .map(|record| record.info.config.clone())
            .ok_or_else(|| LinkError::SessionNotActive(session_id.clone()))
    }

    async fn record_outcome(&self, snapshot: &TaskSnapshot) {
        let content = match snapshot.status {
            TaskStatus::Succeeded => snapshot.message.clone(),
            _ => format!("generation failed: {}", snapshot.message),
        };
        let role = if snapshot.status == TaskStatus::Succeeded {
            HistoryRole::Assistant
        } else {
            HistoryRole::System
        };
        self.record(&snapshot.session_id, role, content).await;
    }

    async fn record(&self, session_id: &SessionId, role: HistoryRole, content: String) {
        let entry = {
            let mut sessions = self.inner.sessions.lock();
            let Some(record) = sessions.live.get_mut(session_id) else {
                return;
            };
            let sequence = record.history.last().map_or(1, |last| last.sequence + 1);
            let entry = HistoryEntry {
                sequence,
                role,
                content,
                at: Utc::now(),
            };
            record.history.push(entry.clone());
            record.info.history_len = record.history.len();
            entry
        };
        if let Some(store) = &self.inner.history_store
            && let Err(error) = store.append(session_id, &entry).await
        {
            warn!(session_id = %session_id, sequence = entry.sequence, %error, "failed persisting history entry");
        }
    }

    /// Consume inbound envelopes: `UserRequest` becomes a task,
    /// `CancelTask` cancels one. Idempotent.
    pub fn start_dispatch(&self) {
        let mut dispatch = self.inner.dispatch.lock();
        if dispatch.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let inbound = self.inner.connection.subscribe();
        *dispatch = Some(tokio::spawn(dispatch_loop(
            Arc::downgrade(&self.inner),
            inbound,
        )));
    }

    async fn dispatch(&self, envelope: Envelope) {
        match envelope.kind {
            MessageKind::UserRequest(request) => {
                let submitted = self
                    .submit(&request.session_id, request.content, request.images)
                    .await;
                if let Err(error) = submitted {
                    warn!(session_id = %request.session_id, %error, "user request rejected");
                    let notice = MessageKind::Error(ErrorNotice {
                        task_id: None,
                        code: error.code(),
                        message: error.to_string(),
                        recoverable: !error.is_fatal(),
                        retry_count: None,
                        max_retries: None,
                    });
                    if let Err(error) = self.inner.connection.send_kind(notice).await {
                        debug!(%error, "rejection notice not delivered");
                    }
                }
            }
            MessageKind::CancelTask(cancel) => {
                self.cancel(&cancel.task_id);
            }
            other => debug!(kind = other.type_name(), "not dispatched"),
        }
    }
}

async fn dispatch_loop(
    inner: Weak<ControllerInner>,
    mut inbound: tokio::sync::broadcast::Receiver<Envelope>,
) {
    loop {
        let envelope = match inbound.recv().await {
            Ok(envelope) => envelope,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "dispatch loop lagged; inbound messages dropped");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        SessionController { inner }.dispatch(envelope).await;
    }
    debug!("dispatch loop stopped");
}

fn renumber(history: Vec<HistoryEntry>) -> Vec<HistoryEntry> {
    history
        .into_iter()
        .zip(1_u64..)
        .map(|(entry, sequence)| HistoryEntry { sequence, ..entry })
        .collect()
}
