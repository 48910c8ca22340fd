//! One handle over the whole link: connection, correlation, sessions and
//! the generation orchestrator.
//!
//! ```no_run
//! # async fn demo(generator: std::sync::Arc<dyn shaderlink_protocol::ShaderGenerator>) -> anyhow::Result<()> {
//! use shaderlink_kernel::LinkBuilder;
//! use shaderlink_protocol::{ConnectionConfig, SessionConfig};
//!
//! let link = LinkBuilder::new(ConnectionConfig::default(), generator).build();
//! link.start().await?;
//! link.open_session("/projects/demo", SessionConfig::default()).await?;
//! let task_id = link.submit("a soft rim light", Vec::new()).await?;
//! let outcome = link.wait_for_task(&task_id).await?;
//! println!("{:?}", outcome.status);
//! link.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::RwLock;
use shaderlink_connection::{ConnectionEvent, ConnectionManager, ConnectionPhase, ConnectionState};
use shaderlink_correlation::CancelReason;
use shaderlink_events::{EventStreamHub, FileHistoryStore, HistoryStore, TaskEvent};
use shaderlink_protocol::{
    ConfirmChoice, ConnectionConfig, HistoryEntry, LinkError, RequestId, SessionConfig,
    SessionId, ShaderGenerator, TaskId,
};
use shaderlink_runtime::{
    GenerationOrchestrator, RuntimeConfig, SessionController, SessionInfo, SessionState,
    TaskSnapshot,
};
use shaderlink_transport::{Connector, WebSocketConnector};
use tokio::sync::broadcast;
use tracing::{info, instrument, warn};

const DEFAULT_EVENT_BUFFER: usize = 1024;

#[derive(Clone)]
pub struct LinkBuilder {
    connection: ConnectionConfig,
    runtime: RuntimeConfig,
    generator: Arc<dyn ShaderGenerator>,
    connector: Option<Arc<dyn Connector>>,
    history_root: Option<PathBuf>,
    event_buffer: usize,
}

impl LinkBuilder {
    pub fn new(connection: ConnectionConfig, generator: Arc<dyn ShaderGenerator>) -> Self {
        Self {
            connection,
            runtime: RuntimeConfig::default(),
            generator,
            connector: None,
            history_root: None,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }

    pub fn runtime_config(mut self, runtime: RuntimeConfig) -> Self {
        self.runtime = runtime;
        self
    }

    /// Replace the WebSocket transport, e.g. with an in-memory one.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Persist session history as JSONL under `root`.
    pub fn history_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.history_root = Some(root.into());
        self
    }

    pub fn event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity.max(1);
        self
    }

    pub fn build(self) -> ShaderLink {
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(WebSocketConnector::new(self.connection.url())));
        let connection = ConnectionManager::new(self.connection, connector);
        let events = EventStreamHub::new(self.event_buffer);
        let orchestrator = GenerationOrchestrator::new(
            connection.clone(),
            self.generator,
            self.runtime.clone(),
            events,
        );
        let history: Option<Arc<dyn HistoryStore>> = self
            .history_root
            .map(|root| Arc::new(FileHistoryStore::new(root)) as Arc<dyn HistoryStore>);
        let sessions = SessionController::new(
            connection.clone(),
            orchestrator.clone(),
            self.runtime,
            history,
        );

        ShaderLink {
            inner: Arc::new(LinkInner {
                connection,
                orchestrator,
                sessions,
                current: RwLock::new(None),
            }),
        }
    }
}

struct LinkInner {
    connection: ConnectionManager,
    orchestrator: GenerationOrchestrator,
    sessions: SessionController,
    /// Session used by [`ShaderLink::submit`].
    current: RwLock<Option<SessionId>>,
}

#[derive(Clone)]
pub struct ShaderLink {
    inner: Arc<LinkInner>,
}

impl ShaderLink {
    /// Start inbound dispatch, then connect. With auto-reconnect on, a
    /// failed first attempt is only logged: the link keeps retrying in the
    /// background and `phase` shows when it is up.
    #[instrument(skip(self), fields(url = %self.inner.connection.config().url()))]
    pub async fn start(&self) -> Result<()> {
        self.inner.sessions.start_dispatch();
        if let Err(error) = self.inner.connection.connect().await {
            if !self.inner.connection.config().auto_reconnect {
                return Err(anyhow::Error::new(error).context("failed to start connection"));
            }
            warn!(%error, "tool host unreachable; reconnecting in the background");
        }
        info!("link started");
        Ok(())
    }

    /// Close sessions, fail whatever is still pending and drop the link.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        self.inner.sessions.close_all().await;
        let cancelled = self
            .inner
            .connection
            .registry()
            .cancel_all(CancelReason::Shutdown);
        self.inner.connection.disconnect();
        *self.inner.current.write() = None;
        info!(cancelled, "link shut down");
    }

    #[instrument(skip(self, project_path, config))]
    pub async fn open_session(
        &self,
        project_path: impl Into<String>,
        config: SessionConfig,
    ) -> Result<SessionId> {
        let session_id = self.inner.sessions.open(project_path, config).await?;
        *self.inner.current.write() = Some(session_id.clone());
        Ok(session_id)
    }

    #[instrument(skip(self, project_path, config), fields(session_id = %session_id))]
    pub async fn resume_session(
        &self,
        session_id: SessionId,
        project_path: impl Into<String>,
        config: SessionConfig,
    ) -> Result<SessionId> {
        let session_id = self
            .inner
            .sessions
            .resume(session_id, project_path, config)
            .await?;
        *self.inner.current.write() = Some(session_id.clone());
        Ok(session_id)
    }

    /// The session most recently opened or resumed, while it stays active.
    pub fn current_session(&self) -> Result<SessionId, LinkError> {
        let current = self.inner.current.read().clone();
        current
            .filter(|session_id| {
                self.inner
                    .sessions
                    .session(session_id)
                    .is_some_and(|info| info.state == SessionState::Active)
            })
            .ok_or(LinkError::NoActiveSession)
    }

    /// Submit to the current session.
    pub async fn submit(&self, content: impl Into<String>, images: Vec<String>) -> Result<TaskId> {
        let session_id = self.current_session()?;
        self.submit_to(&session_id, content, images).await
    }

    #[instrument(skip(self, content, images), fields(session_id = %session_id))]
    pub async fn submit_to(
        &self,
        session_id: &SessionId,
        content: impl Into<String>,
        images: Vec<String>,
    ) -> Result<TaskId> {
        Ok(self.inner.sessions.submit(session_id, content, images).await?)
    }

    pub fn confirm(&self, confirm_id: &RequestId, choice: ConfirmChoice) -> bool {
        self.inner.sessions.confirm(confirm_id, choice, None)
    }

    pub fn cancel_task(&self, task_id: &TaskId) -> bool {
        self.inner.sessions.cancel(task_id)
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn close_session(&self, session_id: &SessionId) -> Result<()> {
        self.inner.sessions.close(session_id).await?;
        self.forget_current(session_id);
        Ok(())
    }

    pub fn archive_session(&self, session_id: &SessionId) -> Result<()> {
        self.inner.sessions.archive(session_id)?;
        self.forget_current(session_id);
        Ok(())
    }

    fn forget_current(&self, session_id: &SessionId) {
        let mut current = self.inner.current.write();
        if current.as_ref() == Some(session_id) {
            *current = None;
        }
    }

    /// Resolves once the task reaches a terminal state.
    pub async fn wait_for_task(&self, task_id: &TaskId) -> Result<TaskSnapshot> {
        self.inner
            .orchestrator
            .wait(task_id)
            .await
            .ok_or_else(|| LinkError::UnknownTask(task_id.clone()).into())
    }

    pub fn task(&self, task_id: &TaskId) -> Option<TaskSnapshot> {
        self.inner.orchestrator.snapshot(task_id)
    }

    pub fn tasks(&self, session_id: &SessionId) -> Vec<TaskSnapshot> {
        self.inner.sessions.tasks(session_id)
    }

    pub fn session(&self, session_id: &SessionId) -> Option<SessionInfo> {
        self.inner.sessions.session(session_id)
    }

    pub fn history(&self, session_id: &SessionId) -> Vec<HistoryEntry> {
        self.inner.sessions.history(session_id)
    }

    pub fn subscribe_tasks(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.orchestrator.events()
    }

    pub fn subscribe_link(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.connection.events()
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.inner.connection.phase()
    }

    /// `true` once the link is `Connected`, `false` if `timeout` passes
    /// first.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        self.inner.connection.wait_connected(timeout).await
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.snapshot()
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.connection.registry().pending_count()
    }
}
