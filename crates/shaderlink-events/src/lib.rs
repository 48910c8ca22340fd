use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shaderlink_protocol::{FailureReason, HistoryEntry, RequestId, SessionId, TaskId, TaskStatus};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, instrument, warn};

/// Fan-out of notifications to any number of observers. Slow observers lag
/// and lose the oldest items; publishers never block.
#[derive(Debug)]
pub struct EventStreamHub<T> {
    sender: broadcast::Sender<T>,
}

impl<T> Clone for EventStreamHub<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> EventStreamHub<T> {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer);
        Self { sender }
    }

    pub fn publish(&self, event: T) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.sender.subscribe()
    }

    pub fn subscribe_stream(&self) -> BroadcastStream<T> {
        BroadcastStream::new(self.sender.subscribe())
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// What observers see of a generation task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    StatusChanged {
        session_id: SessionId,
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
        attempt: u32,
        max_attempts: u32,
    },
    Progress {
        task_id: TaskId,
        stage: String,
        progress: f32,
        message: String,
    },
    Preview {
        task_id: TaskId,
        attempt: u32,
        shader_name: String,
        code: String,
    },
    ConfirmationRequested {
        task_id: TaskId,
        confirm_id: RequestId,
        message: String,
        options: Vec<String>,
    },
    Finished {
        session_id: SessionId,
        task_id: TaskId,
        status: TaskStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure: Option<FailureReason>,
        #[serde(default)]
        artifacts: IndexMap<String, String>,
        message: String,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> &TaskId {
        match self {
            Self::StatusChanged { task_id, .. }
            | Self::Progress { task_id, .. }
            | Self::Preview { task_id, .. }
            | Self::ConfirmationRequested { task_id, .. }
            | Self::Finished { task_id, .. } => task_id,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished { .. })
    }
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, session_id: &SessionId, entry: &HistoryEntry) -> Result<()>;
    async fn read_from(
        &self,
        session_id: &SessionId,
        from_sequence: u64,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>>;
    async fn latest_sequence(&self, session_id: &SessionId) -> Result<u64>;
    async fn list_sessions(&self) -> Result<Vec<SessionId>>;
    async fn delete(&self, session_id: &SessionId) -> Result<bool>;
}

/// One JSONL file per session under `<root>/history`. Appends must carry
/// the next sequence number.
#[derive(Debug)]
pub struct FileHistoryStore {
    root: PathBuf,
    write_locks: Mutex<HashMap<SessionId, Arc<tokio::sync::Mutex<()>>>>,
    sequence_cache: Mutex<HashMap<SessionId, u64>>,
}

impl FileHistoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_locks: Mutex::new(HashMap::new()),
            sequence_cache: Mutex::new(HashMap::new()),
        }
    }

    fn history_dir(&self) -> PathBuf {
        self.root.join("history")
    }

    fn file_path(&self, session_id: &SessionId) -> PathBuf {
        self.history_dir()
            .join(format!("{}.jsonl", sanitize(session_id.as_str())))
    }

    fn lock_for(&self, session_id: &SessionId) -> Arc<tokio::sync::Mutex<()>> {
        self.write_locks
            .lock()
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn scan_latest_sequence(path: &Path) -> Result<u64> {
        let mut latest = 0_u64;
        for entry in Self::read_entries(path).await? {
            latest = latest.max(entry.sequence);
        }
        Ok(latest)
    }

    async fn read_entries(path: &Path) -> Result<Vec<HistoryEntry>> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let file = OpenOptions::new().read(true).open(path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut out = Vec::new();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let entry: HistoryEntry = serde_json::from_str(&line)
                .with_context(|| format!("failed parsing history line in {path:?}"))?;
            out.push(entry);
        }
        Ok(out)
    }

    async fn cached_or_scanned(&self, session_id: &SessionId, path: &Path) -> Result<u64> {
        if let Some(latest) = self.sequence_cache.lock().get(session_id).copied() {
            return Ok(latest);
        }
        let latest = Self::scan_latest_sequence(path).await?;
        self.sequence_cache.lock().insert(session_id.clone(), latest);
        Ok(latest)
    }
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[async_trait]
impl HistoryStore for FileHistoryStore {
    #[instrument(skip(self, entry), fields(session_id = %session_id, sequence = entry.sequence))]
    async fn append(&self, session_id: &SessionId, entry: &HistoryEntry) -> Result<()> {
        let path = self.file_path(session_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create history dir {parent:?}"))?;
        }

        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        let latest = self.cached_or_scanned(session_id, &path).await?;
        let expected = latest.saturating_add(1);
        if entry.sequence != expected {
            warn!(expected, actual = entry.sequence, "history sequence conflict");
            bail!(
                "history sequence conflict for session {session_id}: expected {expected}, got {}",
                entry.sequence
            );
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed opening history log {path:?}"))?;
        let line = serde_json::to_string(entry).context("failed serializing history entry")?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        self.sequence_cache
            .lock()
            .insert(session_id.clone(), entry.sequence);
        debug!("history entry appended");
        Ok(())
    }

    async fn read_from(
        &self,
        session_id: &SessionId,
        from_sequence: u64,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>> {
        let entries = Self::read_entries(&self.file_path(session_id)).await?;
        Ok(entries
            .into_iter()
            .filter(|entry| entry.sequence >= from_sequence)
            .take(limit)
            .collect())
    }

    async fn latest_sequence(&self, session_id: &SessionId) -> Result<u64> {
        let path = self.file_path(session_id);
        self.cached_or_scanned(session_id, &path).await
    }

    async fn list_sessions(&self) -> Result<Vec<SessionId>> {
        let dir = self.history_dir();
        if !fs::try_exists(&dir).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("failed listing {dir:?}"))?;
        let mut sessions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "jsonl")
                && let Some(stem) = path.file_stem().and_then(|stem| stem.to_str())
            {
                sessions.push(SessionId::from(stem));
            }
        }
        sessions.sort();
        Ok(sessions)
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    async fn delete(&self, session_id: &SessionId) -> Result<bool> {
        let path = self.file_path(session_id);
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;
        self.sequence_cache.lock().remove(session_id);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(false);
        }
        fs::remove_file(&path)
            .await
            .with_context(|| format!("failed removing {path:?}"))?;
        debug!("session history deleted");
        Ok(true)
    }
}
