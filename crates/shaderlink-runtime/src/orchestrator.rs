//! Generate → validate → repair loop.
//!
//! Each submitted task runs as one spawned tokio task that owns its state
//! machine outright; transitions for a task never race each other. Tasks of
//! different sessions share nothing but the correlation registry.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use shaderlink_connection::{ConnectionManager, ConnectionPhase};
use shaderlink_correlation::{CallOutcome, CancelReason};
use shaderlink_events::{EventStreamHub, TaskEvent};
use shaderlink_protocol::{
    CompileReport, CompileShaderArgs, ConfirmChoice, ConfirmRequest, CreateMaterialArgs,
    Diagnostic, ErrorCode, ErrorNotice, FailureReason, GeneratedShader, GenerationRequest,
    LinkError, LinkResult, MessageKind, Progress, RequestId, SaveShaderArgs, SessionConfig,
    SessionId, Severity, ShaderGenerator, ShaderPreview, TaskComplete, TaskId, TaskStatus,
    ToolName, extract_shader_code, extract_shader_name, DEFAULT_SHADER_NAME,
};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, instrument, warn};

use crate::config::RuntimeConfig;
use crate::tools::RemoteTools;

const CONFIRM_KIND: &str = "retry_exhausted";
const MAX_SUMMARISED_ERRORS: usize = 5;

/// Work handed to the orchestrator by the session controller.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub session_id: SessionId,
    pub requirement: String,
    pub images: Vec<String>,
    pub config: SessionConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub task_id: TaskId,
    pub session_id: SessionId,
    pub status: TaskStatus,
    /// 1-based; never decremented.
    pub attempt: u32,
    pub max_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shader_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_code: Option<String>,
    pub artifacts: IndexMap<String, String>,
    pub message: String,
    /// Registry entry the task is currently suspended on.
    #[serde(skip)]
    pub pending_request: Option<RequestId>,
}

/// The snapshot lives in a watch channel so waiters see every status
/// change, including the final one after the record is evicted.
struct TaskRecord {
    snapshot_tx: watch::Sender<TaskSnapshot>,
    cancel_tx: watch::Sender<Option<FailureReason>>,
}

struct Candidate {
    code: String,
    name: String,
}

impl Candidate {
    fn from_generated(generated: GeneratedShader) -> Self {
        let code = extract_shader_code(&generated.code);
        let name = generated
            .name
            .filter(|name| !name.trim().is_empty())
            .or_else(|| extract_shader_name(&code))
            .unwrap_or_else(|| DEFAULT_SHADER_NAME.to_owned());
        Self { code, name }
    }
}

enum Outcome {
    Succeeded {
        artifacts: IndexMap<String, String>,
        message: String,
        name: String,
        code: String,
    },
    Failed {
        reason: FailureReason,
        code: ErrorCode,
        message: String,
    },
}

impl Outcome {
    fn failed(reason: FailureReason, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Failed {
            reason,
            code,
            message: message.into(),
        }
    }

    fn cancelled(reason: FailureReason) -> Self {
        Self::failed(reason, ErrorCode::InternalError, format!("task stopped: {reason}"))
    }
}

enum Decision {
    Continue,
    Accept,
    Abandon,
    Stop(Outcome),
}

struct TaskContext {
    task_id: TaskId,
    session_id: SessionId,
    requirement: String,
    images: Vec<String>,
    config: SessionConfig,
    cancel_rx: watch::Receiver<Option<FailureReason>>,
}

impl TaskContext {
    fn cancel_reason(&self) -> Option<FailureReason> {
        *self.cancel_rx.borrow()
    }
}

struct Inner {
    connection: ConnectionManager,
    tools: RemoteTools,
    generator: Arc<dyn ShaderGenerator>,
    config: RuntimeConfig,
    events: EventStreamHub<TaskEvent>,
    tasks: Mutex<HashMap<TaskId, TaskRecord>>,
    /// Finished task ids, oldest first.
    finished: Mutex<VecDeque<TaskId>>,
}

#[derive(Clone)]
pub struct GenerationOrchestrator {
    inner: Arc<Inner>,
}

impl GenerationOrchestrator {
    pub fn new(
        connection: ConnectionManager,
        generator: Arc<dyn ShaderGenerator>,
        config: RuntimeConfig,
        events: EventStreamHub<TaskEvent>,
    ) -> Self {
        let tools = RemoteTools::new(connection.clone(), config.tool_timeout);
        Self {
            inner: Arc::new(Inner {
                connection,
                tools,
                generator,
                config,
                events,
                tasks: Mutex::new(HashMap::new()),
                finished: Mutex::new(VecDeque::new()),
            }),
        }
    }

    pub fn tools(&self) -> &RemoteTools {
        &self.inner.tools
    }

    /// Create a task in `Pending` and start driving it.
    #[instrument(skip(self, request), fields(session_id = %request.session_id))]
    pub fn start(&self, request: TaskRequest) -> LinkResult<TaskId> {
        let ctx = self.register(request)?;
        let task_id = ctx.task_id.clone();
        info!(task_id = %task_id, "generation task created");
        tokio::spawn(run_task(Arc::clone(&self.inner), ctx));
        Ok(task_id)
    }

    fn register(&self, request: TaskRequest) -> LinkResult<TaskContext> {
        request.config.validate()?;
        if request.requirement.trim().is_empty() {
            return Err(LinkError::InvalidInput("requirement is empty".to_owned()));
        }

        let task_id = TaskId::new_uuid();
        let (cancel_tx, cancel_rx) = watch::channel(None);
        let snapshot = TaskSnapshot {
            task_id: task_id.clone(),
            session_id: request.session_id.clone(),
            status: TaskStatus::Pending,
            attempt: 0,
            max_attempts: request.config.max_retry_count,
            failure: None,
            shader_name: None,
            final_code: None,
            artifacts: IndexMap::new(),
            message: String::new(),
            pending_request: None,
        };
        let (snapshot_tx, _) = watch::channel(snapshot);
        self.inner.tasks.lock().insert(
            task_id.clone(),
            TaskRecord {
                snapshot_tx,
                cancel_tx,
            },
        );

        Ok(TaskContext {
            task_id,
            session_id: request.session_id,
            requirement: request.requirement,
            images: request.images,
            config: request.config,
            cancel_rx,
        })
    }

    /// Stop a task. Unknown and finished tasks are left alone and yield
    /// `false`. An outstanding tool call or confirmation is cancelled in
    /// the registry, so a late reply resolves nothing. A `true` return is
    /// binding: the task ends `Failed` with `reason` even if its work had
    /// already completed.
    pub fn cancel(&self, task_id: &TaskId, reason: FailureReason) -> bool {
        let pending = {
            let tasks = self.inner.tasks.lock();
            let Some(record) = tasks.get(task_id) else {
                debug!(task_id = %task_id, "cancel for unknown task ignored");
                return false;
            };
            let snapshot = record.snapshot_tx.borrow();
            if snapshot.status.is_terminal() || record.cancel_tx.borrow().is_some() {
                return false;
            }
            record.cancel_tx.send_replace(Some(reason));
            snapshot.pending_request.clone()
        };
        if let Some(request_id) = pending {
            self.inner
                .connection
                .registry()
                .cancel(&request_id, cancel_reason(reason));
        }
        info!(task_id = %task_id, %reason, "task cancellation requested");
        true
    }

    /// Cancel every unfinished task of `session_id`.
    pub fn cancel_session(&self, session_id: &SessionId, reason: FailureReason) -> usize {
        let ids: Vec<TaskId> = self
            .inner
            .tasks
            .lock()
            .iter()
            .filter(|(_, record)| &record.snapshot_tx.borrow().session_id == session_id)
            .map(|(task_id, _)| task_id.clone())
            .collect();
        ids.iter()
            .filter(|task_id| self.cancel(task_id, reason))
            .count()
    }

    pub fn snapshot(&self, task_id: &TaskId) -> Option<TaskSnapshot> {
        self.inner
            .tasks
            .lock()
            .get(task_id)
            .map(|record| record.snapshot_tx.borrow().clone())
    }

    pub fn tasks_for(&self, session_id: &SessionId) -> Vec<TaskSnapshot> {
        self.inner
            .tasks
            .lock()
            .values()
            .map(|record| record.snapshot_tx.borrow().clone())
            .filter(|snapshot| &snapshot.session_id == session_id)
            .collect()
    }

    /// Wait until the task reaches `status` (or finishes, whichever is
    /// first) and return its snapshot.
    pub async fn wait_for(&self, task_id: &TaskId, status: TaskStatus) -> Option<TaskSnapshot> {
        let mut snapshot_rx = self.inner.tasks.lock().get(task_id)?.snapshot_tx.subscribe();
        snapshot_rx
            .wait_for(|current| current.status == status || current.status.is_terminal())
            .await
            .ok()
            .map(|snapshot| TaskSnapshot::clone(&snapshot))
    }

    /// Wait for the task to finish.
    pub async fn wait(&self, task_id: &TaskId) -> Option<TaskSnapshot> {
        self.wait_for(task_id, TaskStatus::Succeeded).await
    }

    pub fn events(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.events.subscribe()
    }
}

fn cancel_reason(reason: FailureReason) -> CancelReason {
    match reason {
        FailureReason::UserCancelled => CancelReason::UserCancelled,
        FailureReason::SessionClosed => CancelReason::SessionClosed,
        _ => CancelReason::Shutdown,
    }
}

async fn run_task(inner: Arc<Inner>, ctx: TaskContext) {
    let mut cancel_rx = ctx.cancel_rx.clone();
    let outcome = tokio::select! {
        biased;
        reason = cancelled(&mut cancel_rx) => Outcome::cancelled(reason),
        outcome = inner.drive(&ctx) => outcome,
    };
    inner.finish(&ctx, outcome).await;
}

async fn cancelled(cancel_rx: &mut watch::Receiver<Option<FailureReason>>) -> FailureReason {
    // Copy out of the watch guard before awaiting again; it is not `Send`.
    let reason = cancel_rx
        .wait_for(Option::is_some)
        .await
        .ok()
        .and_then(|reason| *reason);
    match reason {
        Some(reason) => reason,
        None => std::future::pending().await,
    }
}

impl Inner {
    async fn drive(&self, ctx: &TaskContext) -> Outcome {
        let mut budget = ctx.config.max_retry_count;
        let mut attempt = 0_u32;
        let mut previous_code: Option<String> = None;
        let mut diagnostics: Vec<Diagnostic> = Vec::new();

        loop {
            attempt += 1;
            self.set_status(ctx, TaskStatus::Generating, attempt, budget);
            let stage_message = if previous_code.is_some() {
                format!("repairing shader (attempt {attempt})")
            } else {
                "generating shader".to_owned()
            };
            self.progress(ctx, "generating", 0.2, stage_message).await;

            let request = GenerationRequest {
                session_id: ctx.session_id.clone(),
                task_id: ctx.task_id.clone(),
                requirement: ctx.requirement.clone(),
                images: ctx.images.clone(),
                attempt,
                previous_code: previous_code.take(),
                diagnostics: std::mem::take(&mut diagnostics),
            };
            let candidate = match self.generator.generate(request).await {
                Ok(generated) => Candidate::from_generated(generated),
                Err(error) => {
                    warn!(task_id = %ctx.task_id, attempt, %error, "generator failed");
                    return Outcome::failed(
                        FailureReason::GeneratorFailed,
                        ErrorCode::LlmError,
                        format!("shader generation failed: {error}"),
                    );
                }
            };
            self.preview(ctx, attempt, &candidate).await;

            self.set_status(ctx, TaskStatus::Validating, attempt, budget);
            self.progress(ctx, "validating", 0.5, format!("compiling {}", candidate.name))
                .await;
            match self.validate(ctx, &candidate).await {
                Ok(report) if !report.is_blocking() => {
                    return self.complete(ctx, attempt, candidate, &report).await;
                }
                Ok(report) => {
                    warn!(
                        task_id = %ctx.task_id,
                        attempt,
                        errors = report.errors().count(),
                        "shader failed to compile"
                    );
                    diagnostics = report.diagnostics;
                }
                Err(error) if error.is_transient() => {
                    warn!(task_id = %ctx.task_id, attempt, %error, "validation did not complete; attempt consumed");
                    diagnostics = vec![Diagnostic {
                        message: format!("validation did not complete: {error}"),
                        severity: Severity::Info,
                        ..Diagnostic::default()
                    }];
                }
                Err(LinkError::ToolFailed { message, .. }) => {
                    warn!(task_id = %ctx.task_id, attempt, %message, "compiler reported failure");
                    diagnostics = vec![Diagnostic::error(0, format!("compiler failed: {message}"))];
                }
                Err(LinkError::Serialization(message)) => {
                    warn!(task_id = %ctx.task_id, attempt, %message, "unreadable compile report");
                    diagnostics = vec![Diagnostic::error(
                        0,
                        format!("compiler returned an unreadable report: {message}"),
                    )];
                }
                Err(LinkError::Cancelled(_)) => {
                    return Outcome::cancelled(
                        ctx.cancel_reason().unwrap_or(FailureReason::UserCancelled),
                    );
                }
                Err(error) => {
                    return Outcome::failed(FailureReason::Internal, error.code(), error.to_string());
                }
            }

            if attempt < budget {
                self.set_status(ctx, TaskStatus::Repairing, attempt, budget);
                self.progress(ctx, "repairing", 0.6, format!("retrying ({attempt}/{budget})"))
                    .await;
                previous_code = Some(candidate.code);
                continue;
            }

            match self.escalate(ctx, attempt, budget, &diagnostics).await {
                Decision::Continue => {
                    budget = attempt + ctx.config.max_retry_count;
                    info!(task_id = %ctx.task_id, attempt, budget, "user granted more attempts");
                    previous_code = Some(candidate.code);
                }
                Decision::Accept => {
                    return self.accept_with_errors(ctx, attempt, candidate, &diagnostics).await;
                }
                Decision::Abandon => {
                    return Outcome::failed(
                        FailureReason::Abandoned,
                        ErrorCode::CompileFailed,
                        format!("abandoned after {attempt} attempts"),
                    );
                }
                Decision::Stop(outcome) => return outcome,
            }
        }
    }

    async fn validate(&self, ctx: &TaskContext, candidate: &Candidate) -> LinkResult<CompileReport> {
        let args = CompileShaderArgs {
            code: candidate.code.clone(),
            name: candidate.name.clone(),
        };
        let call = self
            .tools
            .begin(ToolName::CompileShader, &args, self.config.validation_timeout)
            .await?;
        self.track(&ctx.task_id, Some(call.request_id().clone()));
        let result = call.finish().await;
        self.track(&ctx.task_id, None);

        let value = result?;
        if value.is_null() {
            return Ok(CompileReport::clean());
        }
        serde_json::from_value(value)
            .map_err(|error| LinkError::Serialization(format!("compile report: {error}")))
    }

    /// Retries are spent: tell the user and suspend until they decide.
    async fn escalate(
        &self,
        ctx: &TaskContext,
        attempt: u32,
        budget: u32,
        diagnostics: &[Diagnostic],
    ) -> Decision {
        let summary = diagnostics
            .iter()
            .filter(|diagnostic| diagnostic.severity != Severity::Warning)
            .take(MAX_SUMMARISED_ERRORS)
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        self.mirror(MessageKind::Error(ErrorNotice {
            task_id: Some(ctx.task_id.clone()),
            code: ErrorCode::CompileFailed,
            message: format!("shader still fails after {attempt} attempts: {summary}"),
            recoverable: true,
            retry_count: Some(attempt),
            max_retries: Some(budget),
        }))
        .await;
        self.set_status(ctx, TaskStatus::AwaitingUser, attempt, budget);

        let confirm_id = RequestId::new_uuid();
        let message = format!(
            "The shader still fails to compile after {attempt} attempts. Continue retrying, accept it as-is, or abandon?"
        );
        let options: Vec<String> = ConfirmChoice::OPTIONS
            .iter()
            .map(|choice| choice.as_str().to_owned())
            .collect();
        self.events.publish(TaskEvent::ConfirmationRequested {
            task_id: ctx.task_id.clone(),
            confirm_id: confirm_id.clone(),
            message: message.clone(),
            options: options.clone(),
        });

        loop {
            // A confirmation is only worth asking on a live link.
            let mut phase = self.connection.watch_phase();
            let _ = phase
                .wait_for(|phase| *phase == ConnectionPhase::Connected)
                .await;

            let reply = match self
                .connection
                .registry()
                .register(confirm_id.clone(), "confirm", None)
            {
                Ok(reply) => reply,
                Err(error) => {
                    return Decision::Stop(Outcome::failed(
                        FailureReason::Internal,
                        error.code(),
                        error.to_string(),
                    ));
                }
            };
            self.track(&ctx.task_id, Some(confirm_id.clone()));
            let sent = self
                .connection
                .send_kind(MessageKind::ConfirmRequest(ConfirmRequest {
                    confirm_id: confirm_id.clone(),
                    task_id: Some(ctx.task_id.clone()),
                    kind: CONFIRM_KIND.to_owned(),
                    message: message.clone(),
                    options: options.clone(),
                }))
                .await;
            if let Err(error) = sent {
                debug!(%error, "confirmation request not delivered; retrying");
                drop(reply);
                continue;
            }

            let outcome = reply.wait().await;
            self.track(&ctx.task_id, None);
            match outcome {
                CallOutcome::Resolved(envelope) => {
                    let choice = match envelope.kind {
                        MessageKind::ConfirmResult(result) => result.choice(),
                        other => {
                            warn!(kind = other.type_name(), "unexpected reply to confirmation");
                            ConfirmChoice::Abandon
                        }
                    };
                    info!(task_id = %ctx.task_id, choice = choice.as_str(), "user decided");
                    return match choice {
                        ConfirmChoice::Continue => Decision::Continue,
                        ConfirmChoice::Accept => Decision::Accept,
                        ConfirmChoice::Abandon => Decision::Abandon,
                    };
                }
                CallOutcome::TimedOut => {
                    info!(task_id = %ctx.task_id, "confirmation lost with the connection; asking again");
                }
                CallOutcome::Cancelled(_) => {
                    return Decision::Stop(Outcome::cancelled(
                        ctx.cancel_reason().unwrap_or(FailureReason::UserCancelled),
                    ));
                }
            }
        }
    }

    async fn complete(
        &self,
        ctx: &TaskContext,
        attempt: u32,
        candidate: Candidate,
        report: &CompileReport,
    ) -> Outcome {
        let mut artifacts = base_artifacts(&candidate, attempt);
        let warnings = report.diagnostics.len() - report.errors().count();
        if warnings > 0 {
            artifacts.insert("warnings".to_owned(), warnings.to_string());
        }
        self.publish(ctx, &candidate, &mut artifacts).await;
        Outcome::Succeeded {
            message: format!("{} compiled after {attempt} attempt(s)", candidate.name),
            artifacts,
            name: candidate.name,
            code: candidate.code,
        }
    }

    async fn accept_with_errors(
        &self,
        ctx: &TaskContext,
        attempt: u32,
        candidate: Candidate,
        diagnostics: &[Diagnostic],
    ) -> Outcome {
        let errors = diagnostics.iter().filter(|d| d.is_error()).count();
        let mut artifacts = base_artifacts(&candidate, attempt);
        artifacts.insert("acceptedWithErrors".to_owned(), "true".to_owned());
        artifacts.insert("errorCount".to_owned(), errors.to_string());
        self.publish(ctx, &candidate, &mut artifacts).await;
        Outcome::Succeeded {
            message: format!("{} accepted with {errors} unresolved error(s)", candidate.name),
            artifacts,
            name: candidate.name,
            code: candidate.code,
        }
    }

    /// Save, wrap in a material and preview. Failures here never fail the
    /// task.
    async fn publish(
        &self,
        ctx: &TaskContext,
        candidate: &Candidate,
        artifacts: &mut IndexMap<String, String>,
    ) {
        if !self.config.publish_artifacts {
            return;
        }
        self.progress(ctx, "publishing", 0.9, format!("saving {}", candidate.name))
            .await;

        let saved = self
            .tools
            .save_shader(&SaveShaderArgs {
                code: candidate.code.clone(),
                name: candidate.name.clone(),
                output_directory: ctx.config.output_directory.clone(),
            })
            .await;
        let shader_path = match saved {
            Ok(asset) => asset.path,
            Err(error) => {
                warn!(task_id = %ctx.task_id, %error, "save_shader failed");
                return;
            }
        };
        artifacts.insert("shaderPath".to_owned(), shader_path.clone());

        let material = self
            .tools
            .create_material(&CreateMaterialArgs {
                shader_path,
                material_name: None,
            })
            .await;
        let material_path = match material {
            Ok(asset) => asset.path,
            Err(error) => {
                warn!(task_id = %ctx.task_id, %error, "create_material failed");
                return;
            }
        };
        artifacts.insert("materialPath".to_owned(), material_path.clone());

        if let Err(error) = self.tools.apply_to_preview(&material_path).await {
            warn!(task_id = %ctx.task_id, %error, "apply_to_preview failed");
        }
    }

    fn track(&self, task_id: &TaskId, request_id: Option<RequestId>) {
        if let Some(record) = self.tasks.lock().get(task_id) {
            // Bookkeeping only; waiters are not woken.
            record.snapshot_tx.send_if_modified(|snapshot| {
                snapshot.pending_request = request_id;
                false
            });
        }
    }

    fn set_status(&self, ctx: &TaskContext, to: TaskStatus, attempt: u32, budget: u32) {
        let mut from = None;
        if let Some(record) = self.tasks.lock().get(&ctx.task_id) {
            record.snapshot_tx.send_if_modified(|snapshot| {
                if snapshot.status.is_terminal() {
                    return false;
                }
                from = Some(snapshot.status);
                snapshot.status = to;
                snapshot.attempt = attempt;
                snapshot.max_attempts = budget;
                true
            });
        }
        let Some(from) = from else {
            return;
        };
        debug!(task_id = %ctx.task_id, %from, %to, attempt, budget, "task status changed");
        self.events.publish(TaskEvent::StatusChanged {
            session_id: ctx.session_id.clone(),
            task_id: ctx.task_id.clone(),
            from,
            to,
            attempt,
            max_attempts: budget,
        });
    }

    async fn progress(&self, ctx: &TaskContext, stage: &str, progress: f32, message: String) {
        self.events.publish(TaskEvent::Progress {
            task_id: ctx.task_id.clone(),
            stage: stage.to_owned(),
            progress,
            message: message.clone(),
        });
        self.mirror(MessageKind::Progress(Progress {
            task_id: ctx.task_id.clone(),
            stage: stage.to_owned(),
            progress,
            message,
        }))
        .await;
    }

    async fn preview(&self, ctx: &TaskContext, attempt: u32, candidate: &Candidate) {
        self.events.publish(TaskEvent::Preview {
            task_id: ctx.task_id.clone(),
            attempt,
            shader_name: candidate.name.clone(),
            code: candidate.code.clone(),
        });
        self.mirror(MessageKind::ShaderPreview(ShaderPreview {
            task_id: ctx.task_id.clone(),
            attempt,
            shader_name: candidate.name.clone(),
            code: candidate.code.clone(),
        }))
        .await;
    }

    /// Best-effort notification of the peer.
    async fn mirror(&self, kind: MessageKind) {
        let type_name = kind.type_name().to_owned();
        if let Err(error) = self.connection.send_kind(kind).await {
            debug!(kind = %type_name, %error, "notification not delivered");
        }
    }

    async fn finish(&self, ctx: &TaskContext, outcome: Outcome) {
        // Decided under the task lock, the same lock `cancel` checks, so an
        // accepted cancel always wins over work that finished meanwhile.
        let settled = {
            let tasks = self.tasks.lock();
            let Some(record) = tasks.get(&ctx.task_id) else {
                return;
            };
            let outcome = match *record.cancel_tx.borrow() {
                Some(reason) => Outcome::cancelled(reason),
                None => outcome,
            };
            let mut settled = None;
            record.snapshot_tx.send_if_modified(|snapshot| {
                if snapshot.status.is_terminal() {
                    return false;
                }
                settled = Some(settle(snapshot, outcome));
                false
            });
            settled
        };
        let Some(Settled {
            from,
            status,
            failure,
            attempt,
            budget,
            artifacts,
            message,
            notice,
        }) = settled
        else {
            return;
        };

        match failure {
            None => info!(task_id = %ctx.task_id, attempt, "task succeeded"),
            Some(reason) => warn!(task_id = %ctx.task_id, attempt, %reason, %message, "task failed"),
        }
        self.events.publish(TaskEvent::StatusChanged {
            session_id: ctx.session_id.clone(),
            task_id: ctx.task_id.clone(),
            from,
            to: status,
            attempt,
            max_attempts: budget,
        });
        self.events.publish(TaskEvent::Finished {
            session_id: ctx.session_id.clone(),
            task_id: ctx.task_id.clone(),
            status,
            failure,
            artifacts: artifacts.clone(),
            message: message.clone(),
        });

        if let Some((code, recoverable)) = notice {
            self.mirror(MessageKind::Error(ErrorNotice {
                task_id: Some(ctx.task_id.clone()),
                code,
                message: message.clone(),
                recoverable,
                retry_count: None,
                max_retries: None,
            }))
            .await;
        }
        self.mirror(MessageKind::TaskComplete(TaskComplete {
            task_id: ctx.task_id.clone(),
            success: status == TaskStatus::Succeeded,
            artifacts,
            message,
        }))
        .await;

        // Last: waiters read the snapshot as soon as they are woken.
        if let Some(record) = self.tasks.lock().get(&ctx.task_id) {
            record.snapshot_tx.send_modify(|_| {});
        }
        self.retire(&ctx.task_id);
    }

    /// Keep the newest finished tasks queryable and drop the rest.
    fn retire(&self, task_id: &TaskId) {
        let evicted: Vec<TaskId> = {
            let mut finished = self.finished.lock();
            finished.push_back(task_id.clone());
            let excess = finished.len().saturating_sub(self.config.retained_tasks);
            finished.drain(..excess).collect()
        };
        if evicted.is_empty() {
            return;
        }
        let mut tasks = self.tasks.lock();
        for task_id in &evicted {
            tasks.remove(task_id);
        }
        debug!(evicted = evicted.len(), "finished tasks evicted");
    }
}

struct Settled {
    from: TaskStatus,
    status: TaskStatus,
    failure: Option<FailureReason>,
    attempt: u32,
    budget: u32,
    artifacts: IndexMap<String, String>,
    message: String,
    notice: Option<(ErrorCode, bool)>,
}

/// Write the terminal state of `outcome` into `snapshot`.
fn settle(snapshot: &mut TaskSnapshot, outcome: Outcome) -> Settled {
    let from = snapshot.status;
    let (status, failure, artifacts, message, notice) = match outcome {
        Outcome::Succeeded {
            artifacts,
            message,
            name,
            code,
        } => {
            snapshot.shader_name = Some(name);
            snapshot.final_code = Some(code);
            (TaskStatus::Succeeded, None, artifacts, message, None)
        }
        Outcome::Failed {
            reason,
            code,
            message,
        } => {
            let notice = matches!(reason, FailureReason::GeneratorFailed | FailureReason::Internal)
                .then_some((code, reason == FailureReason::GeneratorFailed));
            (TaskStatus::Failed, Some(reason), IndexMap::new(), message, notice)
        }
    };
    snapshot.status = status;
    snapshot.failure = failure;
    snapshot.artifacts = artifacts.clone();
    snapshot.message = message.clone();
    snapshot.pending_request = None;
    Settled {
        from,
        status,
        failure,
        attempt: snapshot.attempt,
        budget: snapshot.max_attempts,
        artifacts,
        message,
        notice,
    }
}

fn base_artifacts(candidate: &Candidate, attempt: u32) -> IndexMap<String, String> {
    let mut artifacts = IndexMap::new();
    artifacts.insert("shaderName".to_owned(), candidate.name.clone());
    artifacts.insert("attempts".to_owned(), attempt.to_string());
    artifacts.insert("codeSha256".to_owned(), sha256_hex(&candidate.code));
    artifacts
}

fn sha256_hex(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        GLOW_SHADER, PeerScript, ScriptedGenerator, connected, eventually, orchestrator, reply,
        scripted, serve, tool_ok,
    };
    use anyhow::{Context, Result};
    use serde_json::json;
    use shaderlink_protocol::{ConnectionConfig, decode};
    use shaderlink_transport::memory_transport;

    fn request(requirement: &str, max_retry_count: u32) -> TaskRequest {
        TaskRequest {
            session_id: SessionId::from("s-1"),
            requirement: requirement.to_owned(),
            images: Vec::new(),
            config: SessionConfig {
                max_retry_count,
                ..SessionConfig::default()
            },
        }
    }

    fn statuses(events: &mut broadcast::Receiver<TaskEvent>, task_id: &TaskId) -> Vec<TaskStatus> {
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let TaskEvent::StatusChanged { task_id: id, to, .. } = event
                && &id == task_id
            {
                seen.push(to);
            }
        }
        seen
    }

    #[tokio::test]
    async fn clean_first_attempt_succeeds_and_publishes() -> Result<()> {
        let (connection, log, _peer) = scripted(PeerScript::default()).await?;
        let orchestrator = orchestrator(&connection, Arc::new(ScriptedGenerator::default()));
        let mut events = orchestrator.events();

        let task_id = orchestrator.start(request("a glowing rim light", 3))?;
        let done = orchestrator.wait(&task_id).await.context("task vanished")?;

        assert_eq!(done.status, TaskStatus::Succeeded);
        assert_eq!(done.attempt, 1);
        assert_eq!(done.shader_name.as_deref(), Some("Custom/Glow"));
        assert_eq!(done.final_code.as_deref(), Some(GLOW_SHADER));
        assert_eq!(done.artifacts["attempts"], "1");
        assert_eq!(done.artifacts["codeSha256"], sha256_hex(GLOW_SHADER));
        assert_eq!(
            done.artifacts["shaderPath"],
            "Assets/Shaders/Generated/save_shader"
        );
        assert!(done.artifacts.contains_key("materialPath"));
        assert_eq!(
            statuses(&mut events, &task_id),
            vec![
                TaskStatus::Generating,
                TaskStatus::Validating,
                TaskStatus::Succeeded
            ]
        );
        assert_eq!(
            log.tool_calls(),
            vec![
                "compile_shader",
                "save_shader",
                "create_material",
                "apply_to_preview"
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn persistent_errors_escalate_after_the_retry_budget() -> Result<()> {
        let (connection, log, _peer) = scripted(PeerScript::always_failing()).await?;
        let orchestrator = orchestrator(&connection, Arc::new(ScriptedGenerator::default()));
        let mut events = orchestrator.events();

        let task_id = orchestrator.start(request("a dissolve effect", 3))?;
        let waiting = orchestrator
            .wait_for(&task_id, TaskStatus::AwaitingUser)
            .await
            .context("task vanished")?;
        assert_eq!(waiting.status, TaskStatus::AwaitingUser);
        assert_eq!(waiting.attempt, 3);

        let seen = statuses(&mut events, &task_id);
        let visits = |status| seen.iter().filter(|s| **s == status).count();
        assert_eq!(visits(TaskStatus::Generating), 3);
        assert_eq!(visits(TaskStatus::Validating), 3);
        assert_eq!(visits(TaskStatus::Succeeded), 0);
        assert_eq!(log.count("ToolCall"), 3);

        assert!(eventually(|| log.count("ConfirmRequest") == 1).await);
        let envelopes = log.envelopes();
        let notice = envelopes
            .iter()
            .find_map(|envelope| match &envelope.kind {
                MessageKind::Error(notice) => Some(notice.clone()),
                _ => None,
            })
            .context("no error notice")?;
        assert_eq!(notice.code, ErrorCode::CompileFailed);
        assert!(notice.recoverable);
        assert_eq!(
            (notice.retry_count, notice.max_retries),
            (Some(3), Some(3))
        );
        let confirm = envelopes
            .iter()
            .find_map(|envelope| match &envelope.kind {
                MessageKind::ConfirmRequest(request) => Some(request.clone()),
                _ => None,
            })
            .context("no confirmation request")?;
        assert_eq!(confirm.kind, "retry_exhausted");
        assert_eq!(confirm.options, vec!["continue", "accept", "abandon"]);

        // Cancelling while suspended withdraws the confirmation.
        assert!(orchestrator.cancel(&task_id, FailureReason::UserCancelled));
        let done = orchestrator.wait(&task_id).await.context("task vanished")?;
        assert_eq!(done.failure, Some(FailureReason::UserCancelled));
        assert!(!connection.registry().is_pending(&confirm.confirm_id));
        Ok(())
    }

    #[tokio::test]
    async fn accepting_keeps_the_last_attempt_with_its_errors() -> Result<()> {
        let script = PeerScript {
            confirm: Some(ConfirmChoice::Accept),
            ..PeerScript::always_failing()
        };
        let (connection, _log, _peer) = scripted(script).await?;
        let orchestrator = orchestrator(&connection, Arc::new(ScriptedGenerator::default()));

        let task_id = orchestrator.start(request("a toon ramp", 2))?;
        let done = orchestrator.wait(&task_id).await.context("task vanished")?;

        assert_eq!(done.status, TaskStatus::Succeeded);
        assert_eq!(done.attempt, 2);
        assert_eq!(done.artifacts["acceptedWithErrors"], "true");
        assert_eq!(done.artifacts["errorCount"], "1");
        Ok(())
    }

    #[tokio::test]
    async fn continuing_grants_another_round_of_attempts() -> Result<()> {
        let script = PeerScript {
            compile: Box::new(|call| {
                if call <= 2 {
                    Some(CompileReport::failed(vec![Diagnostic::error(3, "syntax error")]))
                } else {
                    Some(CompileReport::clean())
                }
            }),
            confirm: Some(ConfirmChoice::Continue),
            ..PeerScript::default()
        };
        let (connection, _log, _peer) = scripted(script).await?;
        let orchestrator = orchestrator(&connection, Arc::new(ScriptedGenerator::default()));

        let task_id = orchestrator.start(request("a hologram", 2))?;
        let done = orchestrator.wait(&task_id).await.context("task vanished")?;

        assert_eq!(done.status, TaskStatus::Succeeded);
        assert_eq!(done.attempt, 3);
        assert_eq!(done.max_attempts, 4);
        Ok(())
    }

    #[tokio::test]
    async fn abandoning_fails_the_task() -> Result<()> {
        let script = PeerScript {
            confirm: Some(ConfirmChoice::Abandon),
            ..PeerScript::always_failing()
        };
        let (connection, _log, _peer) = scripted(script).await?;
        let orchestrator = orchestrator(&connection, Arc::new(ScriptedGenerator::default()));

        let task_id = orchestrator.start(request("a water surface", 1))?;
        let done = orchestrator.wait(&task_id).await.context("task vanished")?;

        assert_eq!(done.status, TaskStatus::Failed);
        assert_eq!(done.failure, Some(FailureReason::Abandoned));
        Ok(())
    }

    #[tokio::test]
    async fn repairs_carry_previous_code_and_only_the_latest_diagnostics() -> Result<()> {
        let script = PeerScript {
            compile: Box::new(|call| {
                Some(match call {
                    1 => CompileReport::failed(vec![Diagnostic::error(4, "first problem")]),
                    2 => CompileReport::failed(vec![Diagnostic::error(9, "second problem")]),
                    _ => CompileReport::clean(),
                })
            }),
            ..PeerScript::default()
        };
        let (connection, _log, _peer) = scripted(script).await?;
        let generator = Arc::new(ScriptedGenerator::default());
        let orchestrator = orchestrator(&connection, generator.clone());

        let task_id = orchestrator.start(request("a fresnel glow", 3))?;
        let done = orchestrator.wait(&task_id).await.context("task vanished")?;
        assert_eq!(done.status, TaskStatus::Succeeded);

        let requests = generator.requests();
        assert_eq!(requests.len(), 3);
        assert!(!requests[0].is_repair());
        assert!(requests[0].diagnostics.is_empty());
        assert_eq!(requests[1].previous_code.as_deref(), Some(GLOW_SHADER));
        assert_eq!(requests[2].attempt, 3);
        let latest: Vec<_> = requests[2].diagnostics.iter().map(|d| d.message.as_str()).collect();
        assert_eq!(latest, vec!["second problem"]);
        Ok(())
    }

    #[tokio::test]
    async fn generator_failure_ends_with_llm_error() -> Result<()> {
        let (connection, log, _peer) = scripted(PeerScript::default()).await?;
        let orchestrator = orchestrator(&connection, Arc::new(ScriptedGenerator::offline()));

        let task_id = orchestrator.start(request("anything", 3))?;
        let done = orchestrator.wait(&task_id).await.context("task vanished")?;

        assert_eq!(done.status, TaskStatus::Failed);
        assert_eq!(done.failure, Some(FailureReason::GeneratorFailed));
        assert_eq!(log.count("ToolCall"), 0);
        assert!(eventually(|| log.count("TaskComplete") == 1).await);
        let llm_error = log.envelopes().into_iter().any(|envelope| {
            matches!(envelope.kind, MessageKind::Error(notice) if notice.code == ErrorCode::LlmError)
        });
        assert!(llm_error);
        Ok(())
    }

    #[tokio::test]
    async fn cancel_during_validation_ignores_the_late_result() -> Result<()> {
        let (connection, mut peer) = connected().await?;
        let orchestrator = orchestrator(&connection, Arc::new(ScriptedGenerator::default()));

        let task_id = orchestrator.start(request("a pulsing outline", 3))?;
        let call = loop {
            let text = peer.recv_text().await.context("link closed")?;
            if let MessageKind::ToolCall(call) = decode(&text)?.kind {
                break call;
            }
        };
        assert!(
            eventually(|| {
                orchestrator
                    .snapshot(&task_id)
                    .is_some_and(|s| s.pending_request.as_ref() == Some(&call.request_id))
            })
            .await
        );

        assert!(orchestrator.cancel(&task_id, FailureReason::UserCancelled));
        let done = orchestrator.wait(&task_id).await.context("task vanished")?;
        assert_eq!(done.status, TaskStatus::Failed);
        assert_eq!(done.failure, Some(FailureReason::UserCancelled));
        assert!(!connection.registry().is_pending(&call.request_id));

        assert!(peer.send_text(reply(tool_ok(&call, json!(CompileReport::clean())))));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let after = orchestrator.snapshot(&task_id).context("task vanished")?;
        assert_eq!(after.status, TaskStatus::Failed);
        assert!(!orchestrator.cancel(&task_id, FailureReason::UserCancelled));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn validation_timeout_consumes_an_attempt() -> Result<()> {
        let script = PeerScript {
            compile: Box::new(|call| (call > 1).then(CompileReport::clean)),
            ..PeerScript::default()
        };
        let (connection, _log, _peer) = scripted(script).await?;
        let generator = Arc::new(ScriptedGenerator::default());
        let orchestrator = orchestrator(&connection, generator.clone());

        let task_id = orchestrator.start(request("a scanline effect", 3))?;
        let done = orchestrator.wait(&task_id).await.context("task vanished")?;

        assert_eq!(done.status, TaskStatus::Succeeded);
        assert_eq!(done.attempt, 2);
        let retry = &generator.requests()[1];
        assert!(retry.diagnostics[0].message.contains("validation did not complete"));
        Ok(())
    }

    #[tokio::test]
    async fn invalid_retry_bound_is_rejected_up_front() -> Result<()> {
        let (connection, _peer) = connected().await?;
        let orchestrator = orchestrator(&connection, Arc::new(ScriptedGenerator::default()));
        let err = orchestrator.start(request("x", 0)).unwrap_err();
        assert!(matches!(err, LinkError::InvalidConfig(_)));
        assert!(orchestrator.tasks_for(&SessionId::from("s-1")).is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn compiler_failures_are_repaired_like_compile_errors() -> Result<()> {
        let script = PeerScript {
            crashed_compiles: vec![1],
            garbled_compiles: vec![2],
            ..PeerScript::default()
        };
        let (connection, _log, _peer) = scripted(script).await?;
        let generator = Arc::new(ScriptedGenerator::default());
        let orchestrator = orchestrator(&connection, generator.clone());

        let task_id = orchestrator.start(request("a hologram flicker", 3))?;
        let done = orchestrator.wait(&task_id).await.context("task vanished")?;

        assert_eq!(done.status, TaskStatus::Succeeded);
        assert_eq!(done.attempt, 3);
        let requests = generator.requests();
        let crash = &requests[1].diagnostics[0];
        assert_eq!(crash.severity, Severity::Error);
        assert!(crash.message.contains("shader compiler crashed"));
        assert!(requests[2].diagnostics[0].message.contains("unreadable report"));
        Ok(())
    }

    #[tokio::test]
    async fn compiler_failures_escalate_when_retries_run_out() -> Result<()> {
        let script = PeerScript {
            crashed_compiles: vec![1, 2],
            confirm: Some(ConfirmChoice::Abandon),
            ..PeerScript::default()
        };
        let (connection, log, _peer) = scripted(script).await?;
        let orchestrator = orchestrator(&connection, Arc::new(ScriptedGenerator::default()));

        let task_id = orchestrator.start(request("a hologram flicker", 2))?;
        let done = orchestrator.wait(&task_id).await.context("task vanished")?;

        assert_eq!(done.failure, Some(FailureReason::Abandoned));
        assert_eq!(log.count("ConfirmRequest"), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn connection_drop_during_validation_consumes_an_attempt() -> Result<()> {
        let (connector, mut acceptor) = memory_transport();
        let connection = ConnectionManager::new(ConnectionConfig::default(), Arc::new(connector));
        connection.connect().await?;
        let mut first = acceptor.accept().await.context("peer never connected")?;
        let generator = Arc::new(ScriptedGenerator::default());
        let orchestrator = orchestrator(&connection, generator.clone());

        let task_id = orchestrator.start(request("a dissolve effect", 3))?;
        loop {
            let text = first.recv_text().await.context("link closed")?;
            if let MessageKind::ToolCall(call) = decode(&text)?.kind {
                assert_eq!(call.tool_name, "compile_shader");
                break;
            }
        }
        drop(first);

        let second = acceptor.accept().await.context("link never came back")?;
        let (_log, _peer) = serve(second, PeerScript::default());
        let done = orchestrator.wait(&task_id).await.context("task vanished")?;

        assert_eq!(done.status, TaskStatus::Succeeded);
        assert_eq!(done.attempt, 2);
        let retry = &generator.requests()[1];
        assert!(retry.diagnostics[0].message.contains("validation did not complete"));
        Ok(())
    }

    #[tokio::test]
    async fn finished_tasks_beyond_the_retention_window_are_evicted() -> Result<()> {
        let (connection, _log, _peer) = scripted(PeerScript::default()).await?;
        let orchestrator = GenerationOrchestrator::new(
            connection.clone(),
            Arc::new(ScriptedGenerator::default()),
            RuntimeConfig {
                retained_tasks: 1,
                ..RuntimeConfig::default()
            },
            EventStreamHub::new(64),
        );

        let first = orchestrator.start(request("a toon ramp", 3))?;
        let done = orchestrator.wait(&first).await.context("task vanished")?;
        assert_eq!(done.status, TaskStatus::Succeeded);

        let second = orchestrator.start(request("a rim light", 3))?;
        let done = orchestrator.wait(&second).await.context("task vanished")?;
        assert_eq!(done.status, TaskStatus::Succeeded);

        assert!(eventually(|| orchestrator.snapshot(&first).is_none()).await);
        assert!(orchestrator.wait(&first).await.is_none());
        assert!(orchestrator.snapshot(&second).is_some());
        assert_eq!(orchestrator.tasks_for(&SessionId::from("s-1")).len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn accepted_cancel_wins_over_a_finished_attempt() -> Result<()> {
        let (connection, _peer) = connected().await?;
        let orchestrator = orchestrator(&connection, Arc::new(ScriptedGenerator::default()));
        let ctx = orchestrator.register(request("a shield bubble", 3))?;
        let task_id = ctx.task_id.clone();

        assert!(orchestrator.cancel(&task_id, FailureReason::UserCancelled));
        let candidate = Candidate {
            code: GLOW_SHADER.to_owned(),
            name: "Custom/Glow".to_owned(),
        };
        let outcome = Outcome::Succeeded {
            artifacts: base_artifacts(&candidate, 1),
            message: "compiled".to_owned(),
            name: candidate.name,
            code: candidate.code,
        };
        orchestrator.inner.finish(&ctx, outcome).await;

        let done = orchestrator.snapshot(&task_id).context("task vanished")?;
        assert_eq!(done.status, TaskStatus::Failed);
        assert_eq!(done.failure, Some(FailureReason::UserCancelled));
        assert!(done.final_code.is_none());
        assert!(!orchestrator.cancel(&task_id, FailureReason::UserCancelled));
        Ok(())
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn task_futures_are_send() -> Result<()> {
        let (connection, _peer) = connected().await?;
        let orchestrator = orchestrator(&connection, Arc::new(ScriptedGenerator::default()));
        let ctx = orchestrator.register(request("a shield bubble", 3))?;

        let (_cancel_tx, mut cancel_rx) = watch::channel(None);
        let waiting = cancelled(&mut cancel_rx);
        assert_send(&waiting);
        drop(waiting);

        let task = run_task(Arc::clone(&orchestrator.inner), ctx);
        assert_send(&task);
        Ok(())
    }
}
