//! Worker side: engine seam, task state machine, and service loops.
//!
//! The engine is whatever actually executes a task; it sits behind the
//! [`Engine`]/[`EngineSession`] traits so the dispatch machinery is
//! testable with a scripted double. [`TaskRunner`] drives one task from
//! assignment to exactly one terminal record; [`WorkerRuntime`] answers
//! describe/assign/dismiss traffic and keeps the fleet informed of this
//! agent's state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::broker::MessageStream;
use crate::connection::ConnectionManager;
use crate::error::Result;
use crate::help::{Answers, HelpCoordinator};
use crate::protocol::{
    AgentDescriptor, DismissAck, DismissRequest, DisplayEndpoint, ExecState, HelpQuestion,
    StatusUpdate, TaskAck, TaskAssigned, TaskAssignment, TaskComplete, TaskErrored, TaskMessage,
};
use crate::subjects;

/// One step produced by a running engine session.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Intermediate output; forwarded to the durable task log.
    Progress(Value),
    /// The engine is blocked on a decision only a human can make.
    Decision { questions: Vec<HelpQuestion> },
    /// Terminal success, with an optional result value.
    Done(Option<Value>),
}

/// A single running task inside the engine.
#[async_trait]
pub trait EngineSession: Send {
    /// Next event. `Ok(None)` means the engine ended without reporting
    /// completion, which the runner records as a fault.
    async fn next_event(&mut self) -> Result<Option<EngineEvent>>;

    /// Deliver the outcome of the last `Decision` event. `None` tells
    /// the engine to proceed on its own best judgment.
    async fn resolve_decision(&mut self, answers: Option<Answers>) -> Result<()>;

    /// Release engine resources. Called on every exit path.
    async fn close(&mut self);
}

#[async_trait]
pub trait Engine: Send + Sync + 'static {
    async fn start(&self, assignment: &TaskAssignment) -> Result<Box<dyn EngineSession>>;
}

/// How long a worker waits on a help request before proceeding alone.
pub const DEFAULT_HELP_TIMEOUT: Duration = Duration::from_secs(300);

/// Drives one assignment to its terminal record.
pub struct TaskRunner {
    manager: Arc<ConnectionManager>,
    help: HelpCoordinator,
    agent_id: String,
    help_timeout: Duration,
}

impl TaskRunner {
    pub fn new(
        manager: Arc<ConnectionManager>,
        help: HelpCoordinator,
        agent_id: impl Into<String>,
    ) -> Self {
        Self {
            manager,
            help,
            agent_id: agent_id.into(),
            help_timeout: DEFAULT_HELP_TIMEOUT,
        }
    }

    pub fn with_help_timeout(mut self, timeout: Duration) -> Self {
        self.help_timeout = timeout;
        self
    }

    /// Run one assignment end to end. Exactly one durable terminal is
    /// published unless the assignment itself is unusable, in which case
    /// it is logged and dropped before any record is written.
    pub async fn run(&self, engine: &dyn Engine, assignment: TaskAssignment) -> Result<()> {
        let Some(task_id) = assignment.task_id.clone() else {
            warn!(
                target = "agent_fleet::worker",
                agent_id = %self.agent_id,
                "dropping assignment without a task id"
            );
            return Ok(());
        };

        self.publish_durable(
            &subjects::task_event(&task_id, "assigned"),
            &TaskAssigned {
                task_id: task_id.clone(),
                agent_id: self.agent_id.clone(),
                prompt: assignment.prompt.clone(),
            },
        )
        .await?;
        info!(
            target = "agent_fleet::worker",
            task_id = %task_id,
            "task started"
        );

        let mut session = match engine.start(&assignment).await {
            Ok(session) => session,
            Err(err) => {
                self.publish_error(&task_id, format!("engine start failed: {err}"))
                    .await?;
                return Ok(());
            }
        };

        let outcome = self.pump_session(&mut session, &task_id).await;
        session.close().await;

        match outcome {
            SessionOutcome::Done(result) => {
                self.publish_durable(
                    &subjects::task_event(&task_id, "complete"),
                    &TaskComplete {
                        task_id: task_id.clone(),
                        agent_id: self.agent_id.clone(),
                        result,
                    },
                )
                .await?;
                info!(
                    target = "agent_fleet::worker",
                    task_id = %task_id,
                    "task complete"
                );
            }
            SessionOutcome::Fault(message) => {
                error!(
                    target = "agent_fleet::worker",
                    task_id = %task_id,
                    error = %message,
                    "task failed"
                );
                self.publish_error(&task_id, message).await?;
            }
        }
        Ok(())
    }

    async fn pump_session(
        &self,
        session: &mut Box<dyn EngineSession>,
        task_id: &str,
    ) -> SessionOutcome {
        loop {
            match session.next_event().await {
                Ok(Some(EngineEvent::Progress(body))) => {
                    // A dropped progress record must not kill the task.
                    if let Err(err) = self
                        .publish_durable(
                            &subjects::task_event(task_id, "message"),
                            &TaskMessage {
                                task_id: task_id.to_string(),
                                agent_id: self.agent_id.clone(),
                                body,
                            },
                        )
                        .await
                    {
                        warn!(
                            target = "agent_fleet::worker",
                            task_id,
                            error = %err,
                            "progress record lost"
                        );
                    }
                }
                Ok(Some(EngineEvent::Decision { questions })) => {
                    let answers = match self.help.ask(task_id, questions, self.help_timeout).await {
                        Ok(answers) => answers,
                        Err(err) => {
                            // Transport trouble counts as an unanswered
                            // request; the engine proceeds unassisted.
                            warn!(
                                target = "agent_fleet::worker",
                                task_id,
                                error = %err,
                                "help request failed"
                            );
                            None
                        }
                    };
                    if let Err(err) = session.resolve_decision(answers).await {
                        return SessionOutcome::Fault(format!("decision delivery failed: {err}"));
                    }
                }
                Ok(Some(EngineEvent::Done(result))) => return SessionOutcome::Done(result),
                Ok(None) => {
                    return SessionOutcome::Fault("engine ended without completing".to_string())
                }
                Err(err) => return SessionOutcome::Fault(err.to_string()),
            }
        }
    }

    async fn publish_error(&self, task_id: &str, message: String) -> Result<()> {
        self.publish_durable(
            &subjects::task_event(task_id, "error"),
            &TaskErrored {
                task_id: task_id.to_string(),
                agent_id: self.agent_id.clone(),
                error: message,
            },
        )
        .await
    }

    async fn publish_durable<T: serde::Serialize>(&self, subject: &str, payload: &T) -> Result<()> {
        let conn = self.manager.current()?;
        conn.publish_durable(subject, Bytes::from(serde_json::to_vec(payload)?))
            .await
    }
}

enum SessionOutcome {
    Done(Option<Value>),
    Fault(String),
}

/// Static identity a worker advertises.
#[derive(Debug, Clone)]
pub struct WorkerIdentity {
    pub agent_id: String,
    pub capabilities: Vec<String>,
    pub display: Option<DisplayEndpoint>,
}

/// The worker service: presence, describe replies, assignment intake,
/// and dismissal handling.
pub struct WorkerRuntime {
    manager: Arc<ConnectionManager>,
    identity: WorkerIdentity,
    engine: Arc<dyn Engine>,
    help_timeout: Duration,
    exec: Arc<Mutex<ExecSlot>>,
}

#[derive(Default)]
struct ExecSlot {
    busy: bool,
    task_id: Option<String>,
}

impl WorkerRuntime {
    pub fn new(
        manager: Arc<ConnectionManager>,
        identity: WorkerIdentity,
        engine: Arc<dyn Engine>,
    ) -> Self {
        Self {
            manager,
            identity,
            engine,
            help_timeout: DEFAULT_HELP_TIMEOUT,
            exec: Arc::new(Mutex::new(ExecSlot::default())),
        }
    }

    pub fn with_help_timeout(mut self, timeout: Duration) -> Self {
        self.help_timeout = timeout;
        self
    }

    fn descriptor(&self) -> AgentDescriptor {
        let exec = self.exec.lock();
        AgentDescriptor {
            id: self.identity.agent_id.clone(),
            state: if exec.busy {
                ExecState::Busy
            } else {
                ExecState::Idle
            },
            capabilities: self.identity.capabilities.clone(),
            display: self.identity.display.clone(),
        }
    }

    /// Announce presence and start the service loops on the current
    /// connection. Called from the recovery sequence, so a reconnect
    /// re-establishes everything.
    pub async fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<()> {
        let conn = self.manager.current()?;
        let id = &self.identity.agent_id;

        let describe = conn.subscribe(subjects::DESCRIBE).await?;
        let tasks = conn.subscribe(&subjects::agent_task(id)).await?;
        let dismissals = conn.subscribe(&subjects::agent_dismiss(id)).await?;

        conn.publish(
            &subjects::agent_online(id),
            Bytes::from(serde_json::to_vec(&self.descriptor())?),
        )
        .await?;

        tokio::spawn(self.clone().describe_loop(describe, shutdown.clone()));
        tokio::spawn(self.clone().task_loop(tasks, shutdown.clone()));
        tokio::spawn(self.clone().dismiss_loop(dismissals, shutdown));
        Ok(())
    }

    /// Graceful shutdown: tell the fleet this agent is gone.
    pub async fn announce_offline(&self) -> Result<()> {
        let conn = self.manager.current()?;
        conn.publish(
            &subjects::agent_offline(&self.identity.agent_id),
            Bytes::from_static(b"{}"),
        )
        .await
    }

    async fn describe_loop(
        self: Arc<Self>,
        mut stream: MessageStream,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let msg = tokio::select! {
                msg = stream.next() => msg,
                _ = shutdown.changed() => return,
            };
            let Some(msg) = msg else { return };
            let Some(reply) = msg.reply else {
                debug!(
                    target = "agent_fleet::worker",
                    "describe without reply subject, ignoring"
                );
                continue;
            };
            let body = match serde_json::to_vec(&self.descriptor()) {
                Ok(body) => body,
                Err(_) => continue,
            };
            if let Ok(conn) = self.manager.current() {
                let _ = conn.publish(&reply, Bytes::from(body)).await;
            }
        }
    }

    async fn task_loop(
        self: Arc<Self>,
        mut stream: MessageStream,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let msg = tokio::select! {
                msg = stream.next() => msg,
                _ = shutdown.changed() => return,
            };
            let Some(msg) = msg else { return };

            let assignment: TaskAssignment = match serde_json::from_slice(&msg.payload) {
                Ok(assignment) => assignment,
                Err(err) => {
                    warn!(
                        target = "agent_fleet::worker",
                        error = %err,
                        "undecodable assignment"
                    );
                    self.ack(msg.reply.as_deref(), false, Some("undecodable assignment"))
                        .await;
                    continue;
                }
            };

            let claimed = {
                let mut exec = self.exec.lock();
                if exec.busy {
                    false
                } else {
                    exec.busy = true;
                    exec.task_id = assignment.task_id.clone();
                    true
                }
            };
            if !claimed {
                self.ack(msg.reply.as_deref(), false, Some("busy")).await;
                continue;
            }
            self.ack(msg.reply.as_deref(), true, None).await;
            self.broadcast_status().await;

            let worker = self.clone();
            tokio::spawn(async move {
                let help = HelpCoordinator::new(
                    worker.manager.clone(),
                    worker.identity.agent_id.clone(),
                );
                let runner =
                    TaskRunner::new(worker.manager.clone(), help, worker.identity.agent_id.clone())
                        .with_help_timeout(worker.help_timeout);
                if let Err(err) = runner.run(worker.engine.as_ref(), assignment).await {
                    error!(
                        target = "agent_fleet::worker",
                        error = %err,
                        "task runner failed"
                    );
                }
                {
                    let mut exec = worker.exec.lock();
                    exec.busy = false;
                    exec.task_id = None;
                }
                worker.broadcast_status().await;
            });
        }
    }

    async fn dismiss_loop(
        self: Arc<Self>,
        mut stream: MessageStream,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let msg = tokio::select! {
                msg = stream.next() => msg,
                _ = shutdown.changed() => return,
            };
            let Some(msg) = msg else { return };
            let request: DismissRequest = match serde_json::from_slice(&msg.payload) {
                Ok(request) => request,
                Err(err) => {
                    warn!(
                        target = "agent_fleet::worker",
                        error = %err,
                        "undecodable dismissal"
                    );
                    continue;
                }
            };
            // Resolving the parked help request goes through its reply
            // subject, same as an operator answer, so the coordinator
            // needs no extra wiring.
            let answer = crate::protocol::HelpAnswer {
                request_id: request.request_id.clone(),
                answers: Vec::new(),
                error: Some(
                    request
                        .reason
                        .unwrap_or_else(|| "dismissed".to_string()),
                ),
                answered_by: None,
            };
            let dismissed = match self.manager.current() {
                Ok(conn) => {
                    let sent = conn
                        .publish(
                            &subjects::help_reply(&request.request_id),
                            Bytes::from(serde_json::to_vec(&answer).unwrap_or_default()),
                        )
                        .await
                        .is_ok();
                    if let Some(reply) = msg.reply.as_deref() {
                        let ack = DismissAck { dismissed: sent };
                        let _ = conn
                            .publish(
                                reply,
                                Bytes::from(serde_json::to_vec(&ack).unwrap_or_default()),
                            )
                            .await;
                    }
                    sent
                }
                Err(_) => false,
            };
            info!(
                target = "agent_fleet::worker",
                request_id = %request.request_id,
                dismissed,
                "dismissal handled"
            );
        }
    }

    async fn ack(&self, reply: Option<&str>, accepted: bool, reason: Option<&str>) {
        let Some(reply) = reply else { return };
        let ack = TaskAck {
            accepted,
            reason: reason.map(str::to_string),
        };
        if let Ok(conn) = self.manager.current() {
            if let Ok(body) = serde_json::to_vec(&ack) {
                let _ = conn.publish(reply, Bytes::from(body)).await;
            }
        }
    }

    async fn broadcast_status(&self) {
        let (state, task_id) = {
            let exec = self.exec.lock();
            (
                if exec.busy {
                    ExecState::Busy
                } else {
                    ExecState::Idle
                },
                exec.task_id.clone(),
            )
        };
        let update = StatusUpdate {
            agent_id: self.identity.agent_id.clone(),
            state,
            task_id,
        };
        if let Ok(conn) = self.manager.current() {
            if let Ok(body) = serde_json::to_vec(&update) {
                let _ = conn
                    .publish(&subjects::agent_status(&self.identity.agent_id), Bytes::from(body))
                    .await;
            }
        }
    }
}
