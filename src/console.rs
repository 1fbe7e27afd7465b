//! Operator console.
//!
//! Ties the connection manager, intake, projection, and request client
//! into one handle: submit tasks, answer or dismiss help requests, read
//! roster and timeline snapshots. Every reconnect replays the recovery
//! sequence, so the projection is rebuilt from the durable logs and a
//! fresh roster gather rather than patched incrementally.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::broker::{BrokerConnection, BrokerConnector, LogConfig};
use crate::connection::{ConnectionManager, ConnectionPhase, ConnectionStatus, RecoveryFn};
use crate::error::{FleetError, Result};
use crate::intake;
use crate::protocol::{
    AgentDescriptor, DismissAck, DismissRequest, FleetEvent, HelpAnswer, HelpResponded, TaskAck,
    TaskAssignment,
};
use crate::request::RequestClient;
use crate::state::{AgentEntry, EventRecord, HelpEntry, HelpStatus, SharedState};
use crate::subjects;

/// How long the roster gather waits for describe replies.
const SNAPSHOT_WINDOW: Duration = Duration::from_millis(750);
/// Default timeout for directed requests (task submit, dismissals).
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
/// Retention for the durable logs this console ensures on connect.
const LOG_MAX_AGE: Duration = Duration::from_secs(24 * 3600);

/// Outcome of a task submission.
#[derive(Debug, Clone)]
pub struct TaskSubmission {
    pub task_id: String,
    pub accepted: bool,
    pub reason: Option<String>,
}

pub struct Console {
    manager: Arc<ConnectionManager>,
    state: SharedState,
    client: RequestClient,
    operator: String,
    shutdown_tx: watch::Sender<bool>,
}

impl Console {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        operator: impl Into<String>,
        backoff_base: Duration,
        backoff_ceiling: Duration,
    ) -> Self {
        let manager = ConnectionManager::new(connector, backoff_base, backoff_ceiling);
        let client = RequestClient::new(manager.clone());
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            manager,
            state: SharedState::new(),
            client,
            operator: operator.into(),
            shutdown_tx,
        }
    }

    /// Start the connection supervision and wait for the first
    /// successful recovery.
    pub async fn connect(&self) -> Result<()> {
        self.manager.connect(self.recovery());
        self.spawn_status_watcher();
        self.manager.wait_connected().await
    }

    /// Stop reconnecting and close the transport.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.manager.disconnect().await;
    }

    fn recovery(&self) -> Arc<RecoveryFn> {
        let state = self.state.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        Arc::new(move |conn: Arc<dyn BrokerConnection>| {
            let state = state.clone();
            let shutdown_rx = shutdown_rx.clone();
            Box::pin(async move {
                ensure_logs(&conn).await?;
                // Replay rebuilds the timeline; local cache goes first.
                state.begin_replay();
                intake::start(&conn, &state, shutdown_rx).await?;
                gather_roster(&conn, &state).await;
                state.note("connected");
                Ok(())
            })
        })
    }

    fn spawn_status_watcher(&self) {
        let mut rx = self.manager.status();
        let state = self.state.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut was_connected = false;
            loop {
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    _ = shutdown.changed() => return,
                }
                let status: ConnectionStatus = rx.borrow().clone();
                if status.phase == ConnectionPhase::Connected {
                    was_connected = true;
                } else if connection_lost(was_connected, status.phase) {
                    was_connected = false;
                    state.mark_all_unreachable();
                    state.note("connection lost");
                }
            }
        });
    }

    /// Dispatch a prompt to an agent. A fresh task id is minted here;
    /// the rejection reason (busy, unreachable) comes back in the
    /// submission outcome rather than as an error.
    pub async fn submit_task(
        &self,
        agent_id: &str,
        prompt: &str,
        options: serde_json::Map<String, Value>,
    ) -> Result<TaskSubmission> {
        if !subjects::valid_id(agent_id) {
            return Err(FleetError::ProtocolViolation(format!(
                "invalid agent id {agent_id:?}"
            )));
        }
        let task_id = Uuid::new_v4().to_string();
        let assignment = TaskAssignment {
            task_id: Some(task_id.clone()),
            prompt: prompt.to_string(),
            options,
        };
        let ack: TaskAck = self
            .client
            .request(&subjects::agent_task(agent_id), &assignment, REQUEST_TIMEOUT)
            .await?;
        info!(
            target = "agent_fleet::console",
            task_id = %task_id,
            agent_id,
            accepted = ack.accepted,
            "task submitted"
        );
        Ok(TaskSubmission {
            task_id,
            accepted: ack.accepted,
            reason: ack.reason,
        })
    }

    /// Answer a pending help request: unblock the worker on its reply
    /// subject, and write the durable response record so every observer
    /// (including this one, via intake) sees the resolution.
    pub async fn respond_help(&self, request_id: &str, answers: Vec<Vec<String>>) -> Result<()> {
        let conn = self.manager.current()?;
        let answer = HelpAnswer {
            request_id: request_id.to_string(),
            answers: answers.clone(),
            error: None,
            answered_by: Some(self.operator.clone()),
        };
        conn.publish(
            &subjects::help_reply(request_id),
            Bytes::from(serde_json::to_vec(&answer)?),
        )
        .await?;

        let record = HelpResponded {
            request_id: request_id.to_string(),
            answered_by: self.operator.clone(),
            answers,
            dismissed: false,
            timed_out: false,
        };
        conn.publish_durable(
            &subjects::helpdesk_responded(request_id),
            Bytes::from(serde_json::to_vec(&record)?),
        )
        .await?;
        info!(
            target = "agent_fleet::console",
            request_id,
            "help request answered"
        );
        Ok(())
    }

    /// Dismiss one help request. The local mirror flips immediately;
    /// the worker notification is best effort and its failure only
    /// logs, because the worker's own timeout covers the gap.
    pub async fn dismiss_help(&self, request_id: &str, reason: Option<String>) -> Result<()> {
        let agent_id = self
            .state
            .help_requests()
            .into_iter()
            .find(|h| h.request_id == request_id)
            .and_then(|h| h.agent_id);

        self.state.resolve_help(request_id, HelpStatus::Cancelled);

        let conn = self.manager.current()?;
        let record = HelpResponded {
            request_id: request_id.to_string(),
            answered_by: self.operator.clone(),
            answers: Vec::new(),
            dismissed: true,
            timed_out: false,
        };
        conn.publish_durable(
            &subjects::helpdesk_responded(request_id),
            Bytes::from(serde_json::to_vec(&record)?),
        )
        .await?;

        if let Some(agent_id) = agent_id {
            let request = DismissRequest {
                request_id: request_id.to_string(),
                reason,
            };
            match self
                .client
                .request::<_, DismissAck>(
                    &subjects::agent_dismiss(&agent_id),
                    &request,
                    REQUEST_TIMEOUT,
                )
                .await
            {
                Ok(ack) if ack.dismissed => {}
                Ok(_) => {
                    warn!(
                        target = "agent_fleet::console",
                        request_id,
                        agent_id = %agent_id,
                        "worker declined dismissal"
                    );
                }
                Err(error) => {
                    warn!(
                        target = "agent_fleet::console",
                        request_id,
                        agent_id = %agent_id,
                        error = %error,
                        "dismissal notification failed"
                    );
                }
            }
        }
        Ok(())
    }

    /// Dismiss every pending help request concurrently. Each request
    /// gets its own result; one failure never aborts the rest.
    pub async fn dismiss_all_help(&self) -> Vec<(String, Result<()>)> {
        let pending: Vec<String> = self
            .state
            .pending_help()
            .into_iter()
            .map(|h| h.request_id)
            .collect();
        let results = futures::stream::iter(pending)
            .map(|request_id| async move {
                let outcome = self.dismiss_help(&request_id, None).await;
                (request_id, outcome)
            })
            .buffer_unordered(8)
            .collect::<Vec<_>>()
            .await;
        results
    }

    pub fn agents(&self) -> Vec<AgentEntry> {
        self.state.agents()
    }

    pub fn events(&self, agent_id: Option<&str>) -> Vec<EventRecord> {
        self.state.events(agent_id)
    }

    pub fn help_requests(&self) -> Vec<HelpEntry> {
        self.state.help_requests()
    }

    pub fn pending_help(&self) -> Vec<HelpEntry> {
        self.state.pending_help()
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.manager.status()
    }

    /// Shared projection handle, for embedding the console elsewhere.
    pub fn state(&self) -> &SharedState {
        &self.state
    }
}

/// The loss edge: once connected, any other phase means the transport
/// is gone. The `watch` channel coalesces updates, so the watcher may
/// observe `Connecting` or `Disconnected` without ever seeing the
/// intermediate `Backoff`.
fn connection_lost(was_connected: bool, phase: ConnectionPhase) -> bool {
    was_connected && phase != ConnectionPhase::Connected
}

async fn ensure_logs(conn: &Arc<dyn BrokerConnection>) -> Result<()> {
    conn.ensure_log(LogConfig {
        name: subjects::TASK_LOG.to_string(),
        subjects: vec![subjects::task_log_pattern()],
        max_age: LOG_MAX_AGE,
    })
    .await?;
    conn.ensure_log(LogConfig {
        name: subjects::HELPDESK_LOG.to_string(),
        subjects: vec![subjects::helpdesk_log_pattern()],
        max_age: LOG_MAX_AGE,
    })
    .await
}

/// Scatter a describe request and fold every reply into the roster.
/// Zero replies just means an empty fleet.
async fn gather_roster(conn: &Arc<dyn BrokerConnection>, state: &SharedState) {
    let inbox = conn.new_inbox();
    let mut replies = match conn.subscribe(&inbox).await {
        Ok(replies) => replies,
        Err(error) => {
            warn!(
                target = "agent_fleet::console",
                error = %error,
                "roster gather skipped"
            );
            return;
        }
    };
    if let Err(error) = conn
        .publish_with_reply(subjects::DESCRIBE, &inbox, Bytes::from_static(b"{}"))
        .await
    {
        warn!(
            target = "agent_fleet::console",
            error = %error,
            "roster gather skipped"
        );
        return;
    }

    let deadline = tokio::time::Instant::now() + SNAPSHOT_WINDOW;
    loop {
        let msg = tokio::select! {
            msg = replies.next() => msg,
            _ = tokio::time::sleep_until(deadline) => break,
        };
        let Some(msg) = msg else { break };
        match serde_json::from_slice::<AgentDescriptor>(&msg.payload) {
            Ok(descriptor) => state.apply(FleetEvent::AgentOnline(descriptor)),
            Err(error) => {
                warn!(
                    target = "agent_fleet::console",
                    error = %error,
                    "discarding undecodable describe reply"
                );
            }
        }
    }
}
