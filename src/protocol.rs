//! Wire payloads exchanged over the broker, and the classification of
//! inbound messages into typed fleet events.
//!
//! Every payload is JSON. Task lifecycle and help-response payloads travel
//! on the durable logs; everything else is ephemeral broadcast or
//! request/reply.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FleetError, Result};
use crate::subjects;

/// Execution state of an agent. Independent of reachability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecState {
    Idle,
    Busy,
}

/// Remote-display connection metadata advertised by an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayEndpoint {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// An agent's self-description. Sent as the `describe` reply and the
/// `online` broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub id: String,
    pub state: ExecState,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<DisplayEndpoint>,
}

/// Busy/idle transition broadcast on `fleet.agent.<id>.status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub agent_id: String,
    pub state: ExecState,
    #[serde(default)]
    pub task_id: Option<String>,
}

/// Task assignment request sent to `fleet.agent.<id>.task`.
///
/// `task_id` is optional on the wire so a malformed assignment can be
/// observed and dropped rather than failing the decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssignment {
    #[serde(default)]
    pub task_id: Option<String>,
    pub prompt: String,
    #[serde(default)]
    pub options: serde_json::Map<String, Value>,
}

/// Reply to a task assignment request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAck {
    pub accepted: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Durable payload on `fleet.task.<id>.assigned`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAssigned {
    pub task_id: String,
    pub agent_id: String,
    pub prompt: String,
}

/// Durable payload on `fleet.task.<id>.message`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub task_id: String,
    pub agent_id: String,
    pub body: Value,
}

/// Durable payload on `fleet.task.<id>.complete`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskComplete {
    pub task_id: String,
    pub agent_id: String,
    #[serde(default)]
    pub result: Option<Value>,
}

/// Durable payload on `fleet.task.<id>.error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskErrored {
    pub task_id: String,
    pub agent_id: String,
    pub error: String,
}

/// One question inside a help request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelpQuestion {
    pub header: String,
    pub prompt: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub multi_select: bool,
}

/// Broadcast on `fleet.help.request` when a worker needs a decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelpRequestMsg {
    pub request_id: String,
    pub agent_id: String,
    pub task_id: String,
    pub questions: Vec<HelpQuestion>,
    pub created_at: DateTime<Utc>,
    /// Hint to responders: how long the worker will wait.
    pub timeout_ms: u64,
}

/// Answer published on the private reply subject. An `error` value means
/// the request was dismissed or could not be answered; that is an
/// absence, not a fault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelpAnswer {
    pub request_id: String,
    /// One entry per question, holding the selected options (or a single
    /// free-text value).
    #[serde(default)]
    pub answers: Vec<Vec<String>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub answered_by: Option<String>,
}

/// Durable record on `fleet.helpdesk.<id>.responded`. Written by the
/// console on an answer or dismissal, and by the worker itself when its
/// wait deadline passes, so every observer sees the same resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelpResponded {
    pub request_id: String,
    pub answered_by: String,
    #[serde(default)]
    pub answers: Vec<Vec<String>>,
    #[serde(default)]
    pub dismissed: bool,
    /// The worker stopped waiting; nobody answered.
    #[serde(default)]
    pub timed_out: bool,
}

/// Best-effort dismissal request sent to `fleet.agent.<id>.dismiss`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DismissRequest {
    pub request_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DismissAck {
    pub dismissed: bool,
}

/// A typed event handed to the state projection.
#[derive(Debug, Clone, PartialEq)]
pub enum FleetEvent {
    AgentOnline(AgentDescriptor),
    AgentOffline { agent_id: String },
    Status(StatusUpdate),
    HelpRequested(HelpRequestMsg),
    HelpResponded(HelpResponded),
    TaskAssigned(TaskAssigned),
    TaskMessage(TaskMessage),
    TaskComplete(TaskComplete),
    TaskError(TaskErrored),
}

/// Classify an inbound message by its subject.
///
/// Returns `Ok(None)` for subjects this crate does not recognize (the
/// intake loop logs and drops those) and `Err` for recognized subjects
/// whose payload fails to decode.
pub fn classify(subject: &str, payload: &[u8]) -> Result<Option<FleetEvent>> {
    if subject == subjects::HELP_REQUEST {
        let msg: HelpRequestMsg = serde_json::from_slice(payload)?;
        return Ok(Some(FleetEvent::HelpRequested(msg)));
    }

    if let Some((task_id, action)) = subjects::parse_task_subject(subject) {
        let event = match action {
            "assigned" => FleetEvent::TaskAssigned(serde_json::from_slice(payload)?),
            "message" => FleetEvent::TaskMessage(serde_json::from_slice(payload)?),
            "complete" => FleetEvent::TaskComplete(serde_json::from_slice(payload)?),
            "error" => FleetEvent::TaskError(serde_json::from_slice(payload)?),
            _ => return Ok(None),
        };
        // The id in the subject and the payload must agree.
        let payload_id = match &event {
            FleetEvent::TaskAssigned(e) => e.task_id.as_str(),
            FleetEvent::TaskMessage(e) => e.task_id.as_str(),
            FleetEvent::TaskComplete(e) => e.task_id.as_str(),
            FleetEvent::TaskError(e) => e.task_id.as_str(),
            _ => unreachable!(),
        };
        if payload_id != task_id {
            return Err(FleetError::ProtocolViolation(format!(
                "task id mismatch: subject {subject} carries payload for {payload_id}"
            )));
        }
        return Ok(Some(event));
    }

    if let Some((request_id, action)) = subjects::parse_helpdesk_subject(subject) {
        if action != "responded" {
            return Ok(None);
        }
        let msg: HelpResponded = serde_json::from_slice(payload)?;
        if msg.request_id != request_id {
            return Err(FleetError::ProtocolViolation(format!(
                "help request id mismatch on {subject}"
            )));
        }
        return Ok(Some(FleetEvent::HelpResponded(msg)));
    }

    if let Some((agent_id, action)) = subjects::parse_agent_subject(subject) {
        return match action {
            "online" => {
                let desc: AgentDescriptor = serde_json::from_slice(payload)?;
                Ok(Some(FleetEvent::AgentOnline(desc)))
            }
            "offline" => Ok(Some(FleetEvent::AgentOffline {
                agent_id: agent_id.to_string(),
            })),
            "status" => {
                let status: StatusUpdate = serde_json::from_slice(payload)?;
                Ok(Some(FleetEvent::Status(status)))
            }
            _ => Ok(None),
        };
    }

    Ok(None)
}
