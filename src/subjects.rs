//! Subject naming scheme.
//!
//! Pure mapping between logical entities (agent id, task id, help request
//! id) and hierarchical broker subjects, plus the inverse parse used to
//! classify inbound messages. Ids must not contain the hierarchy
//! separator or wildcard characters; passing one that does is a caller
//! error, enforced by [`valid_id`] at the publishing edges.

/// Root of every subject this crate touches.
pub const PREFIX: &str = "fleet";

/// Durable ordered log of task lifecycle events.
pub const TASK_LOG: &str = "fleet-tasks";
/// Durable ordered log of help-response events.
pub const HELPDESK_LOG: &str = "fleet-helpdesk";

/// Ephemeral broadcast announcing a new help request.
pub const HELP_REQUEST: &str = "fleet.help.request";
/// Scatter/gather roster snapshot request, served by every worker.
pub const DESCRIBE: &str = "fleet.control.describe";

/// True if `id` is usable as a single subject segment.
pub fn valid_id(id: &str) -> bool {
    !id.is_empty()
        && !id
            .chars()
            .any(|c| c == '.' || c == '*' || c == '>' || c.is_whitespace())
}

/// Subject pattern covered by the durable task log.
pub fn task_log_pattern() -> String {
    format!("{PREFIX}.task.>")
}

/// Subject pattern covered by the durable helpdesk log.
pub fn helpdesk_log_pattern() -> String {
    format!("{PREFIX}.helpdesk.>")
}

/// Wildcard covering all per-agent broadcasts.
pub fn agent_pattern() -> String {
    format!("{PREFIX}.agent.>")
}

pub fn agent_status(agent_id: &str) -> String {
    format!("{PREFIX}.agent.{agent_id}.status")
}

pub fn agent_online(agent_id: &str) -> String {
    format!("{PREFIX}.agent.{agent_id}.online")
}

pub fn agent_offline(agent_id: &str) -> String {
    format!("{PREFIX}.agent.{agent_id}.offline")
}

/// Request subject a worker serves for task assignments.
pub fn agent_task(agent_id: &str) -> String {
    format!("{PREFIX}.agent.{agent_id}.task")
}

/// Request subject a worker serves for help-request dismissals.
pub fn agent_dismiss(agent_id: &str) -> String {
    format!("{PREFIX}.agent.{agent_id}.dismiss")
}

pub fn task_event(task_id: &str, action: &str) -> String {
    format!("{PREFIX}.task.{task_id}.{action}")
}

pub fn helpdesk_responded(request_id: &str) -> String {
    format!("{PREFIX}.helpdesk.{request_id}.responded")
}

/// Private reply subject for one help request.
pub fn help_reply(request_id: &str) -> String {
    format!("{PREFIX}.help.reply.{request_id}")
}

/// Extract `(task_id, action)` from a `fleet.task.<id>.<action>` subject.
pub fn parse_task_subject(subject: &str) -> Option<(&str, &str)> {
    parse_entity(subject, "task")
}

/// Extract `(request_id, action)` from a `fleet.helpdesk.<id>.<action>` subject.
pub fn parse_helpdesk_subject(subject: &str) -> Option<(&str, &str)> {
    parse_entity(subject, "helpdesk")
}

/// Extract `(agent_id, action)` from a `fleet.agent.<id>.<action>` subject.
pub fn parse_agent_subject(subject: &str) -> Option<(&str, &str)> {
    parse_entity(subject, "agent")
}

fn parse_entity<'a>(subject: &'a str, kind: &str) -> Option<(&'a str, &'a str)> {
    let mut parts = subject.splitn(4, '.');
    if parts.next()? != PREFIX || parts.next()? != kind {
        return None;
    }
    let id = parts.next()?;
    let action = parts.next()?;
    if id.is_empty() || action.is_empty() || action.contains('.') {
        return None;
    }
    Some((id, action))
}
