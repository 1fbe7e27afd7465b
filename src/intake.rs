//! Event intake.
//!
//! Subscribes both delivery channels on a fresh connection and pumps
//! every inbound message through [`crate::protocol::classify`] into the
//! shared state reducer. One pump task per subscription; all of them
//! stop on the shutdown signal, and they end naturally when the
//! connection dies because their streams close.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::broker::{BrokerConnection, MessageStream};
use crate::error::{FleetError, Result};
use crate::protocol::classify;
use crate::state::SharedState;
use crate::subjects;

/// Subscribe the broadcast subjects and both durable logs, then spawn
/// the pump tasks. Called from the connection recovery sequence, after
/// [`SharedState::begin_replay`] has cleared the cache, so the durable
/// cursors rebuild the timeline from the first retained entry.
pub async fn start(
    conn: &Arc<dyn BrokerConnection>,
    state: &SharedState,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let agent_events = conn.subscribe(&subjects::agent_pattern()).await?;
    let help_requests = conn.subscribe(subjects::HELP_REQUEST).await?;
    let task_log = conn.subscribe_durable(subjects::TASK_LOG).await?;
    let helpdesk_log = conn.subscribe_durable(subjects::HELPDESK_LOG).await?;

    for stream in [agent_events, help_requests, task_log, helpdesk_log] {
        tokio::spawn(pump(stream, state.clone(), shutdown.clone()));
    }
    Ok(())
}

async fn pump(mut stream: MessageStream, state: SharedState, mut shutdown: watch::Receiver<bool>) {
    use futures::StreamExt;
    loop {
        let msg = tokio::select! {
            msg = stream.next() => msg,
            _ = shutdown.changed() => return,
        };
        let Some(msg) = msg else { return };
        match classify(&msg.subject, &msg.payload) {
            Ok(Some(event)) => state.apply(event),
            Ok(None) => {
                debug!(
                    target = "agent_fleet::intake",
                    subject = %msg.subject,
                    "ignoring unrecognized subject"
                );
            }
            // A malformed peer must not take the dispatcher down.
            Err(error @ FleetError::Decode(_)) | Err(error @ FleetError::ProtocolViolation(_)) => {
                warn!(
                    target = "agent_fleet::intake",
                    subject = %msg.subject,
                    error = %error,
                    "dropping malformed message"
                );
            }
            Err(error) => {
                warn!(
                    target = "agent_fleet::intake",
                    subject = %msg.subject,
                    error = %error,
                    "dropping message"
                );
            }
        }
    }
}
