//! Request/reply correlation over the ephemeral channel.
//!
//! Every request uses a fresh inbox subject. The inbox subscription is
//! established before the request is published so the reply cannot race
//! past it, and it is released by dropping the stream when the call
//! returns, replied or not.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::connection::ConnectionManager;
use crate::error::{FleetError, Result};

#[derive(Clone)]
pub struct RequestClient {
    manager: Arc<ConnectionManager>,
}

impl RequestClient {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }

    /// Send `payload` to `subject` and wait for the first reply, decoded
    /// as `R`. Fails fast with [`FleetError::NotConnected`] while the
    /// transport is down and with [`FleetError::Timeout`] when no reply
    /// arrives in time.
    pub async fn request<T, R>(&self, subject: &str, payload: &T, timeout: Duration) -> Result<R>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let conn = self.manager.current()?;
        let inbox = conn.new_inbox();
        let mut replies = conn.subscribe(&inbox).await?;
        let body = Bytes::from(serde_json::to_vec(payload)?);
        conn.publish_with_reply(subject, &inbox, body).await?;

        match tokio::time::timeout(timeout, replies.next()).await {
            Ok(Some(msg)) => Ok(serde_json::from_slice(&msg.payload)?),
            Ok(None) => Err(FleetError::Closed),
            Err(_) => {
                debug!(target = "agent_fleet::request", subject, "request timed out");
                Err(FleetError::Timeout(timeout))
            }
        }
    }

    /// Scatter/gather: publish once, collect every reply that lands
    /// within `window`. Zero replies is a valid outcome, not an error.
    /// Replies that fail to decode are skipped.
    pub async fn gather<T, R>(&self, subject: &str, payload: &T, window: Duration) -> Result<Vec<R>>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let conn = self.manager.current()?;
        let inbox = conn.new_inbox();
        let mut replies = conn.subscribe(&inbox).await?;
        let body = Bytes::from(serde_json::to_vec(payload)?);
        conn.publish_with_reply(subject, &inbox, body).await?;

        let mut out = Vec::new();
        let deadline = tokio::time::Instant::now() + window;
        loop {
            let msg = tokio::select! {
                msg = replies.next() => msg,
                _ = tokio::time::sleep_until(deadline) => break,
            };
            let Some(msg) = msg else { break };
            match serde_json::from_slice(&msg.payload) {
                Ok(reply) => out.push(reply),
                Err(error) => {
                    debug!(
                        target = "agent_fleet::request",
                        subject,
                        error = %error,
                        "discarding undecodable gather reply"
                    );
                }
            }
        }
        Ok(out)
    }
}
