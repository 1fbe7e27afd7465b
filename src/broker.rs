//! Broker boundary.
//!
//! The broker is a black box reached through these object-safe traits so
//! the whole coordination layer runs unchanged against the production
//! NATS client ([`crate::nats`]) or the in-memory double
//! ([`crate::testing`]). Components never hold a connection across a
//! reconnect; they re-fetch the live handle from the
//! [`crate::connection::ConnectionManager`] each time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::error::Result;

/// A message delivered by a subscription.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub subject: String,
    pub payload: Bytes,
    /// Reply subject, present when the sender expects a response.
    pub reply: Option<String>,
}

/// Stream of inbound messages. Dropping the stream releases the
/// broker-side interest; that drop is the unsubscribe primitive the
/// request client and help coordinator lean on.
pub type MessageStream = BoxStream<'static, InboundMessage>;

/// Configuration for one durable ordered log.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub name: String,
    pub subjects: Vec<String>,
    pub max_age: Duration,
}

/// A live transport to the broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    /// Fire-and-forget publish on an ephemeral subject.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()>;

    /// Publish carrying a reply subject (the request half of
    /// request/reply; also used for scatter/gather).
    async fn publish_with_reply(
        &self,
        subject: &str,
        reply: &str,
        payload: Bytes,
    ) -> Result<()>;

    /// Publish onto a durable log subject, acknowledged by the broker.
    async fn publish_durable(&self, subject: &str, payload: Bytes) -> Result<()>;

    /// Subscribe to an ephemeral subject (wildcards allowed). Messages
    /// published while no subscription exists are lost.
    async fn subscribe(&self, subject: &str) -> Result<MessageStream>;

    /// Open an independent cursor over a durable log: retained history
    /// replayed in publish order, then live messages, no gaps.
    async fn subscribe_durable(&self, log: &str) -> Result<MessageStream>;

    /// Idempotently create or update a durable log.
    async fn ensure_log(&self, config: LogConfig) -> Result<()>;

    /// Fresh unique inbox subject for correlated replies.
    fn new_inbox(&self) -> String;

    /// Resolves when the transport drops unexpectedly. Used by the
    /// connection manager to schedule reconnection.
    async fn lost(&self);

    /// Close the transport. Consumer loops are expected to have been
    /// told to stop before this is called.
    async fn close(&self);
}

/// Factory for broker connections; the connection manager calls this on
/// every (re)connect attempt.
#[async_trait]
pub trait BrokerConnector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>>;
}
