//! NATS transport.
//!
//! Implements the [`crate::broker`] traits over `async-nats`. Client
//! auto-reconnect is disabled (`max_reconnects(0)`); failure detection
//! and retry belong to the [`crate::connection::ConnectionManager`],
//! which owns the backoff schedule and the post-reconnect recovery
//! sequence. Durable logs map onto JetStream streams; durable cursors
//! are ephemeral ordered pull consumers starting from the first
//! retained entry.

use std::sync::Arc;

use async_nats::jetstream::{self, consumer, stream};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};

use crate::broker::{BrokerConnection, BrokerConnector, InboundMessage, LogConfig, MessageStream};
use crate::error::{FleetError, Result};

/// Connects to a NATS server at a fixed URL.
pub struct NatsConnector {
    url: String,
}

impl NatsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl BrokerConnector for NatsConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>> {
        let (lost_tx, lost_rx) = watch::channel(false);
        let events_tx = lost_tx.clone();
        let client = async_nats::ConnectOptions::new()
            .max_reconnects(0)
            .event_callback(move |event| {
                let events_tx = events_tx.clone();
                async move {
                    if matches!(event, async_nats::Event::Disconnected) {
                        let _ = events_tx.send(true);
                    }
                }
            })
            .connect(&self.url)
            .await
            .map_err(|e| FleetError::unavailable(e.to_string()))?;
        let jetstream = jetstream::new(client.clone());
        Ok(Arc::new(NatsConnection {
            client,
            jetstream,
            lost_rx,
        }))
    }
}

/// One live connection. Dropping it closes the client.
pub struct NatsConnection {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    lost_rx: watch::Receiver<bool>,
}

/// Forward a subscription into an owned channel. The forwarding task
/// exits when the subscription ends or the receiver is dropped, which
/// also tears down the broker-side interest.
fn forward<S>(upstream: S) -> MessageStream
where
    S: futures::Stream<Item = InboundMessage> + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<InboundMessage>(256);
    tokio::spawn(async move {
        let mut upstream = Box::pin(upstream);
        while let Some(msg) = upstream.next().await {
            if tx.send(msg).await.is_err() {
                break;
            }
        }
    });
    Box::pin(futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|msg| (msg, rx))
    }))
}

#[async_trait]
impl BrokerConnection for NatsConnection {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.client
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| FleetError::broker(e.to_string()))
    }

    async fn publish_with_reply(&self, subject: &str, reply: &str, payload: Bytes) -> Result<()> {
        self.client
            .publish_with_reply(subject.to_string(), reply.to_string(), payload)
            .await
            .map_err(|e| FleetError::broker(e.to_string()))
    }

    async fn publish_durable(&self, subject: &str, payload: Bytes) -> Result<()> {
        // First await sends, second awaits the stream ack.
        self.jetstream
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| FleetError::broker(e.to_string()))?
            .await
            .map_err(|e| FleetError::broker(e.to_string()))?;
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<MessageStream> {
        let sub = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| FleetError::broker(e.to_string()))?;
        Ok(forward(sub.map(|msg| InboundMessage {
            subject: msg.subject.to_string(),
            payload: msg.payload,
            reply: msg.reply.map(|r| r.to_string()),
        })))
    }

    async fn subscribe_durable(&self, log: &str) -> Result<MessageStream> {
        let stream = self
            .jetstream
            .get_stream(log)
            .await
            .map_err(|e| FleetError::broker(e.to_string()))?;
        // Unnamed ephemeral consumer: each call gets an independent
        // cursor over the full retained history.
        let consumer = stream
            .create_consumer(consumer::pull::Config {
                deliver_policy: consumer::DeliverPolicy::All,
                ack_policy: consumer::AckPolicy::None,
                ..Default::default()
            })
            .await
            .map_err(|e| FleetError::broker(e.to_string()))?;
        let messages = consumer
            .messages()
            .await
            .map_err(|e| FleetError::broker(e.to_string()))?;
        Ok(forward(messages.filter_map(|item| async move {
            match item {
                Ok(msg) => Some(InboundMessage {
                    subject: msg.subject.to_string(),
                    payload: msg.payload.clone(),
                    reply: None,
                }),
                Err(error) => {
                    tracing::warn!(
                        target = "agent_fleet::nats",
                        error = %error,
                        "durable cursor error, skipping entry"
                    );
                    None
                }
            }
        })))
    }

    async fn ensure_log(&self, config: LogConfig) -> Result<()> {
        let wanted = stream::Config {
            name: config.name.clone(),
            subjects: config.subjects,
            max_age: config.max_age,
            retention: stream::RetentionPolicy::Limits,
            ..Default::default()
        };
        // Update when the stream exists so retention changes take
        // effect; create otherwise.
        match self.jetstream.get_stream(&config.name).await {
            Ok(_) => {
                self.jetstream
                    .update_stream(&wanted)
                    .await
                    .map_err(|e| FleetError::broker(e.to_string()))?;
            }
            Err(_) => {
                self.jetstream
                    .create_stream(wanted)
                    .await
                    .map_err(|e| FleetError::broker(e.to_string()))?;
            }
        }
        Ok(())
    }

    fn new_inbox(&self) -> String {
        self.client.new_inbox()
    }

    async fn lost(&self) {
        let mut rx = self.lost_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    async fn close(&self) {
        if let Err(error) = self.client.drain().await {
            tracing::debug!(
                target = "agent_fleet::nats",
                error = %error,
                "drain on close failed"
            );
        }
    }
}
