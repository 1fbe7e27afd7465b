//! In-memory broker double.
//!
//! [`MemoryBroker`] implements [`BrokerConnector`] entirely in process:
//! subject wildcards, durable logs with replay-then-live cursors, inbox
//! request/reply, and scripted connection loss. Integration tests drive
//! the full coordination stack against it without a running server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::broker::{BrokerConnection, BrokerConnector, InboundMessage, LogConfig, MessageStream};
use crate::error::{FleetError, Result};

/// NATS-style subject match: `*` spans one token, `>` the remainder.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut sub = subject.split('.');
    loop {
        match (pat.next(), sub.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

struct Subscriber {
    conn_id: u64,
    pattern: String,
    tx: mpsc::UnboundedSender<InboundMessage>,
}

struct DurableSub {
    conn_id: u64,
    log: String,
    tx: mpsc::UnboundedSender<InboundMessage>,
}

#[derive(Default)]
struct LogState {
    patterns: Vec<String>,
    entries: Vec<(String, Bytes)>,
}

#[derive(Default)]
struct HubInner {
    subscribers: Vec<Subscriber>,
    durable_subs: Vec<DurableSub>,
    logs: HashMap<String, LogState>,
}

#[derive(Default)]
struct Hub {
    inner: Mutex<HubInner>,
}

impl Hub {
    fn deliver(&self, subject: &str, payload: &Bytes, reply: Option<&str>) {
        let mut inner = self.inner.lock();
        inner.subscribers.retain(|s| {
            if !subject_matches(&s.pattern, subject) {
                return true;
            }
            // A failed send means the stream was dropped; prune it.
            s.tx
                .send(InboundMessage {
                    subject: subject.to_string(),
                    payload: payload.clone(),
                    reply: reply.map(str::to_string),
                })
                .is_ok()
        });
    }

    fn append_durable(&self, subject: &str, payload: &Bytes) -> bool {
        let mut inner = self.inner.lock();
        let mut matched = Vec::new();
        for (name, log) in inner.logs.iter_mut() {
            if log.patterns.iter().any(|p| subject_matches(p, subject)) {
                log.entries.push((subject.to_string(), payload.clone()));
                matched.push(name.clone());
            }
        }
        if matched.is_empty() {
            return false;
        }
        inner.durable_subs.retain(|s| {
            if !matched.contains(&s.log) {
                return true;
            }
            s.tx
                .send(InboundMessage {
                    subject: subject.to_string(),
                    payload: payload.clone(),
                    reply: None,
                })
                .is_ok()
        });
        true
    }

    fn drop_connection(&self, conn_id: u64) {
        let mut inner = self.inner.lock();
        inner.subscribers.retain(|s| s.conn_id != conn_id);
        inner.durable_subs.retain(|s| s.conn_id != conn_id);
    }
}

fn stream_from(rx: mpsc::UnboundedReceiver<InboundMessage>) -> MessageStream {
    Box::pin(futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|msg| (msg, rx))
    }))
}

/// One live in-memory connection. Obtained through [`MemoryBroker`].
pub struct MemoryConnection {
    id: u64,
    hub: Arc<Hub>,
    closed: AtomicBool,
    lost_tx: watch::Sender<bool>,
}

impl MemoryConnection {
    fn guard(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(FleetError::unavailable("connection dropped"))
        } else {
            Ok(())
        }
    }

    /// Simulate an abrupt transport loss: subscriptions end, publishes
    /// start failing, and [`BrokerConnection::lost`] resolves.
    pub fn fail(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.hub.drop_connection(self.id);
        let _ = self.lost_tx.send(true);
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.guard()?;
        self.hub.deliver(subject, &payload, None);
        Ok(())
    }

    async fn publish_with_reply(&self, subject: &str, reply: &str, payload: Bytes) -> Result<()> {
        self.guard()?;
        self.hub.deliver(subject, &payload, Some(reply));
        Ok(())
    }

    async fn publish_durable(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.guard()?;
        if !self.hub.append_durable(subject, &payload) {
            return Err(FleetError::broker(format!(
                "no durable log covers subject {subject}"
            )));
        }
        // Durable subjects are still visible to plain subscribers.
        self.hub.deliver(subject, &payload, None);
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<MessageStream> {
        self.guard()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.hub.inner.lock().subscribers.push(Subscriber {
            conn_id: self.id,
            pattern: subject.to_string(),
            tx,
        });
        Ok(stream_from(rx))
    }

    async fn subscribe_durable(&self, log: &str) -> Result<MessageStream> {
        self.guard()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.hub.inner.lock();
        let state = inner
            .logs
            .get(log)
            .ok_or_else(|| FleetError::broker(format!("unknown log {log}")))?;
        // Replay retained history in publish order, then go live.
        for (subject, payload) in &state.entries {
            let _ = tx.send(InboundMessage {
                subject: subject.clone(),
                payload: payload.clone(),
                reply: None,
            });
        }
        inner.durable_subs.push(DurableSub {
            conn_id: self.id,
            log: log.to_string(),
            tx,
        });
        Ok(stream_from(rx))
    }

    async fn ensure_log(&self, config: LogConfig) -> Result<()> {
        self.guard()?;
        let mut inner = self.hub.inner.lock();
        let state = inner.logs.entry(config.name).or_default();
        state.patterns = config.subjects;
        Ok(())
    }

    fn new_inbox(&self) -> String {
        format!("_inbox.{}", Uuid::new_v4())
    }

    async fn lost(&self) {
        let mut rx = self.lost_tx.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.hub.drop_connection(self.id);
    }
}

/// Shared in-memory broker: every connection it hands out sees the same
/// subjects and durable logs, so one instance stands in for a server.
#[derive(Clone)]
pub struct MemoryBroker {
    hub: Arc<Hub>,
    next_id: Arc<AtomicU64>,
    fail_connects: Arc<AtomicUsize>,
    live: Arc<Mutex<Vec<Arc<MemoryConnection>>>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            hub: Arc::new(Hub::default()),
            next_id: Arc::new(AtomicU64::new(1)),
            fail_connects: Arc::new(AtomicUsize::new(0)),
            live: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_connects(&self, n: usize) {
        self.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Sever every live connection, as a broker restart would.
    pub fn drop_connections(&self) {
        let conns: Vec<_> = self.live.lock().drain(..).collect();
        for conn in conns {
            conn.fail();
        }
    }

    /// Retained entry count for a durable log.
    pub fn log_len(&self, log: &str) -> usize {
        self.hub
            .inner
            .lock()
            .logs
            .get(log)
            .map(|l| l.entries.len())
            .unwrap_or(0)
    }

    /// Live ephemeral subscription count; lets tests observe that a
    /// dropped stream released its interest.
    pub fn subscription_count(&self) -> usize {
        let mut inner = self.hub.inner.lock();
        inner.subscribers.retain(|s| !s.tx.is_closed());
        inner.subscribers.len()
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>> {
        if self
            .fail_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(FleetError::unavailable("simulated connect failure"));
        }
        let (lost_tx, _) = watch::channel(false);
        let conn = Arc::new(MemoryConnection {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            hub: self.hub.clone(),
            closed: AtomicBool::new(false),
            lost_tx,
        });
        self.live.lock().push(conn.clone());
        Ok(conn)
    }
}
