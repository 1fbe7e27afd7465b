//! Connection lifecycle.
//!
//! [`ConnectionManager`] owns the single supervision loop: connect,
//! run the recovery sequence, watch for loss, retry with bounded
//! exponential backoff. Everything downstream observes the lifecycle
//! through a `watch` channel and re-fetches the live transport handle
//! per operation, so no component ever holds a connection across a
//! reconnect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::broker::{BrokerConnection, BrokerConnector};
use crate::error::{FleetError, Result};

/// Lifecycle phase, broadcast on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
    /// Last attempt failed; waiting out the backoff delay.
    Backoff,
}

#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    pub phase: ConnectionPhase,
    /// Consecutive failures since the last successful recovery.
    pub attempt: u32,
    pub last_error: Option<String>,
}

impl ConnectionStatus {
    fn disconnected() -> Self {
        Self {
            phase: ConnectionPhase::Disconnected,
            attempt: 0,
            last_error: None,
        }
    }
}

/// Retry delay before attempt `n` (1-based): `base * 2^(n-1)`, clamped
/// to `ceiling`. Attempt 0 is treated as 1.
pub fn backoff_delay(base: Duration, ceiling: Duration, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exp).unwrap_or(ceiling).min(ceiling)
}

/// Runs once per successful connect, before the status flips to
/// `Connected`: ensure logs, reset caches, restart intake, gather the
/// roster snapshot. A failure here counts as a failed attempt.
pub type RecoveryFn =
    dyn Fn(Arc<dyn BrokerConnection>) -> BoxFuture<'static, Result<()>> + Send + Sync;

pub struct ConnectionManager {
    connector: Arc<dyn BrokerConnector>,
    backoff_base: Duration,
    backoff_ceiling: Duration,
    status_tx: watch::Sender<ConnectionStatus>,
    shutdown_tx: watch::Sender<bool>,
    current: RwLock<Option<Arc<dyn BrokerConnection>>>,
    started: AtomicBool,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        backoff_base: Duration,
        backoff_ceiling: Duration,
    ) -> Arc<Self> {
        let (status_tx, _) = watch::channel(ConnectionStatus::disconnected());
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            connector,
            backoff_base,
            backoff_ceiling,
            status_tx,
            shutdown_tx,
            current: RwLock::new(None),
            started: AtomicBool::new(false),
        })
    }

    /// Start the supervision loop. Idempotent; later calls are no-ops.
    pub fn connect(self: &Arc<Self>, recovery: Arc<RecoveryFn>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let manager = self.clone();
        tokio::spawn(async move {
            manager.supervise(recovery).await;
        });
    }

    /// The live transport, or [`FleetError::NotConnected`].
    pub fn current(&self) -> Result<Arc<dyn BrokerConnection>> {
        self.current.read().clone().ok_or(FleetError::NotConnected)
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    /// Block until the manager reports `Connected`.
    pub async fn wait_connected(&self) -> Result<()> {
        let mut rx = self.status_tx.subscribe();
        loop {
            if rx.borrow().phase == ConnectionPhase::Connected {
                return Ok(());
            }
            rx.changed().await.map_err(|_| FleetError::Closed)?;
        }
    }

    /// Deliberate shutdown: stop the loop, then close the transport.
    /// No reconnection follows.
    pub async fn disconnect(&self) {
        let _ = self.shutdown_tx.send(true);
        let conn = self.current.write().take();
        if let Some(conn) = conn {
            conn.close().await;
        }
        self.status_tx.send_replace(ConnectionStatus::disconnected());
    }

    async fn supervise(self: Arc<Self>, recovery: Arc<RecoveryFn>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut attempt: u32 = 0;
        loop {
            if *shutdown.borrow() {
                return;
            }
            self.status_tx.send_replace(ConnectionStatus {
                phase: ConnectionPhase::Connecting,
                attempt,
                last_error: None,
            });

            let error = match self.connector.connect().await {
                Ok(conn) => {
                    // disconnect() may have raced the dial; a transport
                    // established after the shutdown signal must not be
                    // handed out.
                    if *shutdown.borrow() {
                        conn.close().await;
                        return;
                    }
                    *self.current.write() = Some(conn.clone());
                    match recovery(conn.clone()).await {
                        Ok(()) => {
                            if *shutdown.borrow() {
                                self.current.write().take();
                                conn.close().await;
                                return;
                            }
                            attempt = 0;
                            self.status_tx.send_replace(ConnectionStatus {
                                phase: ConnectionPhase::Connected,
                                attempt: 0,
                                last_error: None,
                            });
                            info!(target = "agent_fleet::connection", "connected");
                            tokio::select! {
                                _ = conn.lost() => {
                                    self.current.write().take();
                                    "connection lost".to_string()
                                }
                                _ = shutdown.changed() => return,
                            }
                        }
                        Err(error) => {
                            self.current.write().take();
                            conn.close().await;
                            format!("recovery failed: {error}")
                        }
                    }
                }
                Err(error) => error.to_string(),
            };

            attempt = attempt.saturating_add(1);
            let delay = backoff_delay(self.backoff_base, self.backoff_ceiling, attempt);
            warn!(
                target = "agent_fleet::connection",
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "connection down, retrying"
            );
            self.status_tx.send_replace(ConnectionStatus {
                phase: ConnectionPhase::Backoff,
                attempt,
                last_error: Some(error),
            });
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return,
            }
        }
    }
}
