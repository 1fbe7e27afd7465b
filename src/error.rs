//! Error types for the fleet coordination core.

use thiserror::Error;

/// Errors surfaced by the coordination layer.
///
/// Transport faults that are safe to retry (connect, subscribe) are
/// absorbed into the connection manager's backoff loop and never reach
/// callers as hard failures; only caller-directed operations (request,
/// help ask) return these variants directly.
#[derive(Error, Debug)]
pub enum FleetError {
    /// No live broker connection. The caller must connect first; nothing
    /// was sent.
    #[error("not connected to the broker. Call connect() first.")]
    NotConnected,

    /// No reply arrived within the wall-clock deadline. Always
    /// recoverable; the caller may retry.
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// A payload could not be decoded. The offending message is dropped
    /// and consumption loops continue.
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// The broker rejected or dropped a transport-level operation.
    #[error("broker error: {0}")]
    Broker(String),

    /// Connecting to or provisioning the broker failed. Triggers
    /// backoff-and-retry in the connection manager.
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// An inbound message violated the protocol (e.g. a required id was
    /// missing). Dropped with a log line, never propagated out of a loop.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Shutdown was observed mid-operation.
    #[error("connection closed")]
    Closed,
}

impl FleetError {
    pub fn broker(err: impl std::fmt::Display) -> Self {
        Self::Broker(err.to_string())
    }

    pub fn unavailable(err: impl std::fmt::Display) -> Self {
        Self::BrokerUnavailable(err.to_string())
    }

    /// Whether the operation may be retried as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::BrokerUnavailable(_))
    }
}

/// Result type alias for fleet operations.
pub type Result<T> = std::result::Result<T, FleetError>;
