//! Coordination layer for a fleet of worker agents over a message
//! broker.
//!
//! The crate splits along the broker boundary: [`broker`] defines the
//! transport traits, [`nats`] implements them for a real server and
//! [`testing`] in process. On top of that sit the connection
//! supervisor ([`connection`]), the event intake and projection
//! ([`intake`], [`state`]), request/reply plumbing ([`request`]), the
//! help protocol ([`help`]), and the two roles: [`worker`] runs tasks,
//! [`console`] operates the fleet.

pub mod broker;
pub mod config;
pub mod connection;
pub mod console;
pub mod error;
pub mod help;
pub mod intake;
pub mod nats;
pub mod protocol;
pub mod request;
pub mod state;
pub mod subjects;
pub mod testing;
pub mod worker;

pub use broker::{BrokerConnection, BrokerConnector, InboundMessage, LogConfig, MessageStream};
pub use connection::{backoff_delay, ConnectionManager, ConnectionPhase, ConnectionStatus};
pub use console::{Console, TaskSubmission};
pub use error::{FleetError, Result};
pub use help::HelpCoordinator;
pub use protocol::{AgentDescriptor, ExecState, FleetEvent, HelpQuestion, TaskAssignment};
pub use state::{AgentEntry, EventKind, EventRecord, FleetState, HelpEntry, HelpStatus, SharedState};
pub use worker::{Engine, EngineEvent, EngineSession, TaskRunner, WorkerIdentity, WorkerRuntime};
