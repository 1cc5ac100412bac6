//! Mole agent library
//!
//! Runs on a host that cannot accept inbound connections. The agent keeps one
//! outbound control connection to the broker and, whenever the broker asks
//! for it, opens a fresh worker connection back and hands it to a
//! [`WorkerHandler`].
//!
//! ```no_run
//! use mole_agent::{run_with_reconnect, AgentConfig, Backoff, TcpForwarder, TunnelClient};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), mole_agent::AgentError> {
//! let config = AgentConfig::new("edge-1", "broker.internal:7070");
//! let mut client = TunnelClient::new(config, Arc::new(TcpForwarder::new("127.0.0.1:8080")));
//! run_with_reconnect(&mut client, Backoff::default(), None).await
//! # }
//! ```

pub mod backoff;
pub mod client;
pub mod config;
pub mod error;
pub mod forwarder;

pub use backoff::Backoff;
pub use client::{run_with_reconnect, AgentState, TunnelClient};
pub use config::AgentConfig;
pub use error::AgentError;
pub use forwarder::{ForwarderError, TcpForwarder, WorkerConnection, WorkerHandler};
