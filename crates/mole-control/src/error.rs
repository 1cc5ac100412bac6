use mole_proto::CodecError;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the broker
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Timed out after {timeout:?} waiting for a worker connection from agent {agent_id}")]
    DialTimeout { agent_id: String, timeout: Duration },

    #[error("Control connection for agent {0} was superseded or closed")]
    Superseded(String),

    #[error("Protocol error: {0}")]
    Codec(#[from] CodecError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(String),
}

impl From<hyper::Error> for BrokerError {
    fn from(e: hyper::Error) -> Self {
        BrokerError::Http(e.to_string())
    }
}

impl From<http::Error> for BrokerError {
    fn from(e: http::Error) -> Self {
        BrokerError::Http(e.to_string())
    }
}
