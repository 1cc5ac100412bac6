use crate::forwarder::ForwarderError;
use mole_proto::CodecError;
use thiserror::Error;

/// Errors that can occur in the agent
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Failed to connect to broker at {address}: {source}")]
    Connect {
        address: String,
        source: std::io::Error,
    },

    #[error("Protocol error: {0}")]
    Codec(#[from] CodecError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Control connection closed by broker")]
    ControlClosed,

    #[error("Not joined to a broker")]
    NotJoined,

    #[error("Worker handling error: {0}")]
    Forwarder(#[from] ForwarderError),

    #[error("Giving up after {attempts} failed join attempts: {last}")]
    RejoinLimit {
        attempts: usize,
        last: Box<AgentError>,
    },
}
