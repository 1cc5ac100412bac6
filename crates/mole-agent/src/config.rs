//! Agent configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the tunnel client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Stable identity announced in JOIN
    pub agent_id: String,

    /// Broker address (host:port)
    pub broker_addr: String,

    /// Interval between PINGs on the control connection (disabled when None)
    #[serde(with = "mole_proto::duration::option_secs")]
    pub heartbeat_interval: Option<Duration>,

    /// Timeout for establishing the control connection
    #[serde(with = "mole_proto::duration::secs")]
    pub connect_timeout: Duration,
}

impl AgentConfig {
    pub fn new(agent_id: impl Into<String>, broker_addr: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            broker_addr: broker_addr.into(),
            ..Default::default()
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_id: format!("agent-{}", uuid::Uuid::new_v4()),
            broker_addr: "localhost:7070".to_string(),
            heartbeat_interval: Some(Duration::from_secs(30)),
            connect_timeout: Duration::from_secs(10),
        }
    }
}
