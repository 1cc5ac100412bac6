//! Broker configuration

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Address accepting both control and worker connections
    pub listen_addr: SocketAddr,
    /// How long `dial` waits for the agent's worker connection
    #[serde(with = "mole_proto::duration::secs")]
    pub dial_timeout: Duration,
    /// How long a fresh connection has to deliver its leading command
    #[serde(with = "mole_proto::duration::secs")]
    pub handshake_timeout: Duration,
    /// Evict agents with no activity for this long (disabled when None)
    #[serde(with = "mole_proto::duration::option_secs")]
    pub idle_timeout: Option<Duration>,
    /// How often the idle sweep runs
    #[serde(with = "mole_proto::duration::secs")]
    pub sweep_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 7070)),
            dial_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Some(Duration::from_secs(90)),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.dial_timeout, Duration::from_secs(10));
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(90)));
        assert_eq!(config.listen_addr.port(), 7070);
    }

    #[test]
    fn test_durations_serialize_as_seconds() {
        let config = BrokerConfig {
            dial_timeout: Duration::from_millis(1500),
            idle_timeout: None,
            ..Default::default()
        };

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["dial_timeout"], 1.5);
        assert!(json["idle_timeout"].is_null());

        let back: BrokerConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back.dial_timeout, Duration::from_millis(1500));
        assert_eq!(back.idle_timeout, None);
    }
}
